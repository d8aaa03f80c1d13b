use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ricecoder_launcher::{CancellationToken, Launcher, ProcessLauncher};

// ============================================================================
// Launch overhead: plain vs buffered vs resolver-cached runs of `true`
// ============================================================================

fn benchmark_launch(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let launcher = Launcher::new();
    let config = launcher
        .configure("true")
        .build()
        .expect("Failed to build configuration");

    let mut group = c.benchmark_group("launch");
    group.sample_size(30);

    group.bench_function("run", |b| {
        b.iter(|| {
            let result = runtime
                .block_on(launcher.run(&config, CancellationToken::new()))
                .expect("run failed");
            black_box(result.exit_code);
        });
    });

    group.bench_function("run_buffered", |b| {
        b.iter(|| {
            let result = runtime
                .block_on(launcher.run_buffered(&config, CancellationToken::new()))
                .expect("run_buffered failed");
            black_box(result.stdout.len());
        });
    });

    group.bench_function("resolve_cached", |b| {
        let resolver = launcher.resolver().clone();
        b.iter(|| {
            black_box(
                resolver
                    .resolve(std::path::Path::new("true"), None)
                    .expect("resolve failed"),
            );
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_launch);
criterion_main!(benches);
