//! Copy loops between the child's standard streams and caller streams

use std::io;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read buffer size for one copy loop
const PIPE_BUFFER_SIZE: usize = 8 * 1024;

/// Copy `reader` into `writer` until EOF or cancellation
///
/// Returns the writer together with the number of bytes copied.
pub async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    channel: &'static str,
) -> io::Result<(W, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(channel, total, "Pipe cancelled");
                break;
            }
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    debug!(channel, total, "Pipe finished");
    Ok((writer, total))
}

/// Drain an optional child output stream into `sink`
pub async fn drain<R, W>(
    stream: Option<R>,
    sink: W,
    cancel: CancellationToken,
    channel: &'static str,
) -> io::Result<(W, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match stream {
        Some(stream) => pump(stream, sink, cancel, channel).await,
        None => Ok((sink, 0)),
    }
}

/// Feed `source` into the child's stdin, then close it
///
/// A child that stops reading (broken pipe) is not an error.
pub async fn feed_stdin<R>(
    source: Option<R>,
    stdin: Option<ChildStdin>,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let Some(stdin) = stdin else {
        return Ok(0);
    };
    let Some(source) = source else {
        // Dropping stdin closes it.
        return Ok(0);
    };

    match pump(source, stdin, cancel, "stdin").await {
        Ok((mut stdin, total)) => {
            match stdin.shutdown().await {
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
            Ok(total)
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Child closed stdin early");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Encode text for a child's stdin
///
/// `encoding_rs` encodes UTF-16 as UTF-8 (WHATWG semantics), so UTF-16 is
/// produced here directly.
pub fn encode_text(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    if encoding == UTF_16LE {
        return text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    }
    if encoding == UTF_16BE {
        return text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    }
    encoding.encode(text).0.into_owned()
}

/// Decode captured child output
pub fn decode_text(encoding: &'static Encoding, bytes: &[u8]) -> String {
    encoding.decode_without_bom_handling(bytes).0.into_owned()
}
