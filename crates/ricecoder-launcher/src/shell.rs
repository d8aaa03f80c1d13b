//! Shell invocations - run scripts through cmd.exe, PowerShell or a POSIX shell

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ProcessConfiguration, ProcessConfigurationBuilder};

/// Shells a script can be run through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// `cmd.exe`
    Cmd,
    /// `pwsh` when available, else Windows PowerShell
    PowerShell,
    /// `/bin/sh`
    Posix,
}

/// A script bound to the shell that runs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    kind: ShellKind,
    script: String,
}

impl ShellInvocation {
    pub fn new(kind: ShellKind, script: impl Into<String>) -> Self {
        Self {
            kind,
            script: script.into(),
        }
    }

    pub fn cmd(script: impl Into<String>) -> Self {
        Self::new(ShellKind::Cmd, script)
    }

    pub fn powershell(script: impl Into<String>) -> Self {
        Self::new(ShellKind::PowerShell, script)
    }

    pub fn posix(script: impl Into<String>) -> Self {
        Self::new(ShellKind::Posix, script)
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Shell executable
    pub fn program(&self) -> PathBuf {
        match self.kind {
            ShellKind::Cmd => PathBuf::from(
                std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string()),
            ),
            ShellKind::PowerShell => {
                if let Ok(pwsh) = which::which("pwsh") {
                    debug!(pwsh = %pwsh.display(), "Using PowerShell 7+");
                    pwsh
                } else {
                    PathBuf::from("powershell")
                }
            }
            ShellKind::Posix => PathBuf::from("/bin/sh"),
        }
    }

    /// Arguments passed to the shell
    pub fn arguments(&self) -> Vec<String> {
        match self.kind {
            ShellKind::Cmd => vec![
                "/d".to_string(),
                "/s".to_string(),
                "/c".to_string(),
                self.script.clone(),
            ],
            ShellKind::PowerShell => vec![
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-EncodedCommand".to_string(),
                encode_powershell_command(&self.script),
            ],
            ShellKind::Posix => vec!["-c".to_string(), self.script.clone()],
        }
    }

    /// Configuration builder for running this script
    pub fn builder(&self) -> ProcessConfigurationBuilder {
        ProcessConfiguration::builder(self.program()).args(self.arguments())
    }

    /// Seed an existing builder (e.g. one carrying launcher defaults)
    pub fn apply(&self, builder: ProcessConfigurationBuilder) -> ProcessConfigurationBuilder {
        builder.target_path(self.program()).args(self.arguments())
    }
}

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects
pub fn encode_powershell_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// Quote one argument for a POSIX shell command line
pub fn quote_posix(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// Quote one argument for a cmd.exe command line
pub fn quote_cmd(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"', '&', '|', '<', '>', '^']) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("\"{}\"", arg.replace('"', "\"\"")))
    }
}

/// Shell program and arguments used for the shell-execution flag
pub(crate) fn shell_execute_command(program: &Path, args: &[String]) -> (PathBuf, Vec<String>) {
    let program = program.to_string_lossy();
    if cfg!(windows) {
        let line = std::iter::once(quote_cmd(&program))
            .chain(args.iter().map(|a| quote_cmd(a)))
            .collect::<Vec<_>>()
            .join(" ");
        let shell = ShellInvocation::cmd(line);
        (shell.program(), shell.arguments())
    } else {
        let line = std::iter::once(quote_posix(&program))
            .chain(args.iter().map(|a| quote_posix(a)))
            .collect::<Vec<_>>()
            .join(" ");
        let shell = ShellInvocation::posix(line);
        (shell.program(), shell.arguments())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_powershell_encoding() {
        // "dir" in UTF-16LE
        assert_eq!(encode_powershell_command("dir"), "ZABpAHIA");
    }

    #[test]
    fn test_posix_arguments() {
        let shell = ShellInvocation::posix("echo hi");
        assert_eq!(shell.program(), PathBuf::from("/bin/sh"));
        assert_eq!(shell.arguments(), vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_cmd_arguments() {
        let shell = ShellInvocation::cmd("dir /b");
        assert_eq!(shell.arguments(), vec!["/d", "/s", "/c", "dir /b"]);
    }

    #[test]
    fn test_powershell_arguments_end_with_encoded_command() {
        let args = ShellInvocation::powershell("Get-Date").arguments();
        let n = args.len();
        assert_eq!(args[n - 2], "-EncodedCommand");
        assert_eq!(args[n - 1], encode_powershell_command("Get-Date"));
    }

    #[test]
    fn test_quote_posix() {
        assert_eq!(quote_posix("plain"), "plain");
        assert_eq!(quote_posix(""), "''");
        assert_eq!(quote_posix("two words"), "'two words'");
        assert_eq!(quote_posix("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_quote_cmd() {
        assert_eq!(quote_cmd("plain"), "plain");
        assert_eq!(quote_cmd("a b"), "\"a b\"");
        assert_eq!(quote_cmd("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    proptest! {
        #[test]
        fn prop_quoted_posix_has_no_bare_quote(arg in ".*") {
            let quoted = quote_posix(&arg);
            if quoted.starts_with('\'') {
                prop_assert!(quoted.ends_with('\''));
                // Every embedded quote is the close-escape-reopen sequence.
                let inner = &quoted[1..quoted.len() - 1];
                prop_assert_eq!(inner.replace(r"'\''", ""), arg.replace('\'', ""));
            } else {
                prop_assert_eq!(quoted.as_ref(), arg.as_str());
            }
        }

        #[test]
        fn prop_powershell_encoding_decodes(script in "\\PC{0,64}") {
            let encoded = encode_powershell_command(&script);
            let bytes = STANDARD.decode(encoded).unwrap();
            let units: Vec<u16> = bytes
                .chunks(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            prop_assert_eq!(String::from_utf16(&units).unwrap(), script);
        }
    }
}
