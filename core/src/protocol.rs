use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal
const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// stdin/stdout/stderr redirected through three pipes.
    Batch,
    /// Child attached to a pseudo-terminal.
    Interactive,
}

/// What to run. Built once by the caller and never mutated afterwards; the
/// builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    tag: String,
    mode: ExecMode,
    env: Vec<(String, String)>,
    nice: Option<i32>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, mode: ExecMode) -> Self {
        Self {
            argv,
            cwd: None,
            tag: String::new(),
            mode,
            env: Vec::new(),
            nice: None,
        }
    }

    /// `[/bin/sh, -c, line]` in batch mode.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self::shell_with(DEFAULT_SHELL, command_line)
    }

    pub fn shell_with(shell: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self::new(
            vec![shell.into(), "-c".to_string(), command_line.into()],
            ExecMode::Batch,
        )
    }

    pub fn interactive<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            argv.into_iter().map(Into::into).collect(),
            ExecMode::Interactive,
        )
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Runs the child at `nice` (see `setpriority(2)`). Raising priority
    /// above the caller's needs privileges; a refused change is ignored.
    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = Some(nice);
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Opaque routing tag; echoed back in `on_started`/`on_exited`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn nice(&self) -> Option<i32> {
        self.nice
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One fragment of child output. Pipe sessions deliver whole lines (only the
/// final fragment of a stream may lack its newline); pty sessions deliver
/// whatever a single read returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub stream: OutputStream,
    pub chunk: Vec<u8>,
}

impl OutputEvent {
    pub fn new(stream: OutputStream, chunk: Vec<u8>) -> Self {
        Self { stream, chunk }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.chunk).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// The session was torn down without the child being reaped.
    Unknown,
}

impl ExitStatus {
    /// Decodes a raw `waitpid` status word.
    pub fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            Self::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Unknown
        }
    }

    /// Shell-style exit code: the code itself, or `128 + signal`.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => EXIT_CODE_SIGNAL_BASE + signal,
            Self::Unknown => -1,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Sink callbacks reified as values, for channel based consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started { tag: String },
    Output(OutputEvent),
    Exited { tag: String, status: ExitStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn shell_spec_wraps_command_line() {
        let spec = CommandSpec::shell("make -j4")
            .with_tag("build")
            .with_cwd("/tmp");
        assert_eq!(spec.argv(), ["/bin/sh", "-c", "make -j4"]);
        assert_eq!(spec.mode(), ExecMode::Batch);
        assert_eq!(spec.tag(), "build");
        assert_eq!(spec.cwd(), Some(Path::new("/tmp")));
    }

    #[test]
    fn signaled_status_maps_to_shell_code() {
        assert_eq!(ExitStatus::Signaled(libc::SIGTERM).code(), 143);
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert!(!ExitStatus::Unknown.success());
    }
}
