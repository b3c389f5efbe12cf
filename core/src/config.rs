use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::ConfigError;

const DEFAULT_INTERRUPT_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_READ_CHUNK_BYTES: usize = 2048;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024; // 64 KiB
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BATCH_NICE: i32 = 10;
const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

const CONFIG_FILE_NAME: &str = "config.toml";
const HOME_ENV_VAR: &str = "EXECBRIDGE_HOME";
const HOME_DIR_NAME: &str = ".execbridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

/// Tunables shared by both session kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub interrupt_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_line_bytes: usize,
    pub drain_stale_output: bool,
    /// Bound on each wait for the pty child's handshake; `0` waits forever.
    pub handshake_timeout_ms: u64,
    /// Niceness given to batch children, which run as background work.
    pub batch_nice: i32,
    pub shell: String,
    pub window: WindowSize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            interrupt_timeout_ms: DEFAULT_INTERRUPT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            drain_stale_output: true,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            batch_nice: DEFAULT_BATCH_NICE,
            shell: DEFAULT_SHELL.to_string(),
            window: WindowSize::default(),
        }
    }
}

impl ExecConfig {
    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub(crate) fn read_chunk_bytes(&self) -> usize {
        self.read_chunk_bytes.max(1)
    }

    pub fn from_toml_str(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(path, &contents)
    }

    /// Loads `config.toml` from the execbridge home, or defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let Some(path) = default_config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}

/// `$EXECBRIDGE_HOME/config.toml`, else `~/.execbridge/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV_VAR)
        && !home.is_empty()
    {
        return Some(PathBuf::from(home).join(CONFIG_FILE_NAME));
    }
    dirs::home_dir().map(|home| home.join(HOME_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ExecConfig::from_toml_str(
            Path::new("config.toml"),
            r#"
interrupt_timeout_ms = 250
shell = "/bin/bash"

[window]
rows = 50
cols = 132
"#,
        )
        .expect("parse");

        assert_eq!(config.interrupt_timeout(), Duration::from_millis(250));
        assert_eq!(config.shell, "/bin/bash");
        assert_eq!(config.window, WindowSize { rows: 50, cols: 132 });
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert!(config.drain_stale_output);
        assert_eq!(config.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(config.batch_nice, DEFAULT_BATCH_NICE);
    }

    #[test]
    fn malformed_file_reports_path() {
        let err = ExecConfig::from_toml_str(Path::new("bad.toml"), "poll_interval_ms = \"x\"")
            .expect_err("must fail");
        assert_matches!(err, ConfigError::Parse { path, .. } if path == Path::new("bad.toml"));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "read_chunk_bytes = 512\n").expect("write config");

        let config = ExecConfig::load(&path).expect("load");
        assert_eq!(config.read_chunk_bytes, 512);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = ExecConfig {
            poll_interval_ms: 0,
            ..ExecConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
