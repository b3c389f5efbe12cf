pub mod grep_cmd;
pub mod pty_cmd;
pub mod run_cmd;

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use execbridge_core::ExecConfig;

/// Reads `path` when given, else the default config location.
pub fn load_config(path: Option<&Path>) -> Result<ExecConfig> {
    match path {
        Some(path) => ExecConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => ExecConfig::load_default().context("failed to load default config"),
    }
}

/// Clamps an exit code into the range a process can return.
pub fn process_exit_code(code: i32) -> i32 {
    if (0..=255).contains(&code) {
        code
    } else {
        255
    }
}
