use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use execbridge_core::ChannelSink;
use execbridge_core::CommandSpec;
use execbridge_core::ExecConfig;
use execbridge_core::ExecEvent;
use execbridge_core::PtyExecutionSession;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tracing::debug;
use tracing::warn;

/// `^D`, sent when local stdin reaches EOF.
const END_OF_TRANSMISSION: u8 = 0x04;

#[derive(Debug, Parser)]
pub struct PtyCli {
    /// Terminal rows (defaults to the configured window).
    #[arg(long = "rows")]
    pub rows: Option<u16>,

    /// Terminal columns (defaults to the configured window).
    #[arg(long = "cols")]
    pub cols: Option<u16>,

    /// Program and arguments.
    #[arg(
        value_name = "ARGV",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub argv: Vec<String>,
}

/// Forwards local stdin lines to the pty and prints raw output.
pub async fn run(cli: PtyCli, mut config: ExecConfig) -> Result<i32> {
    if let Some(rows) = cli.rows {
        config.window.rows = rows;
    }
    if let Some(cols) = cli.cols {
        config.window.cols = cols;
    }

    let (sink, events) = ChannelSink::unbounded();
    let session = Arc::new(PtyExecutionSession::new(config, Arc::new(sink)));
    session
        .start(CommandSpec::interactive(cli.argv))
        .context("failed to start pty session")?;

    let mut stdout = tokio::io::stdout();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    anyhow::bail!("session ended without reporting an exit status");
                };
                match event {
                    ExecEvent::Started { .. } => debug!("pty session started"),
                    ExecEvent::Output(output) => {
                        stdout.write_all(&output.chunk).await?;
                        stdout.flush().await?;
                    }
                    ExecEvent::Exited { status, .. } => {
                        debug!(%status, "pty child exited");
                        return Ok(status.code());
                    }
                }
            }
            line = input.next_line(), if input_open => {
                let bytes = match line? {
                    Some(mut line) => {
                        line.push('\n');
                        line.into_bytes()
                    }
                    None => {
                        input_open = false;
                        vec![END_OF_TRANSMISSION]
                    }
                };
                // The child may already be gone; its exit event follows.
                if let Err(err) = session.write(&bytes) {
                    debug!(error = %err, "input not delivered");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let session = Arc::clone(&session);
                let outcome = tokio::task::spawn_blocking(move || session.interrupt()).await?;
                if let Err(err) = outcome {
                    warn!(error = %err, "interrupt did not complete cleanly");
                }
            }
        }
    }
}
