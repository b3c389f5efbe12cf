use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use execbridge_core::ChannelSink;
use execbridge_core::CommandSpec;
use execbridge_core::ExecConfig;
use execbridge_core::ExecEvent;
use execbridge_core::OutputStream;
use execbridge_core::PipeExecutionSession;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Parser)]
pub struct RunCli {
    /// Working directory for the command.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Tag echoed in the start and exit log lines.
    #[arg(long = "tag", default_value = "run")]
    pub tag: String,

    /// Command line handed to the shell with `-c`.
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Runs the command and returns its shell-style exit code.
pub async fn run(cli: RunCli, config: ExecConfig) -> Result<i32> {
    let mut spec = CommandSpec::shell_with(config.shell.clone(), cli.command.join(" "))
        .with_tag(cli.tag);
    if let Some(cwd) = cli.cwd {
        spec = spec.with_cwd(cwd);
    }

    let (sink, events) = ChannelSink::unbounded();
    let session = Arc::new(PipeExecutionSession::new(config, Arc::new(sink)));
    session.start(spec).context("failed to start command")?;

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    anyhow::bail!("session ended without reporting an exit status");
                };
                match event {
                    ExecEvent::Started { tag } => debug!(%tag, "command started"),
                    ExecEvent::Output(output) => match output.stream {
                        OutputStream::Stdout => forward(&mut stdout, &output.chunk).await?,
                        OutputStream::Stderr => forward(&mut stderr, &output.chunk).await?,
                    },
                    ExecEvent::Exited { tag, status } => {
                        debug!(%tag, %status, "command exited");
                        return Ok(status.code());
                    }
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

async fn forward(out: &mut (impl AsyncWrite + Unpin), bytes: &[u8]) -> std::io::Result<()> {
    out.write_all(bytes).await?;
    out.flush().await
}
