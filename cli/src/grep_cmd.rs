use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use execbridge_core::ExecConfig;
use execbridge_core::PipeExecutionSession;
use execbridge_core::search::GrepQuery;
use execbridge_core::search::LineMatch;
use execbridge_core::search::SearchEvent;
use execbridge_core::search::SearchSink;

#[derive(Debug, Parser)]
pub struct GrepCli {
    /// Fixed text to look for.
    pub text: String,

    /// Directory or file to search.
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Match whole words only.
    #[arg(short = 'w', long = "word", default_value_t = false)]
    pub word: bool,

    #[arg(short = 'i', long = "ignore-case", default_value_t = false)]
    pub ignore_case: bool,

    /// Directory name to skip; repeatable.
    #[arg(long = "exclude-dir", value_name = "DIR")]
    pub exclude_dir: Vec<String>,
}

/// Prints matches grouped by file. Exits 0 when anything matched, else 1.
pub async fn run(cli: GrepCli, config: ExecConfig) -> Result<i32> {
    let query = cli
        .exclude_dir
        .into_iter()
        .fold(GrepQuery::new(cli.text, cli.path), GrepQuery::exclude_dir)
        .whole_word(cli.word)
        .case_sensitive(!cli.ignore_case);
    let spec = query.to_command().context("invalid search")?;

    let (tx, rx) = async_channel::unbounded();
    let session = PipeExecutionSession::new(config, Arc::new(SearchSink::new(tx)));
    session.start(spec).context("failed to start grep")?;

    let mut matched = false;
    while let Ok(event) = rx.recv().await {
        match event {
            SearchEvent::Results(batch) => {
                matched = true;
                println!("{}", batch.path.display());
                for hit in batch.lines {
                    let LineMatch { line, text } = hit;
                    println!("{line:>6}: {text}");
                }
            }
            SearchEvent::Done => break,
        }
    }
    Ok(if matched { 0 } else { 1 })
}
