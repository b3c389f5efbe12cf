//! Find-in-files on top of a pipe session: builds the `grep` command line and
//! turns its `path:line:text` output into per-file result batches.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use async_channel::Sender;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::SpawnError;
use crate::protocol::CommandSpec;
use crate::protocol::ExitStatus;
use crate::protocol::OutputEvent;
use crate::protocol::OutputStream;
use crate::session::lock;
use crate::sink::ExecutionSink;

/// Output lines longer than this are skipped rather than parsed.
pub const MAX_MATCH_LINE_BYTES: usize = 2048;

/// A fixed-string recursive search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepQuery {
    text: String,
    path: PathBuf,
    whole_word: bool,
    case_sensitive: bool,
    exclude_dirs: Vec<String>,
}

impl GrepQuery {
    pub fn new(text: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            path: path.into(),
            whole_word: false,
            case_sensitive: true,
            exclude_dirs: Vec::new(),
        }
    }

    pub fn whole_word(mut self, whole_word: bool) -> Self {
        self.whole_word = whole_word;
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn exclude_dir(mut self, dir: impl Into<String>) -> Self {
        self.exclude_dirs.push(dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `grep [--exclude-dir=D]... -IFHrn[w][i] -- <text> <path>`, quoted for
    /// `sh -c`.
    pub fn command_line(&self) -> Result<String, SpawnError> {
        if self.text.is_empty() {
            return Err(SpawnError::InvalidArgument("empty search text".to_string()));
        }
        let mut line = String::from("grep");
        for dir in &self.exclude_dirs {
            line.push_str(" --exclude-dir=");
            line.push_str(&quote(dir)?);
        }
        line.push_str(" -IFHrn");
        if self.whole_word {
            line.push('w');
        }
        if !self.case_sensitive {
            line.push('i');
        }
        line.push_str(" -- ");
        line.push_str(&quote(&self.text)?);
        line.push(' ');
        line.push_str(&quote(&self.path.to_string_lossy())?);
        Ok(line)
    }

    /// A batch spec running [`GrepQuery::command_line`] under `/bin/sh`.
    pub fn to_command(&self) -> Result<CommandSpec, SpawnError> {
        Ok(CommandSpec::shell(self.command_line()?).with_tag("grep"))
    }
}

fn quote(word: &str) -> Result<String, SpawnError> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| SpawnError::InvalidArgument(word.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    pub line: u32,
    pub text: String,
}

/// Consecutive matches from one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatches {
    pub path: PathBuf,
    pub lines: Vec<LineMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    Results(FileMatches),
    Done,
}

/// Receives grouped search results.
pub trait SearchResultSink: Send + Sync {
    fn on_results(&self, matches: FileMatches);

    /// Called once, after the final batch.
    fn on_done(&self);
}

impl SearchResultSink for Sender<SearchEvent> {
    fn on_results(&self, matches: FileMatches) {
        if self.send_blocking(SearchEvent::Results(matches)).is_err() {
            debug!("search receiver dropped");
        }
    }

    fn on_done(&self) {
        if self.send_blocking(SearchEvent::Done).is_err() {
            debug!("search receiver dropped before completion");
        }
    }
}

/// `path:line:text`, split on the first two colons.
fn parse_match(line: &str) -> Option<(&str, u32, &str)> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (path, rest) = line.split_once(':')?;
    if path.is_empty() {
        return None;
    }
    let (number, text) = rest.split_once(':')?;
    let number = number.parse().ok()?;
    Some((path, number, text))
}

/// An [`ExecutionSink`] for a grep session: groups matching stdout lines by
/// file and flushes a batch whenever the file changes and when the search
/// ends.
pub struct SearchSink<S> {
    downstream: S,
    current: Mutex<Option<FileMatches>>,
}

impl<S: SearchResultSink> SearchSink<S> {
    pub fn new(downstream: S) -> Self {
        Self {
            downstream,
            current: Mutex::new(None),
        }
    }

    fn record(&self, path: &str, line: u32, text: &str) {
        let finished = {
            let mut current = lock(&self.current);
            let same_file = current
                .as_ref()
                .is_some_and(|batch| batch.path.as_os_str() == path);
            let finished = if same_file {
                None
            } else {
                current.replace(FileMatches {
                    path: PathBuf::from(path),
                    lines: Vec::new(),
                })
            };
            if let Some(batch) = current.as_mut() {
                batch.lines.push(LineMatch {
                    line,
                    text: text.to_string(),
                });
            }
            finished
        };
        if let Some(batch) = finished {
            self.downstream.on_results(batch);
        }
    }
}

impl<S: SearchResultSink> ExecutionSink for SearchSink<S> {
    fn on_output(&self, event: OutputEvent) {
        if event.stream != OutputStream::Stdout {
            debug!(line = %event.text().trim_end(), "grep stderr");
            return;
        }
        if event.chunk.len() > MAX_MATCH_LINE_BYTES {
            return;
        }
        let text = event.text();
        if let Some((path, line, matched)) = parse_match(&text) {
            self.record(path, line, matched);
        }
    }

    fn on_exited(&self, _tag: &str, status: ExitStatus) {
        // grep exits 1 when nothing matched.
        debug!(%status, "search finished");
        let last = lock(&self.current).take();
        if let Some(batch) = last {
            self.downstream.on_results(batch);
        }
        self.downstream.on_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_line_quotes_text_and_path() {
        let query = GrepQuery::new("it's here", "/work/my project")
            .whole_word(true)
            .case_sensitive(false)
            .exclude_dir("target")
            .exclude_dir(".git");
        let line = query.command_line().expect("command");
        assert_eq!(
            shlex::split(&line).expect("shell words"),
            vec![
                "grep",
                "--exclude-dir=target",
                "--exclude-dir=.git",
                "-IFHrnwi",
                "--",
                "it's here",
                "/work/my project",
            ]
        );
    }

    #[test]
    fn empty_query_is_rejected() {
        assert!(GrepQuery::new("", ".").command_line().is_err());
    }

    #[test]
    fn parses_path_line_and_text() {
        assert_eq!(
            parse_match("src/main.rs:42:    let x = a:b;\n"),
            Some(("src/main.rs", 42, "    let x = a:b;"))
        );
        assert_eq!(parse_match("Binary file matches\n"), None);
        assert_eq!(parse_match("src/main.rs:x:text"), None);
        assert_eq!(parse_match(":1:text"), None);
    }

    #[test]
    fn consecutive_matches_are_grouped_by_file() {
        let (tx, rx) = async_channel::unbounded();
        let sink = SearchSink::new(tx);
        for line in [
            "a.rs:1:one\n",
            "a.rs:5:five\n",
            "grep: unreadable: Permission denied\n",
            "b.rs:2:two\n",
        ] {
            sink.on_output(OutputEvent::new(OutputStream::Stdout, line.as_bytes().to_vec()));
        }
        sink.on_exited("grep", ExitStatus::Exited(0));

        let events: Vec<SearchEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                SearchEvent::Results(FileMatches {
                    path: PathBuf::from("a.rs"),
                    lines: vec![
                        LineMatch {
                            line: 1,
                            text: "one".to_string()
                        },
                        LineMatch {
                            line: 5,
                            text: "five".to_string()
                        },
                    ],
                }),
                SearchEvent::Results(FileMatches {
                    path: PathBuf::from("b.rs"),
                    lines: vec![LineMatch {
                        line: 2,
                        text: "two".to_string()
                    }],
                }),
                SearchEvent::Done,
            ]
        );
    }

    #[test]
    fn dropped_receiver_does_not_break_the_sink() {
        let (tx, rx) = async_channel::unbounded();
        drop(rx);
        let sink = SearchSink::new(tx);
        sink.on_output(OutputEvent::new(OutputStream::Stdout, b"a.rs:1:one\n".to_vec()));
        sink.on_exited("grep", ExitStatus::Exited(0));
        assert!(lock(&sink.current).is_none());
    }

    #[test]
    fn overlong_lines_are_skipped() {
        let (tx, rx) = async_channel::unbounded();
        let sink = SearchSink::new(tx);
        let long = format!("a.rs:1:{}\n", "x".repeat(MAX_MATCH_LINE_BYTES));
        sink.on_output(OutputEvent::new(OutputStream::Stdout, long.into_bytes()));
        sink.on_exited("grep", ExitStatus::Exited(0));
        assert_eq!(rx.try_recv().ok(), Some(SearchEvent::Done));
    }
}
