use crate::cmd;
use crate::dialect::{LineParser, PreparedRun, Stream};
use crate::locate::ToolKind;
use crate::progress::ProgressUpdate;
use crate::{EngineError, Result};
use regex::Regex;
use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const OUTPUT_TAIL_LINES: usize = 20;
const MAX_REASON_CHARS: usize = 300;
/// How long to keep reading after the process exited while a grandchild
/// still holds the output pipes open.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Shared stop flag for one invocation. Cloned into the queue store so a
/// cancel request can reach the running tool without knowing its pid.
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle(Arc<AtomicBool>);

impl TerminationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(PathBuf),
    Failure(String),
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationEvent {
    Progress(ProgressUpdate),
    Finished(Outcome),
}

/// One running external process, consumed as a finite stream of events that
/// always ends with exactly one `Finished`.
pub struct Invocation {
    tool: ToolKind,
    child: Child,
    lines: Receiver<(Stream, String)>,
    parser: Box<dyn LineParser>,
    expected_output: Option<PathBuf>,
    accept_output_on_error: bool,
    termination: TerminationHandle,
    poll_interval: Duration,
    tail: VecDeque<String>,
    exited: Option<(ExitStatus, Instant)>,
    finished: bool,
}

pub fn invoke(
    run: PreparedRun,
    termination: TerminationHandle,
    poll_interval: Duration,
) -> Result<Invocation> {
    let PreparedRun {
        tool,
        mut command,
        parser,
        expected_output,
        accept_output_on_error,
    } = run;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::ToolMissing {
            tool: tool.as_str().to_string(),
        },
        _ => EngineError::Io(e),
    })?;

    let (tx, rx) = mpsc::channel();
    let readers = [
        child
            .stdout
            .take()
            .map(|out| spawn_line_reader(out, tool, Stream::Stdout, tx.clone())),
        child
            .stderr
            .take()
            .map(|err| spawn_line_reader(err, tool, Stream::Stderr, tx.clone())),
    ];
    drop(tx);
    for reader in readers.into_iter().flatten() {
        if let Err(e) = reader {
            cmd::kill_process_tree(&mut child);
            return Err(EngineError::Io(e));
        }
    }

    tracing::debug!(tool = %tool, pid = child.id(), "spawned external tool");

    Ok(Invocation {
        tool,
        child,
        lines: rx,
        parser,
        expected_output,
        accept_output_on_error,
        termination,
        poll_interval: poll_interval.max(Duration::from_millis(10)),
        tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
        exited: None,
        finished: false,
    })
}

impl Invocation {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    /// Last non-progress output lines, oldest first.
    pub fn output_tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    fn remember(&mut self, line: String) {
        let line = line.trim().to_string();
        if line.is_empty() {
            return;
        }
        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn finish(&mut self, outcome: Outcome) -> InvocationEvent {
        self.finished = true;
        if !matches!(outcome, Outcome::Success(_)) {
            self.remove_partial_output();
        }
        InvocationEvent::Finished(outcome)
    }

    fn finish_with_status(&mut self, status: ExitStatus) -> InvocationEvent {
        if self.termination.is_terminated() {
            return self.finish(Outcome::Terminated);
        }

        let output = self
            .parser
            .reported_output()
            .or_else(|| self.expected_output.clone());
        let produced = output.filter(|p| p.is_file());

        let outcome = match (status.success(), produced) {
            (true, Some(path)) => Outcome::Success(path),
            (true, None) => Outcome::Failure(format!(
                "{} finished without producing an output file",
                self.tool
            )),
            (false, Some(path)) if self.accept_output_on_error => {
                tracing::warn!(
                    tool = %self.tool,
                    code = ?status.code(),
                    "tool exited with an error but produced its output; keeping it"
                );
                Outcome::Success(path)
            }
            (false, _) => Outcome::Failure(classify_failure(
                self.tool,
                status.code(),
                self.tail.make_contiguous(),
            )),
        };
        self.finish(outcome)
    }

    fn remove_partial_output(&self) {
        if let Some(path) = self.expected_output.as_ref().filter(|p| p.is_file()) {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove partial output"),
            }
        }
    }
}

impl Iterator for Invocation {
    type Item = InvocationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.termination.is_terminated() {
                if self.exited.is_none() {
                    tracing::debug!(tool = %self.tool, pid = self.child.id(), "terminating external tool");
                    cmd::kill_process_tree(&mut self.child);
                }
                return Some(self.finish(Outcome::Terminated));
            }

            if let Some((status, at)) = self.exited {
                if at.elapsed() >= EXIT_GRACE {
                    return Some(self.finish_with_status(status));
                }
            }

            match self.lines.recv_timeout(self.poll_interval) {
                Ok((stream, line)) => {
                    if let Some(update) = self.parser.feed(stream, &line) {
                        return Some(InvocationEvent::Progress(update));
                    }
                    self.remember(line);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.exited.is_some() {
                        continue;
                    }
                    match self.child.try_wait() {
                        Ok(Some(status)) => self.exited = Some((status, Instant::now())),
                        Ok(None) => {}
                        Err(e) => {
                            cmd::kill_process_tree(&mut self.child);
                            return Some(self.finish(Outcome::Failure(format!(
                                "could not wait for {}: {e}",
                                self.tool
                            ))));
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = match self.exited {
                        Some((status, _)) => Ok(status),
                        None => self.child.wait(),
                    };
                    return Some(match status {
                        Ok(status) => self.finish_with_status(status),
                        Err(e) => self.finish(Outcome::Failure(format!(
                            "could not wait for {}: {e}",
                            self.tool
                        ))),
                    });
                }
            }
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.finished && self.exited.is_none() {
            cmd::kill_process_tree(&mut self.child);
        }
    }
}

/// Streams `reader` as lines split on `\n` or `\r`; tools redraw progress
/// with bare carriage returns.
fn spawn_line_reader<R: Read + Send + 'static>(
    mut reader: R,
    tool: ToolKind,
    stream: Stream,
    tx: Sender<(Stream, String)>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let name = match stream {
        Stream::Stdout => format!("{tool}-stdout"),
        Stream::Stderr => format!("{tool}-stderr"),
    };
    thread::Builder::new().name(name).spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for &byte in &buf[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !pending.is_empty() {
                        let line = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        if tx.send((stream, line)).is_err() {
                            return;
                        }
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send((stream, String::from_utf8_lossy(&pending).into_owned()));
        }
    })
}

/// Short, user-facing reason for a failed run.
pub fn classify_failure(tool: ToolKind, code: Option<i32>, tail: &[String]) -> String {
    let haystack = tail.join("\n").to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if has(&["no space left", "disk full", "not enough space"]) {
        return "Insufficient disk space".to_string();
    }
    if has(&["permission denied", "access is denied", "operation not permitted"]) {
        return "Permission denied".to_string();
    }
    if has(&["unsupported url"]) {
        return "Unsupported URL".to_string();
    }
    if has(&[
        "unable to download",
        "network is unreachable",
        "connection refused",
        "connection reset",
        "timed out",
        "name or service not known",
        "getaddrinfo failed",
        "temporary failure in name resolution",
    ]) {
        return "Network connection failed".to_string();
    }

    let last_error = tail
        .iter()
        .rev()
        .find_map(|l| l.trim().strip_prefix("ERROR:").map(str::trim))
        .filter(|l| !l.is_empty())
        .or_else(|| tail.iter().rev().map(|l| l.trim()).find(|l| !l.is_empty()));
    if let Some(line) = last_error {
        return shorten(&redact_home_paths(line));
    }

    match code {
        Some(code) => format!("{tool} exited with code {code}"),
        None => format!("{tool} was terminated by a signal"),
    }
}

fn redact_home_paths(value: &str) -> String {
    static HOME_PATH_RE: OnceLock<Regex> = OnceLock::new();
    let re = HOME_PATH_RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:/home/|/Users/|[A-Z]:\\Users\\)[^\s'":]+(?::[^\s'":]+)*"#).unwrap()
    });
    re.replace_all(value, "<redacted_path>").into_owned()
}

fn shorten(value: &str) -> String {
    if value.chars().count() <= MAX_REASON_CHARS {
        return value.to_string();
    }
    let mut out: String = value.chars().take(MAX_REASON_CHARS).collect();
    out.push('…');
    out
}
