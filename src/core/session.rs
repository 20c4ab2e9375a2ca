//! Tail session
//!
//! Drives one [`FileCursor`] in a poll loop, forwarding new lines to a sink
//! until cancelled.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::cancel::CancelObserver;
use super::cursor::{FileCursor, TailError};
use super::event::{LineEvent, LineSink, SourceTag};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped by the cancel signal
    Cancelled,
    /// File became permanently inaccessible
    Failed(String),
    /// Worker thread panicked
    Panicked,
    /// Worker did not finish within the join grace period
    TimedOut,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Cancelled => write!(f, "cancelled"),
            SessionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            SessionOutcome::Panicked => write!(f, "panicked"),
            SessionOutcome::TimedOut => write!(f, "did not stop in time"),
        }
    }
}

/// A single tailed file
pub struct TailSession {
    /// Stream label attached to every line
    tag: SourceTag,
    /// Exclusively owned read position
    cursor: FileCursor,
    /// Sleep between polls that found nothing
    poll_interval: Duration,
    /// A transient error is being reported; cleared on the next good poll
    failing: bool,
}

impl TailSession {
    pub fn new(tag: SourceTag, cursor: FileCursor, poll_interval: Duration) -> Self {
        assert!(tag.is_valid(), "source tag must not be empty");
        assert!(!poll_interval.is_zero(), "poll interval must be positive");
        Self {
            tag,
            cursor,
            poll_interval,
            failing: false,
        }
    }

    /// Run until `cancel` is set or the file becomes unreadable.
    ///
    /// The cursor's handle is closed before this returns.
    pub fn follow<S: LineSink + ?Sized>(&mut self, sink: &S, cancel: &CancelObserver) -> SessionOutcome {
        let outcome = self.poll_loop(sink, cancel);
        self.cursor.close();
        match &outcome {
            SessionOutcome::Failed(reason) => {
                error!(tag = %self.tag, path = %self.cursor.path().display(), %reason, "tail session failed");
            }
            other => {
                debug!(tag = %self.tag, outcome = %other, "tail session ended");
            }
        }
        outcome
    }

    fn poll_loop<S: LineSink + ?Sized>(&mut self, sink: &S, cancel: &CancelObserver) -> SessionOutcome {
        loop {
            if cancel.is_set() {
                return SessionOutcome::Cancelled;
            }

            if !self.cursor.is_open() {
                match self.cursor.open_or_wait(cancel, self.poll_interval) {
                    Ok(()) => {
                        info!(tag = %self.tag, path = %self.cursor.path().display(), identity = ?self.cursor.identity(), "tailing");
                    }
                    Err(TailError::SourceNotFound(_)) => return SessionOutcome::Cancelled,
                    Err(e) => return SessionOutcome::Failed(e.to_string()),
                }
            }

            let progressed = match self.poll_once(sink) {
                Ok(progressed) => {
                    if self.failing {
                        info!(tag = %self.tag, "reads recovered");
                        self.failing = false;
                    }
                    progressed
                }
                Err(e) if e.is_fatal() => return SessionOutcome::Failed(e.to_string()),
                Err(TailError::SourceNotFound(_)) => {
                    info!(tag = %self.tag, path = %self.cursor.path().display(), "file removed, waiting for it to return");
                    self.flush_removed(sink);
                    false
                }
                Err(e) => {
                    if self.failing {
                        debug!(tag = %self.tag, error = %e, "read still failing");
                    } else {
                        warn!(tag = %self.tag, error = %e, "read failed, will retry");
                        self.failing = true;
                    }
                    false
                }
            };

            if !progressed && cancel.wait_timeout(self.poll_interval) {
                return SessionOutcome::Cancelled;
            }
        }
    }

    /// One rotation check plus read. Returns whether anything changed.
    fn poll_once<S: LineSink + ?Sized>(&mut self, sink: &S) -> Result<bool, TailError> {
        let before = self.cursor.offset();
        let rotated = self.cursor.check_rotation()?;
        let lines = self.cursor.read_new()?;
        let progressed = rotated || !lines.is_empty() || self.cursor.offset() != before;

        self.forward(sink, lines);
        Ok(progressed || self.cursor.has_more())
    }

    /// Deliver what the deleted file still held, then let go of it
    fn flush_removed<S: LineSink + ?Sized>(&mut self, sink: &S) {
        let mut lines = self.cursor.read_new().unwrap_or_default();
        lines.extend(self.cursor.take_partial());
        self.forward(sink, lines);
        self.cursor.close();
    }

    fn forward<S: LineSink + ?Sized>(&self, sink: &S, lines: Vec<String>) {
        for line in lines {
            if !line.is_empty() {
                sink.push(LineEvent::new(self.tag.clone(), line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelSignal;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(10);

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn spawn_session(
        path: &Path,
        signal: &CancelSignal,
    ) -> (Arc<Mutex<Vec<String>>>, thread::JoinHandle<SessionOutcome>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let observer = signal.observer();
        let mut session = TailSession::new(SourceTag::Out, FileCursor::new(path), POLL);
        let handle = thread::spawn(move || {
            let sink = move |event: LineEvent| sink_seen.lock().unwrap().push(event.text);
            session.follow(&sink, &observer)
        });
        (seen, handle)
    }

    #[test]
    fn test_follow_skips_empty_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.stdout");
        append(&path, "a\n\n\r\nb\n");

        let signal = CancelSignal::new();
        let (seen, handle) = spawn_session(&path, &signal);

        assert!(wait_for(|| seen.lock().unwrap().len() == 2));
        signal.set();
        assert_eq!(handle.join().unwrap(), SessionOutcome::Cancelled);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.stdout");

        let signal = CancelSignal::new();
        let (seen, handle) = spawn_session(&path, &signal);

        thread::sleep(POLL * 3);
        append(&path, "hello\n");

        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        signal.set();
        assert_eq!(handle.join().unwrap(), SessionOutcome::Cancelled);
    }

    #[test]
    fn test_follows_delete_and_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.stdout");
        append(&path, "old\n");

        let signal = CancelSignal::new();
        let (seen, handle) = spawn_session(&path, &signal);
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));

        fs::remove_file(&path).unwrap();
        thread::sleep(POLL * 3);
        append(&path, "new\n");

        assert!(wait_for(|| seen.lock().unwrap().len() == 2));
        signal.set();
        handle.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["old", "new"]);
    }

    #[test]
    fn test_unreadable_source_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let signal = CancelSignal::new();
        let (seen, handle) = spawn_session(dir.path(), &signal);

        match handle.join().unwrap() {
            SessionOutcome::Failed(reason) => assert!(reason.contains("not a regular file")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "source tag must not be empty")]
    fn test_empty_tag_is_rejected() {
        TailSession::new(SourceTag::Named(String::new()), FileCursor::new("x"), POLL);
    }
}
