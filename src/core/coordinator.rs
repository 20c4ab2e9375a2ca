//! Multi-file tail coordinator
//!
//! Runs one [`TailSession`] per source on its own thread, all feeding the
//! same sink and all watching the same [`CancelSignal`]. Stopping sets the
//! signal once and joins every worker, bounded by a grace period.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::cancel::{CancelSignal, StopTrigger};
use super::cursor::{FileCursor, HandleCount};
use super::event::{LineSink, SourceTag};
use super::session::{SessionOutcome, TailSession};

/// A file to tail and the tag its lines carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSource {
    pub path: PathBuf,
    pub tag: SourceTag,
}

impl TailSource {
    pub fn new(path: impl Into<PathBuf>, tag: SourceTag) -> Self {
        Self {
            path: path.into(),
            tag,
        }
    }
}

/// Timing knobs shared by every session of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    /// Sleep between polls that found no new data
    pub poll_interval: Duration,
    /// How long `stop` waits for workers after cancelling
    pub join_grace: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self::with_poll_interval(Duration::from_secs(1))
    }
}

impl TailOptions {
    /// Grace defaults to three poll intervals
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            join_grace: poll_interval * 3,
        }
    }
}

/// Final state of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub tag: SourceTag,
    pub path: PathBuf,
    pub outcome: SessionOutcome,
}

/// Outcome of every worker, in source order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub sessions: Vec<SessionReport>,
}

impl ShutdownReport {
    /// Sessions that ended for any reason other than cancellation
    pub fn failures(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|s| s.outcome != SessionOutcome::Cancelled)
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Live state of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Finished(SessionOutcome),
}

struct Worker {
    source: TailSource,
    handle: Option<JoinHandle<()>>,
    outcome: Option<SessionOutcome>,
}

/// Owner of a group of tail workers
pub struct MultiTailCoordinator {
    signal: CancelSignal,
    workers: Vec<Worker>,
    done_rx: Receiver<(usize, SessionOutcome)>,
    options: TailOptions,
    handles: HandleCount,
    report: Option<ShutdownReport>,
}

impl MultiTailCoordinator {
    /// Spawn one worker per source and return without blocking
    pub fn start<S>(sources: Vec<TailSource>, sink: Arc<S>, options: TailOptions) -> io::Result<Self>
    where
        S: LineSink + ?Sized + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let mut coordinator = Self {
            signal: CancelSignal::new(),
            workers: Vec::with_capacity(sources.len()),
            done_rx,
            options,
            handles: HandleCount::new(),
            report: None,
        };

        for (index, source) in sources.into_iter().enumerate() {
            let cursor = FileCursor::with_handle_count(&source.path, coordinator.handles.clone());
            let mut session = TailSession::new(source.tag.clone(), cursor, options.poll_interval);
            let observer = coordinator.signal.observer();
            let sink = sink.clone();
            let done = done_tx.clone();

            // On spawn failure, Drop stops the workers already running
            let handle = thread::Builder::new()
                .name(format!("rtlog-tail-{}", source.tag))
                .spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.follow(&*sink, &observer)))
                        .unwrap_or(SessionOutcome::Panicked);
                    let _ = done.send((index, outcome));
                })?;

            debug!(tag = %source.tag, path = %source.path.display(), "worker started");
            coordinator.workers.push(Worker {
                source,
                handle: Some(handle),
                outcome: None,
            });
        }

        info!(workers = coordinator.workers.len(), "tailing started");
        Ok(coordinator)
    }

    /// Handle for interrupt sources; firing it is the first half of `stop`
    pub fn trigger(&self) -> StopTrigger {
        self.signal.trigger()
    }

    pub fn is_stopping(&self) -> bool {
        self.signal.is_set()
    }

    /// File handles currently held by this coordinator's cursors
    pub fn open_handles(&self) -> usize {
        self.handles.get()
    }

    /// Per-source state, picking up any worker that has finished meanwhile
    pub fn status(&mut self) -> Vec<(SourceTag, WorkerState)> {
        while let Ok((index, outcome)) = self.done_rx.try_recv() {
            self.record(index, outcome);
        }

        if let Some(report) = &self.report {
            return report
                .sessions
                .iter()
                .map(|s| (s.tag.clone(), WorkerState::Finished(s.outcome.clone())))
                .collect();
        }

        self.workers
            .iter()
            .map(|w| {
                let state = match &w.outcome {
                    Some(outcome) => WorkerState::Finished(outcome.clone()),
                    None => WorkerState::Running,
                };
                (w.source.tag.clone(), state)
            })
            .collect()
    }

    /// Block until some trigger fires, then shut down like `stop`
    pub fn wait(&mut self) -> ShutdownReport {
        if self.report.is_none() {
            self.signal.wait();
        }
        self.stop()
    }

    /// Cancel every worker and join them. Safe to call repeatedly; later
    /// calls return the first report.
    pub fn stop(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        if self.signal.set() {
            info!(workers = self.workers.len(), "stopping tail workers");
        }

        let report = self.join_all();
        // Failed sessions already logged their reason
        for failed in report
            .failures()
            .filter(|s| !matches!(s.outcome, SessionOutcome::Failed(_)))
        {
            warn!(tag = %failed.tag, path = %failed.path.display(), outcome = %failed.outcome, "worker did not end cleanly");
        }
        self.report = Some(report.clone());
        report
    }

    fn record(&mut self, index: usize, outcome: SessionOutcome) {
        if let Some(worker) = self.workers.get_mut(index) {
            worker.outcome = Some(outcome);
        }
    }

    fn join_all(&mut self) -> ShutdownReport {
        let deadline = Instant::now() + self.options.join_grace;
        while self.workers.iter().any(|w| w.outcome.is_none()) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.done_rx.recv_timeout(deadline - now) {
                Ok((index, outcome)) => self.record(index, outcome),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut sessions = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let outcome = match (worker.outcome.clone(), worker.handle.take()) {
                (Some(outcome), Some(handle)) => {
                    let _ = handle.join();
                    outcome
                }
                (Some(outcome), None) => outcome,
                (None, Some(handle)) if handle.is_finished() => {
                    let _ = handle.join();
                    SessionOutcome::Panicked
                }
                (None, Some(_handle)) => {
                    // The thread is detached; it exits on its next cancel check
                    SessionOutcome::TimedOut
                }
                (None, None) => SessionOutcome::TimedOut,
            };
            worker.outcome = Some(outcome.clone());
            sessions.push(SessionReport {
                tag: worker.source.tag.clone(),
                path: worker.source.path.clone(),
                outcome,
            });
        }

        ShutdownReport { sessions }
    }
}

impl Drop for MultiTailCoordinator {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::LineEvent;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    const POLL: Duration = Duration::from_millis(20);

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn wait_for<F: FnMut() -> bool>(mut check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    type Seen = Arc<Mutex<Vec<LineEvent>>>;

    fn collecting_sink() -> (Seen, Arc<impl LineSink>) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = Arc::new(move |event: LineEvent| sink_seen.lock().unwrap().push(event));
        (seen, sink)
    }

    fn texts(seen: &Seen, tag: SourceTag) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| e.tag == tag)
            .map(|e| e.text.clone())
            .collect()
    }

    fn job_sources(dir: &Path) -> (PathBuf, PathBuf, Vec<TailSource>) {
        let out = dir.join("job.stdout");
        let err = dir.join("job.stderr");
        let sources = vec![
            TailSource::new(&out, SourceTag::Out),
            TailSource::new(&err, SourceTag::Err),
        ];
        (out, err, sources)
    }

    #[test]
    fn test_per_file_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err, sources) = job_sources(dir.path());
        append(&out, "");
        append(&err, "");

        let (seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        append(&out, "a\n");
        append(&err, "b\n");
        append(&out, "c\n");

        assert!(wait_for(|| seen.lock().unwrap().len() == 3));
        let report = coordinator.stop();
        assert!(report.is_clean());

        assert_eq!(texts(&seen, SourceTag::Out), vec!["a", "c"]);
        assert_eq!(texts(&seen, SourceTag::Err), vec!["b"]);
    }

    #[test]
    fn test_missing_file_picked_up_later() {
        let dir = tempfile::tempdir().unwrap();
        let (out, _err, sources) = job_sources(dir.path());

        let (seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        thread::sleep(POLL * 2);
        append(&out, "late arrival\n");

        assert!(wait_for(|| texts(&seen, SourceTag::Out) == vec!["late arrival"]));
        assert!(coordinator
            .status()
            .iter()
            .all(|(_, state)| *state == WorkerState::Running));
        assert!(coordinator.stop().is_clean());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_out, _err, sources) = job_sources(dir.path());

        let (_seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        let first = coordinator.stop();
        let second = coordinator.stop();
        assert_eq!(first, second);
        assert_eq!(first.sessions.len(), 2);
        assert!(first.is_clean());
        assert!(coordinator.is_stopping());
    }

    #[test]
    fn test_stop_mid_poll_is_prompt_and_releases_handles() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err, sources) = job_sources(dir.path());
        append(&out, "x\n");
        append(&err, "y\n");

        let poll = Duration::from_millis(300);
        let (seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(poll)).unwrap();

        assert!(wait_for(|| seen.lock().unwrap().len() == 2));
        assert_eq!(coordinator.open_handles(), 2);

        let started = Instant::now();
        let report = coordinator.stop();
        assert!(started.elapsed() < poll + Duration::from_millis(200));
        assert!(report.is_clean());
        assert_eq!(coordinator.open_handles(), 0);
    }

    #[test]
    fn test_failed_source_does_not_stop_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("job.stdout");
        let sources = vec![
            TailSource::new(&out, SourceTag::Out),
            TailSource::new(dir.path(), SourceTag::Err),
        ];

        let (seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        assert!(wait_for(|| {
            coordinator
                .status()
                .iter()
                .any(|(tag, state)| *tag == SourceTag::Err && matches!(state, WorkerState::Finished(_)))
        }));

        append(&out, "still here\n");
        assert!(wait_for(|| texts(&seen, SourceTag::Out) == vec!["still here"]));

        let report = coordinator.stop();
        assert_eq!(report.sessions[0].outcome, SessionOutcome::Cancelled);
        assert!(matches!(report.sessions[1].outcome, SessionOutcome::Failed(_)));
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_panicking_worker_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let (out, err, sources) = job_sources(dir.path());

        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = Arc::new(move |event: LineEvent| {
            if event.tag == SourceTag::Err {
                panic!("sink rejected stderr line");
            }
            sink_seen.lock().unwrap().push(event);
        });
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        append(&err, "boom\n");
        append(&out, "fine\n");
        assert!(wait_for(|| texts(&seen, SourceTag::Out) == vec!["fine"]));

        let report = coordinator.stop();
        assert_eq!(report.sessions[1].outcome, SessionOutcome::Panicked);
        assert_eq!(coordinator.open_handles(), 0);
    }

    #[test]
    fn test_wait_returns_after_external_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (_out, _err, sources) = job_sources(dir.path());

        let (_seen, sink) = collecting_sink();
        let mut coordinator =
            MultiTailCoordinator::start(sources, sink, TailOptions::with_poll_interval(POLL)).unwrap();

        let trigger = coordinator.trigger();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            assert!(trigger.fire());
            assert!(!trigger.fire());
        });

        let report = coordinator.wait();
        interrupter.join().unwrap();
        assert!(report.is_clean());
        assert_eq!(coordinator.stop(), report);
    }
}
