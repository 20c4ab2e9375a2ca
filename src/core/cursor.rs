//! File cursor
//!
//! Incremental, rotation-aware reading of a single append-only file. The
//! cursor remembers how far it has read and which file it was reading
//! (device + inode on Unix), so it can tell when the path was truncated in
//! place, replaced by a new file, or deleted.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::cancel::CancelObserver;

/// Upper bound on bytes consumed by one `read_new` call
pub const MAX_READ_PER_POLL: u64 = 1 << 20;

/// A partial line longer than this is emitted as-is
const MAX_PENDING: usize = 1 << 20;

/// Leading bytes remembered to spot a truncate-and-rewrite that outgrew the offset
const HEAD_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum TailError {
    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    IoTransient {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is inaccessible: {reason}", path.display())]
    IoFatal { path: PathBuf, reason: String },
}

impl TailError {
    /// Fatal errors end the session; everything else is retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, TailError::IoFatal { .. })
    }

    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TailError::SourceNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => TailError::IoFatal {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
            _ => TailError::IoTransient {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TailError>;

/// Opaque "same file" key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    // No stable file index on Windows; creation time changes when the file is recreated
    #[cfg(windows)]
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::windows::fs::MetadataExt;
        Some(Self {
            dev: 0,
            ino: meta.creation_time(),
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

/// Number of file handles currently held by a group of cursors
#[derive(Debug, Clone, Default)]
pub struct HandleCount(Arc<AtomicUsize>);

impl HandleCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn opened(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Read position and identity of one tailed file
pub struct FileCursor {
    path: PathBuf,
    file: Option<File>,
    /// Bytes consumed from the current file
    offset: u64,
    identity: Option<FileIdentity>,
    /// Bytes after the last newline, waiting for the rest of the line
    pending: Vec<u8>,
    /// Lines drained from a file that was replaced, delivered on the next read
    carry: Vec<String>,
    /// First bytes consumed from the current file
    head: Vec<u8>,
    /// Last read stopped at `MAX_READ_PER_POLL`
    capped: bool,
    handles: HandleCount,
}

impl FileCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_handle_count(path, HandleCount::new())
    }

    /// Cursor whose open handle is tracked in a shared counter
    pub fn with_handle_count(path: impl Into<PathBuf>, handles: HandleCount) -> Self {
        Self {
            path: path.into(),
            file: None,
            offset: 0,
            identity: None,
            pending: Vec::new(),
            carry: Vec::new(),
            head: Vec::new(),
            capped: false,
            handles,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// More data was left behind by the last read
    pub fn has_more(&self) -> bool {
        self.capped
    }

    /// One open attempt. `Ok(false)` means the file does not exist yet.
    pub fn try_open(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(TailError::from_io(&self.path, e)),
        };
        let meta = file
            .metadata()
            .map_err(|e| TailError::from_io(&self.path, e))?;
        if !meta.is_file() {
            return Err(TailError::IoFatal {
                path: self.path.clone(),
                reason: "not a regular file".to_string(),
            });
        }

        self.identity = FileIdentity::of(&meta);
        self.offset = 0;
        self.pending.clear();
        self.head.clear();
        self.capped = false;
        self.file = Some(file);
        self.handles.opened();

        debug!(path = %self.path.display(), size = meta.len(), "opened");
        Ok(true)
    }

    /// Keep trying to open until the file exists.
    ///
    /// Fails with `SourceNotFound` only when cancelled while waiting, and with
    /// `IoFatal` when the path exists but can never be read.
    pub fn open_or_wait(&mut self, cancel: &CancelObserver, poll: Duration) -> Result<()> {
        let mut reported = false;
        loop {
            if cancel.is_set() {
                return Err(TailError::SourceNotFound(self.path.clone()));
            }

            match self.try_open() {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if !reported {
                        info!(path = %self.path.display(), "waiting for file to appear");
                        reported = true;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if reported {
                        debug!(error = %e, "open retry");
                    } else {
                        warn!(error = %e, "open failed, retrying");
                        reported = true;
                    }
                }
            }

            if cancel.wait_timeout(poll) {
                return Err(TailError::SourceNotFound(self.path.clone()));
            }
        }
    }

    /// Compare the file on disk with what the cursor has been reading.
    ///
    /// Returns `true` if the file was replaced, shrank below the current
    /// offset, or no longer starts with the bytes already read; the cursor has
    /// then been reopened at offset 0. A vanished file
    /// is reported as `SourceNotFound` and leaves the old handle open so the
    /// caller can drain it.
    pub fn check_rotation(&mut self) -> Result<bool> {
        if self.file.is_none() {
            return Ok(false);
        }

        let meta = fs::metadata(&self.path).map_err(|e| TailError::from_io(&self.path, e))?;
        let replaced = FileIdentity::of(&meta) != self.identity;
        let truncated = meta.len() < self.offset || (!replaced && self.head_changed()?);
        if !replaced && !truncated {
            return Ok(false);
        }

        if replaced {
            info!(path = %self.path.display(), "file replaced, reading new file from start");
            // Whatever the old file still had is delivered before the new content
            match self.read_new() {
                Ok(lines) => self.carry.extend(lines),
                Err(e) => warn!(path = %self.path.display(), error = %e, "unread tail of replaced file lost"),
            }
            if let Some(partial) = self.take_partial() {
                self.carry.push(partial);
            }
        } else {
            info!(
                path = %self.path.display(),
                size = meta.len(),
                offset = self.offset,
                "file truncated, rewinding"
            );
        }

        self.release();
        if self.try_open()? {
            Ok(true)
        } else {
            Err(TailError::SourceNotFound(self.path.clone()))
        }
    }

    /// All complete lines appended since the last call, newline-stripped.
    ///
    /// Lines carried over from a replaced file stay queued when the read fails.
    pub fn read_new(&mut self) -> Result<Vec<String>> {
        let mut lines = std::mem::take(&mut self.carry);
        match self.read_file(&mut lines) {
            Ok(()) => Ok(lines),
            Err(e) => {
                self.carry = lines;
                Err(e)
            }
        }
    }

    fn read_file(&mut self, lines: &mut Vec<String>) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| TailError::from_io(&self.path, e))?;
        let mut buf = Vec::new();
        let n = file
            .by_ref()
            .take(MAX_READ_PER_POLL)
            .read_to_end(&mut buf)
            .map_err(|e| TailError::from_io(&self.path, e))?;

        self.capped = n as u64 == MAX_READ_PER_POLL;
        if self.head.len() < HEAD_LEN {
            let take = (HEAD_LEN - self.head.len()).min(n);
            self.head.extend_from_slice(&buf[..take]);
        }
        self.offset += n as u64;
        if n > 0 {
            self.pending.extend_from_slice(&buf);
            self.drain_lines(lines);
        }
        Ok(())
    }

    /// The start of the file differs from what was read there
    fn head_changed(&mut self) -> Result<bool> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        if self.head.is_empty() {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(0))
            .map_err(|e| TailError::from_io(&self.path, e))?;
        let mut current = Vec::with_capacity(self.head.len());
        file.by_ref()
            .take(self.head.len() as u64)
            .read_to_end(&mut current)
            .map_err(|e| TailError::from_io(&self.path, e))?;
        Ok(current != self.head)
    }

    /// Unterminated trailing data, if any
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }

    /// Drop the handle and forget all position state
    pub fn close(&mut self) {
        self.release();
        self.carry.clear();
    }

    fn release(&mut self) {
        if self.file.take().is_some() {
            self.handles.closed();
            debug!(path = %self.path.display(), "closed");
        }
        self.offset = 0;
        self.identity = None;
        self.pending.clear();
        self.head.clear();
        self.capped = false;
    }

    fn drain_lines(&mut self, lines: &mut Vec<String>) {
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_PENDING {
            warn!(path = %self.path.display(), len = self.pending.len(), "overlong line, emitting partial");
            if let Some(partial) = self.take_partial() {
                lines.push(partial);
            }
        }
    }
}

impl Drop for FileCursor {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
