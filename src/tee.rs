//! Output capture for `rtlog run`
//!
//! Runs a command with its stdout/stderr piped, and copies every chunk both
//! to this process's matching stream and to the job file. The job files are
//! truncated when the capture starts.

use std::fs::File;
use std::io::{self, BufWriter, LineWriter, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::core::SourceTag;
use crate::registry::JobFiles;

/// How job files buffer what they receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    /// Write each chunk as soon as the child produces it
    Unbuffered,
    /// Flush at every newline
    Line,
    /// Flush when this many bytes are pending
    Block(usize),
}

impl Buffering {
    /// `1` selects line buffering, larger values a block size, anything else
    /// writes through
    pub fn from_arg(size: i64) -> Self {
        match size {
            1 => Buffering::Line,
            n if n > 1 => Buffering::Block(n as usize),
            _ => Buffering::Unbuffered,
        }
    }
}

/// A job output file with the chosen buffering
pub enum LogFile {
    Direct(File),
    Line(LineWriter<File>),
    Block(BufWriter<File>),
}

impl LogFile {
    pub fn create(path: &std::path::Path, buffering: Buffering) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(match buffering {
            Buffering::Unbuffered => LogFile::Direct(file),
            Buffering::Line => LogFile::Line(LineWriter::new(file)),
            Buffering::Block(size) => LogFile::Block(BufWriter::with_capacity(size, file)),
        })
    }

    /// Flush and sync to disk
    pub fn finish(mut self) -> io::Result<()> {
        self.flush()?;
        let file = match &self {
            LogFile::Direct(file) => file,
            LogFile::Line(writer) => writer.get_ref(),
            LogFile::Block(writer) => writer.get_ref(),
        };
        file.sync_all()
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogFile::Direct(file) => file.write(buf),
            LogFile::Line(writer) => writer.write(buf),
            LogFile::Block(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogFile::Direct(file) => file.flush(),
            LogFile::Line(writer) => writer.flush(),
            LogFile::Block(writer) => writer.flush(),
        }
    }
}

/// Duplicates writes to a primary stream and a copy
pub struct Tee<A: Write, B: Write> {
    primary: A,
    copy: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, copy: B) -> Self {
        Self { primary, copy }
    }

    pub fn into_parts(self) -> (A, B) {
        (self.primary, self.copy)
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.copy.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.copy.flush()
    }
}

/// Which streams to capture and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub buffering: Buffering,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            buffering: Buffering::Unbuffered,
        }
    }
}

/// Pump threads of a running capture. Dropping the guard joins them, so
/// job files are always flushed and closed.
pub struct CaptureGuard {
    pumps: Vec<(SourceTag, JoinHandle<io::Result<u64>>)>,
}

impl CaptureGuard {
    /// Wait for the child's streams to close; reports the first copy error
    pub fn finish(mut self) -> io::Result<()> {
        self.join_all()
    }

    fn join_all(&mut self) -> io::Result<()> {
        let mut result = Ok(());
        for (tag, pump) in self.pumps.drain(..) {
            let outcome = pump
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "capture thread panicked")));
            match outcome {
                Ok(bytes) => debug!(tag = %tag, bytes, "capture finished"),
                Err(e) => {
                    warn!(tag = %tag, error = %e, "capture failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let _ = self.join_all();
    }
}

/// Spawn `command` with the selected streams copied into the job files.
/// Streams that are not captured are inherited.
pub fn spawn_captured(
    command: &mut Command,
    files: &JobFiles,
    options: CaptureOptions,
) -> io::Result<(Child, CaptureGuard)> {
    // Create the files first so a failing path does not leave a child behind
    let out_file = if options.stdout {
        Some(LogFile::create(&files.stdout, options.buffering)?)
    } else {
        None
    };
    let err_file = if options.stderr {
        Some(LogFile::create(&files.stderr, options.buffering)?)
    } else {
        None
    };

    command
        .stdout(if options.stdout { Stdio::piped() } else { Stdio::inherit() })
        .stderr(if options.stderr { Stdio::piped() } else { Stdio::inherit() });
    let mut child = command.spawn()?;

    let mut guard = CaptureGuard { pumps: Vec::new() };
    if let (Some(file), Some(pipe)) = (out_file, child.stdout.take()) {
        guard
            .pumps
            .push((SourceTag::Out, spawn_pump(SourceTag::Out, pipe, Tee::new(io::stdout(), file))?));
    }
    if let (Some(file), Some(pipe)) = (err_file, child.stderr.take()) {
        guard
            .pumps
            .push((SourceTag::Err, spawn_pump(SourceTag::Err, pipe, Tee::new(io::stderr(), file))?));
    }

    Ok((child, guard))
}

/// Command line as a shell would accept it, recorded as the job's code
pub fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_alphanumeric() || "-_./=:,+@%".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_pump<R, A>(tag: SourceTag, from: R, to: Tee<A, LogFile>) -> io::Result<JoinHandle<io::Result<u64>>>
where
    R: Read + Send + 'static,
    A: Write + Send + 'static,
{
    thread::Builder::new()
        .name(format!("rtlog-capture-{}", tag))
        .spawn(move || pump(from, to))
}

/// Copy until EOF, pushing every chunk through immediately
fn pump<R: Read, A: Write>(mut from: R, mut to: Tee<A, LogFile>) -> io::Result<u64> {
    let mut buffer = vec![0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        to.write_all(&buffer[..n])?;
        // The terminal side is flushed per chunk so prompts without a
        // newline still show up
        to.primary.flush()?;
        total += n as u64;
    }
    let (mut primary, file) = to.into_parts();
    primary.flush()?;
    file.finish()?;
    Ok(total)
}
