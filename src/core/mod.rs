//! Core tailing engine.
//!
//! This module contains the file-following logic, independent of any UI:
//!
//! - **cancel**: One-shot cancellation signal shared by a worker group
//! - **cursor**: Rotation-aware incremental reads of a single file
//! - **session**: Poll loop around one cursor, feeding a line sink
//! - **coordinator**: One worker thread per file, joint start/stop/join
//! - **display**: Bounded per-stream line buffer feeding the renderer
//!
//! # Architecture
//!
//! ```text
//! MultiTailCoordinator
//! ├── CancelSignal (one-shot, owned)
//! └── worker thread per source
//!     └── TailSession
//!         └── FileCursor (offset + identity + partial line)
//!             │
//!             ▼
//!       LineSink (Mutex<RingDisplayBuffer>) ──▶ render callback
//! ```

pub mod cancel;
pub mod coordinator;
pub mod cursor;
pub mod display;
pub mod event;
pub mod session;

pub use cancel::StopTrigger;
pub use coordinator::{MultiTailCoordinator, ShutdownReport, TailOptions, TailSource, WorkerState};
pub use display::{DisplaySnapshot, RingDisplayBuffer};
pub use event::{LineEvent, SourceTag};
pub use session::SessionOutcome;
