//! Terminal output.
//!
//! - **renderer**: Full-screen live view of a job's streams and code
//! - **job_table**: Job table and plain-text job dumps

pub mod job_table;
pub mod renderer;

pub use job_table::{dump_job, print_code, print_jobs};
pub use renderer::{LiveView, Renderer, StatusLine};
