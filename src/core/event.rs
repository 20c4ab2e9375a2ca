//! Line events and the sink contract shared by all tail sessions

use std::fmt;

/// Which logical stream a line came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceTag {
    /// Standard output
    Out,
    /// Standard error
    Err,
    /// Any other stream
    Named(String),
}

impl SourceTag {
    /// An empty custom name is not a usable tag
    pub fn is_valid(&self) -> bool {
        match self {
            SourceTag::Named(name) => !name.is_empty(),
            _ => true,
        }
    }

    /// Column heading
    pub fn label(&self) -> String {
        match self {
            SourceTag::Out => "STDOUT".to_string(),
            SourceTag::Err => "STDERR".to_string(),
            SourceTag::Named(name) => name.to_uppercase(),
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Out => write!(f, "out"),
            SourceTag::Err => write!(f, "err"),
            SourceTag::Named(name) => write!(f, "{}", name),
        }
    }
}

/// One newline-stripped line read from a tailed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub tag: SourceTag,
    pub text: String,
}

impl LineEvent {
    pub fn new(tag: SourceTag, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
        }
    }
}

/// Receiver of line events. Called concurrently from every tail worker.
pub trait LineSink: Send + Sync {
    fn push(&self, event: LineEvent);
}

impl<F> LineSink for F
where
    F: Fn(LineEvent) + Send + Sync,
{
    fn push(&self, event: LineEvent) {
        self(event)
    }
}
