//! Ring display buffer
//!
//! Keeps the most recent lines of each stream for the live view. Every push
//! hands an immutable snapshot to the render callback.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::event::{LineEvent, LineSink, SourceTag};

/// Default number of lines kept per stream
pub const DEFAULT_CAPACITY: usize = 10;

/// Called with the current contents after every push
pub type RenderCallback = Box<dyn FnMut(&DisplaySnapshot) + Send>;

/// Point-in-time copy of every stream's lines
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplaySnapshot {
    pub capacity: usize,
    pub columns: Vec<(SourceTag, Vec<String>)>,
}

impl DisplaySnapshot {
    /// Lines of one stream, oldest first
    #[cfg(test)]
    pub fn stream(&self, tag: &SourceTag) -> Option<&[String]> {
        self.columns
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, lines)| lines.as_slice())
    }

    /// `capacity` rows aligned by index; a stream shorter than the row
    /// contributes `""`
    pub fn rows(&self) -> Vec<Vec<&str>> {
        (0..self.capacity)
            .map(|i| {
                self.columns
                    .iter()
                    .map(|(_, lines)| lines.get(i).map(String::as_str).unwrap_or(""))
                    .collect()
            })
            .collect()
    }
}

/// Fixed-capacity FIFO per stream
pub struct RingDisplayBuffer {
    capacity: usize,
    streams: Vec<(SourceTag, VecDeque<String>)>,
    on_render: Option<RenderCallback>,
}

impl RingDisplayBuffer {
    /// Buffer with the given column order
    pub fn new(capacity: usize, tags: impl IntoIterator<Item = SourceTag>) -> Self {
        assert!(capacity > 0, "display capacity must be positive");
        let mut buffer = Self {
            capacity,
            streams: Vec::new(),
            on_render: None,
        };
        for tag in tags {
            buffer.column_mut(&tag);
        }
        buffer
    }

    /// STDOUT and STDERR side by side
    pub fn paired(capacity: usize) -> Self {
        Self::new(capacity, [SourceTag::Out, SourceTag::Err])
    }

    pub fn with_render_callback(mut self, callback: RenderCallback) -> Self {
        self.on_render = Some(callback);
        self
    }

    /// Append a line, evicting the oldest one at capacity. A tag without a
    /// column gets a new one on the right.
    pub fn push(&mut self, tag: &SourceTag, line: impl Into<String>) {
        assert!(tag.is_valid(), "source tag must not be empty");
        let capacity = self.capacity;
        let lines = self.column_mut(tag);
        if lines.len() == capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());

        if self.on_render.is_some() {
            let snapshot = self.snapshot();
            if let Some(render) = self.on_render.as_mut() {
                render(&snapshot);
            }
        }
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        DisplaySnapshot {
            capacity: self.capacity,
            columns: self
                .streams
                .iter()
                .map(|(tag, lines)| (tag.clone(), lines.iter().cloned().collect()))
                .collect(),
        }
    }

    fn column_mut(&mut self, tag: &SourceTag) -> &mut VecDeque<String> {
        let index = match self.streams.iter().position(|(t, _)| t == tag) {
            Some(index) => index,
            None => {
                self.streams
                    .push((tag.clone(), VecDeque::with_capacity(self.capacity)));
                self.streams.len() - 1
            }
        };
        &mut self.streams[index].1
    }
}

impl LineSink for Mutex<RingDisplayBuffer> {
    fn push(&self, event: LineEvent) {
        // A panicking render callback must not blank the other streams
        let mut buffer = self.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(&event.tag, event.text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_keeps_last_k_lines_in_order() {
        let mut buffer = RingDisplayBuffer::paired(3);
        for i in 0..7 {
            buffer.push(&SourceTag::Out, format!("line {}", i));
        }

        let snapshot = buffer.snapshot();
        assert_eq!(
            snapshot.stream(&SourceTag::Out).unwrap(),
            ["line 4", "line 5", "line 6"]
        );
        assert!(snapshot.stream(&SourceTag::Err).unwrap().is_empty());
    }

    #[test]
    fn test_rows_align_streams_of_different_length() {
        let mut buffer = RingDisplayBuffer::paired(3);
        buffer.push(&SourceTag::Out, "a");
        buffer.push(&SourceTag::Out, "b");
        buffer.push(&SourceTag::Err, "x");

        let snapshot = buffer.snapshot();
        assert_eq!(
            snapshot.rows(),
            vec![vec!["a", "x"], vec!["b", ""], vec!["", ""]]
        );
    }

    #[test]
    fn test_unknown_tag_gets_new_column() {
        let mut buffer = RingDisplayBuffer::paired(2);
        buffer.push(&SourceTag::Named("build".to_string()), "ok");

        let snapshot = buffer.snapshot();
        let tags: Vec<_> = snapshot.columns.iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(
            tags,
            vec![SourceTag::Out, SourceTag::Err, SourceTag::Named("build".to_string())]
        );
    }

    #[test]
    fn test_render_callback_sees_every_push() {
        let renders = Arc::new(Mutex::new(Vec::new()));
        let seen = renders.clone();
        let mut buffer = RingDisplayBuffer::paired(2).with_render_callback(Box::new(move |snapshot| {
            seen.lock().unwrap().push(snapshot.clone());
        }));

        buffer.push(&SourceTag::Out, "one");
        buffer.push(&SourceTag::Err, "two");

        let renders = renders.lock().unwrap();
        assert_eq!(renders.len(), 2);
        assert_eq!(renders[1].stream(&SourceTag::Out).unwrap(), ["one"]);
        assert_eq!(renders[1].stream(&SourceTag::Err).unwrap(), ["two"]);
    }

    #[test]
    fn test_mutex_buffer_is_a_sink() {
        let buffer = Mutex::new(RingDisplayBuffer::paired(2));
        LineSink::push(&buffer, LineEvent::new(SourceTag::Err, "oops"));
        let snapshot = buffer.lock().unwrap().snapshot();
        assert_eq!(snapshot.stream(&SourceTag::Err).unwrap(), ["oops"]);
    }

    #[test]
    #[should_panic(expected = "source tag must not be empty")]
    fn test_empty_tag_panics() {
        let mut buffer = RingDisplayBuffer::paired(2);
        buffer.push(&SourceTag::Named(String::new()), "x");
    }

    #[test]
    #[should_panic(expected = "display capacity must be positive")]
    fn test_zero_capacity_panics() {
        RingDisplayBuffer::paired(0);
    }
}
