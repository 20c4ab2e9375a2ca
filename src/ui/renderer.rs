//! Live view renderer.
//!
//! Draws one frame per refresh tick:
//!
//! ```text
//! ┌ Code ─────────────────────────────┐
//! │  1 │ python train.py --epochs 3   │
//! ├ Output ───────────────────────────┤
//! │ STDOUT           │ STDERR         │
//! │ epoch 1 done     │ warning: ...   │
//! └──────────────────┴────────────────┘
//!  job: train | 2 running     q/Ctrl+C: quit
//! ```
//!
//! Frames use synchronized output so a redraw never tears.

use std::io::{self, Write};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{self, Clear, ClearType},
};
use unicode_width::UnicodeWidthChar;

use crate::config::ColorScheme;
use crate::core::{DisplaySnapshot, SourceTag};

/// Begin a render frame (synchronized update, hide cursor, disable autowrap)
fn begin_frame<W: Write>(out: &mut W) -> io::Result<()> {
    write!(out, "\x1b[?2026h")?;
    write!(out, "\x1b[?7l")?;
    queue!(out, Hide)?;
    Ok(())
}

/// End a render frame and flush
fn end_frame<W: Write>(out: &mut W) -> io::Result<()> {
    write!(out, "\x1b[?7h")?;
    write!(out, "\x1b[?2026l")?;
    out.flush()
}

/// Run a render operation between frame guards, ending the frame on error too
fn with_frame<W: Write, F>(out: &mut W, f: F) -> io::Result<()>
where
    F: FnOnce(&mut W) -> io::Result<()>,
{
    begin_frame(out)?;
    let result = f(out);
    let _ = end_frame(out);
    result
}

struct BorderChars {
    top_left: char,
    top_right: char,
    bottom_left: char,
    bottom_right: char,
    horizontal: char,
    vertical: char,
    t_up: char,
    t_left: char,
    t_right: char,
}

impl BorderChars {
    fn single() -> Self {
        Self {
            top_left: '┌',
            top_right: '┐',
            bottom_left: '└',
            bottom_right: '┘',
            horizontal: '─',
            vertical: '│',
            t_up: '┴',
            t_left: '┤',
            t_right: '├',
        }
    }
}

/// Status bar contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    /// Some worker has failed
    pub error: bool,
}

/// Everything one frame shows
pub struct LiveView<'a> {
    pub job: &'a str,
    pub code: Option<&'a str>,
    pub snapshot: &'a DisplaySnapshot,
    pub status: &'a StatusLine,
}

/// Rows taken by the code panel and output panel for a terminal `height`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Code lines shown (0 hides the panel)
    pub code_rows: usize,
    /// Output rows shown below the column header
    pub output_rows: usize,
}

impl FrameLayout {
    /// Output rows get priority; the code panel uses what is left
    pub fn compute(height: usize, code_lines: usize, capacity: usize) -> Self {
        // status bar + output title + header + bottom border
        let chrome = 4;
        let body = height.saturating_sub(chrome);
        let output_rows = capacity.min(body);
        // code title row
        let spare = body.saturating_sub(output_rows).saturating_sub(1);
        let code_rows = if code_lines == 0 { 0 } else { code_lines.min(spare) };
        Self { code_rows, output_rows }
    }
}

/// Terminal renderer for the live view
pub struct Renderer {
    initialized: bool,
    pub color_scheme: ColorScheme,
}

impl Renderer {
    pub fn with_color_scheme(color_scheme: ColorScheme) -> Self {
        Self {
            initialized: false,
            color_scheme,
        }
    }

    /// Enter raw mode on the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            terminal::EnterAlternateScreen,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;

        self.initialized = true;
        Ok(())
    }

    /// Restore the terminal; safe to call more than once
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();

        // Restore terminal state (in case of abnormal exit)
        write!(stdout, "\x1b[?7h")?;
        write!(stdout, "\x1b[?2026l")?;
        stdout.flush()?;

        execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            terminal::LeaveAlternateScreen
        )?;
        terminal::disable_raw_mode()
    }

    /// Draw a full frame
    pub fn render(&mut self, view: &LiveView<'_>) -> io::Result<()> {
        let (width, height) = terminal::size()?;
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());

        with_frame(&mut out, |out| {
            queue!(out, Clear(ClearType::All))?;
            self.draw(out, view, width as usize, height as usize)
        })
    }

    fn draw<W: Write>(&self, out: &mut W, view: &LiveView<'_>, width: usize, height: usize) -> io::Result<()> {
        if width < 4 || height < 5 {
            return Ok(());
        }
        let code = view.code.map(numbered_code).unwrap_or_default();
        let layout = FrameLayout::compute(height, code.len(), view.snapshot.capacity);
        let widths = column_widths(width, view.snapshot.columns.len().max(1));
        let mut y = 0u16;

        if layout.code_rows > 0 {
            self.draw_title(out, y, width, "Code", BorderChars::single().top_left, BorderChars::single().top_right)?;
            y += 1;
            let truncated = code.len() > layout.code_rows;
            for (i, line) in code.iter().take(layout.code_rows).enumerate() {
                let line = if truncated && i + 1 == layout.code_rows { "…" } else { line.as_str() };
                self.draw_code_line(out, y, width, line)?;
                y += 1;
            }
        }

        let chars = BorderChars::single();
        let (left, right) = if layout.code_rows > 0 {
            (chars.t_right, chars.t_left)
        } else {
            (chars.top_left, chars.top_right)
        };
        self.draw_title(out, y, width, "Output", left, right)?;
        y += 1;

        let labels: Vec<String> = view.snapshot.columns.iter().map(|(tag, _)| tag.label()).collect();
        self.draw_row(out, y, &widths, &labels, None)?;
        y += 1;

        let tags: Vec<&SourceTag> = view.snapshot.columns.iter().map(|(tag, _)| tag).collect();
        for row in view.snapshot.rows().into_iter().take(layout.output_rows) {
            self.draw_row(out, y, &widths, &row, Some(tags.as_slice()))?;
            y += 1;
        }

        self.draw_bottom(out, y, &widths)?;
        self.draw_status_bar(out, height as u16 - 1, width, view)
    }

    fn draw_title<W: Write>(&self, out: &mut W, y: u16, width: usize, title: &str, left: char, right: char) -> io::Result<()> {
        let cs = &self.color_scheme;
        let chars = BorderChars::single();
        let inner = width.saturating_sub(2);
        let mut label = format!(" {} ", title);
        if display_width(&label) > inner {
            label = fit_width(&label, inner);
        }
        let rest = inner.saturating_sub(display_width(&label));

        queue!(
            out,
            MoveTo(0, y),
            SetForegroundColor(cs.border.to_crossterm()),
            Print(left),
            SetForegroundColor(cs.title.to_crossterm()),
            SetAttribute(Attribute::Bold),
            Print(label),
            SetAttribute(Attribute::Reset),
            SetForegroundColor(cs.border.to_crossterm()),
            Print(chars.horizontal.to_string().repeat(rest)),
            Print(right),
            ResetColor
        )
    }

    fn draw_code_line<W: Write>(&self, out: &mut W, y: u16, width: usize, line: &str) -> io::Result<()> {
        let cs = &self.color_scheme;
        let chars = BorderChars::single();
        let inner = width.saturating_sub(4);
        // Numbers are right aligned in the first five cells
        let (number, text) = match line.split_once(" │ ") {
            Some((number, text)) => (format!("{} │ ", number), text),
            None => (String::new(), line),
        };
        let number = fit_width(&number, inner);
        let text = fit_width(text, inner.saturating_sub(display_width(&number)));

        queue!(
            out,
            MoveTo(0, y),
            SetForegroundColor(cs.border.to_crossterm()),
            Print(chars.vertical),
            Print(' '),
            SetForegroundColor(cs.line_number.to_crossterm()),
            Print(number),
            SetForegroundColor(cs.code.to_crossterm()),
            Print(text),
            SetForegroundColor(cs.border.to_crossterm()),
            Print(' '),
            Print(chars.vertical),
            ResetColor
        )
    }

    /// One table row. Header rows pass `tags = None`.
    fn draw_row<W: Write, S: AsRef<str>>(
        &self,
        out: &mut W,
        y: u16,
        widths: &[usize],
        cells: &[S],
        tags: Option<&[&SourceTag]>,
    ) -> io::Result<()> {
        let cs = &self.color_scheme;
        let chars = BorderChars::single();
        queue!(out, MoveTo(0, y))?;

        for (i, width) in widths.iter().enumerate() {
            let text = cells.get(i).map(|c| c.as_ref()).unwrap_or("");
            let color = match tags.and_then(|t| t.get(i)) {
                None => cs.header,
                Some(SourceTag::Err) => cs.stderr,
                Some(_) => cs.stdout,
            };
            queue!(
                out,
                SetForegroundColor(cs.border.to_crossterm()),
                Print(chars.vertical),
                Print(' '),
                SetForegroundColor(color.to_crossterm())
            )?;
            if tags.is_none() {
                queue!(out, SetAttribute(Attribute::Bold))?;
            }
            queue!(out, Print(fit_width(text, *width)), SetAttribute(Attribute::Reset), Print(' '))?;
        }
        queue!(out, SetForegroundColor(cs.border.to_crossterm()), Print(chars.vertical), ResetColor)
    }

    fn draw_bottom<W: Write>(&self, out: &mut W, y: u16, widths: &[usize]) -> io::Result<()> {
        let chars = BorderChars::single();
        let mut line = String::new();
        line.push(chars.bottom_left);
        for (i, width) in widths.iter().enumerate() {
            if i > 0 {
                line.push(chars.t_up);
            }
            line.push_str(&chars.horizontal.to_string().repeat(width + 2));
        }
        line.push(chars.bottom_right);

        queue!(
            out,
            MoveTo(0, y),
            SetForegroundColor(self.color_scheme.border.to_crossterm()),
            Print(line),
            ResetColor
        )
    }

    fn draw_status_bar<W: Write>(&self, out: &mut W, y: u16, width: usize, view: &LiveView<'_>) -> io::Result<()> {
        let cs = &self.color_scheme;
        let fg = if view.status.error { cs.status_error } else { cs.status_fg };
        let shortcuts = "q/Ctrl+C: quit";
        let left = format!(" job: {} | {}", view.job, view.status.text);

        let right_width = display_width(shortcuts) + 1;
        let left = fit_width(&left, width.saturating_sub(right_width));
        let right = fit_width(&format!("{} ", shortcuts), width.saturating_sub(display_width(&left)));

        queue!(
            out,
            MoveTo(0, y),
            SetBackgroundColor(cs.status_bg.to_crossterm()),
            SetForegroundColor(fg.to_crossterm()),
            Print(left),
            SetForegroundColor(cs.status_fg.to_crossterm()),
            Print(right),
            ResetColor
        )
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Content width of each of `count` columns in a table `total` cells wide.
/// Each column costs one border and two padding cells, plus the closing border.
pub fn column_widths(total: usize, count: usize) -> Vec<usize> {
    let count = count.max(1);
    let usable = total.saturating_sub(count * 3 + 1);
    let base = usable / count;
    let extra = usable % count;
    (0..count).map(|i| base + usize::from(i < extra)).collect()
}

/// Code lines prefixed with right-aligned line numbers
pub fn numbered_code(code: &str) -> Vec<String> {
    code.lines()
        .enumerate()
        .map(|(i, line)| format!("{:>3} │ {}", i + 1, line.replace('\t', "    ")))
        .collect()
}

/// Display width of `text` in terminal cells
pub fn display_width(text: &str) -> usize {
    text.chars().map(|c| c.width().unwrap_or(0)).sum()
}

/// Cut or pad `text` to exactly `width` cells. A wide character that would
/// straddle the edge is replaced by padding.
pub fn fit_width(text: &str, width: usize) -> String {
    let mut result = String::with_capacity(width);
    let mut used = 0;
    for c in text.chars() {
        if c.is_control() {
            continue;
        }
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        result.push(c);
        used += w;
    }
    result.extend(std::iter::repeat(' ').take(width - used));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_width_pads_and_truncates() {
        assert_eq!(fit_width("abc", 5), "abc  ");
        assert_eq!(fit_width("abcdef", 3), "abc");
        assert_eq!(fit_width("", 2), "  ");
    }

    #[test]
    fn test_fit_width_wide_chars() {
        // Each CJK character takes two cells
        assert_eq!(fit_width("日本語", 4), "日本");
        assert_eq!(fit_width("日本語", 5), "日本 ");
        assert_eq!(display_width(&fit_width("a日b", 3)), 3);
    }

    #[test]
    fn test_fit_width_drops_control_chars() {
        assert_eq!(fit_width("a\tb\x1b", 4), "ab  ");
    }

    #[test]
    fn test_column_widths_fill_the_table() {
        let widths = column_widths(80, 2);
        assert_eq!(widths, vec![37, 36]);
        assert_eq!(widths.iter().sum::<usize>() + 2 * 3 + 1, 80);
        assert_eq!(column_widths(3, 2), vec![0, 0]);
    }

    #[test]
    fn test_numbered_code() {
        let lines = numbered_code("import os\n\tprint(1)");
        assert_eq!(lines, vec!["  1 │ import os", "  2 │     print(1)"]);
    }

    #[test]
    fn test_layout_prefers_output_rows() {
        let layout = FrameLayout::compute(24, 3, 10);
        assert_eq!(layout, FrameLayout { code_rows: 3, output_rows: 10 });

        let tight = FrameLayout::compute(12, 30, 10);
        assert_eq!(tight, FrameLayout { code_rows: 0, output_rows: 8 });

        let no_code = FrameLayout::compute(24, 0, 10);
        assert_eq!(no_code.code_rows, 0);
    }
}
