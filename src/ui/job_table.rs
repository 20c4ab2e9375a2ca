//! Job listings: the table printed by `rtlog ls` and before the selection
//! prompt, and the full dump printed by `rtlog load`.

use std::fs;
use std::io::{self, Write};
use crossterm::{
    queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetForegroundColor},
};

use tracing::warn;

use super::renderer::{display_width, fit_width, numbered_code};
use crate::config::ColorScheme;
use crate::registry::Job;

const HEADERS: [&str; 5] = ["Index", "Path", "Output Name", "Code", "Start Date"];

/// Code lines wider than this are cut
const CODE_WIDTH: usize = 60;

/// Physical lines of the table body. A job spans one line per code line;
/// only its first line carries the other columns.
pub fn table_rows(jobs: &[Job]) -> Vec<Vec<[String; 5]>> {
    jobs.iter()
        .enumerate()
        .map(|(index, job)| {
            let mut code: Vec<String> = job
                .entry
                .code
                .lines()
                .enumerate()
                .map(|(i, line)| {
                    let line = format!("{}: {}", i + 1, line.replace('\t', "    "));
                    if display_width(&line) > CODE_WIDTH {
                        format!("{}…", fit_width(&line, CODE_WIDTH - 1).trim_end())
                    } else {
                        line
                    }
                })
                .collect();
            if code.is_empty() {
                code.push(String::new());
            }

            code.into_iter()
                .enumerate()
                .map(|(i, code)| {
                    if i == 0 {
                        [
                            index.to_string(),
                            job.dir(),
                            job.name(),
                            code,
                            job.entry.start_date.clone(),
                        ]
                    } else {
                        [String::new(), String::new(), String::new(), code, String::new()]
                    }
                })
                .collect()
        })
        .collect()
}

/// Width of each column: the widest cell or header
fn column_widths(rows: &[Vec<[String; 5]>]) -> [usize; 5] {
    let mut widths = HEADERS.map(display_width);
    for line in rows.iter().flatten() {
        for (width, cell) in widths.iter_mut().zip(line) {
            *width = (*width).max(display_width(cell));
        }
    }
    widths
}

/// Print the table with the index column highlighted
pub fn print_jobs<W: Write>(out: &mut W, jobs: &[Job], scheme: &ColorScheme) -> io::Result<()> {
    let rows = table_rows(jobs);
    let widths = column_widths(&rows);
    let rule: String = widths
        .iter()
        .map(|w| "─".repeat(*w))
        .collect::<Vec<_>>()
        .join("─┼─");

    queue!(out, SetAttribute(Attribute::Bold))?;
    for (i, (header, width)) in HEADERS.iter().zip(widths).enumerate() {
        if i > 0 {
            queue!(out, Print(" │ "))?;
        }
        queue!(out, Print(fit_width(header, width)))?;
    }
    queue!(out, SetAttribute(Attribute::Reset), Print("\n"))?;

    for job in &rows {
        queue!(
            out,
            SetForegroundColor(scheme.border.to_crossterm()),
            Print(&rule),
            ResetColor,
            Print("\n")
        )?;
        for line in job {
            for (i, (cell, width)) in line.iter().zip(widths).enumerate() {
                if i > 0 {
                    queue!(out, Print(" │ "))?;
                }
                if i == 0 {
                    queue!(
                        out,
                        SetForegroundColor(scheme.index.to_crossterm()),
                        Print(fit_width(cell, width)),
                        ResetColor
                    )?;
                } else {
                    queue!(out, Print(fit_width(cell, width)))?;
                }
            }
            queue!(out, Print("\n"))?;
        }
    }
    out.flush()
}

/// The job's numbered code in a box titled "Code"
pub fn print_code<W: Write>(out: &mut W, job: &Job, scheme: &ColorScheme) -> io::Result<()> {
    let lines = numbered_code(&job.entry.code);
    let title = " Code ";
    let inner = lines
        .iter()
        .map(|line| display_width(line))
        .max()
        .unwrap_or(0)
        .max(display_width(title) + 2);
    let border = scheme.border.to_crossterm();

    queue!(
        out,
        SetForegroundColor(border),
        Print("┌─"),
        SetForegroundColor(scheme.title.to_crossterm()),
        Print(title),
        SetForegroundColor(border),
        Print("─".repeat(inner + 1 - display_width(title))),
        Print("┐\n")
    )?;
    for line in &lines {
        queue!(
            out,
            Print("│ "),
            ResetColor,
            Print(fit_width(line, inner)),
            SetForegroundColor(border),
            Print(" │\n")
        )?;
    }
    queue!(out, Print(format!("└{}┘\n", "─".repeat(inner + 2))), ResetColor)?;
    out.flush()
}

/// Of `len` lines: the first `top` when positive, the last `|top|` when
/// negative, all otherwise
pub fn select_lines(len: usize, top: Option<i64>) -> std::ops::Range<usize> {
    match top {
        Some(n) if n > 0 => 0..len.min(n as usize),
        Some(n) if n < 0 => len.saturating_sub(n.unsigned_abs() as usize)..len,
        _ => 0..len,
    }
}

/// Print a job's code followed by its stderr and stdout files
pub fn dump_job<W: Write>(out: &mut W, job: &Job, top: Option<i64>) -> io::Result<()> {
    let header = format!("{bar}{} code{bar}", job.prefix.display(), bar = "+".repeat(10));
    writeln!(out, "{}", header)?;
    writeln!(out, "{}", job.entry.code)?;

    let files = job.files();
    for path in [&files.stderr, &files.stdout] {
        let name = path.display().to_string();
        let side = display_width(&header).saturating_sub(display_width(&name)) / 2;
        writeln!(out, "{bar}{}{bar}", name, bar = "-".repeat(side))?;

        match fs::read(path) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let lines: Vec<&str> = text.lines().collect();
                for line in &lines[select_lines(lines.len(), top)] {
                    writeln!(out, "{}", line)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => writeln!(out, "(no output yet)")?,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read job output");
                writeln!(out, "(unreadable: {})", e)?;
            }
        }
        writeln!(out)?;
    }
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobEntry;
    use std::path::PathBuf;

    fn job(prefix: &str, code: &str) -> Job {
        Job {
            prefix: PathBuf::from(prefix),
            entry: JobEntry {
                code: code.to_string(),
                start_date: "2024-05-01 10:00:00".to_string(),
            },
        }
    }

    #[test]
    fn test_multiline_code_spans_rows() {
        let rows = table_rows(&[job("/exp/train", "import os\nrun()")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0][0][0], "0");
        assert_eq!(rows[0][0][1], "/exp");
        assert_eq!(rows[0][0][2], "train");
        assert_eq!(rows[0][0][3], "1: import os");
        assert_eq!(rows[0][1][3], "2: run()");
        assert!(rows[0][1][0].is_empty());
    }

    #[test]
    fn test_long_code_is_cut() {
        let long = "x".repeat(200);
        let rows = table_rows(&[job("/exp/a", &long)]);
        let code = &rows[0][0][3];
        assert!(code.ends_with('…'));
        assert!(display_width(code) <= CODE_WIDTH);
    }

    #[test]
    fn test_print_contains_every_job() {
        let jobs = [job("/exp/a", "a()"), job("/exp/b", "")];
        let mut out = Vec::new();
        print_jobs(&mut out, &jobs, &ColorScheme::default()).unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Output Name"));
        assert!(text.contains("1: a()"));
        assert!(text.contains("2024-05-01 10:00:00"));
        // Path only on each job's first line
        assert_eq!(text.matches("/exp").count(), 2);
    }

    #[test]
    fn test_code_box_numbers_lines() {
        let mut out = Vec::new();
        print_code(&mut out, &job("/exp/a", "x = 1\nfit(x)"), &ColorScheme::default()).unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains(" Code "));
        assert!(text.contains("  1 │ x = 1"));
        assert!(text.contains("  2 │ fit(x)"));
        assert_eq!(text.matches('\n').count(), 4);
    }

    #[test]
    fn test_select_lines() {
        let lines = 4;
        assert_eq!(select_lines(lines, None), 0..4);
        assert_eq!(select_lines(lines, Some(0)), 0..4);
        assert_eq!(select_lines(lines, Some(2)), 0..2);
        assert_eq!(select_lines(lines, Some(10)), 0..4);
        assert_eq!(select_lines(lines, Some(-1)), 3..4);
        assert_eq!(select_lines(lines, Some(-10)), 0..4);
    }

    #[test]
    fn test_dump_job_prints_code_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train");
        let job = Job {
            prefix: prefix.clone(),
            entry: JobEntry {
                code: "fit()".to_string(),
                start_date: String::new(),
            },
        };
        let files = job.files();
        std::fs::write(&files.stdout, "epoch 1\nepoch 2\nepoch 3\n").unwrap();

        let mut out = Vec::new();
        dump_job(&mut out, &job, Some(-2)).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("++++++++++"));
        assert!(text.contains("fit()"));
        assert!(text.contains("(no output yet)"));
        assert!(!text.contains("epoch 1"));
        assert!(text.contains("epoch 2\nepoch 3\n"));
        // stderr section comes first
        assert!(text.find(".stderr").unwrap() < text.find(".stdout").unwrap());
    }
}
