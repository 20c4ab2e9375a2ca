//! Configuration and color scheme management for rtlog.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.rtlog/config.toml`
//! - Tail timing and display size settings
//! - Built-in color schemes for the live view
//!
//! # Configuration File
//!
//! ```toml
//! # Job registry (default: ~/.ipython-rtlogging.json)
//! registry_path = "/home/me/.ipython-rtlogging.json"
//!
//! # Color scheme: default, monokai, nord
//! color_scheme = "nord"
//!
//! # Log level for ~/.rtlog/rtlog.log (RTLOG_LOG overrides)
//! log_level = "info"
//!
//! [tail]
//! poll_interval_ms = 1000
//! join_grace_intervals = 3
//!
//! [display]
//! lines = 10
//! refresh_per_second = 4
//! show_code = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::display::DEFAULT_CAPACITY;
use crate::core::TailOptions;
use crate::registry::JobRegistry;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Job registry location
    pub registry_path: Option<PathBuf>,
    /// Color scheme name
    pub color_scheme: String,
    /// Default log filter
    pub log_level: String,
    /// Polling settings
    pub tail: TailConfig,
    /// Live view settings
    pub display: DisplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: None,
            color_scheme: "default".to_string(),
            log_level: "info".to_string(),
            tail: TailConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

/// Tail settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub poll_interval_ms: u64,
    /// `stop` waits this many poll intervals for workers
    pub join_grace_intervals: u32,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            join_grace_intervals: 3,
        }
    }
}

/// Live view settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Lines kept per stream
    pub lines: usize,
    pub refresh_per_second: u32,
    /// Show the job's code above the output
    pub show_code: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            lines: DEFAULT_CAPACITY,
            refresh_per_second: 4,
            show_code: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults.
    ///
    /// Logging is not set up yet when this runs, so a file that cannot be
    /// used is reported back to the caller along with the defaults.
    pub fn load() -> (Self, Option<String>) {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => (Self::default(), None),
        }
    }

    fn load_from(path: &Path) -> (Self, Option<String>) {
        if !path.exists() {
            return (Self::default(), None);
        }
        let error = match fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => return (config, None),
                Err(e) => format!("invalid config {}: {}", path.display(), e.message()),
            },
            Err(e) => format!("unreadable config {}: {}", path.display(), e),
        };
        (Self::default(), Some(error))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `~/.rtlog`, created on demand
    pub fn rtlog_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".rtlog");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        Self::rtlog_dir().map(|dir| dir.join("config.toml"))
    }

    /// Configured registry, else the default location
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry_path.clone().or_else(JobRegistry::default_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail.poll_interval_ms.max(1))
    }

    pub fn tail_options(&self) -> TailOptions {
        let poll_interval = self.poll_interval();
        TailOptions {
            poll_interval,
            join_grace: poll_interval * self.tail.join_grace_intervals.max(1),
        }
    }

    /// Lines kept per stream, never zero
    pub fn display_lines(&self) -> usize {
        self.display.lines.max(1)
    }

    /// Delay between redraws of the live view
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.display.refresh_per_second.max(1)))
    }

    /// Get the color scheme
    pub fn get_color_scheme(&self) -> ColorScheme {
        if !ColorScheme::list().contains(&self.color_scheme.to_lowercase().as_str()) {
            warn!(scheme = %self.color_scheme, available = ?ColorScheme::list(), "unknown color scheme, using default");
        }
        ColorScheme::by_name(&self.color_scheme)
    }
}

/// Color definition (RGB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

/// Color scheme definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorScheme {
    pub name: String,

    // Panel titles and borders
    pub title: Color,
    pub border: Color,

    // Column headers and stream text
    pub header: Color,
    pub stdout: Color,
    pub stderr: Color,

    // Code panel
    pub line_number: Color,
    pub code: Color,

    // Job listing
    pub index: Color,

    // Status bar
    pub status_bg: Color,
    pub status_fg: Color,
    pub status_error: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self::default_scheme()
    }
}

impl ColorScheme {
    /// Default color scheme
    pub fn default_scheme() -> Self {
        Self {
            name: "default".to_string(),

            title: Color::new(220, 50, 47),
            border: Color::new(110, 110, 110),

            header: Color::new(255, 255, 255),
            stdout: Color::new(220, 220, 220),
            stderr: Color::new(230, 160, 60),

            line_number: Color::new(120, 120, 120),
            code: Color::new(200, 200, 200),

            index: Color::new(80, 200, 80),

            status_bg: Color::new(0, 100, 0),
            status_fg: Color::new(255, 255, 255),
            status_error: Color::new(255, 90, 90),
        }
    }

    /// Monokai scheme
    pub fn monokai() -> Self {
        Self {
            name: "monokai".to_string(),

            title: Color::new(249, 38, 114),
            border: Color::new(117, 113, 94),

            header: Color::new(248, 248, 242),
            stdout: Color::new(248, 248, 242),
            stderr: Color::new(253, 151, 31),

            line_number: Color::new(117, 113, 94),
            code: Color::new(230, 219, 116),

            index: Color::new(166, 226, 46),

            status_bg: Color::new(60, 60, 54),
            status_fg: Color::new(248, 248, 242),
            status_error: Color::new(249, 38, 114),
        }
    }

    /// Nord scheme
    pub fn nord() -> Self {
        Self {
            name: "nord".to_string(),

            title: Color::new(136, 192, 208),
            border: Color::new(76, 86, 106),

            header: Color::new(236, 239, 244),
            stdout: Color::new(216, 222, 233),
            stderr: Color::new(235, 203, 139),

            line_number: Color::new(76, 86, 106),
            code: Color::new(163, 190, 140),

            index: Color::new(163, 190, 140),

            status_bg: Color::new(59, 66, 82),
            status_fg: Color::new(216, 222, 233),
            status_error: Color::new(191, 97, 106),
        }
    }

    /// Get scheme by name
    pub fn by_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "monokai" => Self::monokai(),
            "nord" => Self::nord(),
            _ => Self::default_scheme(),
        }
    }

    /// List available schemes
    pub fn list() -> Vec<&'static str> {
        vec!["default", "monokai", "nord"]
    }
}

// Get home directory
pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
