//! Job registry
//!
//! A JSON file mapping each job's absolute output prefix to the code it runs
//! and when it started. Key order is kept, so index 0 is the oldest job:
//!
//! ```json
//! {
//!   "/home/me/exp/train": { "code": "python train.py", "start_date": "2024-05-01 10:00:00" }
//! }
//! ```
//!
//! A job writes `<prefix>.stdout` and `<prefix>.stderr`.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::core::{SourceTag, TailSource};

/// Registry file used when nothing else is configured
pub const DEFAULT_REGISTRY_FILE: &str = ".ipython-rtlogging.json";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to access registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Registry {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No job named {0}")]
    UnknownJob(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry value for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub code: String,
    pub start_date: String,
}

/// A registered job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub prefix: PathBuf,
    pub entry: JobEntry,
}

impl Job {
    /// Output name, the last component of the prefix
    pub fn name(&self) -> String {
        self.prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory the job writes into
    pub fn dir(&self) -> String {
        self.prefix
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    pub fn files(&self) -> JobFiles {
        JobFiles::for_prefix(&self.prefix)
    }
}

/// The two files a job writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl JobFiles {
    pub fn for_prefix(prefix: &Path) -> Self {
        Self {
            stdout: with_suffix(prefix, ".stdout"),
            stderr: with_suffix(prefix, ".stderr"),
        }
    }

    /// Neither file has any content yet (a missing file counts as empty)
    pub fn is_pending(&self) -> bool {
        is_empty_file(&self.stdout) && is_empty_file(&self.stderr)
    }

    /// Tail sources in display order: stdout, then stderr
    pub fn sources(&self) -> Vec<TailSource> {
        vec![
            TailSource::new(&self.stdout, SourceTag::Out),
            TailSource::new(&self.stderr, SourceTag::Err),
        ]
    }

    /// Delete whichever files exist
    pub fn remove(&self) -> io::Result<()> {
        for path in [&self.stdout, &self.stderr] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// `prefix + suffix`; `with_extension` would replace a dotted job name
fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path: OsString = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn is_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true)
}

/// Persisted jobs, oldest first
#[derive(Debug)]
pub struct JobRegistry {
    path: PathBuf,
    jobs: Vec<Job>,
}

impl JobRegistry {
    /// `~/.ipython-rtlogging.json`
    pub fn default_path() -> Option<PathBuf> {
        crate::config::home_dir().map(|home| home.join(DEFAULT_REGISTRY_FILE))
    }

    /// Load the registry; a missing file is an empty registry
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    jobs: Vec::new(),
                })
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        let jobs = match Self::parse(&content) {
            Ok(jobs) => jobs,
            Err(source) => return Err(RegistryError::Parse { path, source }),
        };
        debug!(path = %path.display(), jobs = jobs.len(), "registry loaded");
        Ok(Self { path, jobs })
    }

    fn parse(content: &str) -> serde_json::Result<Vec<Job>> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let map: Map<String, Value> = serde_json::from_str(content)?;
        map.into_iter()
            .map(|(prefix, value)| -> serde_json::Result<Job> {
                Ok(Job {
                    prefix: PathBuf::from(prefix),
                    entry: serde_json::from_value(value)?,
                })
            })
            .collect()
    }

    /// Write the registry back, replacing the file atomically
    pub fn save(&self) -> Result<()> {
        let mut map = Map::new();
        for job in &self.jobs {
            let value = serde_json::to_value(&job.entry).map_err(|source| RegistryError::Parse {
                path: self.path.clone(),
                source,
            })?;
            map.insert(job.prefix.to_string_lossy().into_owned(), value);
        }
        let content = serde_json::to_string_pretty(&map).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = with_suffix(&self.path, ".tmp");
        fs::write(&tmp, content).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Job by index; negative indices count from the newest
    pub fn get(&self, index: isize) -> Option<&Job> {
        resolve_index(index, self.jobs.len()).map(|i| &self.jobs[i])
    }

    /// Job by full prefix or by output name (newest match wins)
    pub fn find(&self, name: &str) -> Option<&Job> {
        self.jobs
            .iter()
            .rev()
            .find(|job| job.prefix == Path::new(name) || job.name() == name)
    }

    /// Register a job, replacing any older entry for the same prefix
    pub fn record(&mut self, prefix: impl Into<PathBuf>, entry: JobEntry) {
        let prefix = prefix.into();
        self.jobs.retain(|job| job.prefix != prefix);
        self.jobs.push(Job { prefix, entry });
    }

    /// Drop a job by name or prefix
    pub fn remove(&mut self, name: &str) -> Result<Job> {
        let prefix = self
            .find(name)
            .map(|job| job.prefix.clone())
            .ok_or_else(|| RegistryError::UnknownJob(name.to_string()))?;
        let index = self
            .jobs
            .iter()
            .position(|job| job.prefix == prefix)
            .ok_or_else(|| RegistryError::UnknownJob(name.to_string()))?;
        Ok(self.jobs.remove(index))
    }

    /// Drop every job, returning them oldest first
    pub fn clear(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }
}

/// Map a possibly negative index onto `0..len`
pub fn resolve_index(index: isize, len: usize) -> Option<usize> {
    let len = isize::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Parse the answer to the selection prompt; empty input means the newest job
pub fn parse_selection(input: &str, len: usize) -> Option<usize> {
    let input = input.trim();
    let index = if input.is_empty() {
        -1
    } else {
        input.parse::<isize>().ok()?
    };
    resolve_index(index, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "/work/zeta": {"code": "print('z')", "start_date": "2024-05-01 10:00:00"},
        "/work/alpha": {"code": "for i in range(3):\n    print(i)", "start_date": "2024-05-01 11:00:00"}
    }"#;

    #[test]
    fn test_load_keeps_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, SAMPLE).unwrap();

        let registry = JobRegistry::load(&path).unwrap();
        let names: Vec<_> = registry.jobs().iter().map(Job::name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(registry.get(-1).unwrap().name(), "alpha");
        assert_eq!(registry.get(0).unwrap().dir(), "/work");
        assert!(registry.get(2).is_none());
        assert!(registry.get(-3).is_none());
    }

    #[test]
    fn test_missing_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::load(dir.path().join("nope.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_registry_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JobRegistry::load(&path),
            Err(RegistryError::Parse { .. })
        ));
    }

    #[test]
    fn test_record_remove_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, SAMPLE).unwrap();

        let mut registry = JobRegistry::load(&path).unwrap();
        let entry = JobEntry {
            code: "sleep 10".to_string(),
            start_date: "2024-05-02 09:00:00".to_string(),
        };
        registry.record("/work/zeta", entry.clone());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(-1).unwrap().entry, entry);

        let removed = registry.remove("alpha").unwrap();
        assert_eq!(removed.prefix, PathBuf::from("/work/alpha"));
        assert!(matches!(
            registry.remove("alpha"),
            Err(RegistryError::UnknownJob(_))
        ));
        registry.save().unwrap();

        let reloaded = JobRegistry::load(&path).unwrap();
        assert_eq!(reloaded.jobs(), registry.jobs());
    }

    #[test]
    fn test_files_append_suffix_to_dotted_name() {
        let files = JobFiles::for_prefix(Path::new("/work/run.v2"));
        assert_eq!(files.stdout, PathBuf::from("/work/run.v2.stdout"));
        assert_eq!(files.stderr, PathBuf::from("/work/run.v2.stderr"));

        let sources = files.sources();
        assert_eq!(sources[0].tag, SourceTag::Out);
        assert_eq!(sources[1].path, files.stderr);
    }

    #[test]
    fn test_pending_until_either_file_has_content() {
        let dir = tempfile::tempdir().unwrap();
        let files = JobFiles::for_prefix(&dir.path().join("job"));
        assert!(files.is_pending());

        fs::write(&files.stdout, "").unwrap();
        assert!(files.is_pending());

        fs::write(&files.stderr, "warming up\n").unwrap();
        assert!(!files.is_pending());

        files.remove().unwrap();
        files.remove().unwrap();
        assert!(!files.stdout.exists());
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("", 3), Some(2));
        assert_eq!(parse_selection(" 0 ", 3), Some(0));
        assert_eq!(parse_selection("-3", 3), Some(0));
        assert_eq!(parse_selection("3", 3), None);
        assert_eq!(parse_selection("-4", 3), None);
        assert_eq!(parse_selection("two", 3), None);
        assert_eq!(parse_selection("", 0), None);
    }
}
