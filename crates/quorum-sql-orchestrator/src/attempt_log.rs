use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Human-readable `{i}log` of one attempt, written in bracketed sections.
///
/// The log is an artifact for reviewers; a write failure is reported and otherwise ignored.
pub struct AttemptLog {
    path: PathBuf,
    file: Option<File>,
}

impl AttemptLog {
    #[must_use]
    pub fn open(path: &Path) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| warn!(path = %path.display(), error = %err, "attempt log unavailable"))
            .ok();
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    pub fn section(&mut self, title: &str, body: &str) {
        self.write(&format!("[{title}]\n{body}\n[{title}]\n"));
    }

    pub fn line(&mut self, text: &str) {
        self.write(&format!("{text}\n"));
    }

    fn write(&mut self, text: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(text.as_bytes()) {
            warn!(path = %self.path.display(), error = %err, "attempt log write failed");
            self.file = None;
        }
    }
}
