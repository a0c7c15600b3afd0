use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const FINAL_SQL: &str = "result.sql";
pub const FINAL_CSV: &str = "result.csv";
pub const FINAL_LOG: &str = "log.log";
pub const VOTE_LOG: &str = "vote.log";

/// Files owned by one attempt inside a task directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPaths {
    pub index: usize,
    pub sql: PathBuf,
    pub csv: PathBuf,
    pub log: PathBuf,
    dir: PathBuf,
}

impl AttemptPaths {
    #[must_use]
    pub fn new(dir: &Path, index: usize) -> Self {
        Self {
            index,
            sql: dir.join(format!("{index}{FINAL_SQL}")),
            csv: dir.join(format!("{index}{FINAL_CSV}")),
            log: dir.join(format!("{index}{FINAL_LOG}")),
            dir: dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn iteration_sql(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("{}result.iter{iteration}.sql", self.index))
    }

    #[must_use]
    pub fn iteration_csv(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("{}result.iter{iteration}.csv", self.index))
    }

    #[must_use]
    pub fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Remove every file of this attempt, including per-iteration copies.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be listed or a file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.sql)?;
        remove_if_exists(&self.csv)?;
        remove_if_exists(&self.log)?;
        let prefix = format!("{}result.iter", self.index);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}

/// The output directory of one task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskArtifacts {
    pub dir: PathBuf,
}

impl TaskArtifacts {
    #[must_use]
    pub fn new(output_dir: &Path, instance_id: &str) -> Self {
        Self {
            dir: output_dir.join(instance_id),
        }
    }

    #[must_use]
    pub fn attempt(&self, index: usize) -> AttemptPaths {
        AttemptPaths::new(&self.dir, index)
    }

    #[must_use]
    pub fn final_sql(&self) -> PathBuf {
        self.dir.join(FINAL_SQL)
    }

    #[must_use]
    pub fn final_csv(&self) -> PathBuf {
        self.dir.join(FINAL_CSV)
    }

    #[must_use]
    pub fn final_log(&self) -> PathBuf {
        self.dir.join(FINAL_LOG)
    }

    #[must_use]
    pub fn vote_log(&self) -> PathBuf {
        self.dir.join(VOTE_LOG)
    }

    #[must_use]
    pub fn has_final(&self) -> bool {
        self.final_sql().is_file() && self.final_csv().is_file()
    }

    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
    }

    /// # Errors
    /// Returns an error when an existing final artifact cannot be removed.
    pub fn clear_final(&self) -> Result<()> {
        remove_if_exists(&self.final_sql())?;
        remove_if_exists(&self.final_csv())?;
        remove_if_exists(&self.final_log())?;
        remove_if_exists(&self.vote_log())
    }

    /// Copy the winning attempt's files to the final names. A missing attempt log is tolerated.
    ///
    /// `result.sql` is published last, so a task only counts as finalized once its table is in
    /// place. Any failure removes whatever was already published.
    ///
    /// # Errors
    /// Returns an error when the attempt's query or table cannot be copied.
    pub fn finalize(&self, winner: &AttemptPaths) -> Result<()> {
        let published = self.publish(winner);
        if let Err(err) = published {
            return match self.clear_final() {
                Ok(()) => Err(err),
                Err(cleanup) => Err(err.context(format!("partial final files remain: {cleanup:#}"))),
            };
        }
        Ok(())
    }

    fn publish(&self, winner: &AttemptPaths) -> Result<()> {
        publish_copy(&winner.csv, &self.final_csv())?;
        if winner.log.is_file() {
            publish_copy(&winner.log, &self.final_log())?;
        }
        publish_copy(&winner.sql, &self.final_sql())
    }
}

/// Copy to a sibling `.partial` name, then rename over the destination.
fn publish_copy(source: &Path, destination: &Path) -> Result<()> {
    let mut staged = destination.as_os_str().to_os_string();
    staged.push(".partial");
    let staged = PathBuf::from(staged);
    let published = fs::copy(source, &staged)
        .with_context(|| format!("failed to copy {}", source.display()))
        .and_then(|_| {
            fs::rename(&staged, destination)
                .with_context(|| format!("failed to publish {}", destination.display()))
        });
    if published.is_err() {
        let _ = fs::remove_file(&staged);
    }
    published
}

/// # Errors
/// Returns an error for any failure other than the file being absent.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::TaskArtifacts;
    use std::fs;
    use ulid::Ulid;

    #[test]
    fn attempt_clear_removes_iteration_copies_only_for_that_attempt() {
        let root = std::env::temp_dir().join(format!("quorum-sql-artifacts-{}", Ulid::new()));
        let artifacts = TaskArtifacts::new(&root, "local001");
        assert!(artifacts.ensure_dir().is_ok());

        let first = artifacts.attempt(0);
        let second = artifacts.attempt(1);
        for path in [
            first.sql.clone(),
            first.iteration_csv(2),
            second.sql.clone(),
            second.iteration_sql(0),
        ] {
            assert!(fs::write(&path, "x").is_ok());
        }

        assert!(first.clear().is_ok());
        assert!(!first.sql.exists());
        assert!(!first.iteration_csv(2).exists());
        assert!(second.sql.exists());
        assert!(second.iteration_sql(0).exists());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn finalize_copies_winner_files() {
        let root = std::env::temp_dir().join(format!("quorum-sql-artifacts-{}", Ulid::new()));
        let artifacts = TaskArtifacts::new(&root, "local002");
        assert!(artifacts.ensure_dir().is_ok());
        let winner = artifacts.attempt(2);
        assert!(fs::write(&winner.sql, "SELECT 1").is_ok());
        assert!(fs::write(&winner.csv, "x\n1\n").is_ok());

        assert!(!artifacts.has_final());
        assert!(artifacts.finalize(&winner).is_ok());
        assert!(artifacts.has_final());
        assert!(winner.sql.exists());
        assert!(!artifacts.final_log().exists());

        assert!(artifacts.clear_final().is_ok());
        assert!(!artifacts.has_final());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn finalize_without_winner_table_leaves_no_final_files() {
        let root = std::env::temp_dir().join(format!("quorum-sql-artifacts-{}", Ulid::new()));
        let artifacts = TaskArtifacts::new(&root, "local003");
        assert!(artifacts.ensure_dir().is_ok());
        let winner = artifacts.attempt(0);
        assert!(fs::write(&winner.sql, "SELECT 1").is_ok());
        assert!(fs::write(&winner.log, "[Self-refine]\n").is_ok());

        assert!(artifacts.finalize(&winner).is_err());
        assert!(!artifacts.has_final());
        assert!(!artifacts.final_sql().exists());
        assert!(!artifacts.final_csv().exists());
        assert!(!artifacts.final_log().exists());
        assert!(winner.sql.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn final_query_without_table_is_not_counted_as_finalized() {
        let root = std::env::temp_dir().join(format!("quorum-sql-artifacts-{}", Ulid::new()));
        let artifacts = TaskArtifacts::new(&root, "local004");
        assert!(artifacts.ensure_dir().is_ok());
        assert!(fs::write(artifacts.final_sql(), "SELECT 1").is_ok());

        assert!(!artifacts.has_final());
        assert!(fs::write(artifacts.final_csv(), "x\n1\n").is_ok());
        assert!(artifacts.has_final());
        let _ = fs::remove_dir_all(root);
    }
}
