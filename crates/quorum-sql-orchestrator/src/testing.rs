use std::fs;
use std::path::{Path, PathBuf};

use quorum_sql_backend::{
    BackendConfig, BackendRegistry, BackendTarget, InProcessSqlite, WorkerCommand,
};
use quorum_sql_domain::TaskInstance;
use rusqlite::Connection;
use ulid::Ulid;

use crate::BackendProvider;

pub fn temp_root(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("quorum-sql-{label}-{}", Ulid::new()));
    assert!(fs::create_dir_all(&root).is_ok());
    root
}

/// `orders` with three regions and no zero amounts.
pub fn fixture_db(root: &Path) -> PathBuf {
    let path = root.join("fixture.sqlite");
    let conn = Connection::open(&path).unwrap_or_else(|_| unreachable!());
    let created = conn.execute_batch(
        "CREATE TABLE orders(id INTEGER PRIMARY KEY, amount REAL, region TEXT);
         INSERT INTO orders VALUES (1, 10.5, 'north'), (2, 20.25, 'south'), (3, 7.0, 'north'),
                                   (4, 3.5, 'east');",
    );
    assert!(created.is_ok());
    path
}

pub fn sqlite_task(instance_id: &str, db_path: &Path) -> TaskInstance {
    TaskInstance {
        instance_id: instance_id.to_string(),
        question: "Total order amount per region".to_string(),
        db_path: Some(db_path.to_path_buf()),
        schema_text: Some("CREATE TABLE orders(id INTEGER, amount REAL, region TEXT)".to_string()),
        schema_path: None,
        format_hint: None,
        backend: None,
    }
}

pub fn sql_reply(query: &str) -> String {
    format!("Thinking it through.\n```sql\n{query}\n```")
}

fn unused_worker() -> BackendConfig {
    BackendConfig {
        credentials_path: None,
        worker: WorkerCommand::sqlite_worker(PathBuf::from("quorum-sql")),
    }
}

/// A registry whose `SQLite` handle for `target` runs in-process.
pub fn registry_for(target: &BackendTarget) -> BackendRegistry {
    let mut registry = BackendRegistry::new(unused_worker());
    if let Some(db_path) = target.db_path.clone() {
        registry.register(target.key.clone(), Box::new(InProcessSqlite::new(db_path)));
    }
    registry
}

/// Serves in-process `SQLite` handles for every task it was built with.
pub struct InProcessBackends {
    targets: Vec<BackendTarget>,
}

impl InProcessBackends {
    pub fn new(tasks: &[TaskInstance]) -> Self {
        let targets = tasks
            .iter()
            .filter_map(|task| BackendTarget::for_task(task, None).ok())
            .collect();
        Self { targets }
    }
}

impl BackendProvider for InProcessBackends {
    fn open_registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new(unused_worker());
        for target in &self.targets {
            if let Some(db_path) = target.db_path.clone() {
                registry.register(target.key.clone(), Box::new(InProcessSqlite::new(db_path)));
            }
        }
        registry
    }
}
