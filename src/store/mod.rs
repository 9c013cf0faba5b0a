pub mod admin;
pub mod logs;
pub mod schema;
pub mod sync;

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config;
use crate::error::Result;
use crate::lock::{ProcessLock, ProcessLockGuard};
use crate::media::ArtifactStore;
use crate::names::sanitize_project_name;

pub const DB_EXT: &str = "db";

/// Per-project embedded store.
///
/// One SQLite database file per project under `dir`; pools are created
/// lazily and cached. Mutations are serialized by the cross-process lock;
/// readers go straight to the WAL-journaled database.
pub struct ProjectStore {
    dir: PathBuf,
    media: ArtifactStore,
    pools: DashMap<String, SqlitePool>,
}

impl ProjectStore {
    pub fn new(dir: PathBuf) -> Self {
        let media = ArtifactStore::new(dir.join("media"));
        Self {
            dir,
            media,
            pools: DashMap::new(),
        }
    }

    /// Store rooted at the configured tracking directory.
    pub fn open_default() -> Self {
        Self::new(config::trackio_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn media(&self) -> &ArtifactStore {
        &self.media
    }

    pub fn db_path(&self, project: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{DB_EXT}", sanitize_project_name(project)))
    }

    pub(crate) fn process_lock(&self, project: &str) -> ProcessLock {
        ProcessLock::in_dir(&self.dir, &sanitize_project_name(project))
    }

    /// Acquire the project's cross-process write lock.
    pub(crate) async fn lock(&self, project: &str) -> Result<ProcessLockGuard> {
        self.process_lock(project).acquire().await
    }

    /// Pool for a project, creating the database and schema if missing.
    pub(crate) async fn writer_pool(&self, project: &str) -> Result<SqlitePool> {
        let key = sanitize_project_name(project);
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }
        std::fs::create_dir_all(&self.dir)?;
        let pool = self.connect(&key, true).await?;
        {
            let _guard = self.lock(project).await?;
            schema::ensure(&pool).await?;
        }
        self.pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Pool for a project whose database already exists; `None` otherwise.
    ///
    /// Readers use this so point lookups never create empty databases.
    pub(crate) async fn reader_pool(&self, project: &str) -> Result<Option<SqlitePool>> {
        let key = sanitize_project_name(project);
        if let Some(pool) = self.pools.get(&key) {
            return Ok(Some(pool.clone()));
        }
        if !self.db_path(project).exists() {
            return Ok(None);
        }
        let pool = self.connect(&key, false).await?;
        self.pools.insert(key, pool.clone());
        Ok(Some(pool))
    }

    async fn connect(&self, key: &str, create: bool) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(self.dir.join(format!("{key}.{DB_EXT}")))
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-20000");
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    /// All projects, discovered by enumerating database files.
    pub fn get_projects(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut projects: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some(DB_EXT) {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(ToString::to_string)
                } else {
                    None
                }
            })
            .collect();
        projects.sort();
        projects
    }
}
