//! Durable string slots that survive process restarts.
//!
//! [`KeyValueStore`] is the capability the session layer is handed; [`Storage`]
//! backs it with SQLite and [`MemoryStore`] is the in-process stand-in.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotWrite {
    Set { key: String, value: String },
    Remove { key: String },
}

impl SlotWrite {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;

    /// Applies `writes` in order. Implementations that can do so apply them
    /// all-or-nothing.
    async fn apply(&self, writes: &[SlotWrite]) -> Result<()> {
        for write in writes {
            match write {
                SlotWrite::Set { key, value } => self.set(key, value).await?,
                SlotWrite::Remove { key } => self.remove(key).await?,
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

const UPSERT_SLOT: &str = r#"
    INSERT INTO kv_slots (key, value, updated_at)
    VALUES (?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
"#;

const DELETE_SLOT: &str = "DELETE FROM kv_slots WHERE key = ?";

#[async_trait]
impl KeyValueStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_slots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read slot '{key}'"))?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(anyhow::Error::from)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(UPSERT_SLOT)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to write slot '{key}'"))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query(DELETE_SLOT)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to erase slot '{key}'"))?;
        Ok(())
    }

    async fn apply(&self, writes: &[SlotWrite]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin slot transaction")?;
        for write in writes {
            match write {
                SlotWrite::Set { key, value } => {
                    sqlx::query(UPSERT_SLOT)
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to write slot '{key}'"))?;
                }
                SlotWrite::Remove { key } => {
                    sqlx::query(DELETE_SLOT)
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to erase slot '{key}'"))?;
                }
            }
        }
        tx.commit()
            .await
            .context("failed to commit slot transaction")?;
        debug!(writes = writes.len(), "storage: slot transaction committed");
        Ok(())
    }
}

/// Process-local slots; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slots<I, K, V>(slots: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            slots: Mutex::new(
                slots
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.slots.lock().await.clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.slots.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.slots
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.slots.lock().await.remove(key);
        Ok(())
    }

    async fn apply(&self, writes: &[SlotWrite]) -> Result<()> {
        let mut slots = self.slots.lock().await;
        for write in writes {
            match write {
                SlotWrite::Set { key, value } => {
                    slots.insert(key.clone(), value.clone());
                }
                SlotWrite::Remove { key } => {
                    slots.remove(key);
                }
            }
        }
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
