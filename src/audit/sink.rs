//! Audit persistence and user lookup collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{GatekeeperError, Result};

/// A user record, as known to the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Internal user id
    pub id: String,
    /// Human-facing name
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One append-only audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

/// Lookup from an external identity string to an internal user record.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find(&self, external_id: &str) -> Result<Option<UserRecord>>;
}

/// Audit sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every event appended so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Audit sink appending one JSON document per line to a file.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)
            .map_err(|e| GatekeeperError::Audit(format!("Failed to encode audit event: {}", e)))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// User directory backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    users: HashMap<String, UserRecord>,
}

impl StaticUserDirectory {
    pub fn new(users: HashMap<String, UserRecord>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn find(&self, external_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.get(external_id).cloned())
    }
}
