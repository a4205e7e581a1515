// src/monitor/store.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::AmiResult;

use super::status::{ExtensionStatus, StatusChange};

/// Supplies the list of extensions to monitor. The list lives outside this
/// core (a database, an admin UI); the synchronizer only reads it.
#[async_trait]
pub trait ExtensionProvider: Send + Sync {
    async fn monitored_extensions(&self) -> AmiResult<Vec<String>>;
}

/// Persists last-known extension statuses. Records are never deleted,
/// only overwritten on change.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, extension: &str) -> AmiResult<Option<ExtensionStatus>>;
    async fn save(&self, status: &ExtensionStatus) -> AmiResult<()>;
}

/// Fire-and-forget publication of status changes (UI broadcast, message
/// bus). Failures are the sink's problem, not the cycle's.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn publish(&self, change: &StatusChange);
}

/// Fixed extension list, for configurations without an external provider.
pub struct StaticProvider {
    extensions: Vec<String>,
}

impl StaticProvider {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }
}

#[async_trait]
impl ExtensionProvider for StaticProvider {
    async fn monitored_extensions(&self) -> AmiResult<Vec<String>> {
        Ok(self.extensions.clone())
    }
}

/// In-memory status store.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, ExtensionStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<ExtensionStatus> {
        let mut all: Vec<ExtensionStatus> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.extension.cmp(&b.extension));
        all
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, extension: &str) -> AmiResult<Option<ExtensionStatus>> {
        Ok(self.records.read().await.get(extension).cloned())
    }

    async fn save(&self, status: &ExtensionStatus) -> AmiResult<()> {
        self.records
            .write()
            .await
            .insert(status.extension.clone(), status.clone());
        Ok(())
    }
}

/// Sink that logs each change as a JSON line. Stands in for the external
/// broadcast layer.
pub struct LogChangeSink;

#[async_trait]
impl ChangeSink for LogChangeSink {
    async fn publish(&self, change: &StatusChange) {
        match serde_json::to_string(change) {
            Ok(payload) => info!(change = %payload, "Extension status changed"),
            Err(_) => info!(
                extension = %change.extension,
                state = ?change.current,
                "Extension status changed"
            ),
        }
    }
}

/// Sink that collects changes in memory; used by tests to assert exactly
/// which notifications a cycle produced.
#[derive(Default)]
pub struct MemoryChangeSink {
    changes: Arc<RwLock<Vec<StatusChange>>>,
}

impl MemoryChangeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<StatusChange> {
        std::mem::take(&mut *self.changes.write().await)
    }

    pub async fn len(&self) -> usize {
        self.changes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.changes.read().await.is_empty()
    }
}

#[async_trait]
impl ChangeSink for MemoryChangeSink {
    async fn publish(&self, change: &StatusChange) {
        self.changes.write().await.push(change.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::status::DeviceState;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStatusStore::new();
        assert!(store.load("100").await.unwrap().is_none());

        let status = ExtensionStatus::observed("100", "0", "from-internal");
        store.save(&status).await.unwrap();

        let loaded = store.load("100").await.unwrap().unwrap();
        assert_eq!(loaded.state, DeviceState::Online);
        assert_eq!(loaded.raw_code, "0");
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticProvider::new(vec!["100".into(), "200".into()]);
        assert_eq!(
            provider.monitored_extensions().await.unwrap(),
            vec!["100", "200"]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemoryChangeSink::new();
        let status = ExtensionStatus::observed("100", "4", "from-internal");
        sink.publish(&StatusChange {
            extension: status.extension.clone(),
            previous: None,
            current: status.state,
            raw_code: status.raw_code.clone(),
            context: status.context.clone(),
            at: status.last_changed,
        })
        .await;
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.drain().await.len(), 1);
        assert!(sink.is_empty().await);
    }
}
