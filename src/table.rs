//! Keyed table materialized from a changelog topic
//!
//! A [`Table`] holds the latest value per key. It is owned by whoever builds
//! it and handed to the processors that need lookups, for example to enrich
//! stream records with reference data. A record with an empty value deletes
//! its key.

use crate::error::SourceError;
use crate::record::Record;
use crate::source::{Fetched, RecordSource};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

#[derive(Debug, Default, Clone)]
pub struct Table {
    entries: Arc<RwLock<HashMap<Bytes, Bytes>>>,
}

impl Table {
    pub fn new() -> Self {
        debug!("Initializing keyed table");
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply one changelog record
    #[instrument(skip(self, record), fields(offset = record.offset))]
    pub async fn apply(&self, record: &Record) {
        let mut entries = self.entries.write().await;
        if record.value.is_empty() {
            trace!("Tombstone, removing key");
            entries.remove(&record.key);
        } else {
            trace!("Upserting key");
            entries.insert(record.key.clone(), record.value.clone());
        }
    }

    pub async fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> HashMap<Bytes, Bytes> {
        self.entries.read().await.clone()
    }
}

/// Keeps a [`Table`] in step with its changelog
pub struct TableUpdater;

impl TableUpdater {
    /// Apply every record of `source` to `table` until it closes or shutdown
    /// is requested
    pub fn spawn<S>(table: Table, mut source: S, poll_timeout: Duration) -> JoinHandle<Result<(), SourceError>>
    where
        S: RecordSource + 'static,
    {
        tokio::spawn(async move {
            let partition = source.topic_partition().clone();
            info!(partition = %partition, "Table updater started");
            loop {
                match source.fetch(poll_timeout).await {
                    Ok(Fetched::Record(record)) => table.apply(&record).await,
                    Ok(Fetched::Empty) => {}
                    Ok(Fetched::Closed) | Err(SourceError::Shutdown) => {
                        let entries = table.len().await;
                        info!(partition = %partition, entries, "Table updater stopped");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
