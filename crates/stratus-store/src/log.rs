//! In-memory partitioned log stream

use crate::{LogStream, RecordPosition, Result, StoreError, StreamRecord};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Default number of partitions per stream
pub const DEFAULT_PARTITIONS: u32 = 4;

struct Stream {
    partitions: Vec<RwLock<Vec<Bytes>>>,
}

/// An in-memory log stream service
///
/// Each stream has a fixed number of partitions. A record's partition is
/// derived from a BLAKE3 hash of its partition key, so all records sharing a
/// key are totally ordered.
#[derive(Clone)]
pub struct MemoryLogStream {
    streams: Arc<DashMap<String, Arc<Stream>>>,
    partition_count: u32,
}

impl Default for MemoryLogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStream {
    /// Create a service whose streams have [`DEFAULT_PARTITIONS`] partitions
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a service whose streams have `count` partitions
    pub fn with_partitions(count: u32) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            partition_count: count.max(1),
        }
    }

    /// Remove a stream and all of its records
    pub fn delete_stream(&self, stream: &str) -> bool {
        self.streams.remove(stream).is_some()
    }

    /// Total number of records across all partitions of a stream
    pub fn record_count(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| s.partitions.iter().map(|p| p.read().len()).sum())
            .unwrap_or(0)
    }

    fn partition_for(&self, key: &str) -> u32 {
        let hash = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&hash.as_bytes()[..4]);
        u32::from_le_bytes(prefix) % self.partition_count
    }

    fn stream(&self, stream: &str) -> Result<Arc<Stream>> {
        self.streams
            .get(stream)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| StoreError::NoSuchStream(stream.to_string()))
    }
}

#[async_trait]
impl LogStream for MemoryLogStream {
    async fn create_stream(&self, stream: &str) -> Result<()> {
        let count = self.partition_count;
        self.streams.entry(stream.to_string()).or_insert_with(|| {
            Arc::new(Stream {
                partitions: (0..count).map(|_| RwLock::new(Vec::new())).collect(),
            })
        });
        Ok(())
    }

    async fn partitions(&self, stream: &str) -> Result<Vec<u32>> {
        let s = self.stream(stream)?;
        Ok((0..s.partitions.len() as u32).collect())
    }

    async fn append(
        &self,
        stream: &str,
        partition_key: &str,
        payload: Bytes,
    ) -> Result<RecordPosition> {
        let s = self.stream(stream)?;
        let partition = self.partition_for(partition_key);
        let mut records = s.partitions[partition as usize].write();
        records.push(payload);
        Ok(RecordPosition {
            partition,
            sequence: records.len() as u64 - 1,
        })
    }

    async fn read_from(
        &self,
        stream: &str,
        partition: u32,
        cursor: u64,
        max_records: usize,
    ) -> Result<Vec<StreamRecord>> {
        let s = self.stream(stream)?;
        let records = s
            .partitions
            .get(partition as usize)
            .ok_or_else(|| StoreError::NoSuchPartition {
                stream: stream.to_string(),
                partition,
            })?
            .read();
        Ok(records
            .iter()
            .enumerate()
            .skip(cursor as usize)
            .take(max_records)
            .map(|(seq, payload)| StreamRecord {
                sequence: seq as u64,
                payload: payload.clone(),
            })
            .collect())
    }
}
