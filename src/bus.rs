//! Durable, partitioned, per-topic message logs.
//!
//! The bus is the transport substrate for the validation pipeline. Each
//! topic is a set of append-only partition logs; messages with the same key
//! land on the same partition, and within a partition consumption is
//! totally ordered. Consumer groups track durable offsets and commit only
//! after downstream effects succeed. No ordering exists across partitions.

use serde_json::Value;
use tracing::{debug, warn};

use crate::canonical::canonical_string;
use crate::error::{StorageError, decode_err, encode_err};
use crate::utils;

const TOPICS_TREE: &str = "bus_topics";
const OFFSETS_TREE: &str = "bus_offsets";

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("partition {partition} out of range for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for BusError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(StorageError::Backend(e))
    }
}

/// Retention mode for messages on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Retention {
    #[n(0)]
    Infinite,
    /// Keep messages for this many seconds.
    #[n(1)]
    For(#[n(0)] u64),
}

impl Retention {
    pub fn days(days: u64) -> Self {
        Self::For(days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum CleanupPolicy {
    #[n(0)]
    Delete,
    /// Only the latest message per key is preserved.
    #[n(1)]
    Compact,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct TopicConfig {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub partitions: u32,
    #[n(2)]
    pub retention: Retention,
    #[n(3)]
    pub cleanup: CleanupPolicy,
    #[n(4)]
    pub replication_factor: u32,
}

/// A message on a partition log.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Message {
    #[n(0)]
    pub topic: String,
    #[n(1)]
    pub partition: u32,
    #[n(2)]
    pub offset: u64,
    /// Partition key; `vote_id` throughout the validation pipeline.
    #[n(3)]
    pub key: String,
    /// Canonical JSON text of the message document.
    #[n(4)]
    pub payload: String,
    #[n(5)]
    pub produced_at: i64,
}

impl Message {
    pub fn payload_value(&self) -> Result<Value, StorageError> {
        serde_json::from_str(&self.payload).map_err(decode_err)
    }
}

/// Stable partition assignment: same key, same partition, across runs.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hex::decode(&digest[..16]).expect("hex digest")[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as u32
}

pub struct Bus {
    db: sled::Db,
    topics: sled::Tree,
    offsets: sled::Tree,
}

fn partition_tree_name(topic: &str, partition: u32) -> String {
    format!("bus/{topic}/{partition}")
}

fn offset_key(group: &str, topic: &str, partition: u32) -> Vec<u8> {
    let mut key = Vec::new();
    key.extend_from_slice(group.as_bytes());
    key.push(0);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(&partition.to_be_bytes());
    key
}

impl Bus {
    pub fn open(db: &sled::Db) -> Result<Self, BusError> {
        Ok(Self {
            db: db.clone(),
            topics: db.open_tree(TOPICS_TREE)?,
            offsets: db.open_tree(OFFSETS_TREE)?,
        })
    }

    /// Create a topic if it does not already exist. Existing topics keep
    /// their configuration; a partition-count mismatch is reported but not
    /// applied, matching the behavior of the topic administration tooling.
    pub fn create_topic(&self, config: TopicConfig) -> Result<bool, BusError> {
        if let Some(existing) = self.topic(&config.name)? {
            if existing.partitions != config.partitions {
                warn!(
                    topic = %config.name,
                    existing = existing.partitions,
                    requested = config.partitions,
                    "topic exists with different partition count"
                );
            }
            return Ok(false);
        }
        let raw = minicbor::to_vec(&config).map_err(encode_err)?;
        self.topics.insert(config.name.as_bytes(), raw)?;
        debug!(topic = %config.name, partitions = config.partitions, "topic created");
        Ok(true)
    }

    /// Idempotently create every topic in the table; returns the names that
    /// were newly created.
    pub fn ensure_topics(&self, table: &[TopicConfig]) -> Result<Vec<String>, BusError> {
        let mut created = Vec::new();
        for config in table {
            if self.create_topic(config.clone())? {
                created.push(config.name.clone());
            }
        }
        Ok(created)
    }

    pub fn topic(&self, name: &str) -> Result<Option<TopicConfig>, BusError> {
        match self.topics.get(name.as_bytes())? {
            Some(raw) => Ok(Some(
                minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?,
            )),
            None => Ok(None),
        }
    }

    pub fn topic_names(&self) -> Result<Vec<String>, BusError> {
        let mut names = Vec::new();
        for item in self.topics.iter() {
            let (key, _) = item?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    fn require_topic(&self, name: &str) -> Result<TopicConfig, BusError> {
        self.topic(name)?
            .ok_or_else(|| BusError::UnknownTopic(name.to_string()))
    }

    fn partition_tree(&self, topic: &str, partition: u32) -> Result<sled::Tree, BusError> {
        Ok(self.db.open_tree(partition_tree_name(topic, partition))?)
    }

    /// Append a message; the partition is derived from the key.
    pub fn produce(&self, topic: &str, key: &str, payload: &Value) -> Result<(u32, u64), BusError> {
        let config = self.require_topic(topic)?;
        let partition = partition_for(key, config.partitions);
        let tree = self.partition_tree(topic, partition)?;

        let offset = match tree.last()? {
            Some((last_key, _)) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&last_key);
                u64::from_be_bytes(bytes) + 1
            }
            None => 0,
        };

        let message = Message {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            payload: canonical_string(payload),
            produced_at: utils::unix_now(),
        };
        let raw = minicbor::to_vec(&message).map_err(encode_err)?;
        tree.insert(offset.to_be_bytes(), raw)?;
        debug!(topic, partition, offset, key, "message produced");
        Ok((partition, offset))
    }

    /// Messages past the group's committed offset, up to `max`, in order.
    pub fn consume(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<Message>, BusError> {
        let config = self.require_topic(topic)?;
        if partition >= config.partitions {
            return Err(BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        let committed = self.committed(group, topic, partition)?;
        let tree = self.partition_tree(topic, partition)?;

        let mut out = Vec::new();
        for item in tree.range(committed.to_be_bytes()..) {
            if out.len() >= max {
                break;
            }
            let (_, raw) = item?;
            out.push(minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?);
        }
        Ok(out)
    }

    /// Next offset the group will consume from.
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<u64, BusError> {
        match self.offsets.get(offset_key(group, topic, partition))? {
            Some(raw) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw);
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Advance the group's committed offset to `next` (exclusive of the
    /// message at `next - 1`). Call only after downstream effects of the
    /// consumed messages are durable.
    pub fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next: u64,
    ) -> Result<(), BusError> {
        self.offsets
            .insert(offset_key(group, topic, partition), &next.to_be_bytes())?;
        Ok(())
    }

    /// Prune expired messages on delete-policy topics.
    pub fn enforce_retention(&self, now_unix: i64) -> Result<u64, BusError> {
        let mut pruned = 0u64;
        for name in self.topic_names()? {
            let config = self.require_topic(&name)?;
            let Retention::For(secs) = config.retention else {
                continue;
            };
            if config.cleanup != CleanupPolicy::Delete {
                continue;
            }
            let horizon = now_unix - secs as i64;
            for partition in 0..config.partitions {
                let tree = self.partition_tree(&name, partition)?;
                let mut expired = Vec::new();
                for item in tree.iter() {
                    let (key, raw) = item?;
                    let message: Message =
                        minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?;
                    if message.produced_at < horizon {
                        expired.push(key.to_vec());
                    } else {
                        break;
                    }
                }
                for key in expired {
                    tree.remove(key)?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Drop all but the latest message per key on a compacted topic.
    pub fn compact(&self, topic: &str) -> Result<u64, BusError> {
        let config = self.require_topic(topic)?;
        if config.cleanup != CleanupPolicy::Compact {
            return Ok(0);
        }
        let mut removed = 0u64;
        for partition in 0..config.partitions {
            let tree = self.partition_tree(topic, partition)?;
            let mut latest: std::collections::HashMap<String, u64> = Default::default();
            for item in tree.iter() {
                let (_, raw) = item?;
                let message: Message =
                    minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?;
                latest.insert(message.key, message.offset);
            }
            let mut stale = Vec::new();
            for item in tree.iter() {
                let (key, raw) = item?;
                let message: Message =
                    minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?;
                if latest.get(&message.key) != Some(&message.offset) {
                    stale.push(key.to_vec());
                }
            }
            for key in stale {
                tree.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Latest message for a key; the compacted-topic lookup.
    pub fn latest_by_key(&self, topic: &str, key: &str) -> Result<Option<Message>, BusError> {
        let config = self.require_topic(topic)?;
        let partition = partition_for(key, config.partitions);
        let tree = self.partition_tree(topic, partition)?;
        for item in tree.iter().rev() {
            let (_, raw) = item?;
            let message: Message =
                minicbor::decode(&raw).map_err(|e| BusError::Storage(decode_err(e)))?;
            if message.key == key {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Message count in one partition.
    pub fn partition_len(&self, topic: &str, partition: u32) -> Result<u64, BusError> {
        Ok(self.partition_tree(topic, partition)?.len() as u64)
    }
}
