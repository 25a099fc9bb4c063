// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Terminal Failure Store
//!
//! Work items that exhausted their retries are recorded here for operators.
//! A record leaves the store only through an explicit `take`, which is what a
//! manual resubmission does.

use crate::errors::AmqpError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A work item that reached the dead state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub original_message_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Storage for dead work items.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), AmqpError>;

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, AmqpError>;

    /// Removes and returns the record of `message_id`.
    async fn take(&self, message_id: &str) -> Result<Option<DeadLetterRecord>, AmqpError>;
}

/// Process-local store, kept in insertion order.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> MemoryDeadLetterStore {
        MemoryDeadLetterStore::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), AmqpError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, AmqpError> {
        Ok(self.records.read().await.clone())
    }

    async fn take(&self, message_id: &str) -> Result<Option<DeadLetterRecord>, AmqpError> {
        let mut records = self.records.write().await;
        let position = records
            .iter()
            .position(|r| r.message_id == message_id || r.original_message_id == message_id);

        Ok(position.map(|idx| records.remove(idx)))
    }
}
