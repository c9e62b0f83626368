//! Durable stream capability interfaces (spec §6).
//!
//! The engine treats the opportunity stream, dead-letter stream, and health
//! stream as external collaborators (spec §1) — it depends on narrow traits,
//! not a concrete Redis/Kafka client, per spec §9's "model every collaborator
//! as a capability interface" guidance.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message read off the opportunity stream, not yet structurally validated.
#[derive(Debug, Clone)]
pub struct RawStreamMessage {
    pub message_id: String,
    pub fields: Value,
}

/// Read/ack/publish surface the consumer needs from the durable opportunity stream.
#[async_trait]
pub trait OpportunityStream: Send + Sync {
    /// Blocking-style batch read with a bounded wait; returns an empty vec on timeout.
    async fn read_batch(&self, batch_size: usize, block_ms: u64) -> Result<Vec<RawStreamMessage>>;
    async fn ack(&self, message_id: &str) -> Result<()>;
}

/// Dead-letter stream message — essential metadata only, never the full payload
/// (spec §6, §8 "Dead-letter no-leak").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub opportunity_id: String,
    pub opportunity_type: String,
    pub service: String,
    pub instance_id: String,
    pub reason: String,
    pub original_message_id: String,
    pub timestamp_ms: u64,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, message: DeadLetterMessage) -> Result<()>;
}

/// Health stream message shape (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMessage {
    pub name: String,
    pub service: String,
    pub status: String,
    pub uptime_ms: u64,
    pub memory_usage_bytes: u64,
    pub last_heartbeat_ms: u64,
    pub event: Option<String>,
    pub region_id: Option<String>,
    pub simulation_mode: Option<bool>,
    pub timestamp_ms: u64,
    pub stats: Option<Value>,
    pub simulation_metrics: Option<Value>,
    pub strategy_metrics: Option<Value>,
}

#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn publish(&self, message: HealthMessage) -> Result<()>;
}

/// In-memory test double for all three stream roles; also useful for a
/// single-process demo binary.
#[derive(Default)]
pub struct InMemoryStreams {
    pub inbox: Mutex<VecDeque<RawStreamMessage>>,
    pub acked: Mutex<Vec<String>>,
    pub dead_letters: Mutex<Vec<DeadLetterMessage>>,
    pub health_messages: Mutex<Vec<HealthMessage>>,
}

impl InMemoryStreams {
    pub fn push_message(&self, message_id: &str, fields: Value) {
        self.inbox.lock().unwrap().push_back(RawStreamMessage {
            message_id: message_id.to_string(),
            fields,
        });
    }
}

#[async_trait]
impl OpportunityStream for InMemoryStreams {
    async fn read_batch(&self, batch_size: usize, _block_ms: u64) -> Result<Vec<RawStreamMessage>> {
        let mut guard = self.inbox.lock().unwrap();
        let mut out = Vec::new();
        for _ in 0..batch_size {
            match guard.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, message_id: &str) -> Result<()> {
        self.acked.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryStreams {
    async fn publish(&self, message: DeadLetterMessage) -> Result<()> {
        self.dead_letters.lock().unwrap().push(message);
        Ok(())
    }
}

#[async_trait]
impl HealthSink for InMemoryStreams {
    async fn publish(&self, message: HealthMessage) -> Result<()> {
        self.health_messages.lock().unwrap().push(message);
        Ok(())
    }
}
