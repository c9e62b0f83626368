//! Reads the opportunity stream, validates, deduplicates, and hands off to the
//! queue; publishes rejects to the dead-letter stream without the full payload
//! (spec §4.7, C7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::clock::Clock;
use crate::errors::EngineError;
use crate::queue::Queue;
use crate::stream::{DeadLetterMessage, DeadLetterSink, OpportunityStream, RawStreamMessage};
use crate::types::{ExecutionStats, Opportunity, OpportunityType, PendingMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub block_ms: u64,
    pub stream_name: String,
    pub group_name: String,
    pub service_name: String,
    pub instance_id: String,
    /// Deferred-ACK entries older than this are considered stuck and logged, not re-delivered
    /// (no dependency on a broker-side claim/XCLAIM primitive exists in this design).
    pub pending_stale_after_ms: u64,
}

/// A dequeued-but-not-yet-completed opportunity: the stream message that
/// produced it is held here, unacked, until `mark_complete` fires (spec §4.7
/// deferred-ACK contract).
struct ActiveEntry {
    message: RawStreamMessage,
    opportunity_type: String,
}

/// Reads opportunities off the durable stream, structurally validates, deduplicates
/// by commitment-adjacent identity, and feeds the bounded queue. Failures go to the
/// dead-letter stream carrying only identifying metadata, never the raw payload
/// (spec §4.7 "Dead-letter no-leak").
pub struct Consumer {
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    stream: Arc<dyn OpportunityStream>,
    dead_letter: Arc<dyn DeadLetterSink>,
    queue: Arc<Queue>,
    stats: Arc<ExecutionStats>,
    active: Mutex<HashMap<String, ActiveEntry>>,
    pending: Mutex<HashMap<String, PendingMessage>>,
    running: AtomicBool,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
        stream: Arc<dyn OpportunityStream>,
        dead_letter: Arc<dyn DeadLetterSink>,
        queue: Arc<Queue>,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            config,
            clock,
            stream,
            dead_letter,
            queue,
            stats,
            active: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Binds queue backpressure: while paused, the consumer stops pulling new
    /// batches but existing deferred-ACKs are left outstanding (spec §4.7).
    pub async fn run_once(&self) -> eyre::Result<usize> {
        if self.queue.is_paused() {
            return Ok(0);
        }
        let messages = self
            .stream
            .read_batch(self.config.batch_size, self.config.block_ms)
            .await?;
        let mut accepted = 0;
        for message in messages {
            if self.process_message(&message).await {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn process_message(&self, message: &RawStreamMessage) -> bool {
        self.pending.lock().unwrap().insert(
            message.message_id.clone(),
            PendingMessage {
                stream_name: self.config.stream_name.clone(),
                group_name: self.config.group_name.clone(),
                message_id: message.message_id.clone(),
                queued_at_ms: self.clock.now_ms(),
                opportunity_id: String::new(),
            },
        );

        match self.validate(message) {
            Ok(opportunity) => {
                self.pending.lock().unwrap().entry(message.message_id.clone()).and_modify(|p| {
                    p.opportunity_id = opportunity.id.clone();
                });

                if self.is_active(&opportunity.id) {
                    self.reject(message, &opportunity.id, &opportunity_type_label(&opportunity), EngineError::DuplicateCommitment)
                        .await;
                    return false;
                }
                // A prior delivery for this same opportunity id may have left a stale
                // pending entry (e.g. its consumer instance crashed before completing);
                // ack and evict it now so it is not also flagged by the next stale sweep.
                self.ack_stale_pending_for(&opportunity.id, &message.message_id).await;

                let opportunity_id = opportunity.id.clone();
                let opportunity_type = opportunity_type_label(&opportunity);
                self.stats.incr_received();
                if self.queue.enqueue(opportunity) {
                    self.mark_active(opportunity_id, message.clone(), opportunity_type);
                    true
                } else {
                    self.stats.incr_queue_rejects();
                    self.reject(
                        message,
                        &message.message_id,
                        "unknown",
                        EngineError::QueueRejected("queue at capacity or paused".into()),
                    )
                    .await;
                    false
                }
            }
            Err(err) => {
                self.reject(message, &message.message_id, "unknown", err).await;
                false
            }
        }
    }

    /// True while `opportunity_id` is dequeued-or-executing (between `mark_active`
    /// and `mark_complete`). Distinct from "ever seen": once completed, the same id
    /// may legitimately arrive again (spec §4.7 duplicate-check).
    pub fn is_active(&self, opportunity_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(opportunity_id)
    }

    fn mark_active(&self, opportunity_id: String, message: RawStreamMessage, opportunity_type: String) {
        self.active.lock().unwrap().insert(opportunity_id, ActiveEntry { message, opportunity_type });
    }

    /// The sole ACK trigger for a successfully-enqueued opportunity (spec §4.7
    /// "Deferred ACK: ACK only on markComplete, which clears both activeExecutions
    /// and the pending entry"). Called by the engine once the opportunity's outcome
    /// — success, failure, or any rejection along the pipeline — has been recorded.
    pub async fn mark_complete(&self, opportunity_id: &str) {
        let entry = self.active.lock().unwrap().remove(opportunity_id);
        if let Some(entry) = entry {
            self.ack(&entry.message).await;
        }
    }

    pub fn get_active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Acks and evicts any pending entry left behind by an earlier delivery of the
    /// same opportunity id that never reached `mark_complete` (spec §4.7).
    async fn ack_stale_pending_for(&self, opportunity_id: &str, current_message_id: &str) {
        let stale_message_ids: Vec<String> = {
            let guard = self.pending.lock().unwrap();
            guard
                .values()
                .filter(|p| p.opportunity_id == opportunity_id && p.message_id != current_message_id)
                .map(|p| p.message_id.clone())
                .collect()
        };
        for message_id in stale_message_ids {
            tracing::debug!(opportunity_id, message_id, "acking stale pending entry for reused opportunity id");
            if let Err(err) = self.stream.ack(&message_id).await {
                tracing::warn!(message_id, error = %err, "stale pending ack failed");
            }
            self.pending.lock().unwrap().remove(&message_id);
        }
    }

    /// Structural + business-rule validation (spec §4.7). Never panics on malformed
    /// input; every failure maps to a typed `EngineError::Validation`.
    fn validate(&self, message: &RawStreamMessage) -> Result<Opportunity, EngineError> {
        let fields = &message.fields;
        let get_str = |key: &str| -> Result<String, EngineError> {
            fields
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| EngineError::Validation(format!("missing field {key}")))
        };

        let id = get_str("id")?;
        let kind_raw = get_str("type")?;
        let kind = OpportunityType::parse(&kind_raw)
            .ok_or_else(|| EngineError::Validation(format!("unknown opportunity type {kind_raw}")))?;
        let token_in = get_str("tokenIn")?;
        let token_out = get_str("tokenOut")?;
        let amount_in: u128 = fields
            .get("amountIn")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Validation("missing amountIn".into()))?
            .parse()
            .map_err(|_| EngineError::Validation("amountIn not a valid integer string".into()))?;
        let expected_profit = fields
            .get("expectedProfit")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::Validation("missing expectedProfit".into()))?;
        let confidence = fields
            .get("confidence")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngineError::Validation("missing confidence".into()))?;
        let expires_at_ms = fields
            .get("expiresAt")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::Validation("missing expiresAt".into()))?;

        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::Validation("confidence out of range [0,1]".into()));
        }
        if amount_in == 0 {
            return Err(EngineError::Validation("amountIn must be positive".into()));
        }
        if expires_at_ms <= self.clock.now_ms() {
            return Err(EngineError::Validation("opportunity already expired".into()));
        }

        let buy_chain = fields.get("buyChain").and_then(Value::as_str).map(str::to_string);
        let sell_chain = fields.get("sellChain").and_then(Value::as_str).map(str::to_string);
        let buy_dex = fields.get("buyDex").and_then(Value::as_str).map(str::to_string);
        let sell_dex = fields.get("sellDex").and_then(Value::as_str).map(str::to_string);

        if kind == OpportunityType::CrossChain && (buy_chain.is_none() || sell_chain.is_none()) {
            return Err(EngineError::Validation(
                "cross-chain opportunity requires both buyChain and sellChain".into(),
            ));
        }

        let mut opportunity = Opportunity {
            id,
            kind,
            token_in,
            token_out,
            amount_in,
            expected_profit,
            confidence,
            expires_at_ms,
            buy_chain,
            sell_chain,
            buy_dex,
            sell_dex,
            pipeline_timestamps: Default::default(),
            execution_received_at_ms: self.clock.now_ms(),
        };
        opportunity.stamp("consumed", self.clock.now_ms());
        Ok(opportunity)
    }

    async fn ack(&self, message: &RawStreamMessage) {
        if let Err(err) = self.stream.ack(&message.message_id).await {
            tracing::warn!(message_id = %message.message_id, error = %err, "ack failed");
        }
        self.pending.lock().unwrap().remove(&message.message_id);
    }

    async fn reject(&self, message: &RawStreamMessage, opportunity_id: &str, opportunity_type: &str, reason: EngineError) {
        self.stats.incr_rejected();
        tracing::warn!(message_id = %message.message_id, reason = %reason, "opportunity rejected");
        let dlq_message = DeadLetterMessage {
            opportunity_id: opportunity_id.to_string(),
            opportunity_type: opportunity_type.to_string(),
            service: self.config.service_name.clone(),
            instance_id: self.config.instance_id.clone(),
            reason: reason.code().to_string(),
            original_message_id: message.message_id.clone(),
            timestamp_ms: self.clock.now_ms(),
        };
        if let Err(err) = self.dead_letter.publish(dlq_message).await {
            tracing::warn!(error = %err, "dead-letter publish failed");
        }
        self.ack(message).await;
    }

    /// Acks and evicts deferred-ACK entries that have sat unacked past the stale
    /// threshold, run periodically by the health monitor (spec §4.7, §4.14). An ack
    /// failure leaves the entry in place for the next run. Returns the number evicted.
    pub async fn cleanup_stale_pending_messages(&self) -> usize {
        let now = self.clock.now_ms();
        let stale: Vec<PendingMessage> = {
            let guard = self.pending.lock().unwrap();
            guard
                .values()
                .filter(|p| now.saturating_sub(p.queued_at_ms) >= self.config.pending_stale_after_ms)
                .cloned()
                .collect()
        };

        let mut evicted = 0;
        for entry in stale {
            match self.stream.ack(&entry.message_id).await {
                Ok(()) => {
                    self.pending.lock().unwrap().remove(&entry.message_id);
                    let opportunity_type = if entry.opportunity_id.is_empty() {
                        None
                    } else {
                        self.active.lock().unwrap().remove(&entry.opportunity_id).map(|e| e.opportunity_type)
                    };
                    tracing::warn!(
                        message_id = %entry.message_id,
                        opportunity_id = %entry.opportunity_id,
                        opportunity_type = ?opportunity_type,
                        age_ms = now.saturating_sub(entry.queued_at_ms),
                        "stale deferred-ack entry evicted"
                    );
                    evicted += 1;
                }
                Err(err) => {
                    tracing::warn!(message_id = %entry.message_id, error = %err, "stale-pending ack failed; left for next cleanup run");
                }
            }
        }
        evicted
    }

    /// Diagnostic snapshot of entries currently past the stale threshold, without
    /// acking or evicting them.
    pub fn stale_pending_info(&self) -> Vec<PendingMessage> {
        let now = self.clock.now_ms();
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|p| now.saturating_sub(p.queued_at_ms) >= self.config.pending_stale_after_ms)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn opportunity_type_label(opportunity: &Opportunity) -> String {
    match opportunity.kind {
        OpportunityType::Simple => "simple",
        OpportunityType::CrossChain => "cross-chain",
        OpportunityType::FlashLoan => "flash-loan",
        OpportunityType::Backrun => "backrun",
        OpportunityType::Uniswapx => "uniswapx",
        OpportunityType::Statistical => "statistical",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::QueueConfig;
    use crate::stream::InMemoryStreams;
    use serde_json::json;

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 10,
            block_ms: 100,
            stream_name: "opportunities".into(),
            group_name: "execution".into(),
            service_name: "execution-engine".into(),
            instance_id: "instance-1".into(),
            pending_stale_after_ms: 30_000,
        }
    }

    fn valid_fields() -> Value {
        json!({
            "id": "op-1",
            "type": "simple",
            "tokenIn": "WETH",
            "tokenOut": "USDC",
            "amountIn": "1000000000000000000",
            "expectedProfit": 1.5,
            "confidence": 0.8,
            "expiresAt": 9_999_999_999_u64,
            "buyChain": "ethereum",
            "buyDex": "uniswap",
        })
    }

    fn consumer() -> (Consumer, Arc<InMemoryStreams>, Arc<Queue>) {
        let clock = ManualClock::new(1_000);
        let streams = Arc::new(InMemoryStreams::default());
        let queue = Arc::new(Queue::new(QueueConfig {
            max_size: 10,
            high_water_mark: 8,
            low_water_mark: 2,
        }));
        let stats = Arc::new(ExecutionStats::default());
        let consumer = Consumer::new(
            config(),
            clock,
            streams.clone(),
            streams.clone(),
            queue.clone(),
            stats,
        );
        (consumer, streams, queue)
    }

    #[tokio::test]
    async fn valid_message_is_enqueued_and_deferred_not_acked() {
        let (consumer, streams, queue) = consumer();
        streams.push_message("1-0", valid_fields());
        let accepted = consumer.run_once().await.unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(queue.size(), 1);
        assert!(consumer.is_active("op-1"));
        assert_eq!(consumer.get_active_count(), 1);
        assert!(streams.acked.lock().unwrap().is_empty(), "ack must wait for mark_complete");
        assert!(streams.dead_letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_complete_acks_and_allows_opportunity_id_reuse() {
        let (consumer, streams, queue) = consumer();
        streams.push_message("1-0", valid_fields());
        consumer.run_once().await.unwrap();
        assert!(consumer.is_active("op-1"));

        consumer.mark_complete("op-1").await;
        assert!(!consumer.is_active("op-1"));
        assert_eq!(streams.acked.lock().unwrap().len(), 1);
        assert_eq!(consumer.pending_count(), 0);

        // same opportunity id may legitimately arrive again once completed
        streams.push_message("1-1", valid_fields());
        let accepted = consumer.run_once().await.unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(queue.size(), 2);
        assert!(streams.dead_letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_stale_pending_messages_acks_and_evicts_old_entries() {
        let clock = ManualClock::new(1_000);
        let streams = Arc::new(InMemoryStreams::default());
        let queue = Arc::new(Queue::new(QueueConfig { max_size: 10, high_water_mark: 8, low_water_mark: 2 }));
        let consumer = Consumer::new(config(), clock.clone(), streams.clone(), streams.clone(), queue, Arc::new(ExecutionStats::default()));

        streams.push_message("1-0", valid_fields());
        consumer.run_once().await.unwrap();
        assert_eq!(consumer.pending_count(), 1);

        let evicted = consumer.cleanup_stale_pending_messages().await;
        assert_eq!(evicted, 0, "not yet stale");

        clock.advance(30_000);
        let evicted = consumer.cleanup_stale_pending_messages().await;
        assert_eq!(evicted, 1);
        assert_eq!(consumer.pending_count(), 0);
        assert!(!consumer.is_active("op-1"));
        assert_eq!(streams.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_goes_to_dead_letter_without_raw_payload() {
        let (consumer, streams, queue) = consumer();
        streams.push_message("1-0", json!({ "id": "op-1" }));
        let accepted = consumer.run_once().await.unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(queue.size(), 0);
        let dlq = streams.dead_letters.lock().unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "ERR_VALIDATION");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (consumer, streams, queue) = consumer();
        streams.push_message("1-0", valid_fields());
        streams.push_message("1-1", valid_fields());
        let accepted = consumer.run_once().await.unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(queue.size(), 1);
        let dlq = streams.dead_letters.lock().unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "ERR_DUPLICATE_COMMITMENT");
    }

    #[tokio::test]
    async fn expired_opportunity_rejected() {
        let (consumer, streams, _queue) = consumer();
        let mut fields = valid_fields();
        fields["expiresAt"] = json!(1);
        streams.push_message("1-0", fields);
        consumer.run_once().await.unwrap();
        let dlq = streams.dead_letters.lock().unwrap();
        assert_eq!(dlq[0].reason, "ERR_VALIDATION");
    }

    #[tokio::test]
    async fn paused_queue_stops_pulling_new_batches() {
        let (consumer, streams, queue) = consumer();
        queue.pause();
        streams.push_message("1-0", valid_fields());
        let accepted = consumer.run_once().await.unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(streams.inbox.lock().unwrap().len(), 1);
    }
}
