//! Commit-reveal state machine with wait-for-block and retry-once-on-failure
//! reveal semantics (spec §4.11, C11).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::utils::keccak256;

use crate::errors::EngineError;
use crate::providers::ChainRpc;
use crate::types::CommitmentRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentState {
    Absent,
    Committed,
    Revealable,
    Done,
    Cancelled,
    FailedAfterRetry,
}

/// Deterministic commitment hash over the fields that must match at reveal time.
pub fn compute_commitment_hash(
    asset: &str,
    amount_in: u128,
    swap_path: &[String],
    min_profit: u128,
    deadline_ms: u64,
    salt: &str,
) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(asset.as_bytes());
    buf.extend_from_slice(&amount_in.to_be_bytes());
    for hop in swap_path {
        buf.extend_from_slice(hop.as_bytes());
    }
    buf.extend_from_slice(&min_profit.to_be_bytes());
    buf.extend_from_slice(&deadline_ms.to_be_bytes());
    buf.extend_from_slice(salt.as_bytes());
    let digest = keccak256(buf);
    format!("0x{}", digest.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

/// Durable storage with atomic set-if-absent semantics. The in-memory implementation
/// below is the fallback path (spec §4.11); a TTL-backed external KV is a separate
/// implementation of this same trait, outside this crate's scope.
#[async_trait]
pub trait CommitmentStore: Send + Sync {
    async fn set_if_absent(&self, key: &str, record: CommitmentRecord) -> bool;
    async fn get(&self, key: &str) -> Option<CommitmentRecord>;
    async fn delete(&self, key: &str);
}

#[derive(Default)]
pub struct InMemoryCommitmentStore {
    records: Mutex<HashMap<String, CommitmentRecord>>,
}

#[async_trait]
impl CommitmentStore for InMemoryCommitmentStore {
    async fn set_if_absent(&self, key: &str, record: CommitmentRecord) -> bool {
        let mut guard = self.records.lock().unwrap();
        if guard.contains_key(key) {
            false
        } else {
            guard.insert(key.to_string(), record);
            true
        }
    }

    async fn get(&self, key: &str) -> Option<CommitmentRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    async fn delete(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }
}

#[derive(Debug, Clone)]
pub struct RevealedEvent {
    pub hash: String,
    pub token_in: String,
    pub token_out: String,
    pub profit: u128,
}

/// On-chain side of commit/reveal/cancel, narrowed to what this state machine needs.
/// The concrete implementation calls into a deployed contract via `ChainRpc`/a
/// signer; tests substitute a scripted fake.
#[async_trait]
pub trait RevealExecutor: Send + Sync {
    async fn commit(&self, record: &CommitmentRecord) -> eyre::Result<()>;
    async fn reveal(&self, record: &CommitmentRecord, gas_limit_multiplier: f64) -> eyre::Result<Option<RevealedEvent>>;
    async fn cancel_commit(&self, record: &CommitmentRecord) -> eyre::Result<()>;
}

const MAX_TRANSIENT_ERRORS: u32 = 5;

pub struct CommitReveal {
    store: std::sync::Arc<dyn CommitmentStore>,
    executor: std::sync::Arc<dyn RevealExecutor>,
}

impl CommitReveal {
    pub fn new(store: std::sync::Arc<dyn CommitmentStore>, executor: std::sync::Arc<dyn RevealExecutor>) -> Self {
        Self { store, executor }
    }

    /// Atomic set-if-absent; a rejected set means a duplicate commitment.
    pub async fn commit(&self, record: CommitmentRecord) -> Result<(), EngineError> {
        let accepted = self.store.set_if_absent(&record.commitment_hash, record.clone()).await;
        if !accepted {
            return Err(EngineError::DuplicateCommitment);
        }
        if let Err(err) = self.executor.commit(&record).await {
            self.store.delete(&record.commitment_hash).await;
            return Err(EngineError::Other(format!("on-chain commit failed: {err}")));
        }
        Ok(())
    }

    pub async fn state_of(&self, commitment_hash: &str, current_block: u64) -> CommitmentState {
        match self.store.get(commitment_hash).await {
            None => CommitmentState::Absent,
            Some(record) if current_block >= record.reveal_block => CommitmentState::Revealable,
            Some(_) => CommitmentState::Committed,
        }
    }

    /// Polls the chain's block number until it reaches `target`. Tolerates up to
    /// `MAX_TRANSIENT_ERRORS` consecutive provider errors; a 6th consecutive failure
    /// fails fast rather than continuing to poll. Times out after `max_attempts`.
    pub async fn wait_for_reveal_block(&self, rpc: &dyn ChainRpc, target: u64, max_attempts: u32, poll_interval_ms: u64) -> Result<(), EngineError> {
        let mut consecutive_errors = 0u32;
        for _ in 0..max_attempts {
            match rpc.get_block_number().await {
                Ok(current) if current >= target => return Ok(()),
                Ok(_) => {
                    consecutive_errors = 0;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %err, consecutive_errors, "block number poll failed");
                    if consecutive_errors > MAX_TRANSIENT_ERRORS {
                        return Err(EngineError::Other("too many consecutive block-poll errors".into()));
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms)).await;
        }
        Err(EngineError::Other("timed out waiting for reveal block".into()))
    }

    /// Invokes the on-chain reveal; on failure retries exactly once at 1.1x gas.
    /// Deletes the storage entry on success; `FailedAfterRetry` otherwise so no
    /// further retries are attempted. Refuses to even attempt the call before
    /// `current_block` reaches `record.reveal_block`.
    pub async fn reveal(&self, record: &CommitmentRecord, current_block: u64) -> Result<(CommitmentState, Option<RevealedEvent>), EngineError> {
        if current_block < record.reveal_block {
            return Err(EngineError::RevealTooEarly { current: current_block, need: record.reveal_block });
        }
        match self.executor.reveal(record, 1.0).await {
            Ok(event) => {
                self.store.delete(&record.commitment_hash).await;
                Ok((CommitmentState::Done, event))
            }
            Err(first_err) => {
                tracing::warn!(error = %first_err, commitment = %record.commitment_hash, "reveal failed, retrying with higher gas limit");
                match self.executor.reveal(record, 1.1).await {
                    Ok(event) => {
                        self.store.delete(&record.commitment_hash).await;
                        Ok((CommitmentState::Done, event))
                    }
                    Err(second_err) => {
                        tracing::error!(error = %second_err, commitment = %record.commitment_hash, "reveal retry failed");
                        Ok((CommitmentState::FailedAfterRetry, None))
                    }
                }
            }
        }
    }

    /// Deletes the storage entry only on success, so a failed cancel can still be
    /// retried by a future call.
    pub async fn cancel(&self, record: &CommitmentRecord) -> Result<(), EngineError> {
        self.executor
            .cancel_commit(record)
            .await
            .map_err(|err| EngineError::Other(format!("cancel failed: {err}")))?;
        self.store.delete(&record.commitment_hash).await;
        Ok(())
    }
}
