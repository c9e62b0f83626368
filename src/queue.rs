//! Bounded FIFO with hysteresis backpressure (spec §4.1, C1).
//!
//! Enqueue/dequeue must stay synchronous so the item-available callback can fire
//! *inside* `enqueue` without the caller suspending first (spec §5). A
//! `std::sync::Mutex` backs the circular buffer instead of `tokio::sync::Mutex` for
//! exactly that reason.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::types::Opportunity;

pub type ItemAvailableCallback = Box<dyn Fn() + Send + Sync>;
pub type PauseStateCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, PartialEq)]
pub struct QueueConfig {
    pub max_size: usize,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), crate::errors::ConfigError> {
        if !(self.low_water_mark < self.high_water_mark && self.high_water_mark <= self.max_size) {
            return Err(crate::errors::ConfigError::InvalidWaterMarks {
                low: self.low_water_mark,
                high: self.high_water_mark,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

struct QueueInner {
    buffer: VecDeque<Opportunity>,
    item_available: Option<ItemAvailableCallback>,
    pause_state_change: Option<PauseStateCallback>,
}

/// Bounded circular-buffer FIFO with two-threshold (hysteresis) backpressure and a
/// separate manual pause for standby instances.
pub struct Queue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    backpressure_paused: AtomicBool,
    manually_paused: AtomicBool,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffer: VecDeque::with_capacity(config.max_size),
                item_available: None,
                pause_state_change: None,
            }),
            backpressure_paused: AtomicBool::new(false),
            manually_paused: AtomicBool::new(false),
            config,
        }
    }

    pub fn on_item_available(&self, cb: ItemAvailableCallback) {
        self.inner.lock().unwrap().item_available = Some(cb);
    }

    pub fn on_pause_state_change(&self, cb: PauseStateCallback) {
        self.inner.lock().unwrap().pause_state_change = Some(cb);
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_paused(&self) -> bool {
        self.backpressure_paused.load(Ordering::SeqCst) || self.manually_paused.load(Ordering::SeqCst)
    }

    fn can_enqueue(&self, len: usize) -> bool {
        !self.is_paused() && len < self.config.max_size
    }

    /// Pushes `op` if capacity and pause state allow it. Fires the item-available
    /// signal synchronously on success, and may flip the backpressure flag on (never
    /// off — that only happens from `dequeue`/hysteresis).
    pub fn enqueue(&self, op: Opportunity) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if !self.can_enqueue(guard.buffer.len()) {
            return false;
        }
        guard.buffer.push_back(op);
        let len = guard.buffer.len();

        let became_paused = len >= self.config.high_water_mark
            && !self.backpressure_paused.swap(true, Ordering::SeqCst);

        let signal_available = !self.is_paused();
        let pause_cb_invoke = if became_paused {
            guard.pause_state_change.as_ref().map(|cb| (cb, true))
        } else {
            None
        };
        if let Some((cb, paused)) = pause_cb_invoke {
            invoke_pause_cb(cb, paused);
        }

        if signal_available {
            if let Some(cb) = guard.item_available.as_ref() {
                invoke_item_cb(cb);
            }
        }
        true
    }

    /// Pops the oldest item, applying hysteresis release: backpressure clears only
    /// once size drops to `low_water_mark`, never merely below `high_water_mark`.
    pub fn dequeue(&self) -> Option<Opportunity> {
        let mut guard = self.inner.lock().unwrap();
        let item = guard.buffer.pop_front();
        if item.is_some() {
            let len = guard.buffer.len();
            let became_unpaused = len <= self.config.low_water_mark
                && self.backpressure_paused.swap(false, Ordering::SeqCst);
            if became_unpaused {
                if !self.manually_paused.load(Ordering::SeqCst) {
                    if let Some(cb) = guard.pause_state_change.as_ref() {
                        invoke_pause_cb(cb, false);
                    }
                }
            }
        }
        item
    }

    /// Manual pause for standby instances. Independent of the hysteresis flag;
    /// effective pause is the logical OR of the two.
    pub fn pause(&self) {
        let was_paused = self.is_paused();
        self.manually_paused.store(true, Ordering::SeqCst);
        if !was_paused {
            let guard = self.inner.lock().unwrap();
            if let Some(cb) = guard.pause_state_change.as_ref() {
                invoke_pause_cb(cb, true);
            }
        }
    }

    /// Resumes from manual pause. If backpressure is still engaged, effective pause
    /// persists and no callback fires. Flushes one item-available signal if
    /// non-empty once genuinely resumed.
    pub fn resume(&self) {
        let guard = self.inner.lock().unwrap();
        let backpressure_active = self.backpressure_paused.load(Ordering::SeqCst);
        self.manually_paused.store(false, Ordering::SeqCst);
        if !backpressure_active {
            if let Some(cb) = guard.pause_state_change.as_ref() {
                invoke_pause_cb(cb, false);
            }
            if !guard.buffer.is_empty() {
                if let Some(cb) = guard.item_available.as_ref() {
                    invoke_item_cb(cb);
                }
            }
        }
    }
}

fn invoke_item_cb(cb: &ItemAvailableCallback) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb()));
    if result.is_err() {
        tracing::warn!("item-available callback panicked; item remains enqueued");
    }
}

fn invoke_pause_cb(cb: &PauseStateCallback, paused: bool) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(paused)));
    if result.is_err() {
        tracing::warn!(paused, "pause-state-change callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Opportunity, OpportunityType};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn opp(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            kind: OpportunityType::Simple,
            token_in: "WETH".into(),
            token_out: "USDC".into(),
            amount_in: 1,
            expected_profit: 1.0,
            confidence: 0.9,
            expires_at_ms: u64::MAX,
            buy_chain: Some("ethereum".into()),
            sell_chain: None,
            buy_dex: None,
            sell_dex: None,
            pipeline_timestamps: Default::default(),
            execution_received_at_ms: 0,
        }
    }

    #[test]
    fn fifo_across_wraparound() {
        let q = Queue::new(QueueConfig {
            max_size: 4,
            high_water_mark: 4,
            low_water_mark: 1,
        });
        for i in 0..4 {
            assert!(q.enqueue(opp(&i.to_string())));
        }
        assert_eq!(q.dequeue().unwrap().id, "0");
        assert_eq!(q.dequeue().unwrap().id, "1");
        assert!(q.enqueue(opp("4")));
        assert!(q.enqueue(opp("5")));
        let rest: Vec<_> = std::iter::from_fn(|| q.dequeue()).map(|o| o.id).collect();
        assert_eq!(rest, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn hysteresis_monotonicity() {
        let q = Queue::new(QueueConfig {
            max_size: 10,
            high_water_mark: 8,
            low_water_mark: 3,
        });
        let transitions = Arc::new(AtomicUsize::new(0));
        let t2 = transitions.clone();
        q.on_pause_state_change(Box::new(move |_paused| {
            t2.fetch_add(1, Ordering::SeqCst);
        }));

        for i in 0..7 {
            q.enqueue(opp(&i.to_string()));
        }
        assert!(!q.is_paused());
        assert_eq!(transitions.load(Ordering::SeqCst), 0);

        q.enqueue(opp("7")); // size 8 -> paused
        assert!(q.is_paused());
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            q.dequeue(); // size 8 -> 7 -> 6 -> 5, still paused (> low=3)
        }
        assert!(q.is_paused());
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        q.dequeue(); // size 4, still > low
        assert!(q.is_paused());
        q.dequeue(); // size 3 == low -> unpaused
        assert!(!q.is_paused());
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manual_pause_independent_of_backpressure() {
        let q = Queue::new(QueueConfig {
            max_size: 10,
            high_water_mark: 8,
            low_water_mark: 3,
        });
        q.pause();
        assert!(q.is_paused());
        assert!(!q.enqueue(opp("x")));
        q.resume();
        assert!(!q.is_paused());
        assert!(q.enqueue(opp("x")));
    }

    #[test]
    fn item_available_signals_synchronously() {
        let q = Queue::new(QueueConfig {
            max_size: 10,
            high_water_mark: 8,
            low_water_mark: 3,
        });
        let fired = Arc::new(AtomicBool::new(false));
        let f2 = fired.clone();
        q.on_item_available(Box::new(move || {
            f2.store(true, Ordering::SeqCst);
        }));
        assert!(!fired.load(Ordering::SeqCst));
        q.enqueue(opp("a"));
        assert!(fired.load(Ordering::SeqCst));
    }
}
