//! Per-message execution state machine and its two expiry clocks.
//!
//! ```text
//! Pending --(execution report)--> Executed --(grace elapses)--> removed
//! Pending --(fallback elapses)--> removed
//! ```
//!
//! Each message owns at most one armed clock at a time: the fallback clock
//! while pending, the grace clock once executed. Clocks are tokio tasks
//! tracked by their abort handle; firing hands a [`ClockTicket`] back to
//! the owner, which must [`release`](ExecutionTracker::release) it under the
//! store guard and re-check the message status before deleting anything.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::AbortHandle;

use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, MessageId, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockPhase {
    Fallback,
    Grace,
}

impl fmt::Display for ClockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockPhase::Fallback => f.write_str("fallback"),
            ClockPhase::Grace => f.write_str("grace"),
        }
    }
}

/// Identifies one arming of one clock. A ticket from a cancelled or
/// superseded arming no longer matches the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTicket {
    pub id: MessageId,
    pub phase: ClockPhase,
    seq: u64,
}

struct ArmedClock {
    phase: ClockPhase,
    seq: u64,
    handle: AbortHandle,
}

pub struct ExecutionTracker {
    fallback: Duration,
    grace: Duration,
    clocks: HashMap<MessageId, ArmedClock>,
    next_seq: u64,
}

impl ExecutionTracker {
    pub fn new(fallback: Duration, grace: Duration) -> Self {
        Self {
            fallback,
            grace,
            clocks: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn duration(&self, phase: ClockPhase) -> Duration {
        match phase {
            ClockPhase::Fallback => self.fallback,
            ClockPhase::Grace => self.grace,
        }
    }

    /// Time left on a clock of `phase` that logically started at `since`.
    pub fn remaining(&self, phase: ClockPhase, since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        self.duration(phase).saturating_sub(elapsed)
    }

    /// Arms a clock for `id`. `fire` builds the future run once `delay`
    /// elapses; it receives the ticket identifying this arming.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(
        &mut self,
        id: MessageId,
        phase: ClockPhase,
        delay: Duration,
        fire: F,
    ) -> BrokerResult<ClockTicket>
    where
        F: FnOnce(ClockTicket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(existing) = self.clocks.get(&id) {
            return Err(BrokerError::ClockAlreadyArmed {
                id,
                phase: existing.phase,
            });
        }

        self.next_seq = self.next_seq.wrapping_add(1);
        let ticket = ClockTicket {
            id,
            phase,
            seq: self.next_seq,
        };

        let on_fire = fire(ticket);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });

        self.clocks.insert(
            id,
            ArmedClock {
                phase,
                seq: ticket.seq,
                handle: task.abort_handle(),
            },
        );

        Ok(ticket)
    }

    /// Cancels whatever clock `id` holds. Returns the phase that was armed;
    /// cancelling an absent or already-fired clock is a no-op.
    pub fn cancel(&mut self, id: &MessageId) -> Option<ClockPhase> {
        let clock = self.clocks.remove(id)?;
        clock.handle.abort();
        Some(clock.phase)
    }

    /// Clears the slot of a fired clock. Returns `false` when the ticket is
    /// stale, in which case the caller must not act on it.
    pub fn release(&mut self, ticket: ClockTicket) -> bool {
        match self.clocks.get(&ticket.id) {
            Some(clock) if clock.seq == ticket.seq && clock.phase == ticket.phase => {
                self.clocks.remove(&ticket.id);
                true
            }
            _ => false,
        }
    }

    pub fn phase_of(&self, id: &MessageId) -> Option<ClockPhase> {
        self.clocks.get(id).map(|clock| clock.phase)
    }

    pub fn armed(&self) -> usize {
        self.clocks.len()
    }

    /// Pending -> Executed. Returns `false` (and leaves the message
    /// untouched) when the message was already executed.
    pub fn apply_execution(message: &mut Message, outcome: bool, now: DateTime<Utc>) -> bool {
        if !message.is_pending() {
            return false;
        }
        message.status = MessageStatus::Executed {
            outcome,
            executed_at: now,
        };
        true
    }

    /// Whether an elapsed clock of `phase` removes a message in `status`.
    pub fn expiry_applies(phase: ClockPhase, status: &MessageStatus) -> bool {
        matches!(
            (phase, status),
            (ClockPhase::Fallback, MessageStatus::Pending)
                | (ClockPhase::Grace, MessageStatus::Executed { .. })
        )
    }
}

impl Drop for ExecutionTracker {
    fn drop(&mut self) {
        for (_, clock) in self.clocks.drain() {
            clock.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Namespace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tracker() -> ExecutionTracker {
        ExecutionTracker::new(Duration::from_secs(60), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn clock_fires_once_after_delay() {
        let mut tracker = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = MessageId::new();

        let counter = fired.clone();
        tracker
            .arm(id, ClockPhase::Fallback, Duration::from_secs(60), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("arm");

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn arming_twice_is_rejected() {
        let mut tracker = tracker();
        let id = MessageId::new();
        tracker
            .arm(id, ClockPhase::Fallback, Duration::from_secs(60), |_| async {})
            .expect("first arm");

        let err = tracker
            .arm(id, ClockPhase::Grace, Duration::from_secs(5), |_| async {})
            .expect_err("second arm must fail");
        assert!(matches!(
            err,
            BrokerError::ClockAlreadyArmed {
                phase: ClockPhase::Fallback,
                ..
            }
        ));
        assert_eq!(tracker.phase_of(&id), Some(ClockPhase::Fallback));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_clock_never_fires_and_cancel_is_idempotent() {
        let mut tracker = tracker();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = MessageId::new();

        let counter = fired.clone();
        tracker
            .arm(id, ClockPhase::Grace, Duration::from_secs(5), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("arm");

        assert_eq!(tracker.cancel(&id), Some(ClockPhase::Grace));
        assert_eq!(tracker.cancel(&id), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.armed(), 0);
    }

    #[tokio::test]
    async fn stale_ticket_is_not_released() {
        let mut tracker = tracker();
        let id = MessageId::new();
        let first = tracker
            .arm(id, ClockPhase::Fallback, Duration::from_secs(60), |_| async {})
            .expect("arm fallback");
        tracker.cancel(&id);
        let second = tracker
            .arm(id, ClockPhase::Grace, Duration::from_secs(5), |_| async {})
            .expect("arm grace");

        assert!(!tracker.release(first));
        assert_eq!(tracker.phase_of(&id), Some(ClockPhase::Grace));
        assert!(tracker.release(second));
        assert!(!tracker.release(second));
    }

    #[test]
    fn execution_is_one_directional() {
        let mut message = Message::pending(Namespace::User, "alice", "x", Utc::now());
        assert!(ExecutionTracker::apply_execution(&mut message, false, Utc::now()));
        assert!(!ExecutionTracker::apply_execution(&mut message, true, Utc::now()));
        assert!(matches!(
            message.status,
            MessageStatus::Executed { outcome: false, .. }
        ));
    }

    #[test]
    fn expiry_only_matches_its_phase() {
        let executed = MessageStatus::Executed {
            outcome: true,
            executed_at: Utc::now(),
        };
        assert!(ExecutionTracker::expiry_applies(ClockPhase::Fallback, &MessageStatus::Pending));
        assert!(!ExecutionTracker::expiry_applies(ClockPhase::Fallback, &executed));
        assert!(ExecutionTracker::expiry_applies(ClockPhase::Grace, &executed));
        assert!(!ExecutionTracker::expiry_applies(ClockPhase::Grace, &MessageStatus::Pending));
    }

    #[test]
    fn remaining_time_is_clamped() {
        let tracker = tracker();
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(20);
        assert_eq!(
            tracker.remaining(ClockPhase::Fallback, since, now),
            Duration::from_secs(40)
        );
        let long_ago = now - chrono::Duration::seconds(600);
        assert_eq!(tracker.remaining(ClockPhase::Grace, long_ago, now), Duration::ZERO);
    }
}
