//! Session Coordinator (section 4.7): strict per-conversation FIFO ordering.
//!
//! Grounded on the session-tracking idiom of the old multi-user session
//! manager (`HashMap` keyed by a composite identity, short critical
//! sections under a plain `Mutex`) but built for a different job: that
//! manager tracked *stats* per user, this one gates *execution order* per
//! conversation. The queueing mechanism itself (`tokio::sync::Notify`
//! per-waiter, FIFO hand-off) has no teacher counterpart — the proxy this
//! crate descends from has no concept of serializing concurrent requests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::model::AnthropicRequest;
use crate::routing::PipelineBinding;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
}

/// The runtime value threaded through all six pipeline stages for one
/// request. `resolved_binding` is populated by the Router; `sequence_number`
/// is assigned by the coordinator at acquisition time.
pub struct RequestEnvelope {
    pub request_id: String,
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub sequence_number: u64,
    pub virtual_route: String,
    pub resolved_binding: Option<Arc<PipelineBinding>>,
    pub payload: AnthropicRequest,
    pub streaming: bool,
    pub deadline: Instant,
    pub cancellation: CancellationToken,
}

struct ConversationState {
    waiters: VecDeque<Arc<Notify>>,
    busy: bool,
    next_sequence: u64,
    outstanding: BTreeSet<u64>,
    highest_completed: u64,
    last_activity: Instant,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            busy: false,
            next_sequence: 0,
            outstanding: BTreeSet::new(),
            highest_completed: 0,
            last_activity: Instant::now(),
        }
    }

    fn idle(&self) -> bool {
        !self.busy && self.waiters.is_empty()
    }
}

/// Owns the per-conversation FIFO queues. One instance per process, shared
/// via `Arc` across Ingress handler tasks.
pub struct SessionCoordinator {
    conversations: Mutex<HashMap<ConversationKey, ConversationState>>,
    loose_ordering: bool,
    idle_threshold: Duration,
}

impl SessionCoordinator {
    pub fn new(loose_ordering: bool, idle_threshold: Duration) -> Arc<Self> {
        Arc::new(Self {
            conversations: Mutex::new(HashMap::new()),
            loose_ordering,
            idle_threshold,
        })
    }

    /// Assign a sequence number to this conversation and, in strict mode,
    /// suspend until any in-flight request for the same conversation has
    /// released its slot. Loose mode assigns a sequence and returns
    /// immediately, tracking completion order only for diagnostic logging.
    pub async fn acquire(self: &Arc<Self>, key: ConversationKey) -> SessionSlot {
        let (sequence, wait_on) = {
            let mut conversations = self.conversations.lock().unwrap();
            let state = conversations.entry(key.clone()).or_insert_with(ConversationState::new);
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.outstanding.insert(sequence);
            state.last_activity = Instant::now();

            if self.loose_ordering {
                (sequence, None)
            } else if state.busy {
                let notify = Arc::new(Notify::new());
                state.waiters.push_back(notify.clone());
                (sequence, Some(notify))
            } else {
                state.busy = true;
                (sequence, None)
            }
        };

        if let Some(notify) = wait_on {
            notify.notified().await;
        }

        SessionSlot {
            coordinator: Arc::clone(self),
            key,
            sequence,
        }
    }

    /// Release a held slot and hand off to the next FIFO waiter (strict
    /// mode only; loose mode has no slot to hand off). Called from
    /// `SessionSlot::drop`, so it runs identically whether the request
    /// completed normally or was cancelled mid-flight.
    fn release(&self, key: &ConversationKey, sequence: u64) {
        let mut conversations = self.conversations.lock().unwrap();
        let Some(state) = conversations.get_mut(key) else { return };

        state.outstanding.remove(&sequence);
        if let Some(&earliest_outstanding) = state.outstanding.iter().next() {
            if earliest_outstanding < sequence {
                tracing::warn!(
                    session_id = %key.session_id.0,
                    conversation_id = %key.conversation_id.0,
                    completed_sequence = sequence,
                    still_outstanding = earliest_outstanding,
                    "out-of-order completion: a later sequence completed before an earlier one"
                );
            }
        }
        if sequence < state.highest_completed {
            tracing::warn!(
                session_id = %key.session_id.0,
                conversation_id = %key.conversation_id.0,
                completed_sequence = sequence,
                highest_completed = state.highest_completed,
                "out-of-order completion: sequence completed below the conversation's high-water mark"
            );
        } else {
            state.highest_completed = sequence;
        }
        state.last_activity = Instant::now();

        if !self.loose_ordering {
            match state.waiters.pop_front() {
                Some(next) => next.notify_one(),
                None => state.busy = false,
            }
        }
    }

    /// Drop conversations with an empty queue and no activity for the
    /// configured idle threshold. Intended to be called periodically from a
    /// background task, not from the request path.
    pub fn gc_idle(&self) {
        let mut conversations = self.conversations.lock().unwrap();
        conversations.retain(|_, state| {
            !(state.idle() && state.last_activity.elapsed() > self.idle_threshold)
        });
    }

    pub fn tracked_conversation_count(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }
}

/// Held for the lifetime of one request's execution within its conversation.
/// Dropping it (whether by normal completion or because the request was
/// cancelled) releases the conversation's slot to the next FIFO waiter.
pub struct SessionSlot {
    coordinator: Arc<SessionCoordinator>,
    key: ConversationKey,
    sequence: u64,
}

impl SessionSlot {
    pub fn sequence_number(&self) -> u64 {
        self.sequence
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.coordinator.release(&self.key, self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str, c: &str) -> ConversationKey {
        ConversationKey {
            session_id: SessionId(s.to_string()),
            conversation_id: ConversationId(c.to_string()),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically_per_conversation() {
        let coordinator = SessionCoordinator::new(false, Duration::from_secs(60));
        let slot1 = coordinator.acquire(key("s1", "c1")).await;
        assert_eq!(slot1.sequence_number(), 0);
        drop(slot1);
        let slot2 = coordinator.acquire(key("s1", "c1")).await;
        assert_eq!(slot2.sequence_number(), 1);
    }

    #[tokio::test]
    async fn distinct_conversations_do_not_block_each_other() {
        let coordinator = SessionCoordinator::new(false, Duration::from_secs(60));
        let slot_a = coordinator.acquire(key("s1", "a")).await;
        // Acquiring a different conversation must not deadlock while slot_a is held.
        let slot_b = coordinator.acquire(key("s1", "b")).await;
        assert_eq!(slot_a.sequence_number(), 0);
        assert_eq!(slot_b.sequence_number(), 0);
    }

    #[tokio::test]
    async fn second_request_waits_for_first_slot_release() {
        let coordinator = SessionCoordinator::new(false, Duration::from_secs(60));
        let order = Arc::new(Mutex::new(Vec::new()));

        let slot1 = coordinator.acquire(key("s1", "c1")).await;

        let coordinator2 = Arc::clone(&coordinator);
        let order2 = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            let slot2 = coordinator2.acquire(key("s1", "c1")).await;
            order2.lock().unwrap().push(slot2.sequence_number());
        });

        // Give the waiter a chance to enqueue before releasing slot1.
        tokio::task::yield_now().await;
        order.lock().unwrap().push(u64::MAX); // marker: slot1 still held
        drop(slot1);
        waiter.await.unwrap();

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec![u64::MAX, 1]);
    }

    #[tokio::test]
    async fn loose_mode_never_blocks_concurrent_acquires() {
        let coordinator = SessionCoordinator::new(true, Duration::from_secs(60));
        let slot1 = coordinator.acquire(key("s1", "c1")).await;
        let slot2 = coordinator.acquire(key("s1", "c1")).await;
        assert_eq!(slot1.sequence_number(), 0);
        assert_eq!(slot2.sequence_number(), 1);
    }

    #[tokio::test]
    async fn gc_removes_idle_conversations_only() {
        let coordinator = SessionCoordinator::new(false, Duration::from_millis(1));
        let slot = coordinator.acquire(key("s1", "c1")).await;
        assert_eq!(coordinator.tracked_conversation_count(), 1);
        drop(slot);
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.gc_idle();
        assert_eq!(coordinator.tracked_conversation_count(), 0);
    }
}
