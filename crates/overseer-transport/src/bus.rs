// In-process durable pub/sub with consumer groups.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use overseer_wire::Envelope;

use crate::{Result, TransportError};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Bounded in-flight window per consumer group
    pub window: usize,
    /// Deadline for a publish blocked on a full window
    pub publish_timeout: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            window: 16,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

struct GroupState {
    tx: mpsc::Sender<Envelope>,
    /// Live consumer guard; a second subscriber to the same group is rejected
    taken: bool,
}

#[derive(Default)]
struct SubjectState {
    /// Retained publish log; replayed to groups subscribing from the start
    log: Vec<Envelope>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct BusState {
    subjects: HashMap<String, SubjectState>,
}

/// Durable subject-routed bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageBus {
    options: BusOptions,
    state: Arc<Mutex<BusState>>,
}

impl MessageBus {
    pub fn new(options: BusOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Publish an envelope to its subject. Messages are retained in the
    /// subject log and fanned out to every consumer group; a group whose
    /// window stays full past the publish deadline fails the publish.
    pub async fn publish(&self, envelope: Envelope) -> Result<()> {
        let senders: Vec<(String, mpsc::Sender<Envelope>)> = {
            let mut state = self.state.lock().await;
            let subject = state.subjects.entry(envelope.subject.clone()).or_default();
            subject.log.push(envelope.clone());
            subject
                .groups
                .iter()
                .map(|(name, group)| (name.clone(), group.tx.clone()))
                .collect()
        };

        for (group, tx) in senders {
            let send = tx.send_timeout(envelope.clone(), self.options.publish_timeout);
            match send.await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        subject = envelope.subject.as_str(),
                        group = group.as_str(),
                        "publish timed out on full consumer window"
                    );
                    return Err(TransportError::PublishTimeout(envelope.subject.clone()));
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    // Consumer went away; drop its group so the subject keeps
                    // flowing for the remaining groups.
                    let mut state = self.state.lock().await;
                    if let Some(subject) = state.subjects.get_mut(&envelope.subject) {
                        subject.groups.remove(&group);
                    }
                }
            }
        }
        Ok(())
    }

    /// Join a consumer group on a subject, receiving messages published from
    /// now on. One live consumer per group.
    pub async fn subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, group, false).await
    }

    /// Join a consumer group and first replay the subject's retained log.
    pub async fn subscribe_from_start(&self, subject: &str, group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, group, true).await
    }

    async fn subscribe_inner(
        &self,
        subject: &str,
        group: &str,
        from_start: bool,
    ) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        let subject_state = state.subjects.entry(subject.to_string()).or_default();

        if let Some(existing) = subject_state.groups.get(group) {
            if existing.taken && !existing.tx.is_closed() {
                return Err(TransportError::GroupTaken {
                    subject: subject.to_string(),
                    group: group.to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::channel(self.options.window.max(1));
        subject_state
            .groups
            .insert(group.to_string(), GroupState { tx, taken: true });

        let backlog = if from_start {
            subject_state.log.iter().cloned().collect()
        } else {
            VecDeque::new()
        };

        Ok(Subscription { backlog, rx })
    }

    /// Number of messages retained for a subject. Test observability.
    pub async fn log_len(&self, subject: &str) -> usize {
        let state = self.state.lock().await;
        state
            .subjects
            .get(subject)
            .map(|s| s.log.len())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusOptions::default())
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A consumer group's receive side. Backlog (if any) drains before live
/// messages; both preserve publish order.
pub struct Subscription {
    backlog: VecDeque<Envelope>,
    rx: mpsc::Receiver<Envelope>,
}

impl Subscription {
    /// Receive the next message; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Tests
// ============================================================================
