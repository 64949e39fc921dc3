//! InMemoryBroker - 開発・テスト用のブローカー実装
//!
//! 本物のブローカー（Service Bus / SQS 相当）と同じ配送セマンティクスを
//! 単一プロセスで再現します：
//! - lease 付き受信（lock が切れるまで他のコンシューマから見えない）
//! - lock 切れ・abandon による再配送（delivery_count が増える）
//! - 配送回数の上限超過と明示的な dead_letter による隔離
//!
//! # 実装詳細
//! - Arc<Mutex<BrokerState>> で全キューの状態を排他制御
//! - キューごとの Notify で受信待ちを起こす
//! - 再配送待ちは BinaryHeap（due が早い順）で管理し、receive のループ内で
//!   期限を確認して ready へ昇格させる
//!
//! # Fencing
//! delivery_count を lease のトークンとして使います。lock が切れて再配送
//! された後、古い lease から来た settle / renew は `LeaseLost` になります。

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use ulid::Ulid;

use crate::domain::{MessageEnvelope, MessageId, QueueName};
use crate::observability::QueueCounts;
use crate::ports::{Broker, BrokerError, Delivery, LockRenewer, RenewLock};

/// Broker behaviour knobs.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// How long a received delivery stays invisible to other consumers.
    pub lock_duration: Duration,
    /// Deliveries beyond this count go to the dead-letter area.
    pub max_delivery_count: u32,
    /// Base backoff before an abandoned or expired message comes back.
    /// The actual delay is `redelivery_delay * delivery_count`.
    pub redelivery_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            redelivery_delay: Duration::from_millis(200),
        }
    }
}

impl BrokerConfig {
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    pub fn with_redelivery_delay(mut self, redelivery_delay: Duration) -> Self {
        self.redelivery_delay = redelivery_delay;
        self
    }
}

/// A message parked after giving up on delivery.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub envelope: MessageEnvelope,
    pub reason: String,
    pub delivery_count: u32,
}

/// Scheduled redelivery entry for the priority queue.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledRedelivery {
    due: Instant,
    message_id: MessageId,
}

impl PartialOrd for ScheduledRedelivery {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRedelivery {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other.due.cmp(&self.due)
    }
}

/// Message body plus how many times it went out.
struct StoredMessage {
    envelope: MessageEnvelope,
    /// 1-origin once delivered; 0 while never received.
    delivery_count: u32,
}

/// The lease a consumer currently holds on a message.
struct LeaseState {
    locked_until: Instant,
    /// Token: equals the delivery_count handed out with this lease.
    attempt: u32,
}

/// Per-queue state. A message id lives in exactly one of
/// ready / inflight / scheduled / dead at any moment.
#[derive(Default)]
struct QueueState {
    /// Message bodies (everything not yet dead-lettered).
    messages: HashMap<MessageId, StoredMessage>,
    /// Waiting to be handed out.
    ready: VecDeque<MessageId>,
    /// Leased out.
    inflight: HashMap<MessageId, LeaseState>,
    /// Waiting out a redelivery backoff.
    scheduled: BinaryHeap<ScheduledRedelivery>,
    /// Parked messages.
    dead: Vec<DeadLetter>,
    /// Wakes receivers blocked on this queue.
    notify: Arc<Notify>,
}

impl QueueState {
    /// Reap expired leases and promote due redeliveries into ready.
    /// Runs with the state lock held.
    fn promote_due(&mut self, now: Instant, config: &BrokerConfig) {
        let expired: Vec<MessageId> = self
            .inflight
            .iter()
            .filter(|(_, lease)| lease.locked_until <= now)
            .map(|(message_id, _)| *message_id)
            .collect();
        for message_id in expired {
            self.inflight.remove(&message_id);
            self.redeliver_or_dead(message_id, now, config, "lock expired");
        }

        while let Some(entry) = self.scheduled.peek() {
            if entry.due > now {
                break; // Heap is sorted, so we can stop
            }
            let message_id = entry.message_id;
            self.scheduled.pop();
            if self.messages.contains_key(&message_id) {
                self.ready.push_back(message_id);
            }
        }
    }

    /// Schedule another delivery, or park the message if its attempts are used up.
    fn redeliver_or_dead(
        &mut self,
        message_id: MessageId,
        now: Instant,
        config: &BrokerConfig,
        cause: &str,
    ) {
        let Some(stored) = self.messages.get(&message_id) else {
            return;
        };
        if stored.delivery_count >= config.max_delivery_count {
            self.move_to_dead(message_id, format!("delivery count exhausted ({cause})"));
        } else {
            let delay = config.redelivery_delay * stored.delivery_count;
            tracing::debug!(
                message_id = %message_id,
                delivery_count = stored.delivery_count,
                cause,
                "redelivery scheduled"
            );
            self.scheduled.push(ScheduledRedelivery {
                due: now + delay,
                message_id,
            });
        }
    }

    fn move_to_dead(&mut self, message_id: MessageId, reason: String) {
        if let Some(stored) = self.messages.remove(&message_id) {
            tracing::warn!(
                message_id = %message_id,
                delivery_count = stored.delivery_count,
                reason = %reason,
                "message dead-lettered"
            );
            self.dead.push(DeadLetter {
                message_id,
                envelope: stored.envelope,
                reason,
                delivery_count: stored.delivery_count,
            });
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            ready: self.ready.len(),
            inflight: self.inflight.len(),
            scheduled: self.scheduled.len(),
            dead_lettered: self.dead.len(),
        }
    }
}

/// Broker-wide state.
struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    closed: bool,
}

impl BrokerState {
    fn queue_mut(&mut self, name: &QueueName) -> &mut QueueState {
        self.queues.entry(name.clone()).or_default()
    }
}

/// In-memory broker implementation.
pub struct InMemoryBroker {
    config: BrokerConfig,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Dead letters parked for a queue, oldest first.
    pub async fn dead_letters(&self, queue: &QueueName) -> Vec<DeadLetter> {
        let mut state = self.state.lock().await;
        state.queue_mut(queue).dead.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(
        &self,
        queue: &QueueName,
        envelope: MessageEnvelope,
    ) -> Result<MessageId, BrokerError> {
        let (message_id, notify) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let message_id = MessageId::from(Ulid::new());
            let q = state.queue_mut(queue);
            q.messages.insert(
                message_id,
                StoredMessage {
                    envelope,
                    delivery_count: 0,
                },
            );
            q.ready.push_back(message_id);
            (message_id, Arc::clone(&q.notify))
        };

        // Notify outside the lock to avoid deadlock
        notify.notify_one();
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &QueueName,
        wait: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let (notify, next_wake) = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                let now = Instant::now();
                let config = self.config;
                let q = state.queue_mut(queue);
                q.promote_due(now, &config);

                if let Some(message_id) = q.ready.pop_front()
                    && let Some(stored) = q.messages.get_mut(&message_id)
                {
                    stored.delivery_count += 1;
                    let attempt = stored.delivery_count;
                    let locked_until = now + config.lock_duration;
                    q.inflight.insert(
                        message_id,
                        LeaseState {
                            locked_until,
                            attempt,
                        },
                    );
                    let delivery = MemoryDelivery {
                        message_id,
                        envelope: stored.envelope.clone(),
                        locked_until,
                        attempt,
                        queue: queue.clone(),
                        state: Arc::clone(&self.state),
                        config,
                    };
                    return Ok(Some(Box::new(delivery)));
                }

                // Nothing ready: the next internal event is the earliest
                // scheduled redelivery or the earliest lease expiry.
                let scheduled_due = q.scheduled.peek().map(|entry| entry.due);
                let lease_due = q.inflight.values().map(|lease| lease.locked_until).min();
                let next_wake = match (scheduled_due, lease_due) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                (Arc::clone(&q.notify), next_wake)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Wait for a send/abandon notification OR the next internal event,
            // but never past the caller's deadline.
            let sleep_until = next_wake.map_or(deadline, |wake| wake.min(deadline));
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(sleep_until.into()) => {}
            }
        }
    }

    async fn counts(&self, queue: &QueueName) -> QueueCounts {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let config = self.config;
        let q = state.queue_mut(queue);
        q.promote_due(now, &config);
        q.counts()
    }

    async fn close(&self) {
        let notifies: Vec<Arc<Notify>> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state
                .queues
                .values()
                .map(|q| Arc::clone(&q.notify))
                .collect()
        };
        for notify in notifies {
            notify.notify_waiters();
        }
    }
}

/// Lease implementation for InMemoryBroker.
struct MemoryDelivery {
    message_id: MessageId,
    envelope: MessageEnvelope,
    locked_until: Instant,
    attempt: u32,
    queue: QueueName,
    state: Arc<Mutex<BrokerState>>,
    config: BrokerConfig,
}

impl MemoryDelivery {
    fn lease_lost(&self) -> BrokerError {
        BrokerError::LeaseLost {
            message_id: self.message_id,
            attempt: self.attempt,
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    fn locked_until(&self) -> Instant {
        self.locked_until
    }

    fn delivery_count(&self) -> u32 {
        self.attempt
    }

    fn renewer(&self) -> LockRenewer {
        Arc::new(MemoryRenewer {
            message_id: self.message_id,
            attempt: self.attempt,
            queue: self.queue.clone(),
            state: Arc::clone(&self.state),
            config: self.config,
        })
    }

    async fn complete(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(&self.queue);
        match q.inflight.get(&self.message_id) {
            Some(lease) if lease.attempt == self.attempt => {
                q.inflight.remove(&self.message_id);
                q.messages.remove(&self.message_id);
                Ok(())
            }
            _ => Err(self.lease_lost()),
        }
    }

    async fn abandon(self: Box<Self>) -> Result<(), BrokerError> {
        let notify = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let config = self.config;
            let q = state.queue_mut(&self.queue);
            match q.inflight.get(&self.message_id) {
                Some(lease) if lease.attempt == self.attempt => {
                    q.inflight.remove(&self.message_id);
                    q.redeliver_or_dead(self.message_id, now, &config, "abandoned");
                    Arc::clone(&q.notify)
                }
                _ => return Err(self.lease_lost()),
            }
        };

        // Notify outside the lock to avoid deadlock
        notify.notify_one();
        Ok(())
    }

    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let q = state.queue_mut(&self.queue);
        match q.inflight.get(&self.message_id) {
            Some(lease) if lease.attempt == self.attempt => {
                q.inflight.remove(&self.message_id);
                q.move_to_dead(self.message_id, reason);
                Ok(())
            }
            _ => Err(self.lease_lost()),
        }
    }
}

/// Renewal handle tied to one lease.
///
/// settle と違い、renew は lock が生きていることも要求します。切れた lease を
/// 延長しても手遅れの可能性があるためで、呼び出し側は LeaseLost を見たら
/// 処理を打ち切って abandon するのが正しい対応です。
struct MemoryRenewer {
    message_id: MessageId,
    attempt: u32,
    queue: QueueName,
    state: Arc<Mutex<BrokerState>>,
    config: BrokerConfig,
}

#[async_trait]
impl RenewLock for MemoryRenewer {
    async fn renew(&self) -> Result<Instant, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let q = state.queue_mut(&self.queue);
        match q.inflight.get_mut(&self.message_id) {
            Some(lease) if lease.attempt == self.attempt && lease.locked_until > now => {
                lease.locked_until = now + self.config.lock_duration;
                Ok(lease.locked_until)
            }
            _ => Err(BrokerError::LeaseLost {
                message_id: self.message_id,
                attempt: self.attempt,
            }),
        }
    }
}
