//! QueueListener - 受信・実行・決着のループ
//!
//! 一つの QueueListener は一つのキューを担当します：
//! - **fetch loop** が broker から配送を受け取り、bounded channel に積む
//!   （channel の容量 = prefetch。枠を確保してから受信するので、
//!   溢れた配送が lease を抱えたまま宙に浮くことはない）
//! - **slot** が concurrency 本走り、channel から取った配送を処理する
//!
//! # 一配送の流れ
//! 1. kind が未登録なら dead-letter（何度配っても処理できない）
//! 2. 受け取った時点で lease が切れていれば実行せずに abandon
//! 3. ハンドラを spawn し、RetryPolicy で包んで実行。lease の期限
//!    （renew で延びる）を watch で監視し、期限が来たら abort
//! 4. 結果で決着：成功 → reply 送信 + complete / retryable 使い切り →
//!    abandon / permanent → dead-letter / 期限切れ・panic → abandon
//!
//! settle が LeaseLost で失敗するのは「broker が既に回収した」合図なので、
//! 警告ログだけ出して飲み込みます（メッセージは再配送側が生きている）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::dispatch::{DispatchError, HandlerContext, HandlerRegistry, LeaseHandle};
use crate::domain::{Classified, MessageEnvelope, QueueName, ReplyEnvelope};
use crate::ports::{Broker, BrokerError, Delivery};
use crate::retry::RetryPolicy;

type DeliveryRx = Arc<Mutex<mpsc::Receiver<Box<dyn Delivery>>>>;

/// Listener behaviour knobs.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How many handlers run at once.
    pub concurrency: usize,
    /// How many deliveries to hold leased ahead of free slots.
    pub prefetch: usize,
    /// Wait per broker receive call. Bounds how fast shutdown is noticed.
    pub receive_wait: Duration,
    /// In-process retry for handler failures.
    pub retry: RetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prefetch: 1,
            receive_wait: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

impl ListenerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Listener handle for one queue.
/// - `request_shutdown` で新規受付を止める
/// - `shutdown_and_join` で全タスクの終了を待ち、先読み分を broker に返す
pub struct QueueListener {
    shutdown_tx: watch::Sender<bool>,
    fetch: JoinHandle<()>,
    slots: Vec<JoinHandle<()>>,
    leftovers: DeliveryRx,
}

impl QueueListener {
    /// Spawn the fetch loop and `concurrency` slots for `queue`.
    pub fn start(
        queue: QueueName,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        config: ListenerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.prefetch.max(1));
        let delivery_rx: DeliveryRx = Arc::new(Mutex::new(delivery_rx));

        let fetch = {
            let queue = queue.clone();
            let broker = Arc::clone(&broker);
            let receive_wait = config.receive_wait;
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                fetch_loop(queue, broker, delivery_tx, receive_wait, &mut rx).await;
            })
        };

        let mut slots = Vec::with_capacity(config.concurrency);
        for slot_id in 0..config.concurrency {
            let worker = SlotWorker {
                slot_id,
                queue: queue.clone(),
                broker: Arc::clone(&broker),
                registry: Arc::clone(&registry),
                retry: config.retry.clone(),
            };
            let deliveries = Arc::clone(&delivery_rx);
            let mut rx = shutdown_rx.clone();
            slots.push(tokio::spawn(async move {
                worker.run(deliveries, &mut rx).await;
            }));
        }

        Self {
            shutdown_tx,
            fetch,
            slots,
            leftovers: delivery_rx,
        }
    }

    /// Request shutdown. In-flight handlers finish (bounded by their lease
    /// deadline); no new deliveries are taken.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the fetch loop and all slots, then give
    /// prefetched-but-unprocessed deliveries back to the broker.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.fetch.await;
        for slot in self.slots {
            let _ = slot.await;
        }

        let mut leftovers = self.leftovers.lock().await;
        while let Some(delivery) = leftovers.recv().await {
            let message_id = delivery.message_id();
            if let Err(err) = delivery.abandon().await {
                tracing::warn!(message_id = %message_id, error = %err, "abandon on shutdown failed");
            }
        }
    }
}

/// Receive deliveries and queue them for the slots.
async fn fetch_loop(
    queue: QueueName,
    broker: Arc<dyn Broker>,
    deliveries: mpsc::Sender<Box<dyn Delivery>>,
    receive_wait: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // 受信する前に枠を確保する。逆順だと、slot が詰まっている間に
        // 受け取った配送が lease を消費しながら待つことになる。
        let permit = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            permit = deliveries.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            received = broker.receive(&queue, receive_wait) => received,
        };

        match received {
            Ok(Some(delivery)) => permit.send(delivery),
            Ok(None) => {}
            Err(BrokerError::Closed) => break,
            Err(err) => {
                tracing::warn!(queue = %queue, error = %err, "receive failed");
            }
        }
    }
}

/// One concurrent handler slot.
struct SlotWorker {
    slot_id: usize,
    queue: QueueName,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
}

/// What became of one handler run.
enum Verdict {
    Finished(Result<serde_json::Value, DispatchError>),
    DeadlineExpired,
    Panicked,
}

impl Verdict {
    fn from_join(joined: Result<Result<serde_json::Value, DispatchError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Verdict::Finished(result),
            Err(err) if err.is_panic() => Verdict::Panicked,
            Err(_) => Verdict::DeadlineExpired,
        }
    }
}

impl SlotWorker {
    async fn run(&self, deliveries: DeliveryRx, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // lock は recv の間だけ握る。処理中は他の slot が受け取れる。
            let delivery = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                delivery = async {
                    let mut rx = deliveries.lock().await;
                    rx.recv().await
                } => delivery,
            };

            let Some(delivery) = delivery else {
                break; // fetch loop is gone and the buffer is drained
            };

            tracing::debug!(
                queue = %self.queue,
                slot = self.slot_id,
                message_id = %delivery.message_id(),
                "processing delivery"
            );
            self.process_delivery(delivery).await;
        }
    }

    async fn process_delivery(&self, delivery: Box<dyn Delivery>) {
        let message_id = delivery.message_id();
        let envelope = delivery.envelope().clone();
        let kind = envelope.action();

        let Some(handler) = self.registry.get(kind) else {
            tracing::warn!(
                queue = %self.queue,
                message_id = %message_id,
                action = %kind,
                "no handler registered; dead-lettering"
            );
            let err = DispatchError::UnknownAction(kind);
            self.settle_dead_letter(delivery, err.to_string()).await;
            return;
        };

        let locked_until = delivery.locked_until();
        if locked_until <= Instant::now() {
            // 受け取った時点で手遅れ。実行せず返して再配送に任せる。
            tracing::warn!(
                queue = %self.queue,
                message_id = %message_id,
                "lease already expired on pickup; abandoning"
            );
            self.settle_abandon(delivery).await;
            return;
        }

        let (deadline_tx, mut deadline_rx) = watch::channel(locked_until);
        let lease = LeaseHandle::new(delivery.renewer(), Arc::new(deadline_tx));
        let ctx = HandlerContext::new(
            envelope.request_id(),
            envelope.metadata().clone(),
            delivery.delivery_count(),
            lease,
        );

        let retry = self.retry.clone();
        let payload = envelope.payload().clone();
        let mut join = tokio::spawn(async move {
            retry
                .run(|| handler.handle_dyn(payload.clone(), ctx.clone()))
                .await
        });

        let verdict = loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                joined = &mut join => break Verdict::from_join(joined),
                _ = tokio::time::sleep_until(deadline.into()) => {
                    // 眠っている間に renew が入っていれば締め切りが動いている
                    if *deadline_rx.borrow() > Instant::now() {
                        continue;
                    }
                    join.abort();
                    // abort が効く前に終わっていたら、その結果を尊重する
                    break Verdict::from_join((&mut join).await);
                }
            }
        };

        match verdict {
            Verdict::Finished(Ok(result)) => {
                self.publish_reply(&envelope, &result).await;
                self.settle_complete(delivery).await;
            }
            Verdict::Finished(Err(err)) if err.is_retryable() => {
                tracing::warn!(
                    queue = %self.queue,
                    message_id = %message_id,
                    error = %err,
                    "handler failed; abandoning for redelivery"
                );
                self.settle_abandon(delivery).await;
            }
            Verdict::Finished(Err(err)) => {
                tracing::warn!(
                    queue = %self.queue,
                    message_id = %message_id,
                    error = %err,
                    "handler failed permanently; dead-lettering"
                );
                self.settle_dead_letter(delivery, err.to_string()).await;
            }
            Verdict::DeadlineExpired => {
                tracing::warn!(
                    queue = %self.queue,
                    message_id = %message_id,
                    "lease deadline hit mid-handler; abandoning"
                );
                self.settle_abandon(delivery).await;
            }
            Verdict::Panicked => {
                tracing::error!(
                    queue = %self.queue,
                    message_id = %message_id,
                    "handler panicked; abandoning"
                );
                self.settle_abandon(delivery).await;
            }
        }
    }

    /// Publish the success result to the reply queue, when one is named.
    async fn publish_reply(&self, envelope: &MessageEnvelope, result: &serde_json::Value) {
        let (Some(reply_to), Some(request_id)) = (envelope.reply_to(), envelope.request_id())
        else {
            return;
        };

        let reply = ReplyEnvelope::new(request_id, result.clone());
        match reply.into_message() {
            Ok(message) => {
                if let Err(err) = self.broker.send(&reply_to, message).await {
                    tracing::warn!(
                        reply_to = %reply_to,
                        request_id = %request_id,
                        error = %err,
                        "failed to publish reply"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "failed to encode reply");
            }
        }
    }

    async fn settle_complete(&self, delivery: Box<dyn Delivery>) {
        let message_id = delivery.message_id();
        if let Err(err) = delivery.complete().await {
            tracing::warn!(queue = %self.queue, message_id = %message_id, error = %err, "complete failed");
        }
    }

    async fn settle_abandon(&self, delivery: Box<dyn Delivery>) {
        let message_id = delivery.message_id();
        if let Err(err) = delivery.abandon().await {
            tracing::warn!(queue = %self.queue, message_id = %message_id, error = %err, "abandon failed");
        }
    }

    async fn settle_dead_letter(&self, delivery: Box<dyn Delivery>, reason: String) {
        let message_id = delivery.message_id();
        if let Err(err) = delivery.dead_letter(reason).await {
            tracing::warn!(queue = %self.queue, message_id = %message_id, error = %err, "dead-letter failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Action, Handler};
    use crate::domain::{ActionKind, HandlerError, META_REPLY_TO, META_REQUEST_ID, RequestId};
    use crate::impls::{BrokerConfig, InMemoryBroker};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use ulid::Ulid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        text: String,
    }

    impl Action for Probe {
        const KIND: ActionKind = ActionKind::CreateTask;
    }

    enum Script {
        Succeed,
        FailRetryable,
        FailPermanent,
        Panic,
        Hang,
        RenewingSlow { slices: u32, slice: Duration },
    }

    struct ScriptedHandler {
        script: Script,
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Handler<Probe> for ScriptedHandler {
        async fn handle(
            &self,
            action: Probe,
            ctx: &HandlerContext,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Succeed => Ok(serde_json::json!({"echo": action.text})),
                Script::FailRetryable => Err(HandlerError::retryable("flaky")),
                Script::FailPermanent => Err(HandlerError::non_retryable("broken")),
                Script::Panic => panic!("scripted panic"),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(serde_json::json!(null))
                }
                Script::RenewingSlow { slices, slice } => {
                    for _ in 0..*slices {
                        tokio::time::sleep(*slice).await;
                        ctx.renew_lock()
                            .await
                            .map_err(|e| HandlerError::retryable(e.to_string()))?;
                    }
                    Ok(serde_json::json!({"echo": action.text}))
                }
            }
        }
    }

    fn work_queue() -> QueueName {
        QueueName::new("work")
    }

    fn probe_envelope(text: &str) -> MessageEnvelope {
        MessageEnvelope::new(ActionKind::CreateTask, serde_json::json!({"text": text}))
    }

    fn scripted_registry(script: Script, calls: &Arc<AtomicU32>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<Probe, _>(ScriptedHandler {
                script,
                calls: Arc::clone(calls),
            })
            .unwrap();
        Arc::new(registry)
    }

    fn quick_config() -> ListenerConfig {
        ListenerConfig::default()
            .with_concurrency(2)
            .with_receive_wait(Duration::from_millis(50))
            .with_retry(RetryPolicy::none())
    }

    /// Poll until the queue has no outstanding messages.
    async fn drained(broker: &InMemoryBroker, queue: &QueueName) -> bool {
        for _ in 0..300 {
            if broker.counts(queue).await.outstanding() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Poll until the queue has `n` dead letters.
    async fn dead_lettered(broker: &InMemoryBroker, queue: &QueueName, n: usize) -> bool {
        for _ in 0..300 {
            if broker.counts(queue).await.dead_lettered == n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn success_completes_the_message() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Succeed, &calls),
            quick_config(),
        );

        broker.send(&work_queue(), probe_envelope("hello")).await.unwrap();

        assert!(drained(&broker, &work_queue()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.counts(&work_queue()).await.dead_lettered, 0);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn retryable_failure_retries_in_process_then_round_trips_the_broker() {
        let broker = Arc::new(InMemoryBroker::new(
            BrokerConfig::default()
                .with_max_delivery_count(2)
                .with_redelivery_delay(Duration::from_millis(10)),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::FailRetryable, &calls),
            quick_config().with_retry(RetryPolicy::fixed(2, Duration::from_millis(5))),
        );

        broker.send(&work_queue(), probe_envelope("x")).await.unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        // 配送ごとに 1 + max_retries 回、それが max_delivery_count 配送分
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_redelivery() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::FailPermanent, &calls),
            quick_config().with_retry(RetryPolicy::fixed(5, Duration::from_millis(5))),
        );

        broker.send(&work_queue(), probe_envelope("x")).await.unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let dead = broker.dead_letters(&work_queue()).await;
        assert!(dead[0].reason.contains("non-retryable: broken"));

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn malformed_payload_dead_letters_and_the_listener_survives() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Succeed, &calls),
            quick_config(),
        );

        // text が無いので Probe として decode できない
        broker
            .send(
                &work_queue(),
                MessageEnvelope::new(ActionKind::CreateTask, serde_json::json!({"wrong": 1})),
            )
            .await
            .unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let dead = broker.dead_letters(&work_queue()).await;
        assert!(dead[0].reason.contains("malformed"));

        // 後続のまともな配送は普通に処理される
        broker.send(&work_queue(), probe_envelope("ok")).await.unwrap();
        assert!(drained(&broker, &work_queue()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn unknown_action_dead_letters_without_crashing() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Succeed, &calls),
            quick_config(),
        );

        broker
            .send(
                &work_queue(),
                MessageEnvelope::new(ActionKind::LongRunning, serde_json::json!({})),
            )
            .await
            .unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        let dead = broker.dead_letters(&work_queue()).await;
        assert!(dead[0].reason.contains("no handler registered"));

        broker.send(&work_queue(), probe_envelope("still alive")).await.unwrap();
        assert!(drained(&broker, &work_queue()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn panicking_handler_abandons_and_the_slot_survives() {
        let broker = Arc::new(InMemoryBroker::new(
            BrokerConfig::default()
                .with_max_delivery_count(2)
                .with_redelivery_delay(Duration::from_millis(10)),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Panic, &calls),
            quick_config().with_concurrency(1),
        );

        broker.send(&work_queue(), probe_envelope("boom")).await.unwrap();

        // panic -> abandon -> 再配送 -> panic -> 配送回数切れで dead-letter
        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_the_handler_and_abandons() {
        let broker = Arc::new(InMemoryBroker::new(
            BrokerConfig::default()
                .with_lock_duration(Duration::from_millis(80))
                .with_max_delivery_count(2)
                .with_redelivery_delay(Duration::from_millis(10)),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Hang, &calls),
            quick_config().with_concurrency(1),
        );

        broker.send(&work_queue(), probe_envelope("slow")).await.unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn renewal_keeps_a_slow_handler_alive() {
        let broker = Arc::new(InMemoryBroker::new(
            BrokerConfig::default().with_lock_duration(Duration::from_millis(100)),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(
                Script::RenewingSlow {
                    slices: 3,
                    slice: Duration::from_millis(60),
                },
                &calls,
            ),
            quick_config(),
        );

        // 合計 180ms > lock 100ms。renew が効かなければ完走できない。
        broker.send(&work_queue(), probe_envelope("patient")).await.unwrap();

        assert!(drained(&broker, &work_queue()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.counts(&work_queue()).await.dead_lettered, 0);

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn shutdown_returns_prefetched_deliveries() {
        let broker = Arc::new(InMemoryBroker::new(
            BrokerConfig::default().with_lock_duration(Duration::from_millis(300)),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Hang, &calls),
            quick_config().with_concurrency(1).with_prefetch(4),
        );

        for n in 0..3 {
            broker
                .send(&work_queue(), probe_envelope(&format!("m{n}")))
                .await
                .unwrap();
        }

        // slot が一件目で止まり、残りが先読みバッファに積まれるのを待つ
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 && broker.counts(&work_queue()).await.inflight == 3
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        listener.shutdown_and_join().await;

        // 一件も消えていない：実行中だった一件は期限切れで、先読み分は
        // shutdown の drain で broker に返っている
        let counts = broker.counts(&work_queue()).await;
        assert_eq!(counts.inflight, 0);
        assert_eq!(counts.outstanding(), 3);
        assert_eq!(counts.dead_lettered, 0);
    }

    #[tokio::test]
    async fn success_publishes_a_reply_when_asked() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::Succeed, &calls),
            quick_config(),
        );

        let request_id = RequestId::from_ulid(Ulid::new());
        let envelope = probe_envelope("hi")
            .with_metadata(META_REQUEST_ID, request_id.to_string())
            .with_metadata(META_REPLY_TO, "replies");
        broker.send(&work_queue(), envelope).await.unwrap();

        let reply_delivery = broker
            .receive(&QueueName::new("replies"), Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply_delivery.envelope().action(), ActionKind::Reply);

        let reply = ReplyEnvelope::from_message(reply_delivery.envelope()).unwrap();
        assert_eq!(reply.request_id, request_id);
        assert_eq!(reply.result, serde_json::json!({"echo": "hi"}));
        reply_delivery.complete().await.unwrap();

        listener.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn failure_publishes_no_reply() {
        let broker = Arc::new(InMemoryBroker::default());
        let calls = Arc::new(AtomicU32::new(0));
        let listener = QueueListener::start(
            work_queue(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            scripted_registry(Script::FailPermanent, &calls),
            quick_config(),
        );

        let request_id = RequestId::from_ulid(Ulid::new());
        let envelope = probe_envelope("no reply expected")
            .with_metadata(META_REQUEST_ID, request_id.to_string())
            .with_metadata(META_REPLY_TO, "replies");
        broker.send(&work_queue(), envelope).await.unwrap();

        assert!(dead_lettered(&broker, &work_queue(), 1).await);

        let got = broker
            .receive(&QueueName::new("replies"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());

        listener.shutdown_and_join().await;
    }
}
