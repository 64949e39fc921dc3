use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::time::{Duration, sleep};

use courier_core::app::{PipelineBuilder, Submission};
use courier_core::dispatch::Action;
use courier_core::domain::{
    ActionKind, IdempotencyKey, MessageEnvelope, NewTask, QueueName, TaskPatch, TaskStatus,
};
use courier_core::handlers::{CreateTask, CreateTaskHandler, LongRunning, LongRunningHandler};
use courier_core::impls::{BrokerConfig, InMemoryBroker, InMemoryTaskStore};
use courier_core::listener::ListenerConfig;
use courier_core::ports::{Broker, TaskStore, UpdateOutcome};
use courier_core::retry::{HttpRetryPolicy, Outbound, OutboundError, RetryingCaller};

/// デモ用の下流 API。最初の数回は 503 を返し、RetryingCaller が
/// バックオフで吸収する様子を見せる。
struct FlakyApi {
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyApi {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Outbound for FlakyApi {
    async fn call(&self, body: &serde_json::Value) -> Result<serde_json::Value, OutboundError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            println!("  downstream: call #{n} -> 503 (left={left})");
            return Err(OutboundError::Status(503));
        }
        println!("  downstream: call #{n} -> 200 for {body}");
        Ok(serde_json::json!({"processed": body}))
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // (A) 部品を用意：broker / store / 下流 API
    let lock_ms = env_u64("COURIER_LOCK_MS", 500);
    let concurrency = env_u64("COURIER_CONCURRENCY", 4) as usize;
    let broker = Arc::new(InMemoryBroker::new(
        BrokerConfig::default()
            .with_lock_duration(Duration::from_millis(lock_ms))
            .with_redelivery_delay(Duration::from_millis(100)),
    ));
    let store = Arc::new(InMemoryTaskStore::default());
    let api = Arc::new(FlakyApi::new(2));

    // (B) パイプラインを配線。expect_actions が登録漏れを起動時に弾く。
    let pipeline = PipelineBuilder::new()
        .register::<CreateTask, _>(CreateTaskHandler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>
        ))
        .expect("register create_task")
        .register::<LongRunning, _>(LongRunningHandler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            RetryingCaller::new(
                Arc::clone(&api) as Arc<dyn Outbound>,
                HttpRetryPolicy {
                    base_delay: Duration::from_millis(50),
                    ..HttpRetryPolicy::default()
                },
            ),
        ))
        .expect("register long_running")
        .expect_actions(&[ActionKind::CreateTask, ActionKind::LongRunning])
        .listener_config(ListenerConfig::default().with_concurrency(concurrency))
        .build(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn TaskStore>,
        )
        .expect("pipeline wiring");
    tracing::info!(concurrency, lock_ms, "pipeline ready");

    // (C) 受理して返信を待つ
    let key = IdempotencyKey::new("order-2026-001");
    let submission = pipeline
        .submit_and_wait(
            &key,
            NewTask {
                name: "import-orders".into(),
                payload: serde_json::json!({"rows": 42}),
            },
            Duration::from_secs(2),
        )
        .await
        .expect("submit");
    let task_id = match submission {
        Submission::Replied { ticket, reply } => {
            println!("replied: task={} reply={reply}", ticket.task_id);
            ticket.task_id
        }
        other => panic!("unexpected submission outcome: {other:?}"),
    };

    // (D) 同じキーをもう一度。仕事は増えない。
    let again = pipeline
        .submit_and_wait(
            &key,
            NewTask {
                name: "import-orders".into(),
                payload: serde_json::json!({"rows": 42}),
            },
            Duration::from_secs(2),
        )
        .await
        .expect("resubmit");
    match again {
        Submission::AlreadyProcessed { ticket } => {
            println!("duplicate key: already processed as task={}", ticket.task_id);
            assert_eq!(ticket.task_id, task_id);
        }
        other => panic!("unexpected submission outcome: {other:?}"),
    }

    // (E) 時間のかかる仕事。lease(500ms) を超えるので renew_lock で延長しつつ、
    //     下流の 503 は RetryingCaller が吸収する。
    let admission = store
        .create_if_absent(
            &IdempotencyKey::new("crunch-2026-001"),
            NewTask {
                name: "crunch-numbers".into(),
                payload: serde_json::json!({}),
            },
        )
        .await
        .expect("admit long-running task");
    let crunch_id = admission.task_ref().task_id;

    let action = LongRunning {
        task_id: crunch_id,
        slices: 3,
        slice_ms: 250,
        renew_lock: true,
    };
    broker
        .send(
            &QueueName::new("work"),
            MessageEnvelope::new(
                LongRunning::KIND,
                serde_json::to_value(&action).expect("encode long_running"),
            ),
        )
        .await
        .expect("enqueue long_running");

    loop {
        let (task, _) = store
            .get(&crunch_id)
            .await
            .expect("store get")
            .expect("task exists");
        if task.status == TaskStatus::Completed {
            println!("long-running task {} completed", crunch_id);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    // (F) check-and-set。最後に読んだタグを添えた update だけが通り、
    //     古いタグは現在のタグ付きで弾かれる。
    let (_, tag1) = store
        .get(&task_id)
        .await
        .expect("store get")
        .expect("task exists");
    let tag2 = match store
        .update(&task_id, &tag1, TaskPatch::rename("import-orders (audited)"))
        .await
        .expect("first update")
    {
        UpdateOutcome::Updated(tag) => {
            println!("update with fresh tag: applied, next tag={tag}");
            tag
        }
        other => panic!("unexpected update outcome: {other:?}"),
    };
    match store
        .update(&task_id, &tag1, TaskPatch::rename("import-orders (lost)"))
        .await
        .expect("second update")
    {
        UpdateOutcome::PreconditionFailed(current) => {
            println!("update with stale tag: rejected, current tag={current}");
            assert_eq!(current, tag2);
        }
        other => panic!("unexpected update outcome: {other:?}"),
    }

    // (G) 壊れた payload は dead-letter に落ちる
    let work = QueueName::new("work");
    broker
        .send(
            &work,
            MessageEnvelope::new(ActionKind::CreateTask, serde_json::json!("not an object")),
        )
        .await
        .expect("enqueue garbage");
    loop {
        if broker.counts(&work).await.dead_lettered == 1 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    for dead in broker.dead_letters(&work).await {
        println!(
            "dead letter: message={} count={} reason={}",
            dead.message_id, dead.delivery_count, dead.reason
        );
    }

    // (H) 後片付け。listener -> router -> broker の順で止める。
    println!("queue counts before shutdown: {:?}", pipeline.counts(&work).await);
    pipeline.shutdown().await;
    println!("done");
}
