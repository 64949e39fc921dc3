//! 返信の突き合わせ。
//!
//! ReplyRouter は reply キューを一本だけ受信し、届いた ReplyEnvelope を
//! RequestId で待ち合わせ中の oneshot waiter に配ります。
//!
//! 順序の約束はひとつだけ：**subscribe してから publish する**こと。
//! 先に登録してあれば、どんなに速い返信でも oneshot に積まれて
//! 待ち手が後から受け取れます。待ち手のいない返信（タイムアウト後に
//! 届いた等）は debug ログを出して complete し、捨てます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

use crate::domain::{QueueName, ReplyEnvelope, RequestId};
use crate::ports::{Broker, BrokerError, Delivery};

type WaiterMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<serde_json::Value>>>>;

const RECEIVE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("no reply within the deadline for {0}")]
    Timeout(RequestId),
    #[error("reply router is gone")]
    RouterClosed,
}

/// One caller's claim on a future reply.
pub struct ReplyWaiter {
    request_id: RequestId,
    rx: oneshot::Receiver<serde_json::Value>,
    waiters: WaiterMap,
}

impl ReplyWaiter {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the reply, up to `timeout`. Timing out deregisters the
    /// claim; a reply that lands afterwards is dropped by the router.
    pub async fn wait(self, timeout: Duration) -> Result<serde_json::Value, ReplyError> {
        let Self {
            request_id,
            rx,
            waiters,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ReplyError::RouterClosed),
            Err(_) => {
                waiters.lock().await.remove(&request_id);
                Err(ReplyError::Timeout(request_id))
            }
        }
    }

    /// Give up without waiting.
    pub async fn cancel(self) {
        self.waiters.lock().await.remove(&self.request_id);
    }
}

/// Pumps one reply queue and hands results to subscribed waiters.
pub struct ReplyRouter {
    waiters: WaiterMap,
    shutdown_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

impl ReplyRouter {
    pub fn start(broker: Arc<dyn Broker>, reply_queue: QueueName) -> Self {
        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let pump = {
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                pump_loop(broker, reply_queue, waiters, &mut shutdown_rx).await;
            })
        };

        Self {
            waiters,
            shutdown_tx,
            pump,
        }
    }

    /// Register interest in `request_id`. Call this **before** publishing
    /// the request, so a fast reply cannot slip past the registration.
    pub async fn subscribe(&self, request_id: RequestId) -> ReplyWaiter {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id, tx);
        ReplyWaiter {
            request_id,
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.pump.await;
    }
}

async fn pump_loop(
    broker: Arc<dyn Broker>,
    reply_queue: QueueName,
    waiters: WaiterMap,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            received = broker.receive(&reply_queue, RECEIVE_WAIT) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(BrokerError::Closed) => break,
            Err(err) => {
                tracing::warn!(queue = %reply_queue, error = %err, "reply receive failed");
                continue;
            }
        };

        route_reply(&waiters, delivery).await;
    }
}

async fn route_reply(waiters: &WaiterMap, delivery: Box<dyn Delivery>) {
    let message_id = delivery.message_id();

    let reply = match ReplyEnvelope::from_message(delivery.envelope()) {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(message_id = %message_id, error = %err, "undecodable reply; dead-lettering");
            if let Err(err) = delivery.dead_letter(format!("undecodable reply: {err}")).await {
                tracing::warn!(message_id = %message_id, error = %err, "dead-letter failed");
            }
            return;
        }
    };

    let waiter = waiters.lock().await.remove(&reply.request_id);
    match waiter {
        Some(tx) => {
            // 受け手が直前に諦めていても配送は決着させる
            let _ = tx.send(reply.result);
        }
        None => {
            tracing::debug!(request_id = %reply.request_id, "reply arrived with no waiter; dropping");
        }
    }

    if let Err(err) = delivery.complete().await {
        tracing::warn!(message_id = %message_id, error = %err, "reply complete failed");
    }
}
