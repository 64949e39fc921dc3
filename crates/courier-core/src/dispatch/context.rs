//! HandlerContext - ハンドラ実行中に見える配送コンテキスト
//!
//! ハンドラは payload 以外に「この配送が何回目か」「返信はどこへか」
//! 「lease をどう延長するか」を知る必要があります。broker 由来の情報を
//! ここに畳んで、ハンドラからは broker そのものを見えなくします。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::domain::RequestId;
use crate::ports::{BrokerError, LockRenewer};

/// Handle for extending the lease from inside a handler.
///
/// renew は broker に届くと同時に、リスナーの期限監視（watch channel）にも
/// 新しい期限を伝えます。両方に届かないと、broker 上は生きている lease を
/// リスナーが打ち切ってしまいます。
#[derive(Clone)]
pub struct LeaseHandle {
    renewer: LockRenewer,
    deadline_tx: Arc<watch::Sender<Instant>>,
}

impl LeaseHandle {
    pub fn new(renewer: LockRenewer, deadline_tx: Arc<watch::Sender<Instant>>) -> Self {
        Self {
            renewer,
            deadline_tx,
        }
    }

    /// Extend the lease and report the new deadline to the listener.
    pub async fn renew(&self) -> Result<Instant, BrokerError> {
        let new_deadline = self.renewer.renew().await?;
        // watch 側が全員いなくなっていても renew 自体は成立している
        let _ = self.deadline_tx.send(new_deadline);
        Ok(new_deadline)
    }
}

/// Per-delivery context handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    request_id: Option<RequestId>,
    metadata: BTreeMap<String, String>,
    delivery_count: u32,
    lease: LeaseHandle,
}

impl HandlerContext {
    pub fn new(
        request_id: Option<RequestId>,
        metadata: BTreeMap<String, String>,
        delivery_count: u32,
        lease: LeaseHandle,
    ) -> Self {
        Self {
            request_id,
            metadata,
            delivery_count,
            lease,
        }
    }

    /// Correlation id of the waiting caller, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// How many times this message has been delivered, this run included.
    /// 2 以上なら再配送。副作用の重複に備えること。
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Extend the lease for slow work.
    pub async fn renew_lock(&self) -> Result<Instant, BrokerError> {
        self.lease.renew().await
    }
}

#[cfg(test)]
impl HandlerContext {
    /// Context with a renewer that always grants one more minute.
    pub(crate) fn for_tests() -> Self {
        use async_trait::async_trait;
        use std::time::Duration;

        struct NoopRenewer;

        #[async_trait]
        impl crate::ports::RenewLock for NoopRenewer {
            async fn renew(&self) -> Result<Instant, BrokerError> {
                Ok(Instant::now() + Duration::from_secs(60))
            }
        }

        let (deadline_tx, _) = watch::channel(Instant::now() + Duration::from_secs(60));
        Self::new(
            None,
            BTreeMap::new(),
            1,
            LeaseHandle::new(Arc::new(NoopRenewer), Arc::new(deadline_tx)),
        )
    }
}
