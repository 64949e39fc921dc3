//! Retry - 失敗の分類とバックオフ
//!
//! 再試行は二層あります：
//! - **RetryPolicy**: ハンドラ内のインライン再試行。一回の配送の中で短く粘る。
//! - **HttpRetryPolicy / RetryingCaller**: 下流 HTTP 呼び出し。timeout / 429 /
//!   5xx を指数バックオフで再試行し、それ以外の 4xx は即座に諦める。
//!
//! どちらの層でも再試行し切れなかった失敗は Classified の判定に従って
//! abandon（再配送待ち）か dead-letter に落ちます。

mod outbound;
mod policy;

pub use outbound::{HttpRetryPolicy, Outbound, OutboundError, RetryingCaller};
pub use policy::RetryPolicy;
