//! App - 配線の層
//!
//! ports と impls を組み合わせ、受理から返信までをひとつの Pipeline に
//! まとめます。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: ハンドラ登録と起動時検証（Fail-fast）
//! - **Pipeline**: submit / submit_and_wait の表面と shutdown

pub mod builder;
pub mod pipeline;

pub use self::builder::{BuildError, PipelineBuilder};
pub use self::pipeline::{Pipeline, Submission};
