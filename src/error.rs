//! クレート共通のエラー型。

use burn::record::RecorderError;
use thiserror::Error;

/// `viv-pinn` の操作が返す `Result`。
pub type PinnResult<T> = Result<T, PinnError>;

/// 初期化・学習・永続化で発生するエラー。
#[derive(Debug, Error)]
pub enum PinnError {
    /// テンソルの次元数や要素数が前提を満たしていない
    #[error("Shape error: {0}")]
    Shape(String),

    /// 未知のモード名・活性化関数名、または不正な設定値
    #[error("Config error: {0}")]
    Config(String),

    /// テンソルデータの取り出しに失敗した
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// モデル・オプティマイザのレコード保存/読み込みに失敗した
    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// 分散学習の準備に失敗した
    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PinnError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tensor(msg: impl Into<String>) -> Self {
        Self::Tensor(msg.into())
    }
}
