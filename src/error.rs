use crate::gemini::ApiError;
use thiserror::Error;

/// 一次 generate 调用的错误分类。
///
/// Transient / QuotaExceeded / Overloaded 在 Invoker 内部驱动重试与轮转，
/// 正常情况下不会穿透到调用方；调用方看到的是 UploadFailed /
/// PoolExhausted / Cancelled / Other 之一。
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("请求超时: {0}")]
    Transient(String),

    #[error("配额被拒（429）: {0}")]
    QuotaExceeded(String),

    #[error("模型过载（503）: {0}")]
    Overloaded(String),

    #[error("上传的文件未能激活: {0}")]
    UploadFailed(String),

    #[error("模型 {0} 没有可用的 API Key（配额均已耗尽）")]
    PoolExhausted(String),

    #[error("调用已被取消")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 把底层传输错误归入上面的分类。
///
/// 先看结构化信号（reqwest 超时 / 408 / 429 / 503），
/// "timeout" 子串嗅探只在状态码无法识别时兜底，
/// 避免带 "timeout" 字样的 429/503 报文被误判成可重试超时。
pub fn classify(err: ApiError) -> InvokeError {
    if let ApiError::FileState { .. } = err {
        return InvokeError::UploadFailed(err.to_string());
    }
    if err.is_timeout() {
        return InvokeError::Transient(err.to_string());
    }
    match err.status() {
        Some(429) => InvokeError::QuotaExceeded(err.to_string()),
        Some(503) => InvokeError::Overloaded(err.to_string()),
        _ if err.to_string().to_lowercase().contains("timeout") => {
            InvokeError::Transient(err.to_string())
        }
        _ => InvokeError::Other(anyhow::Error::new(err)),
    }
}
