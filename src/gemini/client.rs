use crate::config::Config;
use crate::gemini::types::{
    FileInfo, GenerateContentRequest, GenerateContentResponse, UploadResponse,
};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Gemini API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("文件 {name} 处理失败，状态 {state}")]
    FileState { name: String, state: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 结构化的超时判定：reqwest 超时或 HTTP 408。
    /// 不看报文文本，"timeout" 子串嗅探由上层分类兜底。
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Http { status: 408, .. } => true,
            _ => false,
        }
    }
}

/// Gemini REST 客户端：generateContent + Files API（上传、轮询状态）。
/// key 逐请求传入，由上层的 key 池负责轮转。
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn headers(&self, api_key: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key).unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    pub async fn generate_content(
        &self,
        api_key: &str,
        model: &str,
        req: &GenerateContentRequest,
    ) -> Result<String, ApiError> {
        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);
        let body = sonic_rs::to_vec(req)?;

        let resp = self
            .http
            .post(url)
            .headers(self.headers(api_key))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed: GenerateContentResponse = sonic_rs::from_slice(&bytes)?;
        Ok(parsed.text())
    }

    /// 原始媒体上传。mime 类型按扩展名推断。
    pub async fn upload_file(&self, api_key: &str, path: &Path) -> Result<FileInfo, ApiError> {
        let bytes = tokio::fs::read(path).await?;
        let url = format!("{}/upload/v1beta/files", self.base_url);

        let mut headers = self.headers(api_key);
        headers.insert(
            "X-Goog-Upload-Protocol",
            HeaderValue::from_static("raw"),
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(mime_for_path(path))
                .unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );

        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed: UploadResponse = sonic_rs::from_slice(&bytes)?;
        Ok(parsed.file)
    }

    pub async fn get_file(&self, api_key: &str, name: &str) -> Result<FileInfo, ApiError> {
        // name 形如 "files/abc123"
        let url = format!("{}/v1beta/{name}", self.base_url);
        let resp = self
            .http
            .get(url)
            .headers(self.headers(api_key))
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice(&bytes)?)
    }

    /// 等待上传的文件转为 ACTIVE。终态不是 ACTIVE 即失败。
    pub async fn wait_for_file_active(
        &self,
        api_key: &str,
        mut file: FileInfo,
    ) -> Result<FileInfo, ApiError> {
        while file.is_processing() {
            tokio::time::sleep(FILE_POLL_INTERVAL).await;
            file = self.get_file(api_key, &file.name).await?;
        }

        if !file.is_active() {
            return Err(ApiError::FileState {
                name: file.name,
                state: file.state,
            });
        }
        Ok(file)
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
    }

    let mut out_status = status;
    let mut message = "Unknown error".to_string();

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        use sonic_rs::JsonValueTrait;

        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        match err.status.to_uppercase().as_str() {
            "RESOURCE_EXHAUSTED" => out_status = 429,
            "UNAVAILABLE" => out_status = 503,
            "UNAUTHENTICATED" => out_status = 401,
            "INTERNAL" => out_status = 500,
            _ => {}
        }

        if let Some(code) = err.code
            && let Some(i) = code.as_i64()
            && i > 0
            && i <= u16::MAX as i64
        {
            out_status = i as u16;
        }
    }

    ApiError::Http {
        status: out_status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_details_maps_resource_exhausted_to_429() {
        let body = r#"{
            "error": {
                "message": "Quota exceeded for quota metric",
                "status": "RESOURCE_EXHAUSTED"
            }
        }"#;
        let err = extract_error_details(400, body.as_bytes());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn extract_error_details_prefers_numeric_code() {
        let body = r#"{
            "error": {
                "code": 503,
                "message": "The model is overloaded. Please try again later.",
                "status": "UNAVAILABLE"
            }
        }"#;
        let err = extract_error_details(500, body.as_bytes());
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn extract_error_details_tolerates_garbage_body() {
        let err = extract_error_details(502, b"<html>bad gateway</html>");
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn timeout_detection_only_trusts_structured_signals() {
        let err = ApiError::Http {
            status: 408,
            message: "Request Timeout".to_string(),
        };
        assert!(err.is_timeout());

        // 报文里出现 "timeout" 不算：子串嗅探在分类层兜底
        let err = ApiError::Http {
            status: 500,
            message: "deadline exceeded: request Timeout while reading body".to_string(),
        };
        assert!(!err.is_timeout());

        let err = ApiError::Http {
            status: 429,
            message: "quota".to_string(),
        };
        assert!(!err.is_timeout());
    }

    #[test]
    fn mime_guess_covers_common_audio_types() {
        assert_eq!(mime_for_path(Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(mime_for_path(Path::new("a.m4a")), "audio/mp4");
        assert_eq!(mime_for_path(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
    }
}
