use crate::config::Config;
use crate::error::{InvokeError, classify};
use crate::gemini::GeminiClient;
use crate::gemini::client::ApiError;
use crate::gemini::types::{FileInfo, GenerateContentRequest, Part};
use crate::keypool::KeyPool;
use crate::logging::{self, LogLevel};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 任务类型，与模型一一对应。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Transcription,
    Note,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Note => "note",
        }
    }
}

/// 推理后端的最小接口：生成文本 + 上传文件并等待激活。
/// Invoker 只通过它发请求，测试用假后端替换。
#[allow(async_fn_in_trait)]
pub trait GenerateBackend {
    async fn generate(
        &self,
        api_key: &str,
        model: &str,
        req: &GenerateContentRequest,
    ) -> Result<String, ApiError>;

    async fn upload_and_wait(&self, api_key: &str, path: &Path) -> Result<FileInfo, ApiError>;
}

impl GenerateBackend for GeminiClient {
    async fn generate(
        &self,
        api_key: &str,
        model: &str,
        req: &GenerateContentRequest,
    ) -> Result<String, ApiError> {
        self.generate_content(api_key, model, req).await
    }

    async fn upload_and_wait(&self, api_key: &str, path: &Path) -> Result<FileInfo, ApiError> {
        tracing::info!("上传文件: {}", path.display());
        let file = self.upload_file(api_key, path).await?;
        tracing::info!("文件已上传: {}，等待激活...", file.name);
        self.wait_for_file_active(api_key, file).await
    }
}

/// 把一次逻辑上的 generate 请求变成一串带重试、退避与 key 轮转的网络尝试。
///
/// 失败策略按类别区分：
/// - 超时：同 key 重试 max_retries 次，用尽后标记耗尽并换 key
/// - 429：立即标记该 key 耗尽并换 key
/// - 503：服务整体过载，长退避后同 key 继续，不计重试次数
/// - 其他：立即向调用方抛出
#[derive(Debug)]
pub struct Invoker<B> {
    backend: B,
    pool: Arc<KeyPool>,
    model_transcription: String,
    model_note: String,
    max_retries: usize,
    retry_delay: Duration,
    overload_backoff: Duration,
    log_level: LogLevel,
    cancel: CancellationToken,
}

impl<B: GenerateBackend> Invoker<B> {
    pub fn new(cfg: &Config, backend: B, pool: Arc<KeyPool>) -> Self {
        Self {
            backend,
            pool,
            model_transcription: cfg.model_transcription.clone(),
            model_note: cfg.model_note.clone(),
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            overload_backoff: Duration::from_millis(cfg.overload_backoff_ms),
            log_level: cfg.log_level(),
            cancel: CancellationToken::new(),
        }
    }

    /// 挂接取消令牌：长退避途中也能中断调用。
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model_for(&self, task: TaskKind) -> &str {
        match task {
            TaskKind::Transcription => &self.model_transcription,
            TaskKind::Note => &self.model_note,
        }
    }

    /// 执行一次逻辑 generate 请求。可附带系统指令与一个待上传的文件。
    pub async fn generate(
        &self,
        task: TaskKind,
        prompt: &str,
        system_instruction: Option<&str>,
        file_path: Option<&Path>,
    ) -> Result<String, InvokeError> {
        let model = self.model_for(task).to_string();

        // key 轮转外层循环：每轮换一个可用 key
        loop {
            if self.cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            let Some(api_key) = self.pool.get_available_key(&model).await? else {
                return Err(InvokeError::PoolExhausted(model));
            };
            let masked = logging::mask_key(&api_key);

            // 选中即计费：超时的请求同样消耗了服务端配额
            self.pool.record_usage(&api_key, &model).await?;

            match self
                .run_attempts(task, &model, &api_key, &masked, prompt, system_instruction, file_path)
                .await?
            {
                Some(text) => return Ok(text),
                // 该 key 已标记耗尽，轮转下一个
                None => continue,
            }
        }
    }

    /// 同一个 key 上的尝试循环。Ok(Some) 成功，Ok(None) 要求换 key，Err 致命。
    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        task: TaskKind,
        model: &str,
        api_key: &str,
        masked: &str,
        prompt: &str,
        system_instruction: Option<&str>,
        file_path: Option<&Path>,
    ) -> Result<Option<String>, InvokeError> {
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            logging::log_request(task.as_str(), model, masked, attempt + 1);
            logging::log_prompt(self.log_level, prompt, system_instruction);

            let start = std::time::Instant::now();
            let result = self
                .attempt_once(api_key, model, prompt, system_instruction, file_path)
                .await;

            match result {
                Ok(text) => {
                    logging::log_response(self.log_level, start.elapsed(), &text);
                    return Ok(Some(text));
                }
                Err(api_err) => match classify(api_err) {
                    InvokeError::Transient(msg) => {
                        tracing::warn!(
                            "Gemini 请求超时 - 耗时: {:.2}s - {msg}",
                            start.elapsed().as_secs_f64()
                        );
                        if attempt < self.max_retries {
                            tracing::info!(
                                "{}s 后重试（{}/{}）...",
                                self.retry_delay.as_secs(),
                                attempt + 1,
                                self.max_retries
                            );
                            self.sleep(self.retry_delay).await?;
                            attempt += 1;
                            continue;
                        }
                        tracing::error!("Key {masked} 重试次数用尽，标记为模型 {model} 耗尽");
                        self.pool.mark_exhausted(api_key, model).await?;
                        return Ok(None);
                    }
                    InvokeError::QuotaExceeded(msg) => {
                        tracing::error!("Key {masked} 配额被拒（429），标记耗尽：{msg}");
                        self.pool.mark_exhausted(api_key, model).await?;
                        return Ok(None);
                    }
                    InvokeError::Overloaded(msg) => {
                        // 服务整体状况，与 key 无关：不计重试次数，不标记耗尽
                        tracing::warn!(
                            "模型过载（503），等待 {}s 后重试：{msg}",
                            self.overload_backoff.as_secs()
                        );
                        self.sleep(self.overload_backoff).await?;
                        continue;
                    }
                    fatal => {
                        tracing::error!(
                            "Gemini 请求失败 - 耗时: {:.2}s - {fatal}",
                            start.elapsed().as_secs_f64()
                        );
                        return Err(fatal);
                    }
                },
            }
        }
    }

    async fn attempt_once(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
        system_instruction: Option<&str>,
        file_path: Option<&Path>,
    ) -> Result<String, ApiError> {
        let mut parts = Vec::new();
        if let Some(path) = file_path {
            let file = self.backend.upload_and_wait(api_key, path).await?;
            parts.push(Part::file(file.mime_type, file.uri));
        }
        parts.push(Part::text(prompt));

        let req = GenerateContentRequest::new(parts, system_instruction);
        self.backend.generate(api_key, model, &req).await
    }

    async fn sleep(&self, duration: Duration) -> Result<(), InvokeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(InvokeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
