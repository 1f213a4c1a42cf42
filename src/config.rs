use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_OVERLOAD_BACKOFF_MS: u64 = 600_000;
const DEFAULT_QUOTA_LIMIT: u32 = 20;

const DEFAULT_MODEL_TRANSCRIPTION: &str = "gemini-2.5-flash";
const DEFAULT_MODEL_NOTE: &str = "gemini-3-flash-preview";

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TIME_API_URL: &str = "http://worldtimeapi.org/api/timezone/America/Los_Angeles";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub overload_backoff_ms: u64,

    pub quota_limit: u32,
    pub model_transcription: String,
    pub model_note: String,

    pub gemini_base_url: String,
    /// 留空则跳过外部时间源，直接使用本地 UTC-8 回退。
    pub time_api_url: String,
    pub proxy: String,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    #[serde(alias = "API_TIMEOUT")]
    api_timeout: Option<u64>,
    #[serde(alias = "API_MAX_RETRIES")]
    api_max_retries: Option<usize>,
    #[serde(alias = "API_RETRY_DELAY")]
    api_retry_delay: Option<u64>,
    #[serde(alias = "OVERLOAD_BACKOFF")]
    overload_backoff: Option<u64>,

    #[serde(alias = "QUOTA_LIMIT")]
    quota_limit: Option<u32>,
    #[serde(alias = "MODEL_TRANSCRIPTION")]
    model_transcription: Option<String>,
    #[serde(alias = "MODEL_NOTE")]
    model_note: Option<String>,

    #[serde(alias = "GEMINI_BASE_URL")]
    gemini_base_url: Option<String>,
    #[serde(alias = "TIME_API_URL")]
    time_api_url: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            data_dir: raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            timeout_ms: raw.api_timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: raw.api_max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: raw.api_retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            overload_backoff_ms: raw.overload_backoff.unwrap_or(DEFAULT_OVERLOAD_BACKOFF_MS),
            quota_limit: raw.quota_limit.unwrap_or(DEFAULT_QUOTA_LIMIT),
            model_transcription: raw
                .model_transcription
                .unwrap_or_else(|| DEFAULT_MODEL_TRANSCRIPTION.to_string()),
            model_note: raw
                .model_note
                .unwrap_or_else(|| DEFAULT_MODEL_NOTE.to_string()),
            gemini_base_url: raw
                .gemini_base_url
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            time_api_url: raw
                .time_api_url
                .unwrap_or_else(|| DEFAULT_TIME_API_URL.to_string()),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    /// 已配置的模型全集（重置配额时使用）。
    pub fn known_models(&self) -> Vec<String> {
        let mut out = vec![self.model_transcription.clone()];
        if self.model_note != self.model_transcription {
            out.push(self.model_note.clone());
        }
        out
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

#[cfg(test)]
impl Config {
    /// 测试用：不读环境变量，外部时间源留空走本地回退。
    pub fn for_tests(data_dir: &str) -> Self {
        Self {
            data_dir: data_dir.to_string(),
            timeout_ms: 1_000,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            overload_backoff_ms: DEFAULT_OVERLOAD_BACKOFF_MS,
            quota_limit: DEFAULT_QUOTA_LIMIT,
            model_transcription: DEFAULT_MODEL_TRANSCRIPTION.to_string(),
            model_note: DEFAULT_MODEL_NOTE.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            time_api_url: String::new(),
            proxy: String::new(),
            debug: "off".to_string(),
        }
    }
}
