/// 日志等级：
/// - off：只输出基础运行日志
/// - low：额外输出每次请求的提示词/响应摘要（截断）
/// - high：输出完整提示词与响应（不截断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    High = 2,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "request" => Self::Low,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn request_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

/// 日志用截断：提示词/响应最多保留前 100 个字符。
pub fn truncated(text: &str) -> String {
    const LIMIT: usize = 100;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(LIMIT).collect();
    format!("{head}...")
}

/// API Key 脱敏：只保留前后各 4 位，过短的 key 完全遮蔽。
pub fn mask_key(key: &str) -> String {
    if key.len() > 8 && key.is_ascii() {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "****".to_string()
    }
}

pub fn log_request(task: &str, model: &str, masked_key: &str, attempt: usize) {
    tracing::info!("Gemini 请求 - 任务: {task}, 模型: {model}, Key: {masked_key}（第 {attempt} 次尝试）");
}

pub fn log_prompt(level: LogLevel, prompt: &str, system_instruction: Option<&str>) {
    if !level.request_enabled() {
        return;
    }
    if let Some(si) = system_instruction {
        if level.raw_enabled() {
            tracing::info!("系统指令: {si}");
        } else {
            tracing::info!("系统指令（截断）: {}", truncated(si));
        }
    }
    if level.raw_enabled() {
        tracing::info!("提示词: {prompt}");
    } else {
        tracing::info!("提示词（截断）: {}", truncated(prompt));
    }
}

pub fn log_response(level: LogLevel, duration: std::time::Duration, text: &str) {
    tracing::info!("Gemini 响应 - 成功 - 耗时: {:.2}s", duration.as_secs_f64());
    if !level.request_enabled() {
        return;
    }
    if level.raw_enabled() {
        tracing::info!("响应: {text}");
    } else {
        tracing::info!("响应（截断）: {}", truncated(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse(""), LogLevel::Off);
        assert_eq!(LogLevel::parse(" LOW "), LogLevel::Low);
        assert_eq!(LogLevel::parse("raw"), LogLevel::High);
        assert!(LogLevel::High.request_enabled());
        assert!(!LogLevel::Off.request_enabled());
    }

    #[test]
    fn mask_key_never_leaks_short_keys() {
        assert_eq!(mask_key("12345678"), "****");
        assert_eq!(mask_key(""), "****");
        assert_eq!(mask_key("AIzaSyEXAMPLE1234"), "AIza...1234");
    }

    #[test]
    fn truncated_keeps_short_text() {
        assert_eq!(truncated("hello"), "hello");
        let long = "x".repeat(150);
        let t = truncated(&long);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), 103);
    }
}
