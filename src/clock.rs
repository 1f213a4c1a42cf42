use chrono::{FixedOffset, Utc};
use serde::Deserialize;
use std::time::Duration;

/// 计算太平洋时区的当前日期（YYYY-MM-DD）。
///
/// 优先询问外部时间源（url 为空则跳过），任何失败都回退到本地时间换算，
/// 绝不向调用方抛错。
pub async fn today_pacific(time_api_url: &str) -> String {
    let url = time_api_url.trim();
    if !url.is_empty()
        && let Some(date) = fetch_remote_date(url).await
    {
        return date;
    }
    fallback_today()
}

#[derive(Debug, Deserialize)]
struct TimeApiResponse {
    datetime: String,
}

async fn fetch_remote_date(url: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;
    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let bytes = resp.bytes().await.ok()?;
    let parsed: TimeApiResponse = sonic_rs::from_slice(&bytes).ok()?;
    // "2026-08-29T07:21:33.123456-08:00" → 取前 10 位日期部分
    let date = parsed.datetime.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.to_string())
}

/// 本地回退：固定按 PST（UTC-8）换算，与原有行为一致，不处理夏令时。
fn fallback_today() -> String {
    let tz = FixedOffset::west_opt(8 * 3600).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string()
}
