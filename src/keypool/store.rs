use crate::clock;
use crate::config::Config;
use crate::keypool::types::{KeyRecord, PoolFile};
use anyhow::{Context, anyhow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// API Key 池：按模型跟踪每个 key 的当日用量与耗尽标记，轮转发放可用 key。
///
/// 状态整体落在一个 JSON 文件里，每次变更全量重写。该文件只允许单进程
/// 写入：多进程并发改写会丢失更新。
#[derive(Debug)]
pub struct KeyPool {
    file_path: PathBuf,
    quota_limit: u32,
    models: Vec<String>,
    time_api_url: String,
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    data: PoolFile,
    /// 轮转游标：上一次发出的 key 下标。只存在内存里，重启后从头轮转。
    cursor: Option<usize>,
}

impl KeyPool {
    pub fn new(cfg: &Config) -> Self {
        let file_path = PathBuf::from(&cfg.data_dir).join("api_keys.json");
        Self {
            file_path,
            quota_limit: cfg.quota_limit,
            models: cfg.known_models(),
            time_api_url: cfg.time_api_url.clone(),
            state: RwLock::new(State::default()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut state = self.state.write().await;
                state.data = PoolFile::default();
                state.cursor = None;
                return Ok(());
            }
            Err(e) => return Err(e).context("读取 api_keys.json 失败"),
        };

        let parsed: PoolFile = match sonic_rs::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                let mut state = self.state.write().await;
                state.data = PoolFile::default();
                state.cursor = None;
                return Err(anyhow!(e)).context("解析 api_keys.json 失败");
            }
        };

        let mut state = self.state.write().await;
        state.data = parsed;
        state.cursor = None;
        Ok(())
    }

    /// 添加 key；重复的 secret 不重复入池。返回是否新增。
    pub async fn add_key(&self, key: &str) -> anyhow::Result<bool> {
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("API Key 为空"));
        }

        let snapshot = {
            let mut state = self.state.write().await;
            if state.data.keys.iter().any(|k| k.key == key) {
                return Ok(false);
            }
            state.data.keys.push(KeyRecord::new(key));
            state.data.clone()
        };
        self.save_snapshot(&snapshot).await?;
        Ok(true)
    }

    /// 移除 key。返回是否真的删除了。
    pub async fn remove_key(&self, key: &str) -> anyhow::Result<bool> {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.data.keys.len();
            state.data.keys.retain(|k| k.key != key);
            if state.data.keys.len() == before {
                return Ok(false);
            }
            // 游标可能越界，回到起点重新轮转即可
            if state
                .cursor
                .is_some_and(|c| c >= state.data.keys.len())
            {
                state.cursor = None;
            }
            state.data.clone()
        };
        self.save_snapshot(&snapshot).await?;
        Ok(true)
    }

    /// 为指定 key/模型记一次用量。key 不存在时返回 false。
    pub async fn record_usage(&self, key: &str, model: &str) -> anyhow::Result<bool> {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(rec) = state.data.keys.iter_mut().find(|k| k.key == key) else {
                return Ok(false);
            };
            *rec.usage.entry(model.to_string()).or_insert(0) += 1;
            state.data.clone()
        };
        self.save_snapshot(&snapshot).await?;
        Ok(true)
    }

    /// 将 key 在指定模型上标记为耗尽，直到下一次日界重置。
    pub async fn mark_exhausted(&self, key: &str, model: &str) -> anyhow::Result<bool> {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(rec) = state.data.keys.iter_mut().find(|k| k.key == key) else {
                return Ok(false);
            };
            rec.exhausted.insert(model.to_string(), true);
            state.data.clone()
        };
        self.save_snapshot(&snapshot).await?;
        Ok(true)
    }

    /// 取下一个可用的 key：先做日界重置检查，然后从游标之后开始扫一圈，
    /// 返回第一个未耗尽且未超配额的 key。全部不可用时返回 None（可恢复，
    /// 不是崩溃）。
    pub async fn get_available_key(&self, model: &str) -> anyhow::Result<Option<String>> {
        self.reset_if_needed().await?;

        let mut state = self.state.write().await;
        let len = state.data.keys.len();
        if len == 0 {
            return Ok(None);
        }

        let start = match state.cursor {
            Some(c) if c < len => (c + 1) % len,
            _ => 0,
        };

        for i in 0..len {
            let idx = (start + i) % len;
            let rec = &state.data.keys[idx];
            if !rec.is_exhausted(model) && rec.usage_for(model) < self.quota_limit {
                let key = rec.key.clone();
                state.cursor = Some(idx);
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// 日界重置检查：参考时区的日期翻转后，清零所有 key 的用量与耗尽标记。
    /// 进程跨过重置点离线也没关系，翻转后的第一次调用会补做重置。
    pub async fn reset_if_needed(&self) -> anyhow::Result<bool> {
        let today = clock::today_pacific(&self.time_api_url).await;
        self.reset_for_date(&today).await
    }

    async fn reset_for_date(&self, today: &str) -> anyhow::Result<bool> {
        let (snapshot, did_reset) = {
            let mut state = self.state.write().await;
            if state.data.last_reset_date == today {
                return Ok(false);
            }

            // 首次运行只记录日期，不清零
            let did_reset = !state.data.last_reset_date.is_empty();
            if did_reset {
                for rec in &mut state.data.keys {
                    rec.usage = zeroed_map(&self.models, 0u32);
                    rec.exhausted = zeroed_map(&self.models, false);
                }
            }
            state.data.last_reset_date = today.to_string();
            (state.data.clone(), did_reset)
        };

        self.save_snapshot(&snapshot).await?;
        if did_reset {
            tracing::info!("配额已重置（参考日期 {today}）");
        }
        Ok(did_reset)
    }

    /// 诊断用状态报告：每个 key 一行，key 只显示脱敏形式。
    pub async fn status_report(&self) -> String {
        let state = self.state.read().await;
        if state.data.keys.is_empty() {
            return "key 池为空".to_string();
        }

        let mut lines = Vec::with_capacity(state.data.keys.len());
        for rec in &state.data.keys {
            let mut line = rec.masked();
            for model in &self.models {
                let marker = if rec.is_exhausted(model) {
                    " [exhausted]"
                } else {
                    ""
                };
                line.push_str(&format!(
                    "  {model}: {}/{}{marker}",
                    rec.usage_for(model),
                    self.quota_limit
                ));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    pub async fn count(&self) -> usize {
        let state = self.state.read().await;
        state.data.keys.len()
    }

    async fn save_snapshot(&self, data: &PoolFile) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let bytes = sonic_rs::to_vec_pretty(data).context("序列化 api_keys.json 失败")?;
        tokio::fs::write(&self.file_path, bytes)
            .await
            .context("写入 api_keys.json 失败")
    }
}

fn zeroed_map<T: Clone>(models: &[String], zero: T) -> HashMap<String, T> {
    models.iter().map(|m| (m.clone(), zero.clone())).collect()
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "gemini-2.5-flash";

    fn pool_in(dir: &tempfile::TempDir) -> KeyPool {
        let cfg = Config::for_tests(dir.path().to_str().unwrap());
        KeyPool::new(&cfg)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_reports() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();

        assert!(pool.add_key("AIzaSyKEY_A_0001").await.unwrap());
        assert!(!pool.add_key("AIzaSyKEY_A_0001").await.unwrap());
        assert_eq!(pool.count().await, 1);

        assert!(pool.remove_key("AIzaSyKEY_A_0001").await.unwrap());
        assert!(!pool.remove_key("AIzaSyKEY_A_0001").await.unwrap());
        assert_eq!(pool.count().await, 0);
    }

    #[tokio::test]
    async fn usage_is_monotonic_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyKEY_A_0001").await.unwrap();

        for _ in 0..5 {
            assert!(pool.record_usage("AIzaSyKEY_A_0001", MODEL).await.unwrap());
        }
        assert!(!pool.record_usage("unknown-key", MODEL).await.unwrap());

        // 重新加载同一文件：计数不丢
        let reloaded = pool_in(&dir);
        reloaded.load().await.unwrap();
        let report = reloaded.status_report().await;
        assert!(report.contains(&format!("{MODEL}: 5/20")));
    }

    #[tokio::test]
    async fn rotation_is_fair_across_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        for k in ["AIzaSyKEY_A_0001", "AIzaSyKEY_B_0002", "AIzaSyKEY_C_0003"] {
            pool.add_key(k).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.get_available_key(MODEL).await.unwrap().unwrap());
        }
        assert_eq!(
            seen,
            vec!["AIzaSyKEY_A_0001", "AIzaSyKEY_B_0002", "AIzaSyKEY_C_0003"]
        );

        // 第二圈保持同样的循环顺序
        assert_eq!(
            pool.get_available_key(MODEL).await.unwrap().unwrap(),
            "AIzaSyKEY_A_0001"
        );
    }

    #[tokio::test]
    async fn exhausted_key_is_skipped_even_with_zero_usage() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyKEY_A_0001").await.unwrap();
        pool.add_key("AIzaSyKEY_B_0002").await.unwrap();

        pool.mark_exhausted("AIzaSyKEY_A_0001", MODEL).await.unwrap();

        // 游标位置无关：连续取两次都只会给出 key B
        for _ in 0..2 {
            assert_eq!(
                pool.get_available_key(MODEL).await.unwrap().unwrap(),
                "AIzaSyKEY_B_0002"
            );
        }
    }

    #[tokio::test]
    async fn quota_ceiling_blocks_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyKEY_A_0001").await.unwrap();

        for _ in 0..20 {
            pool.record_usage("AIzaSyKEY_A_0001", MODEL).await.unwrap();
        }
        assert!(pool.get_available_key(MODEL).await.unwrap().is_none());

        // 另一个模型的配额互不影响
        assert!(
            pool.get_available_key("gemini-3-flash-preview")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        assert!(pool.get_available_key(MODEL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_reset_only_initializes_date() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyKEY_A_0001").await.unwrap();
        pool.record_usage("AIzaSyKEY_A_0001", MODEL).await.unwrap();

        // last_reset_date 为空：只记日期，不清零
        assert!(!pool.reset_for_date("2026-08-29").await.unwrap());
        let report = pool.status_report().await;
        assert!(report.contains(&format!("{MODEL}: 1/20")));
    }

    #[tokio::test]
    async fn day_rollover_resets_usage_and_exhaustion_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyKEY_A_0001").await.unwrap();

        pool.reset_for_date("2026-08-29").await.unwrap();
        for _ in 0..7 {
            pool.record_usage("AIzaSyKEY_A_0001", MODEL).await.unwrap();
        }
        pool.mark_exhausted("AIzaSyKEY_A_0001", MODEL).await.unwrap();

        assert!(pool.reset_for_date("2026-08-30").await.unwrap());
        // 同一天再查一次：不会重复重置
        assert!(!pool.reset_for_date("2026-08-30").await.unwrap());

        let report = pool.status_report().await;
        assert!(report.contains(&format!("{MODEL}: 0/20")));
        assert!(!report.contains("exhausted"));
        assert_eq!(
            pool.get_available_key(MODEL).await.unwrap().unwrap(),
            "AIzaSyKEY_A_0001"
        );
    }

    #[tokio::test]
    async fn status_report_masks_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        pool.add_key("AIzaSyTOPSECRET9876").await.unwrap();

        let report = pool.status_report().await;
        assert!(report.contains("AIza...9876"));
        assert!(!report.contains("TOPSECRET"));
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        pool.load().await.unwrap();
        assert_eq!(pool.count().await, 0);
    }
}
