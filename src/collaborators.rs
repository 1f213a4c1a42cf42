//! 外部协作者的接口定义。
//!
//! 浏览器自动化、音频下载、文档转换和任务队列都是薄胶水，不属于本 crate
//! 的失败处理核心；这里只固定核心代码需要的调用形状，具体实现由外部提供。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Done,
    Cancelled,
}

/// 队列中的一个待处理任务。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub url: String,
    pub status: JobStatus,
}

/// 已登录的浏览器页面/上下文，提供导航与基础 UI 操作。
#[allow(async_fn_in_trait)]
pub trait BrowserSession {
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
    async fn fill(&self, selector: &str, value: &str) -> anyhow::Result<()>;
    async fn inner_text(&self, selector: &str) -> anyhow::Result<String>;
}

/// 把任务描述的 url 拉成本地音频文件。
#[allow(async_fn_in_trait)]
pub trait Downloader {
    async fn download(&self, job: &Job) -> anyhow::Result<PathBuf>;
}

/// 把 Markdown/文本产物转成排版后的文档。
#[allow(async_fn_in_trait)]
pub trait DocumentConverter {
    async fn convert(&self, input: &Path, output: &Path) -> anyhow::Result<()>;
}

/// 持久化的任务队列。
#[allow(async_fn_in_trait)]
pub trait JobStore {
    async fn enqueue(&self, name: &str, url: &str) -> anyhow::Result<()>;
    async fn cancel(&self, name: &str) -> anyhow::Result<bool>;
    async fn mark_done(&self, name: &str) -> anyhow::Result<bool>;
    async fn pending(&self) -> anyhow::Result<Vec<Job>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryJobStore {
        jobs: Mutex<Vec<Job>>,
    }

    impl JobStore for MemoryJobStore {
        async fn enqueue(&self, name: &str, url: &str) -> anyhow::Result<()> {
            self.jobs.lock().await.push(Job {
                name: name.to_string(),
                url: url.to_string(),
                status: JobStatus::Pending,
            });
            Ok(())
        }

        async fn cancel(&self, name: &str) -> anyhow::Result<bool> {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.iter_mut().find(|j| j.name == name) else {
                return Ok(false);
            };
            job.status = JobStatus::Cancelled;
            Ok(true)
        }

        async fn mark_done(&self, name: &str) -> anyhow::Result<bool> {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.iter_mut().find(|j| j.name == name) else {
                return Ok(false);
            };
            job.status = JobStatus::Done;
            Ok(true)
        }

        async fn pending(&self) -> anyhow::Result<Vec<Job>> {
            let jobs = self.jobs.lock().await;
            Ok(jobs
                .iter()
                .filter(|j| j.status == JobStatus::Pending)
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn job_store_call_shapes() {
        let store = MemoryJobStore::default();
        store.enqueue("lecture-01", "https://example.com/a").await.unwrap();
        store.enqueue("lecture-02", "https://example.com/b").await.unwrap();

        assert!(store.cancel("lecture-01").await.unwrap());
        assert!(!store.cancel("missing").await.unwrap());
        assert!(store.mark_done("lecture-02").await.unwrap());

        assert!(store.pending().await.unwrap().is_empty());
    }

    #[test]
    fn job_status_serializes_lowercase() {
        let job = Job {
            name: "n".to_string(),
            url: "u".to_string(),
            status: JobStatus::Pending,
        };
        let json = sonic_rs::to_string(&job).unwrap();
        assert!(json.contains("\"pending\""));
    }
}

