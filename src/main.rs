pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod gemini;
pub mod invoker;
pub mod keypool;
pub mod logging;
pub mod services;

use anyhow::Context;
use invoker::Invoker;
use keypool::KeyPool;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "用法:
  zaknotes keys add <key>           添加一个 API Key
  zaknotes keys remove <key>        移除一个 API Key
  zaknotes keys status              打印 key 池状态（脱敏）
  zaknotes transcribe <out> <chunk...>  逐块转写音频到 <out>
  zaknotes note <transcript> <out>  根据转写稿生成 Markdown 笔记";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();
    init_tracing();

    let pool = Arc::new(KeyPool::new(&cfg));
    if let Err(e) = pool.load().await {
        tracing::warn!("加载 api_keys.json 失败: {e:#}");
    }
    tracing::info!("key 池已加载，共 {} 个 key", pool.count().await);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("keys") => handle_keys(&pool, &args[1..]).await,
        Some("transcribe") if args.len() >= 3 => {
            let invoker = build_invoker(&cfg, pool)?;
            let output = Path::new(&args[1]);
            let chunks: Vec<&Path> = args[2..].iter().map(Path::new).collect();
            services::transcribe_chunks(&invoker, &chunks, output).await?;
            tracing::info!("转写完成: {}", output.display());
            Ok(())
        }
        Some("note") if args.len() >= 3 => {
            let invoker = build_invoker(&cfg, pool)?;
            let output = Path::new(&args[2]);
            services::generate_notes(&invoker, Path::new(&args[1]), output, None).await?;
            tracing::info!("笔记已生成: {}", output.display());
            Ok(())
        }
        _ => {
            eprintln!("{USAGE}");
            Ok(())
        }
    }
}

async fn handle_keys(pool: &KeyPool, args: &[String]) -> anyhow::Result<()> {
    match (args.first().map(String::as_str), args.get(1)) {
        (Some("add"), Some(key)) => {
            if pool.add_key(key).await? {
                tracing::info!("已添加 key {}", logging::mask_key(key));
            } else {
                tracing::info!("key {} 已存在，忽略", logging::mask_key(key));
            }
            Ok(())
        }
        (Some("remove"), Some(key)) => {
            if pool.remove_key(key).await? {
                tracing::info!("已移除 key {}", logging::mask_key(key));
            } else {
                tracing::warn!("key {} 不在池中", logging::mask_key(key));
            }
            Ok(())
        }
        (Some("status"), _) => {
            pool.reset_if_needed().await?;
            println!("{}", pool.status_report().await);
            Ok(())
        }
        _ => {
            eprintln!("{USAGE}");
            Ok(())
        }
    }
}

fn build_invoker(
    cfg: &config::Config,
    pool: Arc<KeyPool>,
) -> anyhow::Result<Invoker<gemini::GeminiClient>> {
    let client = gemini::GeminiClient::new(cfg).context("初始化 Gemini 客户端失败")?;

    // Ctrl-C 触发取消令牌：长退避途中也能干净地中断调用
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("收到退出信号，准备中断当前调用...");
            cancel.cancel();
        });
    }

    Ok(Invoker::new(cfg, client, pool).with_cancellation(cancel))
}

fn init_tracing() {
    // 依赖库日志压到 warn，本项目自身至少 info，避免环境里的 RUST_LOG=warn
    // 把关键日志过滤掉。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,zaknotes=info")
    } else if env.contains("zaknotes") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},zaknotes=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}
