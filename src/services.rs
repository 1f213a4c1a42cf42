use crate::invoker::{GenerateBackend, Invoker, TaskKind};
use anyhow::Context;
use std::path::Path;

pub const TRANSCRIPTION_PROMPT: &str = "请逐字转写这段音频，保留说话人的原始措辞，不要总结或改写。只输出转写文本。";

pub const NOTE_PROMPT: &str = "根据下面的课程转写稿整理一份结构化的 Markdown 笔记：提炼小标题、要点与关键结论，保留重要细节。\n\n转写稿：\n";

/// 音频体积上限（MB）。超限的文件应先切分再上传。
pub const AUDIO_SIZE_LIMIT_MB: u64 = 20;

pub fn is_under_limit(path: &Path, limit_mb: u64) -> bool {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    size < limit_mb * 1024 * 1024
}

/// 逐块转写音频并把文本追加写入 output_path。任一块失败即整体失败。
pub async fn transcribe_chunks<B: GenerateBackend>(
    invoker: &Invoker<B>,
    chunks: &[impl AsRef<Path>],
    output_path: &Path,
) -> anyhow::Result<()> {
    if let Some(dir) = output_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建转写输出目录失败")?;
    }
    // 先清空旧内容
    tokio::fs::write(output_path, b"")
        .await
        .context("初始化转写输出文件失败")?;

    let mut transcript = String::new();
    for chunk in chunks {
        let chunk = chunk.as_ref();
        if !is_under_limit(chunk, AUDIO_SIZE_LIMIT_MB) {
            anyhow::bail!("音频分块超过 {AUDIO_SIZE_LIMIT_MB}MB 上限: {}", chunk.display());
        }

        tracing::info!("转写分块: {}", chunk.display());
        let text = invoker
            .generate(TaskKind::Transcription, TRANSCRIPTION_PROMPT, None, Some(chunk))
            .await
            .with_context(|| format!("转写分块失败: {}", chunk.display()))?;

        if text.is_empty() {
            tracing::warn!("分块 {} 的转写结果为空", chunk.display());
            continue;
        }
        transcript.push_str(&text);
        tokio::fs::write(output_path, transcript.as_bytes())
            .await
            .context("写入转写结果失败")?;
    }

    Ok(())
}

/// 读取转写稿、生成 Markdown 笔记并写入 output_path。
/// prompt 为空时使用默认笔记提示词。
pub async fn generate_notes<B: GenerateBackend>(
    invoker: &Invoker<B>,
    transcript_path: &Path,
    output_path: &Path,
    prompt: Option<&str>,
) -> anyhow::Result<()> {
    let transcript = tokio::fs::read_to_string(transcript_path)
        .await
        .with_context(|| format!("读取转写稿失败: {}", transcript_path.display()))?;

    let mut full_prompt = prompt.unwrap_or(NOTE_PROMPT).to_string();
    full_prompt.push_str(&transcript);

    let notes = invoker
        .generate(TaskKind::Note, &full_prompt, None, None)
        .await
        .context("笔记生成失败")?;
    if notes.is_empty() {
        anyhow::bail!("笔记生成返回了空响应");
    }

    if let Some(dir) = output_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建笔记输出目录失败")?;
    }
    tokio::fs::write(output_path, notes.as_bytes())
        .await
        .context("写入笔记失败")
}
