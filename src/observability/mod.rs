//! 可观测性
//!
//! TUI 占用终端，日志写到数据目录下的文件；默认 info，可通过 RUST_LOG 覆盖。

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化到日志文件（追加写）；重复初始化时忽略
pub fn init(log_path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init();
    Ok(())
}

/// 初始化到 stderr（非 TUI 子命令用）
pub fn init_stderr() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
