use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 默认级别为 info，可通过 RUST_LOG 覆盖
pub fn init() {
    if let Err(e) = try_init() {
        eprintln!("日志初始化失败: {}", e);
    }
}

/// 初始化日志，重复初始化时返回错误
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}
