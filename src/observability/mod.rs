//! 可观测性：tracing 订阅器
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖；日志写到 stderr，stdout 留给请求响应。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
