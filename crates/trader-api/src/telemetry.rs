//! tracing 초기화.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

/// `RUST_LOG`가 없을 때 쓰는 필터.
pub const DEFAULT_LOG_FILTER: &str = "trader_api=info,trader_execution=info,tower_http=debug";

/// 전역 subscriber 설치. 두 번째 호출부터는 무시됩니다.
pub fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber 이미 설치됨");
    }
}
