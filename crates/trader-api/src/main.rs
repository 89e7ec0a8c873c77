//! 트레이딩 봇 API 서버.
//!
//! 원장/상태 채널/거래소 클라이언트를 구성하고, 남아 있는 Active 포지션의
//! 주문 모니터를 재개한 뒤 시그널 엔드포인트를 엽니다.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{http::StatusCode, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use trader_api::{create_api_router, telemetry::init_tracing, AppState, ServerConfig};
use trader_core::domain::{
    ApiCredentials, ExchangeFactory, InMemoryStatusChannel, PositionLedger, StatusChannel,
};
use trader_data::{database, DatabaseConfig, MemoryLedger, PgLedger, RedisStatusChannel};
use trader_exchange::{CoincatchExchangeFactory, MockExchangeProvider};
use trader_execution::{ExecutionConfig, ExecutionContext, MonitorRegistry, SignalDispatcher};

/// 상태 채널 항목 유효 시간.
const STATUS_TTL: Duration = Duration::from_secs(300);

/// 거래소 HTTP 요청 타임아웃.
const EXCHANGE_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// 원장 생성.
///
/// `DATABASE_URL`이 있으면 PostgreSQL (마이그레이션 포함), 없으면 메모리 원장에
/// 페이퍼 트레이더 1명을 등록합니다.
async fn create_ledger() -> anyhow::Result<Arc<dyn PositionLedger>> {
    if std::env::var("DATABASE_URL").is_ok() {
        let db_config = DatabaseConfig::from_env()?;
        let pool = database::connect(&db_config)
            .await
            .context("데이터베이스 연결 실패")?;
        database::migrate(&pool).await?;
        info!("PostgreSQL 원장 사용");
        return Ok(Arc::new(PgLedger::new(pool)));
    }

    warn!("DATABASE_URL not set, using in-memory ledger with a paper trader");
    let ledger = MemoryLedger::new();
    ledger
        .insert_trader("paper", ApiCredentials::new("paper", "paper", "paper"))
        .await;
    Ok(Arc::new(ledger))
}

/// 상태 채널 생성 (`REDIS_URL`이 없으면 프로세스 내 채널).
async fn create_status_channel(config: &ServerConfig) -> anyhow::Result<Arc<dyn StatusChannel>> {
    match &config.redis_url {
        Some(url) => {
            let channel = RedisStatusChannel::connect(url, STATUS_TTL)
                .await
                .context("Redis 연결 실패")?;
            info!("Redis 상태 채널 사용");
            Ok(Arc::new(channel))
        }
        None => {
            warn!("REDIS_URL not set, status channel is process-local");
            Ok(Arc::new(InMemoryStatusChannel::new(STATUS_TTL)))
        }
    }
}

/// 거래소 팩토리 생성.
///
/// `USE_REAL_EXCHANGE`가 아니면 모든 트레이더가 하나의 Mock 거래소를 공유합니다.
fn create_exchange_factory(config: &ServerConfig) -> anyhow::Result<Arc<dyn ExchangeFactory>> {
    if !config.use_real_exchange {
        info!(mark_price = %config.paper_mark_price, "페이퍼 모드: Mock 거래소 사용");
        return Ok(Arc::new(MockExchangeProvider::new(config.paper_mark_price)));
    }

    let http = reqwest::Client::builder()
        .timeout(EXCHANGE_HTTP_TIMEOUT)
        .build()
        .context("HTTP 클라이언트 생성 실패")?;
    let mut factory = CoincatchExchangeFactory::new(http);
    if let Some(base_url) = &config.exchange_base_url {
        factory = factory.with_base_url(base_url.clone());
    }
    info!("실거래 모드: CoinCatch 거래소 사용");
    Ok(Arc::new(factory))
}

/// 전체 라우터 생성.
fn create_router(state: Arc<AppState>) -> Router {
    create_api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // 시그널 엔드포인트는 예약만 하므로 짧게
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 파일 로드 (있는 경우)
    let _ = dotenvy::dotenv();

    let config = ServerConfig::from_env();
    init_tracing(config.log_format);
    info!("Starting trader API server...");

    let addr = config.socket_addr().map_err(|e| {
        error!(
            host = %config.host,
            port = config.port,
            error = %e,
            "소켓 주소 설정이 유효하지 않습니다. API_HOST, API_PORT 환경변수를 확인하세요."
        );
        e
    })?;

    // 전역 종료 토큰 (주문 모니터에 전파)
    let shutdown_token = CancellationToken::new();

    let execution_config = ExecutionConfig::from_env();
    info!(?execution_config, "실행 설정");

    let ctx = ExecutionContext::new(
        create_ledger().await?,
        create_status_channel(&config).await?,
        create_exchange_factory(&config)?,
        execution_config,
    );
    let monitors = Arc::new(MonitorRegistry::new(ctx.clone(), shutdown_token.clone()));

    // 재시작 전 Active 포지션의 모니터 재개
    match monitors.resume_active().await {
        Ok(started) => info!(started, "주문 모니터 복구 완료"),
        Err(e) => error!(error = %e, "주문 모니터 복구 실패"),
    }

    let state = Arc::new(AppState::new(SignalDispatcher::new(ctx, monitors.clone())));
    info!(version = state.version, "Application state initialized");

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await?;

    info!("Server shutdown initiated, cleaning up...");
    shutdown_token.cancel();

    // 모니터가 현재 사이클을 끝낼 때까지 잠시 대기
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while monitors.running_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            running = monitors.running_count(),
            "Cleanup timeout, forcing shutdown"
        );
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Graceful shutdown 시그널 대기.
///
/// Ctrl+C 또는 SIGTERM 시그널을 수신하면 종료 토큰을 취소합니다.
async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C 핸들러 설치 실패");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM 핸들러 설치 실패");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    // 모든 백그라운드 태스크에 종료 시그널 전파
    shutdown_token.cancel();
    info!("Shutdown signal propagated to background tasks");
}
