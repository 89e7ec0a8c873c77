//! 서버 설정.
//!
//! 모든 값은 환경변수에서 읽습니다 (`.env` 파일은 `main`에서 `dotenvy`로 먼저 로드).
//!
//! | 변수 | 기본값 | 설명 |
//! |---|---|---|
//! | `API_HOST` | `127.0.0.1` | 바인딩 주소 |
//! | `API_PORT` | `3000` | 바인딩 포트 |
//! | `USE_REAL_EXCHANGE` | `false` | `true`/`1`이면 실거래소, 아니면 Mock 거래소 (페이퍼 모드) |
//! | `EXCHANGE_BASE_URL` | - | 거래소 REST 주소 재정의 |
//! | `REDIS_URL` | - | 설정 시 Redis 상태 채널, 없으면 프로세스 내 채널 |
//! | `PAPER_MARK_PRICE` | `60000` | 페이퍼 모드 Mock 거래소 초기 마크 가격 |
//! | `LOG_FORMAT` | `pretty` | `json`이면 JSON 로그 |

use std::net::SocketAddr;
use std::str::FromStr;

use rust_decimal::Decimal;

/// 로그 출력 형식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// 서버 설정 구조체.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 바인딩할 호스트 주소
    pub host: String,
    /// 바인딩할 포트
    pub port: u16,
    /// 실거래소 사용 여부
    pub use_real_exchange: bool,
    /// 거래소 REST 주소 재정의
    pub exchange_base_url: Option<String>,
    /// Redis 주소
    pub redis_url: Option<String>,
    /// 페이퍼 모드 초기 마크 가격
    pub paper_mark_price: Decimal,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            use_real_exchange: false,
            exchange_base_url: None,
            redis_url: None,
            paper_mark_price: Decimal::from(60_000),
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// 환경 변수에서 설정 로드.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: env_parse("API_PORT", defaults.port),
            use_real_exchange: env_flag("USE_REAL_EXCHANGE"),
            exchange_base_url: env_non_empty("EXCHANGE_BASE_URL"),
            redis_url: env_non_empty("REDIS_URL"),
            paper_mark_price: env_parse("PAPER_MARK_PRICE", defaults.paper_mark_price),
            log_format: env_parse("LOG_FORMAT", defaults.log_format),
        }
    }

    /// 소켓 주소 반환.
    ///
    /// # Errors
    /// `host:port` 형식이 유효하지 않으면 `AddrParseError`를 반환합니다.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
