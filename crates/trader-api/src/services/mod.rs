//! 백그라운드 서비스 모듈.

pub mod signal_processor;

pub use signal_processor::{fan_out_signal, signal_budget, TraderSignalResult};
