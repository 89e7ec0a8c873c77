//! 애플리케이션 상태.

use std::sync::Arc;

use trader_core::domain::PositionLedger;
use trader_execution::{MonitorRegistry, SignalDispatcher};

/// 핸들러 공유 상태.
#[derive(Debug, Clone)]
pub struct AppState {
    pub dispatcher: SignalDispatcher,
    pub version: &'static str,
}

impl AppState {
    pub fn new(dispatcher: SignalDispatcher) -> Self {
        Self {
            dispatcher,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn PositionLedger> {
        &self.dispatcher.context().ledger
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        self.dispatcher.monitors()
    }
}
