// =============================================================================
// Engine events — the outbound notification stream
// =============================================================================
//
// Components publish structured events onto one mpsc channel; a single
// consumer (the alert task) renders them for operators. Components never
// format alert text themselves, and the channel is the only coupling between
// the exit engine and the execution side (close intents excluded, which have
// their own queue).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{Environment, Side, SignalType};

/// One accepted fill inside a batched open report.
#[derive(Debug, Clone, Serialize)]
pub struct OpenedPosition {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub signal_type: SignalType,
    pub quantity: f64,
    pub entry_price: f64,
    pub capital_allocated: f64,
}

/// One skipped signal inside a batched open report.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedSignal {
    pub symbol: String,
    pub signal_type: SignalType,
    pub reason: String,
}

/// Events the engine publishes. One channel, many producers.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    /// Batched report after an execution pass: every accepted fill and every
    /// rejection with its reason.
    PositionsOpened {
        at: DateTime<Utc>,
        opened: Vec<OpenedPosition>,
        rejected: Vec<RejectedSignal>,
    },
    /// A position fully closed and settled.
    PositionClosed {
        at: DateTime<Utc>,
        position_id: String,
        symbol: String,
        signal_type: SignalType,
        exit_reason: String,
        realized_pnl: f64,
    },
    /// A partial profit-taking fill.
    PartialClose {
        at: DateTime<Utc>,
        position_id: String,
        symbol: String,
        closed_quantity: f64,
        remaining_quantity: f64,
        realized_pnl: f64,
    },
    /// Keep-alive or renewal trouble in the OAuth session.
    AuthHealth {
        at: DateTime<Utc>,
        environment: Environment,
        consecutive_failures: u32,
        detail: String,
    },
    /// A position hit an unrecoverable error and is flagged for EOD close.
    PositionEscalated {
        at: DateTime<Utc>,
        position_id: String,
        symbol: String,
        detail: String,
    },
    /// Stale ADV data or other data-quality warnings.
    DataQuality { at: DateTime<Utc>, detail: String },
}

/// Cloneable publishing handle. A `None` sender (detached) drops events,
/// which keeps tests quiet.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Publish without blocking; a full channel drops the event with a log
    /// line rather than stalling a trading loop.
    pub fn publish(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                warn!(error = %e, "event channel full or closed — event dropped");
            }
        }
    }
}

/// Drain the event channel and render events into the log. Runs until the
/// channel closes.
pub async fn run_event_logger(mut rx: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            EngineEvent::PositionsOpened { opened, rejected, .. } => {
                info!(
                    opened = opened.len(),
                    rejected = rejected.len(),
                    detail = %serde_json::to_string(&event).unwrap_or_default(),
                    "positions opened"
                );
            }
            EngineEvent::PositionClosed {
                symbol,
                exit_reason,
                realized_pnl,
                ..
            } => {
                info!(symbol = %symbol, reason = %exit_reason, pnl = realized_pnl, "position closed");
            }
            EngineEvent::PartialClose {
                symbol,
                closed_quantity,
                remaining_quantity,
                ..
            } => {
                info!(
                    symbol = %symbol,
                    closed = closed_quantity,
                    remaining = remaining_quantity,
                    "partial close"
                );
            }
            EngineEvent::AuthHealth {
                environment,
                consecutive_failures,
                detail,
                ..
            } => {
                warn!(
                    env = %environment,
                    failures = consecutive_failures,
                    detail = %detail,
                    "auth health alert"
                );
            }
            EngineEvent::PositionEscalated { symbol, detail, .. } => {
                warn!(symbol = %symbol, detail = %detail, "position escalated");
            }
            EngineEvent::DataQuality { detail, .. } => {
                warn!(detail = %detail, "data quality alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_sink_swallows_events() {
        let sink = EventSink::detached();
        sink.publish(EngineEvent::DataQuality {
            at: Utc::now(),
            detail: "test".into(),
        });
    }

    #[tokio::test]
    async fn publish_reaches_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx);
        sink.publish(EngineEvent::DataQuality {
            at: Utc::now(),
            detail: "stale".into(),
        });
        let received = rx.recv().await.expect("event");
        assert!(matches!(received, EngineEvent::DataQuality { .. }));
    }
}
