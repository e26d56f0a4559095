// =============================================================================
// OAuth keep-alive loop — prevents the broker's 2-hour idle timeout
// =============================================================================
//
// One task per environment. Each pass:
//
//   1. Read the current tokens; sleep through absence or daily expiry.
//   2. If idle > 80 minutes, issue a lightweight signed read (list
//      accounts) and update `last_used` on success.
//   3. Sleep until `last_used + 90 minutes`, floored at a 5-minute retry
//      spacing.
//
// Failures never terminate the loop; three consecutive failures raise an
// `AuthHealth` event and the loop keeps going.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{renew_action, AuthError, OAuthSession, RenewAction};
use crate::events::{EngineEvent, EventSink};
use crate::types::Environment;

/// Idle threshold beyond which a keep-alive call is issued.
const READINESS_MINUTES: i64 = 80;
/// Scheduling interval measured from `last_used`.
const DUE_MINUTES: i64 = 90;
/// Minimum spacing between passes.
const MIN_RETRY_MINUTES: i64 = 5;
/// Consecutive failures that trigger an alert.
const ALERT_AFTER_FAILURES: u32 = 3;

/// How long to sleep before the next pass, from the token's idle state.
/// Pure so the schedule can be tested without a clock.
pub fn next_delay(idle_minutes: i64) -> Duration {
    let until_due = DUE_MINUTES - idle_minutes;
    Duration::minutes(until_due.max(MIN_RETRY_MINUTES))
}

/// Whether the token is idle enough to warrant a keep-alive call now.
pub fn call_needed(idle_minutes: i64) -> bool {
    idle_minutes > READINESS_MINUTES
}

/// The lightweight signed read used as the keep-alive ping.
async fn keepalive_call(session: &OAuthSession, env: Environment) -> Result<(), AuthError> {
    let url = format!("{}/v1/accounts/list", session.api_base(env));
    session.signed_get(env, &url, &[]).await.map(|_| ())
}

/// Run one keep-alive pass: returns `Ok(true)` when a call was made.
pub async fn run_pass(
    session: &OAuthSession,
    env: Environment,
) -> Result<bool, AuthError> {
    let now = Utc::now();
    let Some(info) = session.peek_tokens(env) else {
        debug!(env = %env, "keep-alive: no tokens on disk");
        return Ok(false);
    };

    if renew_action(&info, now) == RenewAction::DailyReauthRequired {
        debug!(env = %env, "keep-alive: tokens past midnight ET, waiting for re-auth");
        return Ok(false);
    }

    let idle = info.idle(now).num_minutes();
    if !call_needed(idle) {
        debug!(env = %env, idle_minutes = idle, "keep-alive: not due");
        return Ok(false);
    }

    info!(env = %env, idle_minutes = idle, "keep-alive: issuing lightweight call");
    keepalive_call(session, env).await?;
    session.touch_last_used(env, Utc::now());
    Ok(true)
}

/// The keep-alive loop for one environment. Suspends cleanly when `shutdown`
/// flips to true.
pub async fn run_keepalive_loop(
    session: Arc<OAuthSession>,
    env: Environment,
    events: EventSink,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(env = %env, "keep-alive loop started");
    let mut consecutive_failures: u32 = 0;

    loop {
        let idle_minutes = session
            .peek_tokens(env)
            .map(|t| t.idle(Utc::now()).num_minutes())
            .unwrap_or(0);
        let delay = next_delay(idle_minutes)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(300));

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(env = %env, "keep-alive loop stopping");
                    return;
                }
            }
        }

        match run_pass(&session, env).await {
            Ok(made_call) => {
                if made_call {
                    consecutive_failures = 0;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    env = %env,
                    failures = consecutive_failures,
                    error = %e,
                    "keep-alive call failed"
                );
                if consecutive_failures >= ALERT_AFTER_FAILURES {
                    events.publish(EngineEvent::AuthHealth {
                        at: Utc::now(),
                        environment: env,
                        consecutive_failures,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}
