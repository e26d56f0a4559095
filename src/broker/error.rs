// =============================================================================
// Broker error normalization
// =============================================================================
//
// Every adapter failure collapses into five kinds so callers branch on
// recovery strategy, not on transport detail:
//
//   Transient         retry-worthy (5xx, timeouts, connection resets)
//   PermissionDenied  auth problems; the operator must intervene
//   InvalidRequest    4xx the caller constructed wrong; do not retry
//   StaleData         data too old to act on (chain age, quote gaps)
//   Fatal             anything that should stop the affected workflow
// =============================================================================

use thiserror::Error;

use crate::oauth::AuthError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transient broker failure: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("stale data: {0}")]
    StaleData(String),
    #[error("fatal broker failure: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Whether a retry at a later time could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<AuthError> for BrokerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Transport(m) => Self::Transient(m),
            AuthError::BrokerRejected(m) => Self::InvalidRequest(m),
            AuthError::CredentialsMissing(_)
            | AuthError::NoTokens(_)
            | AuthError::DailyReauthRequired
            | AuthError::TokenExpired
            | AuthError::TokenInactive
            | AuthError::UserAborted => Self::PermissionDenied(err.to_string()),
            AuthError::Storage(m) => Self::Fatal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    #[test]
    fn auth_errors_map_to_expected_kinds() {
        assert!(matches!(
            BrokerError::from(AuthError::Transport("timeout".into())),
            BrokerError::Transient(_)
        ));
        assert!(matches!(
            BrokerError::from(AuthError::DailyReauthRequired),
            BrokerError::PermissionDenied(_)
        ));
        assert!(matches!(
            BrokerError::from(AuthError::NoTokens(Environment::Sandbox)),
            BrokerError::PermissionDenied(_)
        ));
        assert!(matches!(
            BrokerError::from(AuthError::BrokerRejected("bad symbol".into())),
            BrokerError::InvalidRequest(_)
        ));
    }

    #[test]
    fn transient_flag() {
        assert!(BrokerError::Transient("x".into()).is_transient());
        assert!(!BrokerError::Fatal("x".into()).is_transient());
    }
}
