// =============================================================================
// OAuth 1.0a session management
// =============================================================================
//
// `signer` builds RFC 5849 signatures; `vault` + `token_store` keep tokens
// encrypted on disk; `session` runs the 3-legged flow, idle renewal, and
// signed calls; `keepalive` pings the broker before the 2-hour idle timeout.

pub mod keepalive;
pub mod session;
pub mod signer;
pub mod token_store;
pub mod vault;

pub use session::{AuthError, OAuthSession};
