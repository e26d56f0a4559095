// =============================================================================
// OAuth session manager — 3-legged auth, idle renewal, signed calls
// =============================================================================
//
// Owns all credentials and tokens. One instance serves both environments;
// a per-environment async Mutex serializes token mutation so concurrent
// signers cannot double-renew.
//
// Lifecycle rules:
//
//   * Tokens die at the first ET midnight after issue. Once the ET date
//     differs from `issued_et_date` only `start` (operator re-auth) recovers;
//     every other operation fails with `DailyReauthRequired`.
//   * Idle > 2 h deactivates tokens broker-side. `renew_if_needed` calls the
//     renew endpoint when idle exceeds the renewal threshold; `sign_request`
//     always goes through it first.
//
// HTTP retry policy: 3 attempts with 1 s / 2 s / 4 s backoff on transient
// failures. A 401 naming token_revoked/token_inactive short-circuits into a
// single in-band renewal; a second 401 surfaces `TokenInactive`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::signer::{self, SigningInput};
use super::token_store::{OperationalMetrics, TokenInfo, TokenStore};
use crate::config::AppConfig;
use crate::market::eastern;
use crate::types::Environment;

/// Idle threshold after which the broker deactivates tokens.
pub fn broker_idle_timeout() -> Duration {
    Duration::hours(2)
}

/// Typed failure kinds for the auth layer.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("consumer credentials missing for {0}")]
    CredentialsMissing(Environment),
    #[error("no tokens on disk for {0}; run `oauth start {0}`")]
    NoTokens(Environment),
    #[error("tokens expired at midnight ET; run `oauth start` to re-authenticate")]
    DailyReauthRequired,
    #[error("token expired broker-side; run `oauth start`")]
    TokenExpired,
    #[error("token inactive after renewal attempt; run `oauth start`")]
    TokenInactive,
    #[error("broker rejected the request: {0}")]
    BrokerRejected(String),
    #[error("operator aborted the authorization flow")]
    UserAborted,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// What `renew_if_needed` should do for a token at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewAction {
    /// ET date rolled since issue — only a fresh `start` recovers.
    DailyReauthRequired,
    /// Idle beyond the threshold — call the broker renew endpoint.
    Renew,
    /// Token is fresh enough.
    NoOp,
}

/// Pure renewal decision, separated from I/O so the clock can be pinned.
pub fn renew_action(info: &TokenInfo, now: DateTime<Utc>) -> RenewAction {
    if eastern::eastern_date(now) != info.issued_et_date {
        return RenewAction::DailyReauthRequired;
    }
    if info.idle(now) > broker_idle_timeout() {
        return RenewAction::Renew;
    }
    RenewAction::NoOp
}

/// Per-environment broker endpoints.
fn base_url(env: Environment) -> &'static str {
    match env {
        Environment::Sandbox => "https://apisb.etrade.com",
        Environment::Prod => "https://api.etrade.com",
    }
}

const AUTHORIZE_URL: &str = "https://us.etrade.com/e/t/etws/authorize";

/// Operator-facing status snapshot (`oauth status`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    pub environment: Environment,
    pub has_tokens: bool,
    pub issued_et_date: Option<chrono::NaiveDate>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_renewed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_minutes: Option<i64>,
    pub needs_daily_reauth: bool,
    pub metrics: OperationalMetrics,
}

/// The session manager.
pub struct OAuthSession {
    config: Arc<AppConfig>,
    store: TokenStore,
    http: reqwest::Client,
    sandbox_lock: Mutex<()>,
    prod_lock: Mutex<()>,
}

impl OAuthSession {
    pub fn new(config: Arc<AppConfig>, store: TokenStore) -> Self {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            config,
            store,
            http,
            sandbox_lock: Mutex::new(()),
            prod_lock: Mutex::new(()),
        }
    }

    fn lock(&self, env: Environment) -> &Mutex<()> {
        match env {
            Environment::Sandbox => &self.sandbox_lock,
            Environment::Prod => &self.prod_lock,
        }
    }

    fn credentials(&self, env: Environment) -> Result<(&str, &str), AuthError> {
        self.config
            .credentials(env)
            .map(|c| (c.consumer_key.as_str(), c.consumer_secret.as_str()))
            .ok_or(AuthError::CredentialsMissing(env))
    }

    // -------------------------------------------------------------------------
    // OAuth protocol legs
    // -------------------------------------------------------------------------

    /// Sign and send one OAuth protocol request (request/access/renew token
    /// legs), parsing the form-encoded response.
    async fn oauth_leg(
        &self,
        env: Environment,
        url: &str,
        extra: &[(&str, &str)],
        token: Option<(&str, &str)>,
    ) -> Result<HashMap<String, String>, AuthError> {
        let (consumer_key, consumer_secret) = self.credentials(env)?;

        let mut params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), consumer_key.to_string()),
            ("oauth_nonce".into(), signer::generate_nonce()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), signer::generate_timestamp()),
            ("oauth_version".into(), "1.0".into()),
        ];
        if let Some((tok, _)) = token {
            params.push(("oauth_token".into(), tok.to_string()));
        }
        for (k, v) in extra {
            params.push((k.to_string(), v.to_string()));
        }

        let token_secret = token.map(|(_, s)| s).unwrap_or("");
        let signature = signer::sign(&SigningInput {
            method: "GET",
            base_url: url,
            params: params.clone(),
            consumer_secret,
            token_secret,
        });
        params.push(("oauth_signature".into(), signature));

        let header = signer::authorization_header(&params);
        let non_oauth: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| !k.starts_with("oauth_"))
            .cloned()
            .collect();

        let response = self
            .http
            .get(url)
            .query(&non_oauth)
            .header("Authorization", header)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::BrokerRejected(format!("{status}: {body}")));
        }

        Ok(parse_form_encoded(&body))
    }

    /// Full 3-legged flow. `prompt` receives the authorize URL and returns
    /// the verifier PIN the operator copied from the broker page.
    pub async fn start(
        &self,
        env: Environment,
        prompt: impl FnOnce(&str) -> Result<String, AuthError>,
    ) -> Result<(), AuthError> {
        let _guard = self.lock(env).lock().await;
        info!(env = %env, "starting 3-legged OAuth flow");

        let (consumer_key, _) = self.credentials(env)?;

        // Leg 1: request token.
        let request_url = format!("{}/oauth/request_token", base_url(env));
        let response = self
            .oauth_leg(env, &request_url, &[("oauth_callback", "oob")], None)
            .await?;
        let request_token = response
            .get("oauth_token")
            .ok_or_else(|| AuthError::BrokerRejected("request token missing".into()))?
            .clone();
        let request_secret = response
            .get("oauth_token_secret")
            .ok_or_else(|| AuthError::BrokerRejected("request token secret missing".into()))?
            .clone();
        info!(env = %env, "request token obtained");

        // Leg 2: operator authorizes in the browser and supplies the PIN.
        let auth_url = format!("{AUTHORIZE_URL}?key={consumer_key}&token={request_token}");
        let verifier = prompt(&auth_url)?;
        let verifier = verifier.trim().to_string();
        if verifier.is_empty() {
            return Err(AuthError::UserAborted);
        }

        // Leg 3: exchange the verifier for an access token.
        let access_url = format!("{}/oauth/access_token", base_url(env));
        let response = self
            .oauth_leg(
                env,
                &access_url,
                &[("oauth_verifier", verifier.as_str())],
                Some((&request_token, &request_secret)),
            )
            .await?;
        let oauth_token = response
            .get("oauth_token")
            .ok_or_else(|| AuthError::BrokerRejected("access token missing".into()))?
            .clone();
        let oauth_token_secret = response
            .get("oauth_token_secret")
            .ok_or_else(|| AuthError::BrokerRejected("access token secret missing".into()))?
            .clone();

        let now = Utc::now();
        let expires_at = eastern::next_midnight_eastern(now);
        let info = TokenInfo {
            oauth_token,
            oauth_token_secret,
            created_at: now,
            last_used: now,
            last_renewed: None,
            expires_at,
            issued_et_date: eastern::eastern_date(now),
        };
        self.store
            .save_tokens(env, &info)
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        let mut metrics = self.store.load_metrics(env);
        metrics.consecutive_failures = 0;
        metrics.last_successful_call = Some(now);
        metrics.next_midnight_et = Some(expires_at);
        let _ = self.store.save_metrics(env, &metrics);

        info!(env = %env, expires_at = %expires_at, "OAuth flow complete, tokens saved");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Renewal
    // -------------------------------------------------------------------------

    /// Renew tokens when idle beyond the threshold; fail fast after the ET
    /// date rolls. Serialized per environment.
    pub async fn renew_if_needed(&self, env: Environment) -> Result<(), AuthError> {
        let _guard = self.lock(env).lock().await;
        self.renew_if_needed_locked(env).await
    }

    async fn renew_if_needed_locked(&self, env: Environment) -> Result<(), AuthError> {
        let info = self
            .store
            .load_tokens(env)
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or(AuthError::NoTokens(env))?;

        match renew_action(&info, Utc::now()) {
            RenewAction::DailyReauthRequired => Err(AuthError::DailyReauthRequired),
            RenewAction::NoOp => Ok(()),
            RenewAction::Renew => self.renew_now(env, info).await,
        }
    }

    /// Renew unconditionally under the environment lock.
    pub async fn force_renew(&self, env: Environment) -> Result<(), AuthError> {
        let _guard = self.lock(env).lock().await;
        let info = self
            .store
            .load_tokens(env)
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or(AuthError::NoTokens(env))?;
        self.renew_now(env, info).await
    }

    /// Unconditionally call the broker renew endpoint.
    async fn renew_now(&self, env: Environment, mut info: TokenInfo) -> Result<(), AuthError> {
        debug!(env = %env, "renewing idle tokens");
        let mut metrics = self.store.load_metrics(env);
        metrics.renew_attempts += 1;

        let renew_url = format!("{}/oauth/renew_access_token", base_url(env));
        let result = self
            .oauth_leg(
                env,
                &renew_url,
                &[],
                Some((&info.oauth_token, &info.oauth_token_secret)),
            )
            .await;

        match result {
            Ok(_) => {
                let now = Utc::now();
                info.last_renewed = Some(now);
                info.last_used = now;
                self.store
                    .save_tokens(env, &info)
                    .map_err(|e| AuthError::Storage(e.to_string()))?;
                metrics.last_successful_call = Some(now);
                metrics.consecutive_failures = 0;
                let _ = self.store.save_metrics(env, &metrics);
                info!(env = %env, "tokens renewed");
                Ok(())
            }
            Err(e) => {
                metrics.renew_failures += 1;
                metrics.consecutive_failures += 1;
                let _ = self.store.save_metrics(env, &metrics);
                warn!(env = %env, error = %e, "token renewal failed");
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Produce the `Authorization` header for a broker API request and touch
    /// `last_used`. Renewal runs first when the token has gone idle.
    pub async fn sign_request(
        &self,
        env: Environment,
        method: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<String, AuthError> {
        let _guard = self.lock(env).lock().await;

        let info = self
            .store
            .load_tokens(env)
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or(AuthError::NoTokens(env))?;

        match renew_action(&info, Utc::now()) {
            RenewAction::DailyReauthRequired => return Err(AuthError::DailyReauthRequired),
            RenewAction::Renew => self.renew_now(env, info).await?,
            RenewAction::NoOp => {}
        }

        // Reload: renewal may have touched timestamps.
        let mut info = self
            .store
            .load_tokens(env)
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or(AuthError::NoTokens(env))?;

        let (consumer_key, consumer_secret) = self.credentials(env)?;

        let mut all_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), consumer_key.to_string()),
            ("oauth_nonce".into(), signer::generate_nonce()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), signer::generate_timestamp()),
            ("oauth_version".into(), "1.0".into()),
            ("oauth_token".into(), info.oauth_token.clone()),
        ];
        all_params.extend(params.iter().cloned());

        let signature = signer::sign(&SigningInput {
            method,
            base_url: url,
            params: all_params.clone(),
            consumer_secret,
            token_secret: &info.oauth_token_secret,
        });
        all_params.push(("oauth_signature".into(), signature));

        info.last_used = Utc::now();
        self.store
            .save_tokens(env, &info)
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        Ok(signer::authorization_header(&all_params))
    }

    // -------------------------------------------------------------------------
    // Signed API calls with retry
    // -------------------------------------------------------------------------

    /// Signed GET with the standard retry policy. Returns the response body
    /// on 2xx.
    pub async fn signed_get(
        &self,
        env: Environment,
        url: &str,
        query: &[(String, String)],
    ) -> Result<String, AuthError> {
        self.signed_call(env, reqwest::Method::GET, url, query, None)
            .await
    }

    /// Signed POST with a JSON body. Body content is not part of the OAuth
    /// signature (only query parameters are).
    pub async fn signed_post_json(
        &self,
        env: Environment,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<String, AuthError> {
        self.signed_call(env, reqwest::Method::POST, url, &[], Some(body.clone()))
            .await
    }

    /// Signed PUT with a JSON body.
    pub async fn signed_put_json(
        &self,
        env: Environment,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<String, AuthError> {
        self.signed_call(env, reqwest::Method::PUT, url, &[], Some(body.clone()))
            .await
    }

    async fn signed_call(
        &self,
        env: Environment,
        method: reqwest::Method,
        url: &str,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<String, AuthError> {
        let mut renewed_in_band = false;

        for attempt in 0..3u32 {
            if attempt > 0 {
                let backoff = StdDuration::from_secs(1 << (attempt - 1).min(2));
                tokio::time::sleep(backoff).await;
            }

            let header = self
                .sign_request(env, method.as_str(), url, query)
                .await?;

            let mut request = self
                .http
                .request(method.clone(), url)
                .header("Authorization", header)
                .header("Accept", "application/json");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(b) = &body {
                request = request.json(b);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(env = %env, attempt, error = %e, "broker call transport error");
                    continue;
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| AuthError::Transport(e.to_string()))?;

            if status.is_success() {
                let mut metrics = self.store.load_metrics(env);
                metrics.last_successful_call = Some(Utc::now());
                metrics.consecutive_failures = 0;
                let _ = self.store.save_metrics(env, &metrics);
                return Ok(text);
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                let mut metrics = self.store.load_metrics(env);
                metrics.last_401_count += 1;
                let _ = self.store.save_metrics(env, &metrics);

                let lowered = text.to_lowercase();
                if lowered.contains("token_expired") || lowered.contains("oauth token has expired")
                {
                    return Err(AuthError::TokenExpired);
                }
                if lowered.contains("token_revoked") || lowered.contains("token_inactive") {
                    if renewed_in_band {
                        return Err(AuthError::TokenInactive);
                    }
                    renewed_in_band = true;
                    warn!(env = %env, "401 token_inactive — attempting in-band renewal");
                    self.force_renew(env).await?;
                    continue;
                }
                return Err(AuthError::BrokerRejected(format!("{status}: {text}")));
            }

            if status.is_server_error() {
                warn!(env = %env, attempt, status = %status, "broker 5xx — retrying");
                continue;
            }

            return Err(AuthError::BrokerRejected(format!("{status}: {text}")));
        }

        Err(AuthError::Transport("broker call failed after 3 attempts".into()))
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Structured status snapshot for operators.
    pub fn status(&self, env: Environment) -> SessionStatus {
        let now = Utc::now();
        let tokens = self.store.load_tokens(env).ok().flatten();
        let metrics = self.store.load_metrics(env);

        match tokens {
            Some(info) => SessionStatus {
                environment: env,
                has_tokens: true,
                issued_et_date: Some(info.issued_et_date),
                last_used: Some(info.last_used),
                last_renewed: info.last_renewed,
                expires_at: Some(info.expires_at),
                idle_minutes: Some(info.idle(now).num_minutes()),
                needs_daily_reauth: renew_action(&info, now)
                    == RenewAction::DailyReauthRequired,
                metrics,
            },
            None => SessionStatus {
                environment: env,
                has_tokens: false,
                issued_et_date: None,
                last_used: None,
                last_renewed: None,
                expires_at: None,
                idle_minutes: None,
                needs_daily_reauth: false,
                metrics,
            },
        }
    }

    /// Read-only token access for the keep-alive loop.
    pub fn peek_tokens(&self, env: Environment) -> Option<TokenInfo> {
        self.store.load_tokens(env).ok().flatten()
    }

    /// Persist an updated `last_used` after a successful keep-alive call.
    pub fn touch_last_used(&self, env: Environment, at: DateTime<Utc>) {
        if let Ok(Some(mut info)) = self.store.load_tokens(env) {
            info.last_used = at;
            let _ = self.store.save_tokens(env, &info);
        }
    }

    pub fn metrics(&self, env: Environment) -> OperationalMetrics {
        self.store.load_metrics(env)
    }

    /// Base API URL for `env` (used by the broker adapter).
    pub fn api_base(&self, env: Environment) -> &'static str {
        base_url(env)
    }
}

/// Parse `k=v&k2=v2` form-encoded responses from the OAuth endpoints.
fn parse_form_encoded(body: &str) -> HashMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

/// Minimal percent-decoder for form-encoded token responses.
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    Ok(v) => {
                        out.push(v);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
