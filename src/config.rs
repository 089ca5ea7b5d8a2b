//! Coordinator configuration.
//!
//! Read from environment variables; every knob has a default suitable
//! for a single-instance deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ids::Address;

/// How registration transactions get their player authorizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// Each player signs their own authorization entry in their wallet;
    /// the service only signs the envelope. Production mode.
    ClientSigned,
    /// No player signatures are collected; the transaction is submitted
    /// with the service key alone. Only valid against a ledger whose
    /// contract does not demand player authorization (local development).
    ServiceOnly,
}

impl RegistrationMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client_signed" | "client" => Some(Self::ClientSigned),
            "service_only" | "service" => Some(Self::ServiceOnly),
            _ => None,
        }
    }
}

/// Submission retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total submission attempts (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier for each subsequent retry.
    pub multiplier: u32,
    /// Maximum delay cap.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            multiplier: 2,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = (self.multiplier.max(1) as u64).saturating_pow(attempt.saturating_sub(1));
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// No delays; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1,
            max_delay_ms: 0,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Registration signing mode.
    pub mode: RegistrationMode,
    /// Service account: transaction source and envelope signer.
    pub service_address: Address,
    /// Submission retry policy.
    pub retry: RetryConfig,
    /// Fallback session id candidates after the preferred one.
    pub session_fallback_candidates: usize,
    /// Ledgers a player authorization stays valid for.
    pub auth_validity_ledgers: u32,
    /// Pending registrations older than this are cancelled.
    pub signature_timeout: Duration,
    /// Verify round proofs when committing (otherwise at resolution).
    pub verify_on_commit: bool,
    /// Where clients are sent after a cancellation.
    pub lobby_redirect: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: RegistrationMode::ClientSigned,
            service_address: Address::new("GSERVICE"),
            retry: RetryConfig::default(),
            session_fallback_candidates: 48,
            auth_validity_ledgers: 60,
            signature_timeout: Duration::from_secs(120),
            verify_on_commit: true,
            lobby_redirect: "/play".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = RetryConfig::default();

        Self {
            mode: env_var("REGISTRATION_MODE")
                .and_then(|v| RegistrationMode::parse(&v))
                .unwrap_or(defaults.mode),
            service_address: env_var("SERVICE_ADDRESS")
                .map(Address::new)
                .unwrap_or(defaults.service_address),
            retry: RetryConfig {
                max_attempts: env_parse("MAX_SUBMIT_ATTEMPTS").unwrap_or(retry_defaults.max_attempts),
                base_delay_ms: env_parse("RETRY_BASE_DELAY_MS").unwrap_or(retry_defaults.base_delay_ms),
                multiplier: retry_defaults.multiplier,
                max_delay_ms: env_parse("RETRY_MAX_DELAY_MS").unwrap_or(retry_defaults.max_delay_ms),
            },
            session_fallback_candidates: env_parse("SESSION_FALLBACK_CANDIDATES")
                .unwrap_or(defaults.session_fallback_candidates),
            auth_validity_ledgers: env_parse("AUTH_VALIDITY_LEDGERS")
                .unwrap_or(defaults.auth_validity_ledgers),
            signature_timeout: env_parse("SIGNATURE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.signature_timeout),
            verify_on_commit: env_var("VERIFY_ON_COMMIT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.verify_on_commit),
            lobby_redirect: env_var("LOBBY_REDIRECT").unwrap_or(defaults.lobby_redirect),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.mode, RegistrationMode::ClientSigned);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.session_fallback_candidates, 48);
        assert!(config.verify_on_commit);
    }

    #[test]
    fn test_retry_delay_growth() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(250));
        assert_eq!(retry.delay_for(2), Duration::from_millis(500));
        assert_eq!(retry.delay_for(3), Duration::from_millis(1_000));
        // Capped
        assert_eq!(retry.delay_for(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_immediate_retry() {
        let retry = RetryConfig::immediate(4);
        assert_eq!(retry.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(RegistrationMode::parse("client_signed"), Some(RegistrationMode::ClientSigned));
        assert_eq!(RegistrationMode::parse(" SERVICE_ONLY "), Some(RegistrationMode::ServiceOnly));
        assert_eq!(RegistrationMode::parse("admin"), None);
    }
}
