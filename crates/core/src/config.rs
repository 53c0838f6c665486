//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the engine. Core
//! never reads environment variables itself; binaries read them and hand the raw values to
//! the `*_from_env_value(s)` helpers here.

use crate::constants::{
    DEFAULT_MAX_REFERENCE_DEPTH, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_STORE_DIR,
};
use crate::retry::{Backoff, RetryPolicy};
use crate::{EngineError, EngineResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Where canonical records are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    /// Sharded JSON files under a local directory.
    Directory(PathBuf),
    /// A remote FHIR REST server.
    Http(Url),
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    store: StoreTarget,
    retry: RetryPolicy,
    request_timeout: Duration,
    max_reference_depth: usize,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for a zero request timeout or reference depth.
    pub fn new(
        store: StoreTarget,
        retry: RetryPolicy,
        request_timeout: Duration,
        max_reference_depth: usize,
    ) -> EngineResult<Self> {
        if request_timeout.is_zero() {
            return Err(EngineError::Config(
                "request timeout must be greater than zero".into(),
            ));
        }
        if max_reference_depth == 0 {
            return Err(EngineError::Config(
                "maximum reference depth must be at least 1".into(),
            ));
        }
        Ok(Self {
            store,
            retry,
            request_timeout,
            max_reference_depth,
        })
    }

    /// Defaults with the given store.
    pub fn with_store(store: StoreTarget) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_reference_depth: DEFAULT_MAX_REFERENCE_DEPTH,
        }
    }

    pub fn store(&self) -> &StoreTarget {
        &self.store
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_reference_depth(&self) -> usize {
        self.max_reference_depth
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: FromStr>(name: &str, value: Option<String>) -> EngineResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    non_blank(value)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| EngineError::Config(format!("{name}='{v}': {e}")))
        })
        .transpose()
}

/// Resolves the store from `TIE_STORE_URL` and `TIE_STORE_DIR` values.
///
/// A URL selects the HTTP store, a directory the file store; setting both is an error.
/// With neither, the file store at [`DEFAULT_STORE_DIR`] is used.
pub fn store_target_from_env_values(
    url: Option<String>,
    dir: Option<String>,
) -> EngineResult<StoreTarget> {
    match (non_blank(url), non_blank(dir)) {
        (Some(_), Some(_)) => Err(EngineError::Config(
            "TIE_STORE_URL and TIE_STORE_DIR are mutually exclusive".into(),
        )),
        (Some(url), None) => {
            let parsed = Url::parse(&url)
                .map_err(|e| EngineError::Config(format!("TIE_STORE_URL='{url}': {e}")))?;
            match parsed.scheme() {
                "http" | "https" => Ok(StoreTarget::Http(parsed)),
                other => Err(EngineError::Config(format!(
                    "TIE_STORE_URL must be http or https, got {other}"
                ))),
            }
        }
        (None, Some(dir)) => Ok(StoreTarget::Directory(PathBuf::from(dir))),
        (None, None) => Ok(StoreTarget::Directory(PathBuf::from(DEFAULT_STORE_DIR))),
    }
}

/// Builds the retry policy from `TIE_RETRY_ATTEMPTS`, `TIE_RETRY_BACKOFF_MS` and
/// `TIE_RETRY_BACKOFF_MAX_MS` values.
///
/// Without a backoff value the policy retries immediately. The maximum defaults to eight
/// times the initial delay.
pub fn retry_policy_from_env_values(
    attempts: Option<String>,
    backoff_ms: Option<String>,
    backoff_max_ms: Option<String>,
) -> EngineResult<RetryPolicy> {
    let attempts = parse_number::<u32>("TIE_RETRY_ATTEMPTS", attempts)?
        .unwrap_or(DEFAULT_RETRY_ATTEMPTS);
    if attempts == 0 {
        return Err(EngineError::Config(
            "TIE_RETRY_ATTEMPTS must be at least 1".into(),
        ));
    }

    let initial = parse_number::<u64>("TIE_RETRY_BACKOFF_MS", backoff_ms)?;
    let max = parse_number::<u64>("TIE_RETRY_BACKOFF_MAX_MS", backoff_max_ms)?;
    let backoff = match (initial, max) {
        (None | Some(0), _) => Backoff::None,
        (Some(initial), max) => {
            let max = max.unwrap_or(initial.saturating_mul(8));
            if max < initial {
                return Err(EngineError::Config(
                    "TIE_RETRY_BACKOFF_MAX_MS must not be below TIE_RETRY_BACKOFF_MS".into(),
                ));
            }
            Backoff::Exponential {
                initial: Duration::from_millis(initial),
                max: Duration::from_millis(max),
            }
        }
    };
    Ok(RetryPolicy::new(attempts, backoff))
}

/// Parses `TIE_REQUEST_TIMEOUT_MS`.
pub fn request_timeout_from_env_value(value: Option<String>) -> EngineResult<Duration> {
    let ms = parse_number::<u64>("TIE_REQUEST_TIMEOUT_MS", value)?
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
    Ok(Duration::from_millis(ms))
}

/// Parses `TIE_MAX_REFERENCE_DEPTH`.
pub fn max_reference_depth_from_env_value(value: Option<String>) -> EngineResult<usize> {
    Ok(parse_number::<usize>("TIE_MAX_REFERENCE_DEPTH", value)?
        .unwrap_or(DEFAULT_MAX_REFERENCE_DEPTH))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn store_target_selection() {
        assert_eq!(
            store_target_from_env_values(None, None).expect("default"),
            StoreTarget::Directory(PathBuf::from(DEFAULT_STORE_DIR))
        );
        assert_eq!(
            store_target_from_env_values(some(" "), some("/data/store")).expect("dir"),
            StoreTarget::Directory(PathBuf::from("/data/store"))
        );
        assert!(matches!(
            store_target_from_env_values(some("https://store.example/fhir"), None),
            Ok(StoreTarget::Http(_))
        ));
        assert!(store_target_from_env_values(some("https://a"), some("/b")).is_err());
        assert!(store_target_from_env_values(some("ftp://a/"), None).is_err());
    }

    #[test]
    fn retry_policy_defaults_match_three_immediate_attempts() {
        let policy = retry_policy_from_env_values(None, None, None).expect("default");
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff(), Backoff::None);
    }

    #[test]
    fn retry_policy_with_backoff() {
        let policy = retry_policy_from_env_values(some("5"), some("100"), None).expect("policy");
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(
            policy.backoff(),
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(800),
            }
        );
        assert!(retry_policy_from_env_values(some("0"), None, None).is_err());
        assert!(retry_policy_from_env_values(some("three"), None, None).is_err());
        assert!(retry_policy_from_env_values(None, some("100"), some("50")).is_err());
    }

    #[test]
    fn numeric_values_and_validation() {
        assert_eq!(
            request_timeout_from_env_value(None).expect("default"),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
        assert_eq!(max_reference_depth_from_env_value(some("4")).expect("depth"), 4);
        assert!(CoreConfig::new(
            StoreTarget::Directory(PathBuf::from("x")),
            RetryPolicy::default(),
            Duration::ZERO,
            16
        )
        .is_err());
        assert!(CoreConfig::new(
            StoreTarget::Directory(PathBuf::from("x")),
            RetryPolicy::default(),
            Duration::from_secs(1),
            0
        )
        .is_err());
    }
}
