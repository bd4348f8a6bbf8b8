use std::thread::sleep;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{RemoteError, RetryError};

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// MediaWiki API error codes worth another attempt: load shedding, or an expired token
/// that the client drops and fetches again.
const TRANSIENT_API_CODES: &[&str] =
    &["maxlag", "ratelimited", "readonly", "throttled", "badtoken"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff_factor: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay slept after the failed attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(exponent);
        let millis = u64::try_from(self.initial_delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay.max(self.initial_delay))
    }

    /// Run `call` until it succeeds, fails terminally, or the attempt budget is spent.
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, RemoteError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(RemoteError::Terminal(message)) => {
                    return Err(RetryError::Terminal {
                        operation: operation.to_string(),
                        message,
                    });
                }
                Err(RemoteError::Transient(message)) => {
                    last_error = message;
                    if attempt + 1 < attempts {
                        let delay = self.delay_for(attempt);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %last_error,
                            "transient failure, retrying"
                        );
                        sleep(delay);
                    }
                }
            }
        }
        debug!(operation, attempts, "retry budget exhausted");
        Err(RetryError::RetryExhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub fn classify_status(status: StatusCode, context: &str) -> RemoteError {
    let message = format!("{context}: HTTP {status}");
    if is_transient_status(status) {
        RemoteError::Transient(message)
    } else {
        RemoteError::Terminal(message)
    }
}

pub fn classify_transport(error: &reqwest::Error, context: &str) -> RemoteError {
    let message = format!("{context}: {error}");
    if error.is_timeout()
        || error.is_connect()
        || error.is_request()
        || error.is_body()
        || error.is_decode()
    {
        RemoteError::Transient(message)
    } else {
        RemoteError::Terminal(message)
    }
}

pub fn classify_api_error(code: &str, info: &str) -> RemoteError {
    let message = format!("API error [{code}]: {info}");
    if TRANSIENT_API_CODES.contains(&code) || code.starts_with("internal_api_error") {
        RemoteError::Transient(message)
    } else {
        RemoteError::Terminal(message)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{RetryPolicy, classify_api_error, classify_status, is_transient_status};
    use crate::error::{RemoteError, RetryError};

    #[test]
    fn transient_failures_are_retried_until_success() {
        let policy = RetryPolicy::immediate(4);
        let calls = Cell::new(0);
        let result = policy.run("query", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(RemoteError::transient("HTTP 503"))
            } else {
                Ok("payload")
            }
        });
        assert_eq!(result, Ok("payload"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn terminal_failures_are_not_retried() {
        let policy = RetryPolicy::immediate(4);
        let calls = Cell::new(0);
        let result: Result<(), RetryError> = policy.run("write", || {
            calls.set(calls.get() + 1);
            Err(RemoteError::terminal("HTTP 403"))
        });
        assert_eq!(
            result,
            Err(RetryError::Terminal {
                operation: "write".to_string(),
                message: "HTTP 403".to_string(),
            })
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn persistent_transient_failure_exhausts_the_budget() {
        let policy = RetryPolicy::immediate(3);
        let calls = Cell::new(0);
        let result: Result<(), RetryError> = policy.run("query", || {
            calls.set(calls.get() + 1);
            Err(RemoteError::transient("connection reset"))
        });
        let error = result.expect_err("must exhaust");
        assert!(error.is_exhausted());
        assert_eq!(calls.get(), 3);
        assert!(error.to_string().contains("gave up after 3 attempts"));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn statuses_and_api_codes_are_classified() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "query").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "query").is_transient());
        assert!(classify_api_error("maxlag", "lagged").is_transient());
        assert!(!classify_api_error("modification-failed", "exists").is_transient());
    }
}
