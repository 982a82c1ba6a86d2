/// Crate-wide error type carrying the failure taxonomy used across the
/// replay pipeline.
use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::r#const::{MAX_RETRIES, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Api,
    Timeout,
    Config,
    Initialization,
    Validation,
    Encoding,
    Decoding,
    Parsing,
    Mutation,
    Execution,
    Storage,
    Contract,
    NotFound,
    Access,
    Quota,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Api => "api",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Config => "config",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Validation => "validation",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Decoding => "decoding",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Mutation => "mutation",
            ErrorKind::Execution => "execution",
            ErrorKind::Storage => "storage",
            ErrorKind::Contract => "contract",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Access => "access",
            ErrorKind::Quota => "quota",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error, one kind. The context map carries stage-specific detail
/// (tx hash, contract address, slot...) without growing the type.
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct ReplayError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub context: HashMap<String, String>,
    pub timestamp: u64,
    pub recoverable: bool,
    pub suggestion: Option<String>,
}

impl ReplayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            context: HashMap::new(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            recoverable: matches!(
                kind,
                ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Api
            ),
            suggestion: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
            .with_suggestion("check RPC endpoint availability and retry")
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Api, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_suggestion("increase the operation deadline")
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decoding, message)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message)
    }

    pub fn mutation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mutation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Eligible for the backoff loop: transient kinds, flagged recoverable.
    pub fn is_retryable(&self) -> bool {
        self.recoverable
            && matches!(
                self.kind,
                ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Api
            )
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;

/// Retry `op` with exponential backoff `base * 2^n`, capped at
/// [`RETRY_MAX_DELAY_MS`]. Non-retryable errors abort immediately.
pub fn retry_with_backoff<T, F>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let delay = (RETRY_BASE_DELAY_MS << attempt).min(RETRY_MAX_DELAY_MS);
                warn!(
                    "{} failed ({}), retrying in {}ms (attempt {}/{})",
                    label,
                    e,
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
