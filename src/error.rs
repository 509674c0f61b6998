//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanError`, for the whole scan
//! orchestrator. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a campaign can hit,
//! from configuration problems to instrument protocol trouble.
//!
//! ## Error Hierarchy
//!
//! `ScanError` consolidates the error sources of a scan:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration
//!   (unknown initial point layout, empty task list, ...). Caught by `validate()`.
//! - **`TransportConnect` / `TransportRejected` / `TransportStatus` / `Transport`**:
//!   Instrument lifecycle failures. Rejections are the only retried kind.
//! - **`Protocol` / `MalformedPayload`**: Replies that do not follow the reply
//!   grammar. The acquisition loop absorbs these; they never stop a campaign.
//! - **`DimensionMismatch` / `UnknownFunction`**: Fatal configuration errors
//!   detected while the campaign is being set up or at the first point of use.
//! - **`Persistence`**: Artifact writing failures. Logged at shutdown, never re-raised.
//!
//! By using `#[from]`, `ScanError` can be created from the underlying error types,
//! keeping the `?` operator usable throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Every failure a campaign can report.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but is inconsistent
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `START` failed, or the instrument could not be reached or described
    #[error("Failed to start instrument: {0}")]
    TransportConnect(String),

    /// The instrument answered a command with `ERROR`
    #[error("Instrument rejected command: {0}")]
    TransportRejected(String),

    /// The instrument stayed busy
    #[error("Instrument not ready: status {0}")]
    TransportStatus(String),

    /// A request could not be delivered or answered
    #[error("Transport error: {0}")]
    Transport(String),

    /// A reply did not follow the line grammar
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A `MEASURE` payload was unreadable or held non-finite values
    #[error("Malformed measurement payload: {0}")]
    MalformedPayload(String),

    /// Two lengths that must agree do not
    #[error("Length mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// What was measured
        what: &'static str,
        /// Required length
        expected: usize,
        /// Actual length
        found: usize,
    },

    /// A configured function name is not registered
    #[error("Unknown {kind} function '{name}'")]
    UnknownFunction {
        /// `reduction`, `acquisition` or `cost`
        kind: &'static str,
        /// The name looked up
        name: String,
    },

    /// The surrogate model failed
    #[error("Surrogate model error: {0}")]
    Model(String),

    /// A campaign artifact could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A blocking model call panicked or was cancelled
    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Config(Box::new(err))
    }
}

impl ScanError {
    /// Returns true for conditions the acquisition loop absorbs and retries on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::Transport(_) | ScanError::Protocol(_) | ScanError::MalformedPayload(_)
        )
    }
}
