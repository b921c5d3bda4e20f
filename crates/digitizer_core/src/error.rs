//! The error type returned by fallible operations across the crate.

/// Everything that can go wrong while configuring, arming, or running an acquisition.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The acquisition was stopped by a caller; not itself an error condition, but surfaced
    /// through the same channel so callers can distinguish a clean stop from a failure.
    #[error("acquisition stopped")]
    Stopped,

    /// A blocking wait was interrupted before data or an error became available.
    #[error("wait interrupted")]
    Interrupted,

    /// The streaming poll loop's watchdog detected that the driver stopped producing samples
    /// at anywhere close to the configured rate.
    #[error("watchdog: sample rate dropped below threshold")]
    Watchdog,

    /// The underlying driver reported a failure.
    #[error("driver error: {message}")]
    DriverError {
        /// Driver-supplied description of the failure.
        message: String,
    },

    /// A configuration value failed validation at `configure`/`start` time.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Human-readable description of which value was invalid and why.
        message: String,
    },

    /// An operation was attempted from a lifecycle state that doesn't permit it.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable description of the expected vs. actual state.
        message: String,
    },

    /// A requested channel, port, or index was out of the configured range.
    #[error("value out of range: {message}")]
    OutOfRange {
        /// Human-readable description of which value and its valid range.
        message: String,
    },

    /// One or more sample chunks were dropped because the pool was exhausted when the driver
    /// tried to claim one. Not itself fatal (§7: "not an error ... surfaced once on the next
    /// successful chunk"), but still logged to the error ring per §4.H so an operator can see it.
    #[error("{count} buffer(s) lost since the previous delivered chunk")]
    BuffersLost {
        /// How many chunks were dropped.
        count: u32,
    },
}

/// The crate's result alias.
pub type Result<T, E = ErrorKind> = std::result::Result<T, E>;
