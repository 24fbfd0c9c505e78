//! Bus error types.

use thiserror::Error;

/// Errors that can occur with the broker client.
#[derive(Error, Debug)]
pub enum BusError {
    /// Connection to the broker failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The account stream does not exist
    #[error("Stream missing for account '{0}'")]
    StreamMissing(String),

    /// A consumer that must be provisioned externally was not found
    #[error("Consumer missing: {0}")]
    ConsumerMissing(String),

    /// Creating or attaching to a consumer failed
    #[error("Consumer setup failed: {0}")]
    ConsumerSetup(String),

    /// A delivered message did not match the expected subject form
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No retained source event to replay
    #[error("No source event found for subject '{0}'")]
    ReplaySourceMissing(String),

    /// A history read passed the triggering message without finding it
    #[error("Unable to find original message with stream sequence {want}, read past it at {have}")]
    BundleOverrun { want: u64, have: u64 },

    /// Reading back sequence history failed
    #[error("Unable to read back messages: {0}")]
    BundleFetch(String),

    /// Publish failed for a reason other than the duplicate fence
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Encoding an outbound payload failed
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// Draining the connection on close failed
    #[error("Drain failed: {0}")]
    DrainFailed(String),

    /// Keyfile could not be read or parsed
    #[error("Invalid keyfile: {0}")]
    Keyfile(String),
}
