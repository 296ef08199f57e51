use thiserror::Error;

/// Errors returned by the [`ProxyRouter`](crate::ProxyRouter).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Channels are addressed by name, an empty one can never be matched.
    #[error("channel name must not be empty")]
    EmptyChannel,
}
