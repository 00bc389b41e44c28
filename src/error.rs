use thiserror::Error;

/// Failure of a single request through the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// The request never reached the server, or the response never arrived
  #[error("network error: {0}")]
  Network(String),

  /// The server answered with a non-2xx status
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },

  /// A 2xx body that could not be read as the requested type
  #[error("unexpected response body: {0}")]
  Decode(String),

  /// An id that cannot be used as a path segment; nothing was sent
  #[error("invalid id {0:?}")]
  InvalidId(String),
}

/// Why a mutation did not go through.
///
/// Network and server errors roll back the optimistic value. Validation errors
/// are raised before anything touches the cache or the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
  #[error("network error: {0}")]
  Network(String),

  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },

  #[error("{0}")]
  Validation(String),

  /// The cached value had a different type than the transform expected
  #[error(transparent)]
  Cache(#[from] CacheError),
}

impl MutationError {
  /// Short text suitable for a toast.
  pub fn user_message(&self) -> String {
    match self {
      Self::Network(_) => "Couldn't reach Vibely. Check your connection and try again.".to_string(),
      Self::Server { status, message } if message.is_empty() => {
        format!("Something went wrong ({})", status)
      }
      Self::Server { message, .. } => message.clone(),
      Self::Validation(message) => message.clone(),
      Self::Cache(_) => "Something went wrong".to_string(),
    }
  }
}

impl From<ApiError> for MutationError {
  fn from(err: ApiError) -> Self {
    match err {
      ApiError::Network(msg) => Self::Network(msg),
      ApiError::Server { status, message } => Self::Server { status, message },
      // Mutations read bodies leniently; an unreadable body here means the
      // exchange itself broke down.
      ApiError::Decode(msg) => Self::Network(msg),
      ApiError::InvalidId(id) => Self::Validation(format!("Invalid id \"{}\"", id)),
    }
  }
}

/// Why the push channel stopped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
  /// The server rejected our credentials; reconnecting will not help
  #[error("authentication rejected: {0}")]
  Auth(String),

  #[error("invalid realtime URL: {0}")]
  InvalidUrl(String),

  /// Reconnect attempts ran out
  #[error("gave up after {attempts} reconnect attempts")]
  Exhausted { attempts: u32 },
}

/// Misuse of the cache itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
  #[error("cached value at {key} is not a {expected}")]
  TypeMismatch { key: String, expected: &'static str },
}
