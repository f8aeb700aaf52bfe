use serde_derive::{Deserialize, Serialize};

/// A toyraft error. The engine itself is infallible: errors only surface at
/// the host boundary, e.g. when a command is proposed on a node that isn't
/// the leader or when a configuration is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation must be submitted to the cluster leader. The host should
    /// retry against the leader, if known.
    NotLeader,
    /// Invalid input, e.g. a malformed configuration or node ID.
    InvalidInput(String),
}

/// A toyraft result.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotLeader => write!(f, "not the cluster leader"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
        }
    }
}

impl Error {
    /// Creates an InvalidInput error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }
}

/// Flags an internal invariant violation. This is a bug: debug builds abort,
/// release builds log an error and carry on with the state unchanged.
macro_rules! bug {
    ($($args:tt)*) => {{
        ::log::error!($($args)*);
        debug_assert!(false, $($args)*);
    }};
}

pub(crate) use bug;
