use thiserror::Error;

/// Reasons a single `/register` call is refused. These are local to the
/// offending request and never abort the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The identity already has an entry; bound ports never change.
    #[error("duplicate registration for {0}")]
    Duplicate(String),

    /// The body did not decode into a well-formed bound worker.
    #[error("malformed registration payload: {0}")]
    Malformed(String),

    /// The identity (or its traffic type) is not part of this fleet.
    #[error("unexpected registration: {0}")]
    Unexpected(String),
}

impl RegistrationError {
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::Malformed(reason.into())
    }
}
