//! Delivery responses
//!
//! Every message a downstream stage consumes is answered with exactly one
//! [`Response`], in the same order the messages were consumed.

use std::fmt;

/// Outcome of delivering one message downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Delivered, the sender may forget the message
    Ack,

    /// Delivery failed, the sender keeps the message for redelivery
    Failure(String),

    /// Neither ack nor nack; the receiver is a degenerate stage that takes no
    /// responsibility for the message
    Unacknowledged,
}

impl Response {
    /// Build a response from the result of a delivery attempt
    pub fn from_result<E: fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(e) => Self::Failure(e.to_string()),
        }
    }

    /// Build a failure response
    pub fn failure(reason: impl fmt::Display) -> Self {
        Self::Failure(reason.to_string())
    }

    /// The failure description, if this is a failure
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failure(reason) => Some(reason),
            _ => None,
        }
    }

    /// True when the upstream should neither ack nor nack
    pub fn skip_ack(&self) -> bool {
        matches!(self, Self::Unacknowledged)
    }

    /// True for responses that release the message (`Ack` or `Unacknowledged`)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("ack"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
            Self::Unacknowledged => f.write_str("unacknowledged"),
        }
    }
}
