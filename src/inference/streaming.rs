//! Streaming inference support
//!
//! Items sent from the worker thread to a streaming caller.

use crate::inference::session::{FinishReason, SessionError};

/// Represents one event of a streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed; always the last item unless an error was sent
    Done(FinishReason),
    /// Generation failed; sent once, after any fragments produced before the failure
    Error(SessionError),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the text if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&SessionError> {
        match self {
            StreamToken::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Result<String, SessionError>> for StreamToken {
    fn from(item: Result<String, SessionError>) -> Self {
        match item {
            Ok(fragment) => StreamToken::Token(fragment),
            Err(e) => StreamToken::Error(e),
        }
    }
}
