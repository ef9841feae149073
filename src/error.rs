pub use anyhow::Result;

use serde::Serialize;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

/// Compile-time failure classes.
///
/// The runtime-only classes (missing tuple view, missing routine, driver
/// errors) never originate here; the client maps those from driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The model contains a construct the compiler cannot lower.
    InvalidModel,
    /// The implied-by graph of a relation contains a cycle.
    CyclicSchema,
    /// A relation's userset chain exceeds the configured depth ceiling.
    DepthExceeded,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub reason: Reason,
    pub help: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Reason {
    Simple(String),
    /// A construct was found somewhere it cannot be lowered from.
    Unsupported {
        construct: String,
        within: String,
    },
    /// A cycle through the named relations.
    Cycle {
        object_type: String,
        path: Vec<String>,
    },
}

impl Error {
    pub fn new(kind: ErrorKind, reason: Reason) -> Self {
        Error {
            kind,
            reason,
            help: None,
        }
    }

    pub fn simple<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Error::new(kind, Reason::Simple(message.into()))
    }

    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }
}

// Needed for anyhow
impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason.message())
    }
}

impl Reason {
    pub fn message(&self) -> String {
        match self {
            Reason::Simple(text) => text.clone(),
            Reason::Unsupported { construct, within } => {
                format!("cannot lower {construct} within {within}")
            }
            Reason::Cycle { object_type, path } => {
                format!(
                    "cyclic relation graph on type `{object_type}`: {}",
                    path.join(" -> ")
                )
            }
        }
    }
}

/// User-facing form of an [Error], as returned from the top-level wrappers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    /// Failure class, stable across releases.
    pub kind: Option<ErrorKind>,
    /// Plain text of the error
    pub reason: String,
    /// A list of suggestions of how to fix the error
    pub hint: Option<String>,
}

impl Display for ErrorMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)?;
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessages {
    pub inner: Vec<ErrorMessage>,
}

impl From<ErrorMessage> for ErrorMessages {
    fn from(e: ErrorMessage) -> Self {
        ErrorMessages { inner: vec![e] }
    }
}

impl Display for ErrorMessages {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for e in &self.inner {
            Display::fmt(&e, f)?;
        }
        Ok(())
    }
}

impl StdError for ErrorMessages {}

impl ErrorMessages {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

pub fn downcast(error: anyhow::Error) -> ErrorMessages {
    let error = match error.downcast::<ErrorMessages>() {
        Ok(messages) => return messages,
        Err(error) => error,
    };

    let message = match error.downcast::<Error>() {
        Ok(error) => ErrorMessage {
            kind: Some(error.kind),
            reason: error.reason.message(),
            hint: error.help,
        },
        Err(error) => ErrorMessage {
            kind: None,
            // default to basic Display
            reason: format!("{:#?}", error),
            hint: None,
        },
    };

    message.into()
}

pub trait WithErrorInfo {
    fn with_help<S: Into<String>>(self, help: S) -> Self;
}

impl<T> WithErrorInfo for Result<T, Error> {
    fn with_help<S: Into<String>>(self, help: S) -> Self {
        self.map_err(|e| e.with_help(help))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::simple(ErrorKind::InvalidModel, "condition on subject ref");
        assert_eq!(e.to_string(), "invalid_model: condition on subject ref");

        let e = Error::new(
            ErrorKind::CyclicSchema,
            Reason::Cycle {
                object_type: "doc".to_string(),
                path: vec![
                    "viewer".to_string(),
                    "editor".to_string(),
                    "viewer".to_string(),
                ],
            },
        );
        assert_eq!(
            e.to_string(),
            "cyclic_schema: cyclic relation graph on type `doc`: viewer -> editor -> viewer"
        );
    }

    #[test]
    fn test_downcast_carries_kind_and_hint() {
        let err = anyhow::Error::from(
            Error::simple(ErrorKind::DepthExceeded, "userset chain of length 26")
                .with_help("flatten the nesting or raise the depth ceiling"),
        );
        let messages = downcast(err);
        let only = &messages.inner[0];
        assert_eq!(only.kind, Some(ErrorKind::DepthExceeded));
        assert!(only.hint.is_some());
    }
}
