//! Library error types.

use std::fmt;
use std::sync::Arc;

use serde::{de, ser};

/// A shape-pack Result, normally returning a shape-pack [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A shape-pack error. Encompasses any issue that can happen during shape
/// registration, encoding, or decoding.
#[derive(Clone, Debug)]
pub enum Error {
    /// The byte source drained in the middle of a token or structure.
    EndOfStream,
    /// A wire byte doesn't correspond to any valid token in the expected
    /// context (the reserved 0xc1, or an alias token of the wrong kind).
    InvalidCode(u8),
    /// A wire integer can't fit the requested target type.
    Overflow {
        /// Name of the target type the value wouldn't fit into
        target: &'static str,
    },
    /// The nesting depth budget fell below zero.
    DepthExceeded,
    /// A typed read was attempted against the wrong kind of token. This is a
    /// recoverable state within the streaming reader; it only surfaces as an
    /// error through the throwing facade.
    TokenMismatch {
        /// What the caller asked for
        expected: &'static str,
        /// The token family actually present
        found: &'static str,
    },
    /// A constructor parameter was assigned twice within one object read.
    DoubleAssignment {
        /// The colliding parameter name
        property: String,
    },
    /// Nil was read for a non-nullable constructor parameter.
    DisallowedNull {
        /// The parameter that rejected nil
        property: String,
    },
    /// An object graph cycle was seen while cycles are disallowed.
    CycleDetected,
    /// A required property was absent from the input.
    MissingRequired {
        /// The missing parameter name
        property: String,
    },
    /// A union tag didn't match any registered alias.
    UnknownUnionAlias(String),
    /// The operation's cancellation signal tripped.
    Canceled,
    /// Shape registration detected an illegal combination. Raised when the
    /// converter is built, never during encode/decode.
    Config(String),
    /// The payload content itself is malformed: invalid UTF-8, an unknown
    /// enum member name, a bad extension payload length, ragged
    /// multi-dimensional data.
    BadData(String),
    /// The underlying byte sink or source failed.
    Io(Arc<std::io::Error>),
    /// An error raised inside a property read/write, wrapped with the
    /// declaring type and property names. The inner error is the cause.
    InProperty {
        /// Name of the object shape being read or written
        type_name: String,
        /// Name of the property whose converter failed
        property: String,
        /// The underlying failure
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the object shape and property it was raised in.
    /// Cancellation propagates unwrapped.
    pub(crate) fn in_property(self, type_name: &str, property: &str) -> Error {
        match self {
            Error::Canceled => Error::Canceled,
            err => Error::InProperty {
                type_name: type_name.to_string(),
                property: property.to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::EndOfStream => write!(f, "Byte source ended in the middle of a value"),
            Error::InvalidCode(code) => {
                write!(f, "Byte 0x{:02x} is not a valid token here", code)
            }
            Error::Overflow { target } => {
                write!(f, "Integer on the wire does not fit in {}", target)
            }
            Error::DepthExceeded => write!(f, "Value nesting exceeded the depth budget"),
            Error::TokenMismatch { expected, found } => {
                write!(f, "Expected a {} token, but found {}", expected, found)
            }
            Error::DoubleAssignment { ref property } => {
                write!(f, "Parameter \"{}\" was assigned twice", property)
            }
            Error::DisallowedNull { ref property } => {
                write!(f, "Nil is not allowed for parameter \"{}\"", property)
            }
            Error::CycleDetected => write!(f, "Object cycle detected"),
            Error::MissingRequired { ref property } => {
                write!(f, "Required property \"{}\" was absent", property)
            }
            Error::UnknownUnionAlias(ref alias) => {
                write!(f, "No union case registered for alias {}", alias)
            }
            Error::Canceled => write!(f, "Operation was canceled"),
            Error::Config(ref err) => write!(f, "Bad shape registration: {}", err),
            Error::BadData(ref err) => write!(f, "Malformed payload: {}", err),
            Error::Io(ref err) => write!(f, "I/O failure: {}", err),
            Error::InProperty {
                ref type_name,
                ref property,
                ..
            } => write!(f, "Failure in {}.{}", type_name, property),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err.as_ref()),
            Error::InProperty { ref source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::BadData(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::BadData(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn property_wrap_keeps_cause() {
        let inner = Error::Overflow { target: "u8" };
        let wrapped = inner.in_property("Point", "x");
        match wrapped {
            Error::InProperty {
                ref type_name,
                ref property,
                ..
            } => {
                assert_eq!(type_name, "Point");
                assert_eq!(property, "x");
            }
            ref other => panic!("Expected InProperty, got {:?}", other),
        }
        let cause = wrapped.source().expect("wrapped error should have a cause");
        assert!(cause.to_string().contains("u8"));
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        match Error::Canceled.in_property("Point", "x") {
            Error::Canceled => (),
            other => panic!("Canceled should propagate unwrapped, got {:?}", other),
        }
    }
}
