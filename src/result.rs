use std::{
    error::Error as StdError,
    fmt::{self, Display},
};

use crate::Kind;

/// The top-level result type for encoding, decoding and
/// evaluating merge operands.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating the ways that encoding,
/// decoding, or resolving merge operands may fail.
///
/// None of these are transient. The same input always fails
/// the same way, so callers should never retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer was truncated or otherwise malformed.
    Corruption {
        /// The byte offset at which decoding gave up.
        at: usize,
        /// What was being decoded.
        what: &'static str,
    },
    /// A version byte did not match the one this crate writes.
    VersionMismatch {
        /// The version this crate understands.
        expected: u8,
        /// The version found in the buffer.
        found: u8,
    },
    /// An operand or operator failed validation before encoding
    /// or registration.
    Validation(String),
    /// An operand named an operator that is not present in the
    /// `Registry`. Usually caused by replicas running different
    /// versions.
    UnregisteredOperator(String),
    /// Two distinct operators were declared under the same name.
    DuplicateOperator(String),
    /// An operator's own `apply` or `combine` function failed.
    Operator {
        /// The operator that failed.
        name: String,
        /// Why it failed.
        reason: String,
    },
    /// A value of one kind was found where the other was required.
    UnexpectedKind {
        /// The kind that was required.
        expected: Kind,
        /// The kind that was found.
        found: Kind,
    },
    /// The accumulated versions for a key violate the merge lineage,
    /// such as a Full value that is not the oldest version.
    Integrity(String),
    /// The system has been used in an unsupported way.
    Unsupported(String),
}

impl Error {
    pub(crate) const fn corruption(at: usize, what: &'static str) -> Error {
        Error::Corruption { at, what }
    }

    /// Constructs the error an operator function returns when it
    /// cannot process its inputs.
    pub fn operator<N, R>(name: N, reason: R) -> Error
    where
        N: Into<String>,
        R: Into<String>,
    {
        Error::Operator { name: name.into(), reason: reason.into() }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Corruption { at, what } => {
                write!(f, "Read corrupted {} at byte offset {}", what, at)
            }
            VersionMismatch { expected, found } => write!(
                f,
                "Unsupported encoding version {}, expected {}",
                found, expected
            ),
            Validation(ref e) => write!(f, "Validation failed: {}", e),
            UnregisteredOperator(ref name) => {
                write!(f, "Operator {:?} is not registered", name)
            }
            DuplicateOperator(ref name) => write!(
                f,
                "Operator {:?} was declared by more than one definition",
                name
            ),
            Operator { ref name, ref reason } => {
                write!(f, "Operator {:?} failed: {}", name, reason)
            }
            UnexpectedKind { expected, found } => write!(
                f,
                "Expected a {:?} value but found a {:?} value",
                expected, found
            ),
            Integrity(ref e) => write!(f, "Merge lineage violated: {}", e),
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
        }
    }
}
