use std::fmt;
use thiserror::Error as ThisError;

///
/// PipelineError
///
/// Structured runtime error with a stable classification, so the pipeline
/// driver can tell "bad input or configuration" apart from "engine failure"
/// without parsing messages.
///

#[derive(Debug, ThisError)]
#[error("{origin}:{class}: {message}")]
pub struct PipelineError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,
}

impl PipelineError {
    /// Construct an error with an explicit classification.
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
        }
    }

    /// Construct a store-class error (statement preparation, stepping,
    /// connection open/close).
    pub fn store(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Store, origin, message)
    }

    /// Construct a configuration-class error (invalid identifier tokens,
    /// missing seeds, unresolvable modules, malformed lookups).
    pub fn config(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Configuration, origin, message)
    }

    /// Construct an invariant-class error (structural violations that must
    /// never be skipped silently).
    pub fn invariant(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Invariant, origin, message)
    }

    /// Wrap an engine failure, keeping the underlying message.
    pub fn from_sqlite(origin: ErrorOrigin, err: &rusqlite::Error) -> Self {
        Self::store(origin, err.to_string())
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        self.class
    }

    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self.class, ErrorClass::Store)
    }

    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self.class, ErrorClass::Configuration)
    }

    #[must_use]
    pub const fn is_invariant(&self) -> bool {
        matches!(self.class, ErrorClass::Invariant)
    }
}

///
/// ErrorClass
/// Failure taxonomy surfaced to the pipeline driver.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The relational engine failed (prepare, step, open, close).
    Store,
    /// The caller supplied bad input or configuration.
    Configuration,
    /// A structural invariant of the event model was violated.
    Invariant,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Store => "store",
            Self::Configuration => "configuration",
            Self::Invariant => "invariant",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Component taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Connection,
    Functions,
    Prng,
    Loader,
    PvFinder,
    Selector,
    PvReconstruction,
    Plugin,
    Table,
    Maintenance,
    Pipeline,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connection => "connection",
            Self::Functions => "functions",
            Self::Prng => "prng",
            Self::Loader => "loader",
            Self::PvFinder => "pv_finder",
            Self::Selector => "selector",
            Self::PvReconstruction => "pv_reconstruction",
            Self::Plugin => "plugin",
            Self::Table => "table",
            Self::Maintenance => "maintenance",
            Self::Pipeline => "pipeline",
        };
        write!(f, "{label}")
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_origin_and_class() {
        let err = PipelineError::config(ErrorOrigin::Plugin, "bad token: 'a-b'");
        assert_eq!(err.to_string(), "plugin:configuration: bad token: 'a-b'");
    }

    #[test]
    fn class_predicates_are_disjoint() {
        let store = PipelineError::store(ErrorOrigin::Connection, "prepare failed");
        assert!(store.is_store());
        assert!(!store.is_configuration());
        assert!(!store.is_invariant());

        let invariant = PipelineError::invariant(ErrorOrigin::Selector, "missing particle");
        assert!(invariant.is_invariant());
        assert!(!invariant.is_store());
    }
}
