//! Error types for SQLObject operations.

use std::fmt;

/// The primary error type for all SQLObject operations.
#[derive(Debug)]
pub enum Error {
    /// Unknown or ambiguous field, class, or collection name
    SchemaResolution(SchemaResolutionError),
    /// The query uses a construct the compiler cannot lower
    UnsupportedQueryFeature(UnsupportedFeatureError),
    /// A key has no backing row
    ObjectNotFound(ObjectNotFoundError),
    /// A non-nullable field is null at commit validation
    NullConstraint(NullConstraintError),
    /// A cycle runs through non-nullable references only
    CyclicReference(CyclicReferenceError),
    /// Primary key set twice, double registration, cross-transaction use
    ConcurrentMutation(ConcurrentMutationError),
    /// Wrapped data source failure
    Backend(BackendError),
    /// Invalid schema definition
    Schema(SchemaError),
    /// Value cannot be coerced to the declared type
    Type(TypeError),
    /// A trigger failed
    Hook(HookError),
    /// Change-log encoding/decoding errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Flat error category, for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaResolution,
    UnsupportedQueryFeature,
    ObjectNotFound,
    NullConstraint,
    CyclicReference,
    ConcurrentMutation,
    Backend,
    Schema,
    Type,
    Hook,
    Serde,
    Custom,
}

#[derive(Debug, Clone)]
pub struct SchemaResolutionError {
    /// The path segment or name that failed to resolve
    pub segment: String,
    /// Class, alias or scope the lookup was performed in
    pub container: String,
    pub ambiguous: bool,
}

#[derive(Debug, Clone)]
pub struct UnsupportedFeatureError {
    pub feature: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ObjectNotFoundError {
    pub class: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct NullConstraintError {
    pub class: String,
    pub key: String,
    pub field: String,
}

#[derive(Debug, Clone)]
pub struct CyclicReferenceError {
    pub class: String,
    pub key: String,
    pub field: String,
}

#[derive(Debug, Clone)]
pub struct ConcurrentMutationError {
    pub class: String,
    pub message: String,
}

#[derive(Debug)]
pub struct BackendError {
    pub message: String,
    /// Statement text the failure was reported for
    pub statement: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Parent class not declared
    UnknownParent,
    /// Reference target class not declared
    UnknownReference,
    /// Field declared twice in one class chain
    DuplicateField,
    /// Class declared twice
    DuplicateClass,
    /// Class without a primary key
    MissingPrimaryKey,
    /// Any other invalid declaration
    Invalid,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

#[derive(Debug)]
pub struct HookError {
    pub class: String,
    pub key: String,
    pub field: Option<String>,
    pub source: Box<Error>,
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaResolution(_) => ErrorKind::SchemaResolution,
            Error::UnsupportedQueryFeature(_) => ErrorKind::UnsupportedQueryFeature,
            Error::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            Error::NullConstraint(_) => ErrorKind::NullConstraint,
            Error::CyclicReference(_) => ErrorKind::CyclicReference,
            Error::ConcurrentMutation(_) => ErrorKind::ConcurrentMutation,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Schema(_) => ErrorKind::Schema,
            Error::Type(_) => ErrorKind::Type,
            Error::Hook(_) => ErrorKind::Hook,
            Error::Serde(_) => ErrorKind::Serde,
            Error::Custom(_) => ErrorKind::Custom,
        }
    }

    /// Innermost error kind, looking through hook wrappers.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Error::Hook(h) => h.source.root_kind(),
            other => other.kind(),
        }
    }

    /// Get the statement that caused this error, if available
    pub fn statement(&self) -> Option<&str> {
        match self {
            Error::Backend(b) => b.statement.as_deref(),
            Error::Hook(h) => h.source.statement(),
            _ => None,
        }
    }

    pub fn unresolved(segment: impl Into<String>, container: impl Into<String>) -> Self {
        Error::SchemaResolution(SchemaResolutionError {
            segment: segment.into(),
            container: container.into(),
            ambiguous: false,
        })
    }

    pub fn ambiguous(segment: impl Into<String>, container: impl Into<String>) -> Self {
        Error::SchemaResolution(SchemaResolutionError {
            segment: segment.into(),
            container: container.into(),
            ambiguous: true,
        })
    }

    pub fn unsupported(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Error::UnsupportedQueryFeature(UnsupportedFeatureError {
            feature: feature.into(),
            message: message.into(),
        })
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend(BackendError {
            message: message.into(),
            statement: None,
            source: None,
        })
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    pub fn concurrent(class: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConcurrentMutation(ConcurrentMutationError {
            class: class.into(),
            message: message.into(),
        })
    }

    /// Attach statement context to a backend error that lacks it.
    pub fn with_statement(self, sql: &str) -> Self {
        match self {
            Error::Backend(mut b) if b.statement.is_none() => {
                b.statement = Some(sql.to_string());
                Error::Backend(b)
            }
            other => other,
        }
    }
}

impl BackendError {
    /// Wrap a driver error.
    pub fn wrap(
        err: impl std::error::Error + Send + Sync + 'static,
        statement: Option<&str>,
    ) -> Self {
        Self {
            message: err.to_string(),
            statement: statement.map(str::to_string),
            source: Some(Box::new(err)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SchemaResolution(e) => write!(f, "Schema resolution error: {}", e),
            Error::UnsupportedQueryFeature(e) => write!(f, "Unsupported query feature: {}", e),
            Error::ObjectNotFound(e) => write!(f, "Object not found: {}", e),
            Error::NullConstraint(e) => write!(f, "Null constraint violation: {}", e),
            Error::CyclicReference(e) => write!(f, "Cyclic reference: {}", e),
            Error::ConcurrentMutation(e) => write!(f, "Concurrent mutation: {}", e),
            Error::Backend(e) => {
                if let Some(sql) = &e.statement {
                    write!(f, "Backend error: {} (statement: {})", e.message, sql)
                } else {
                    write!(f, "Backend error: {}", e.message)
                }
            }
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Hook(e) => write!(f, "Hook error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Backend(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Hook(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ambiguous {
            write!(
                f,
                "'{}' is ambiguous in {}; qualify it with an alias",
                self.segment, self.container
            )
        } else {
            write!(f, "'{}' cannot be resolved in {}", self.segment, self.container)
        }
    }
}

impl fmt::Display for UnsupportedFeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.feature, self.message)
    }
}

impl fmt::Display for ObjectNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with key {}", self.class, self.key)
    }
}

impl fmt::Display for NullConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} is null on {} {}", self.class, self.field, self.class, self.key)
    }
}

impl fmt::Display for CyclicReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} closes a cycle through non-nullable reference '{}'",
            self.class, self.key, self.field
        )
    }
}

impl fmt::Display for ConcurrentMutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "trigger on {}.{} ({}) failed: {}",
                self.class, field, self.key, self.source
            ),
            None => write!(
                f,
                "trigger on {} ({}) failed: {}",
                self.class, self.key, self.source
            ),
        }
    }
}

impl From<SchemaResolutionError> for Error {
    fn from(err: SchemaResolutionError) -> Self {
        Error::SchemaResolution(err)
    }
}

impl From<UnsupportedFeatureError> for Error {
    fn from(err: UnsupportedFeatureError) -> Self {
        Error::UnsupportedQueryFeature(err)
    }
}

impl From<ObjectNotFoundError> for Error {
    fn from(err: ObjectNotFoundError) -> Self {
        Error::ObjectNotFound(err)
    }
}

impl From<NullConstraintError> for Error {
    fn from(err: NullConstraintError) -> Self {
        Error::NullConstraint(err)
    }
}

impl From<CyclicReferenceError> for Error {
    fn from(err: CyclicReferenceError) -> Self {
        Error::CyclicReference(err)
    }
}

impl From<ConcurrentMutationError> for Error {
    fn from(err: ConcurrentMutationError) -> Self {
        Error::ConcurrentMutation(err)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<HookError> for Error {
    fn from(err: HookError) -> Self {
        Error::Hook(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for SQLObject operations.
pub type Result<T> = std::result::Result<T, Error>;
