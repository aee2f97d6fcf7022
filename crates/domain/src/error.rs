//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`SensesError`]
//! via `#[from]`. Adapter errors that have no domain meaning are boxed into
//! [`SensesError::Bus`].

/// Base error for every fallible domain and application operation.
#[derive(Debug, thiserror::Error)]
pub enum SensesError {
    /// A value broke a domain invariant.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A device, service or driver lookup failed.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// A registration collided with an existing one.
    #[error(transparent)]
    AlreadyExists(#[from] AlreadyExistsError),

    /// A topic pattern or payload template could not be rendered.
    #[error("template error")]
    Template(#[from] TemplateError),

    /// A payload could not be decoded or encoded.
    #[error("payload error")]
    Decode(#[from] DecodeError),

    /// The message bus failed to deliver a publish or subscribe.
    #[error("message bus error")]
    Bus(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Domain invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("uid must not be empty")]
    EmptyUid,

    #[error("name must not be empty")]
    EmptyName,

    #[error("automation must define at least one action")]
    NoActions,

    #[error("invalid topic pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("invalid device type {0:?}")]
    InvalidDeviceType(String),

    #[error("missing field {0:?}")]
    MissingField(&'static str),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("sun condition needs `before`, `after` or both")]
    EmptySunWindow,
}

/// A lookup by identifier returned nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} {id:?} not found")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// A registration used an identifier that is already taken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} {id:?} already exists")]
pub struct AlreadyExistsError {
    pub entity: &'static str,
    pub id: String,
}

/// Failures while filling a topic pattern or rendering a template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("missing binding {0:?}")]
    MissingBinding(String),

    #[error("cannot fill multi-level wildcard in {0:?}")]
    Wildcard(String),

    #[error("template rendering failed")]
    Render(#[from] minijinja::Error),
}

/// Failures while turning a payload into state fields or back.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json payload")]
    Json(#[from] serde_json::Error),

    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid number {0:?}")]
    Number(String),

    #[error("invalid boolean {0:?}")]
    Boolean(String),

    #[error("route has no template")]
    MissingTemplate,
}

impl SensesError {
    /// Wrap an adapter-specific error as a bus failure.
    pub fn bus(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Bus(Box::new(err))
    }
}
