//! Error types shared across the instrumentation pipeline.

use thiserror::Error;

use crate::classfile::ClassFileError;
use crate::interceptor::InterceptorId;

/// A mutation attempted after the owning object was frozen.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal state: {0}")]
pub struct IllegalStateError(pub String);

impl IllegalStateError {
    pub fn new(message: impl Into<String>) -> Self {
        IllegalStateError(message.into())
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),
    #[error("interceptor not found: {0}")]
    InterceptorNotFound(InterceptorId),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error("interceptor {type_name} could not be created: {reason}")]
    InterceptorCreation { type_name: String, reason: String },
}

impl InstrumentError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        InstrumentError::NotFound { kind, name: name.into() }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("no class source provides {0}")]
    NoSource(String),
    #[error("defining {class} failed: {reason}")]
    DefineFailed { class: String, reason: String },
    #[error("reading {class} failed: {reason}")]
    Read { class: String, reason: String },
}

/// Failure of a transformer, carrying the class it was applied to.
#[derive(Debug, Error)]
#[error("transform of {class_name} failed")]
pub struct TransformError {
    pub class_name: String,
    #[source]
    pub source: InstrumentError,
}

impl TransformError {
    pub fn new(class_name: impl Into<String>, source: InstrumentError) -> Self {
        Self { class_name: class_name.into(), source }
    }
}

/// Formats an error with its full `source()` chain on one line.
pub fn display_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
