//! Structured error types for the conductor.
//!
//! Each failure class has its own pattern-matchable type instead of a generic
//! `anyhow::Error`:
//!
//! - [`AdmissionError`] - surfaced synchronously by `submit`, nothing queued
//! - [`BeatError`] - caught at the beat boundary, recorded in the execution context
//! - [`SequenceError`] - terminates the current execution, draining continues
//! - [`MountError`] - returned inside a `MountResult`, never thrown
//! - [`ResourceTransferError`] - an interrupt that could not re-acquire
//! - [`ManifestError`] - manifest or module loading failed
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the bus boundary.**
//!
//! Handlers return `anyhow::Result` for ergonomics; the executor flattens
//! those into [`BeatError`] messages before anything is published as
//! telemetry. Telemetry carries an [`ErrorCategory`] and a message, never the
//! raw error chain.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{Priority, RequestId};

// =============================================================================
// Error Category
// =============================================================================

/// Category used when a failure is reported outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input - safe to expose details.
    Validation,
    /// Unknown sequence, plugin or request - safe to expose.
    NotFound,
    /// Another request owns the resource - safe to expose.
    Conflict,
    /// Execution was cancelled by a caller.
    Cancelled,
    /// Handler or engine fault.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

/// Errors that can be categorized for telemetry.
pub trait Categorizable: std::error::Error {
    /// The category reported alongside this error.
    fn category(&self) -> ErrorCategory;

    /// A message that is safe to publish on the bus.
    fn safe_message(&self) -> Cow<'static, str>;
}

// =============================================================================
// Admission
// =============================================================================

/// A submission was refused before anything was queued.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// No mounted plugin registered this sequence id.
    #[error("sequence not found: {sequence_id}")]
    SequenceNotFound {
        /// The id the caller asked for.
        sequence_id: String,
    },

    /// The derived resource is owned by someone the requester may not displace.
    #[error("resource {resource_id} is owned by {current_owner}; {requester} rejected: {reason}")]
    ResourceConflict {
        /// The contested resource.
        resource_id: String,
        /// Owner name holding the resource.
        current_owner: String,
        /// Owner name of the rejected requester.
        requester: String,
        /// Human-readable decision reason.
        reason: String,
    },

    /// The request data could not be interpreted.
    #[error("malformed submission: {0}")]
    Malformed(String),

    /// An interrupt released the old owner but could not acquire.
    #[error(transparent)]
    ResourceTransfer(#[from] ResourceTransferError),
}

impl Categorizable for AdmissionError {
    fn category(&self) -> ErrorCategory {
        match self {
            AdmissionError::SequenceNotFound { .. } => ErrorCategory::NotFound,
            AdmissionError::ResourceConflict { .. } => ErrorCategory::Conflict,
            AdmissionError::Malformed(_) => ErrorCategory::Validation,
            AdmissionError::ResourceTransfer(_) => ErrorCategory::Internal,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            AdmissionError::ResourceTransfer(_) => "Resource transfer failed".into(),
            other => other.to_string().into(),
        }
    }
}

/// An INTERRUPT released the previous owner but failed to install the new one.
///
/// Fatal to the submission: the resource may be momentarily unowned.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to transfer {resource_id} from {from_owner} to {to_owner}: {reason}")]
pub struct ResourceTransferError {
    /// The contested resource.
    pub resource_id: String,
    /// Owner that was interrupted.
    pub from_owner: String,
    /// Owner that should have taken over.
    pub to_owner: String,
    /// Why the acquire half failed.
    pub reason: String,
}

// =============================================================================
// Execution
// =============================================================================

/// A failure at a single beat.
///
/// Always recorded in the execution context; whether it stops the sequence
/// depends on the beat's error policy.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("beat {beat} ({event}) in movement '{movement}' failed after {attempts} attempt(s): {message}")]
pub struct BeatError {
    /// Movement name.
    pub movement: String,
    /// Beat number within the movement.
    pub beat: u32,
    /// The event the beat published.
    pub event: String,
    /// Flattened handler failure messages.
    pub message: String,
    /// How many times the beat ran.
    pub attempts: u32,
}

impl Categorizable for BeatError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Internal
    }

    fn safe_message(&self) -> Cow<'static, str> {
        format!("beat {} ({}) failed", self.beat, self.event).into()
    }
}

/// An unrecovered failure that ended the current execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SequenceError {
    /// A beat with `abort-sequence` (or exhausted `retry`) failed.
    #[error("sequence aborted: {0}")]
    Aborted(BeatError),

    /// A caller cancelled the execution.
    #[error("sequence cancelled: {reason}")]
    Cancelled {
        /// Caller-supplied reason.
        reason: String,
    },

    /// The plugin providing the sequence was unmounted while the request waited.
    #[error("sequence {sequence_id} disappeared before request {request_id} could run")]
    SequenceMissing {
        /// The sequence id that no longer resolves.
        sequence_id: String,
        /// The orphaned request.
        request_id: RequestId,
    },

    /// The executor itself failed (e.g. a panic escaped a beat).
    #[error("executor fault: {0}")]
    ExecutorFault(String),

    /// The request was removed from the queue before it ran.
    #[error("request {0} was cleared from the queue")]
    Cleared(RequestId),

    /// Nothing is known about the request, or its outcome has aged out of history.
    #[error("request {0} is unknown or its outcome has expired")]
    UnknownRequest(RequestId),
}

impl Categorizable for SequenceError {
    fn category(&self) -> ErrorCategory {
        match self {
            SequenceError::Aborted(_) | SequenceError::ExecutorFault(_) => ErrorCategory::Internal,
            SequenceError::Cancelled { .. } | SequenceError::Cleared(_) => ErrorCategory::Cancelled,
            SequenceError::SequenceMissing { .. } | SequenceError::UnknownRequest(_) => {
                ErrorCategory::NotFound
            }
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            SequenceError::Aborted(beat) => beat.safe_message(),
            SequenceError::ExecutorFault(_) => "An internal error occurred".into(),
            other => other.to_string().into(),
        }
    }
}

// =============================================================================
// Mounting
// =============================================================================

/// Why a plugin could not be mounted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MountError {
    /// The plugin id is already mounted; the existing mount is untouched.
    #[error("plugin {plugin_id} is already mounted")]
    AlreadyMounted {
        /// The duplicate plugin id.
        plugin_id: String,
    },

    /// The sequence failed structural validation.
    #[error("invalid sequence: {}", errors.join("; "))]
    InvalidSequence {
        /// Every hard error found.
        errors: Vec<String>,
    },

    /// The handler table failed validation.
    #[error("invalid handler table: {}", errors.join("; "))]
    InvalidHandlers {
        /// Every hard error found.
        errors: Vec<String>,
    },

    /// Another plugin already registered a sequence with this id.
    #[error("sequence {sequence_id} is already provided by plugin {owner}")]
    SequenceIdTaken {
        /// The clashing sequence id.
        sequence_id: String,
        /// Plugin that owns it.
        owner: String,
    },
}

impl MountError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            MountError::AlreadyMounted { .. } => "already_mounted",
            MountError::InvalidSequence { .. } => "invalid_sequence",
            MountError::InvalidHandlers { .. } => "invalid_handlers",
            MountError::SequenceIdTaken { .. } => "sequence_id_taken",
        }
    }
}

impl Categorizable for MountError {
    fn category(&self) -> ErrorCategory {
        match self {
            MountError::AlreadyMounted { .. } | MountError::SequenceIdTaken { .. } => {
                ErrorCategory::Conflict
            }
            _ => ErrorCategory::Validation,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        self.to_string().into()
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Manifest or module loading failed.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest {path}: {source}")]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest or a module was not valid JSON of the expected shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// None of the candidate paths for a module existed.
    #[error("no module found for {name}; tried {}", tried.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    ModuleNotFound {
        /// Descriptor name.
        name: String,
        /// Every path that was probed.
        tried: Vec<PathBuf>,
    },
}

/// Convenience used by admission errors to describe the requester.
pub(crate) fn describe_requester(owner: &str, instance_id: &str, priority: Priority) -> String {
    format!("{owner}/{instance_id} ({priority})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_not_found_display() {
        let err = AdmissionError::SequenceNotFound {
            sequence_id: "canvas-drop".into(),
        };
        assert!(err.to_string().contains("sequence not found"));
        assert!(err.to_string().contains("canvas-drop"));
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_resource_transfer_is_internal_with_generic_message() {
        let err: AdmissionError = ResourceTransferError {
            resource_id: "canvas-1".into(),
            from_owner: "Library".into(),
            to_owner: "Canvas".into(),
            reason: "store poisoned".into(),
        }
        .into();

        assert_eq!(err.category(), ErrorCategory::Internal);
        assert_eq!(err.safe_message(), "Resource transfer failed");
        assert!(err.to_string().contains("store poisoned"));
    }

    #[test]
    fn test_mount_error_reason_codes() {
        let already = MountError::AlreadyMounted {
            plugin_id: "CanvasPlugin".into(),
        };
        assert_eq!(already.reason(), "already_mounted");
        assert_eq!(already.category(), ErrorCategory::Conflict);

        let invalid = MountError::InvalidSequence {
            errors: vec!["movement 0 has no beats".into(), "missing name".into()],
        };
        assert_eq!(invalid.reason(), "invalid_sequence");
        assert!(invalid.to_string().contains("movement 0 has no beats; missing name"));
    }

    #[test]
    fn test_beat_error_safe_message_hides_handler_details() {
        let err = BeatError {
            movement: "main".into(),
            beat: 2,
            event: "canvas:render".into(),
            message: "db password rejected".into(),
            attempts: 1,
        };
        let safe = err.safe_message();
        assert!(!safe.contains("password"));
        assert!(safe.contains("canvas:render"));
    }

    #[test]
    fn test_sequence_error_categories() {
        let cancelled = SequenceError::Cancelled {
            reason: "user".into(),
        };
        assert_eq!(cancelled.category(), ErrorCategory::Cancelled);

        let fault = SequenceError::ExecutorFault("boom".into());
        assert_eq!(fault.category(), ErrorCategory::Internal);
        assert_eq!(fault.safe_message(), "An internal error occurred");
    }
}
