//! Rejection taxonomy shared by every pipeline stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, machine-checkable reason for a fatal rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    /// A write or administrative statement keyword appeared outside a literal.
    ForbiddenVerb,
    /// Two tables declared incompatible were joined.
    IllegalJoin,
    /// File-system, extension-loading or system-catalog access.
    DangerousConstruct,
    /// Input outside the accepted grammar.
    UnsupportedSyntax,
    /// A repair pass produced SQL that failed revalidation.
    InternalRepairFailure,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ForbiddenVerb => "ForbiddenVerb",
            ReasonCode::IllegalJoin => "IllegalJoin",
            ReasonCode::DangerousConstruct => "DangerousConstruct",
            ReasonCode::UnsupportedSyntax => "UnsupportedSyntax",
            ReasonCode::InternalRepairFailure => "InternalRepairFailure",
        }
    }

    /// Every surfaced code is fatal: the engine never retries or patches a
    /// rejected candidate.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Whether the candidate SQL itself is at fault, as opposed to the engine.
    pub fn is_candidate_fault(&self) -> bool {
        !matches!(self, ReasonCode::InternalRepairFailure)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed rejection with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct Rejection {
    pub reason: ReasonCode,
    pub message: String,
    pub offending_fragment: Option<String>,
}

impl Rejection {
    pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            offending_fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.offending_fragment = Some(fragment.into());
        self
    }

    pub fn forbidden_verb(verb: &str) -> Self {
        Self::new(
            ReasonCode::ForbiddenVerb,
            format!("Query contains forbidden keyword: {}", verb.to_ascii_uppercase()),
        )
        .with_fragment(verb)
    }

    pub fn dangerous(construct: &str) -> Self {
        Self::new(
            ReasonCode::DangerousConstruct,
            format!("Query contains a dangerous construct: {}", construct),
        )
        .with_fragment(construct)
    }

    pub fn illegal_join(left: &str, right: &str) -> Self {
        Self::new(
            ReasonCode::IllegalJoin,
            format!(
                "Tables {} and {} must not be joined; combine them with UNION ALL",
                left, right
            ),
        )
        .with_fragment(format!("{} JOIN {}", left, right))
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::UnsupportedSyntax, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::InternalRepairFailure, message)
    }
}

/// Failures raised by rewrite passes. The pipeline surfaces them as
/// `UnsupportedSyntax` rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("Computed column `{expr}` needs an alias to be aligned across UNION ALL branches")]
    UnaliasedColumn { expr: String },

    #[error("Cannot expand `*` for table `{table}`: table is not in the schema catalog")]
    UnknownStarTable { table: String },
}

impl RepairError {
    pub fn fragment(&self) -> &str {
        match self {
            RepairError::UnaliasedColumn { expr } => expr,
            RepairError::UnknownStarTable { table } => table,
        }
    }
}

impl From<RepairError> for Rejection {
    fn from(err: RepairError) -> Self {
        let fragment = err.fragment().to_string();
        Rejection::unsupported(err.to_string()).with_fragment(fragment)
    }
}
