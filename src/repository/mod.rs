//! Read queries, explicit moves and consistency tools on top of the strategies.

use serde::Serialize;

pub mod closure;
pub mod nested;
pub mod path;

pub use closure::ClosureTableRepository;
pub use nested::{NestedSetRepository, Steps};
pub use path::MaterializedPathRepository;

/// Rows handled per transaction by the batched recovery tools.
pub const BATCH_SIZE: usize = 1000;

/// Outcome of a consistency check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "errors", rename_all = "snake_case")]
pub enum Verification {
    Valid,
    /// Human-readable findings, one per discrepancy.
    Invalid(Vec<String>),
}

impl Verification {
    pub fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            Verification::Valid
        } else {
            Verification::Invalid(errors)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            Verification::Valid => &[],
            Verification::Invalid(errors) => errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_findings_are_valid() {
        assert!(Verification::from_errors(Vec::new()).is_valid());
        let invalid = Verification::from_errors(vec!["index [2], missing".into()]);
        assert!(!invalid.is_valid());
        assert_eq!(invalid.errors(), ["index [2], missing".to_owned()]);
    }

    #[test]
    fn verification_serializes_with_status_tag() {
        let json = serde_json::to_value(Verification::Invalid(vec!["x".into()]))
            .expect("serialize verification");
        assert_eq!(json, serde_json::json!({ "status": "invalid", "errors": ["x"] }));
        let json = serde_json::to_value(Verification::Valid).expect("serialize verification");
        assert_eq!(json, serde_json::json!({ "status": "valid" }));
    }
}
