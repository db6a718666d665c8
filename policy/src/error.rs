//! Error types surfaced by parsing, linting, and transpilation.

use thiserror::Error;

use crate::lint::LintIssue;
use crate::parser::ParseError;

#[derive(Debug, Error)]
#[allow(clippy::large_enum_variant)]
pub enum TranspileError {
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] ParseError),
    #[error("policy document failed lint checks")]
    Lint(Vec<LintIssue>),
}
