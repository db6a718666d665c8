//! Parses the Cedar-like policy language into the flat [`ir::PolicySet`]
//! consumed by the LSM engines and MITM proxy.
//!
//! The public pipeline is `parse` -> `lint` -> `transpile`. Lint errors
//! abort before transpilation; lint warnings are carried through in
//! [`Output::issues`] so callers can still surface them after a successful
//! load.

pub mod ast;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod lint;
pub mod parser;
pub mod transpile;

pub use error::TranspileError;
pub use ir::PolicySet;
pub use lint::LintIssue;
pub use lint::Severity;
pub use ir::HeaderRewriteRule;

pub struct Output {
    pub policy_set: PolicySet,
    pub header_rewrites: Vec<HeaderRewriteRule>,
    pub issues: Vec<LintIssue>,
}

/// Runs the full pipeline over Cedar source text.
///
/// Returns `Err(TranspileError::Parse)` on a lex/parse failure, and
/// `Err(TranspileError::Lint(issues))` if any lint issue has
/// [`Severity::Error`]; only warnings are returned alongside a successful
/// [`Output`].
pub fn load(source: &str) -> Result<Output, TranspileError> {
    let document = parser::parse(source)?;
    let issues = lint::lint(&document);
    if issues.iter().any(|i| i.severity == Severity::Error) {
        return Err(TranspileError::Lint(issues));
    }
    let transpiled = transpile::transpile(&document);
    Ok(Output {
        policy_set: transpiled.policy_set,
        header_rewrites: transpiled.header_rewrites,
        issues,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn load_rejects_documents_with_lint_errors() {
        let err = load(r#"permit(principal, action == Action::"NetworkConnect", resource in [File::"/a"]);"#).unwrap_err();
        match err {
            TranspileError::Lint(issues) => assert!(issues.iter().any(|i| i.code == "resource_action_mismatch")),
            other => panic!("expected lint error, got {other:?}"),
        }
    }

    #[test]
    fn load_succeeds_and_carries_warnings() {
        let out = load(r#"permit(principal, action == Action::"FileOpen", resource in [Fs::Directory::"/tmp"]);"#).unwrap();
        assert_eq!(out.policy_set.open.len(), 1);
        assert!(out.issues.iter().any(|i| i.code == "directory_missing_trailing_slash"));
    }

    #[test]
    fn load_rejects_malformed_source() {
        let err = load("permit(").unwrap_err();
        assert!(matches!(err, TranspileError::Parse(_)));
    }
}
