//! Read-only SQL validation.
//!
//! Everything the model emits passes through here before it can touch a
//! data source. The validator strips markdown fences, rejects multi-
//! statement bodies and anything that is not a SELECT (or a WITH ending in
//! one), extracts named parameters, and normalizes them to the dialect's
//! placeholder form.

mod scanner;
mod validator;

pub use scanner::{scan, ScanOutcome};
pub use validator::{strip_fences, validate, MAX_SQL_CHARS};

/// A statement that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    /// The normalized statement: fences stripped, named parameters replaced
    /// by the dialect's placeholders.
    pub sql: String,

    /// Parameter names in placeholder order, one entry per occurrence.
    /// Binding happens positionally against this list.
    pub param_names: Vec<String>,
}

impl ValidatedSql {
    /// Returns true when the statement carries no parameters.
    pub fn is_parameterless(&self) -> bool {
        self.param_names.is_empty()
    }
}
