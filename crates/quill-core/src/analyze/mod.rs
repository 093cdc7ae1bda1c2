//! Read/write set derivation for notebook cells.
//!
//! This module answers one question: given a cell's source, which shared
//! namespace symbols does it read and which does it write? The dependency
//! graph is a pure projection of these sets.
//!
//! - Python cells are parsed into an AST and walked with scope tracking;
//!   names bound only inside nested functions, lambdas, comprehensions, or
//!   class bodies never reach the cell-level sets.
//! - SQL cells read the identifiers appearing in `{name}` templates and
//!   never write anything.
//!
//! Derivation is a pure function of the source text. Syntactically invalid
//! source yields empty sets; the failure surfaces at execution time.

mod builtins;
mod python;
mod sql;

use std::collections::BTreeSet;

use crate::notebook::CellKind;

pub use builtins::is_builtin;
pub use sql::{parameterize, template_reads};

/// Derive `(reads, writes)` for a cell.
pub fn analyze(kind: CellKind, source: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    match kind {
        CellKind::Python => python::analyze(source),
        CellKind::Sql => (sql::template_reads(source), BTreeSet::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_kind() {
        let (reads, writes) = analyze(CellKind::Python, "y = x + 1");
        assert!(reads.contains("x"));
        assert!(writes.contains("y"));

        let (reads, writes) = analyze(CellKind::Sql, "SELECT * FROM t WHERE id = {x}");
        assert!(reads.contains("x"));
        assert!(writes.is_empty());
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let source = "import numpy as np\nresult = np.mean(data)\n";
        let first = analyze(CellKind::Python, source);
        let second = analyze(CellKind::Python, source);
        assert_eq!(first, second);
    }
}
