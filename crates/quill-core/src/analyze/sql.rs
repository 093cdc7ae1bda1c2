//! SQL cell template analysis and parameterization.
//!
//! SQL cells reference namespace values through `{identifier}` templates.
//! Analysis extracts the distinct identifiers as the cell's read set; the
//! kernel uses [`parameterize`] to turn the same templates into positional
//! `$N` placeholders so values are always bound as query parameters, never
//! interpolated into the SQL text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("template regex"));

/// The distinct identifiers referenced by `{name}` templates.
pub fn template_reads(source: &str) -> BTreeSet<String> {
    TEMPLATE_RE
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Rewrite templates into positional placeholders.
///
/// Each distinct identifier is assigned one `$N` placeholder (repeats reuse
/// the earlier index). Returns the rewritten query and the identifiers in
/// placeholder order, ready for namespace lookup.
pub fn parameterize(source: &str) -> (String, Vec<String>) {
    let mut names: Vec<String> = Vec::new();
    let query = TEMPLATE_RE.replace_all(source, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        let index = match names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        format!("${}", index + 1)
    });
    (query.into_owned(), names)
}
