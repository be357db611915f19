// Environment Substitution
// Replaces ${NAME} references in raw configuration before parsing

use regex::{Captures, Regex};
use std::sync::LazyLock;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex pattern")
});

/// Substitute `${NAME}` with the looked-up value.
///
/// Missing names expand to the empty string, `$$` yields a literal `$`,
/// and values spanning several lines are emitted as a quoted string so the
/// surrounding YAML stays well formed.
pub fn envsubst<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    REFERENCE_RE
        .replace_all(input, |caps: &Captures| match caps.get(1) {
            None => "$".to_string(),
            Some(name) => {
                let value = lookup(name.as_str()).unwrap_or_default();
                if value.contains('\n') {
                    serde_json::to_string(&value).unwrap_or(value)
                } else {
                    value
                }
            }
        })
        .into_owned()
}
