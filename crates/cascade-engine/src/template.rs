//! Template resolution for node input text.
//!
//! Templates reference the session input as `{{input}}`, the single upstream
//! output as `{{parent}}`, and any completed node's output as
//! `{{node_<id>}}`. Unresolvable variables substitute the empty string so a
//! missing upstream output degrades the prompt instead of aborting the run.

use std::sync::OnceLock;

use regex::Regex;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}").unwrap())
}

/// Variable bindings available while resolving one node's template.
pub struct TemplateContext<'a> {
    /// Original session input.
    pub input: &'a str,
    /// Output of the node's sole upstream predecessor, if it has exactly one.
    pub parent: Option<&'a str>,
    /// Lookup of completed node outputs by node id.
    pub lookup: &'a dyn Fn(&str) -> Option<String>,
}

/// Resolve every `{{...}}` variable in `template` against `ctx`. Unknown
/// variables and variables with no bound value resolve to `""`.
pub fn resolve(template: &str, ctx: &TemplateContext<'_>) -> String {
    variable_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match lookup_variable(name, ctx) {
                Some(value) => value,
                None => {
                    tracing::debug!(variable = name, "template variable unresolved, substituting empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn lookup_variable(name: &str, ctx: &TemplateContext<'_>) -> Option<String> {
    match name {
        "input" => Some(ctx.input.to_string()),
        "parent" => ctx.parent.map(str::to_string),
        _ => name
            .strip_prefix("node_")
            .and_then(|id| (ctx.lookup)(id)),
    }
}

/// Node ids referenced via `{{node_<id>}}` in a template. Used by validation
/// to flag references to nodes that cannot have completed.
pub fn referenced_nodes(template: &str) -> Vec<String> {
    variable_pattern()
        .captures_iter(template)
        .filter_map(|caps| caps[1].strip_prefix("node_").map(str::to_string))
        .collect()
}

/// Whether a template uses `{{parent}}` at all. Ambiguity checks only apply
/// when it does.
pub fn uses_parent(template: &str) -> bool {
    variable_pattern()
        .captures_iter(template)
        .any(|caps| &caps[1] == "parent")
}
