//! Route fingerprints
//!
//! A rule key identifies what a route matches: host, path type and path,
//! the raw method list and every header and query predicate. Two routes
//! with the same key would shadow each other, so the first claims it and
//! later ones are reported duplicated; canaries find their base route by it.

use crate::annotations::matching::{parse_match_key, MatchTarget, MATCH_METHOD};
use crate::annotations::Annotations;
use std::collections::BTreeMap;

const SECTION_SEPARATOR: &str = "\n\n";

/// Fingerprint of `path_format` plus the resource's match annotations.
///
/// Predicates are sorted by `type-name`, so the key does not depend on the
/// order annotations were written in.
pub fn create_rule_key(annotations: &BTreeMap<String, String>, path_format: &str) -> String {
    let annotations = Annotations::new(annotations);

    let mut headers: Vec<(String, &str)> = Vec::new();
    let mut params: Vec<(String, &str)> = Vec::new();
    for (key, value) in annotations.portti_entries() {
        let Some(Ok((_, target))) = parse_match_key(key) else {
            continue;
        };
        // key is `<type>-match-...`, the type is everything before the first dash
        let kind = key.split('-').next().unwrap_or_default();
        match target {
            MatchTarget::Header(name) => headers.push((format!("{}-{}", kind, name), value)),
            MatchTarget::Query(name) => params.push((format!("{}-{}", kind, name), value)),
        }
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let render = |pairs: &[(String, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| format!("{}\t{}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut key = String::with_capacity(path_format.len() + 64);
    key.push_str(path_format);
    key.push_str(SECTION_SEPARATOR);
    key.push_str(annotations.string_portti(MATCH_METHOD).unwrap_or_default());
    key.push_str(SECTION_SEPARATOR);
    key.push_str(&render(&headers));
    key.push_str(SECTION_SEPARATOR);
    key.push_str(&render(&params));
    key.push_str(SECTION_SEPARATOR);
    key
}
