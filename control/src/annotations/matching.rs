//! Extra match predicates
//!
//! Gateway-prefixed annotations add method, header, pseudo-header and query
//! parameter conditions to every match of a resource's routes:
//!
//! ```text
//! portti.io/match-method: "GET PUT"
//! portti.io/exact-match-header-x-env: prod
//! portti.io/prefix-match-pseudo-header-authority: api.
//! portti.io/regex-match-query-user: "^u-[0-9]+$"
//! ```
//!
//! Conditions already present on a match are never overwritten.

use super::{AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser, RouteHandler};
use common::{HttpMethod, HttpRoute, StringMatch};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

pub const MATCH_METHOD: &str = "match-method";
pub const MATCH_HEADER: &str = "match-header-";
pub const MATCH_PSEUDO_HEADER: &str = "match-pseudo-header-";
pub const MATCH_QUERY: &str = "match-query-";

const USE_REGEX: &str = "use-regex";
const FULL_PATH_REGEX: &str = "full-path-regex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchType {
    Exact,
    Prefix,
    Regex,
}

impl MatchType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(Self::Exact),
            "prefix" => Some(Self::Prefix),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }

    pub fn to_string_match(self, value: &str) -> StringMatch {
        match self {
            Self::Exact => StringMatch::Exact(value.to_string()),
            Self::Prefix => StringMatch::Prefix(value.to_string()),
            Self::Regex => StringMatch::Regex(value.to_string()),
        }
    }
}

/// What a `<type>-match-...` annotation key targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchTarget {
    /// Header name; pseudo headers carry their leading `:`
    Header(String),
    Query(String),
}

/// Split an unprefixed annotation key such as `exact-match-header-x-env`.
///
/// Returns None for keys that are not match annotations at all.
pub fn parse_match_key(key: &str) -> Option<Result<(MatchType, MatchTarget), AnnotationError>> {
    let (kind, rest) = key.split_once('-')?;
    if !rest.starts_with("match-") || rest == MATCH_METHOD {
        return None;
    }

    let target = if let Some(name) = rest.strip_prefix(MATCH_HEADER) {
        MatchTarget::Header(name.to_string())
    } else if let Some(name) = rest.strip_prefix(MATCH_PSEUDO_HEADER) {
        MatchTarget::Header(format!(":{}", name))
    } else if let Some(name) = rest.strip_prefix(MATCH_QUERY) {
        MatchTarget::Query(name.to_string())
    } else {
        return None;
    };

    let name_is_empty = match &target {
        MatchTarget::Header(name) => name.is_empty() || name == ":",
        MatchTarget::Query(name) => name.is_empty(),
    };
    match MatchType::parse(kind) {
        Some(kind) if !name_is_empty => Some(Ok((kind, target))),
        _ => Some(Err(AnnotationError::InvalidName(key.to_string()))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchConfig {
    /// Deduplicated, in annotation order
    pub methods: Vec<HttpMethod>,
    pub headers: BTreeMap<String, StringMatch>,
    pub query_params: BTreeMap<String, StringMatch>,
}

impl MatchConfig {
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.headers.is_empty() && self.query_params.is_empty()
    }

    /// Regex alternation of the configured methods, e.g. `GET|PUT`
    pub fn method_match(&self) -> Option<StringMatch> {
        if self.methods.is_empty() {
            return None;
        }
        let methods: Vec<&str> = self.methods.iter().map(HttpMethod::as_str).collect();
        Some(StringMatch::Regex(methods.join("|")))
    }
}

pub struct Match;

impl Parser for Match {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let mut matching = MatchConfig::default();

        if let Some(methods) = annotations.string_portti(MATCH_METHOD) {
            for token in methods.split(' ').map(str::to_ascii_uppercase) {
                if let Some(method) = HttpMethod::parse(&token) {
                    if !matching.methods.contains(&method) {
                        matching.methods.push(method);
                    }
                }
            }
        }

        for (key, value) in annotations.portti_entries() {
            let (kind, target) = match parse_match_key(key) {
                None => continue,
                Some(Ok(parsed)) => parsed,
                Some(Err(e)) => {
                    warn!(
                        "Skipping match annotation of ingress {}/{}: {}",
                        config.namespace, config.name, e
                    );
                    continue;
                }
            };
            if kind == MatchType::Regex {
                if let Err(e) = Regex::new(value) {
                    warn!(
                        "Dropping match annotation {} of ingress {}/{}: invalid regex: {}",
                        key, config.namespace, config.name, e
                    );
                    continue;
                }
            }
            match target {
                MatchTarget::Header(name) => {
                    matching.headers.insert(name, kind.to_string_match(value));
                }
                MatchTarget::Query(name) => {
                    matching.query_params.insert(name, kind.to_string_match(value));
                }
            }
        }

        if !matching.is_empty() {
            config.matching = Some(matching);
        }
        Ok(())
    }
}

impl RouteHandler for Match {
    fn apply_route(&self, route: &mut HttpRoute, config: &AnnotationConfig) {
        let Some(matching) = &config.matching else {
            return;
        };

        let method = matching.method_match();
        for predicate in &mut route.matches {
            if method.is_some() {
                predicate.method = method.clone();
            }
            for (name, value) in &matching.headers {
                predicate
                    .headers
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
            for (name, value) in &matching.query_params {
                predicate
                    .query_params
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// Regex path matching switches
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathRegexConfig {
    /// Paths are regex prefixes
    pub use_regex: bool,
    /// Paths are anchored regexes over the whole path
    pub full_path_regex: bool,
}

/// Whether raw annotations switch paths to regex matching, before any parsing
pub fn needs_regex_match(annotations: Annotations<'_>) -> bool {
    annotations.bool_asap(USE_REGEX).ok().flatten().unwrap_or(false)
        || annotations.string_portti(FULL_PATH_REGEX) == Some("true")
}

pub struct PathRegex;

impl Parser for PathRegex {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let use_regex = annotations.bool_asap(USE_REGEX)?.unwrap_or(false);
        let full_path_regex = match annotations.string_portti(FULL_PATH_REGEX) {
            None => false,
            Some(value) => value.parse().map_err(|_| {
                AnnotationError::invalid(FULL_PATH_REGEX, value, "expected true or false")
            })?,
        };

        if use_regex || full_path_regex {
            config.path_regex = Some(PathRegexConfig {
                use_regex: use_regex || full_path_regex,
                full_path_regex,
            });
        }
        Ok(())
    }
}
