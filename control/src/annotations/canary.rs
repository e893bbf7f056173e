//! Canary releases
//!
//! A canary resource never produces routes of its own. It is merged into
//! the base route with the same rule key, either as an extra weighted
//! destination or as a sibling route selected by a header or cookie.

use super::{AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser};
use common::{HttpRoute, StringMatch};
use tracing::warn;

const ENABLE_CANARY: &str = "canary";
const CANARY_BY_HEADER: &str = "canary-by-header";
const CANARY_BY_HEADER_VALUE: &str = "canary-by-header-value";
const CANARY_BY_HEADER_PATTERN: &str = "canary-by-header-pattern";
const CANARY_BY_COOKIE: &str = "canary-by-cookie";
const CANARY_WEIGHT: &str = "canary-weight";
const CANARY_WEIGHT_TOTAL: &str = "canary-weight-total";

pub const DEFAULT_CANARY_WEIGHT_TOTAL: i32 = 100;

/// Header value that always selects the canary
const ALWAYS: &str = "always";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryConfig {
    pub enabled: bool,
    pub header: String,
    pub header_value: String,
    pub header_pattern: String,
    pub cookie: String,
    pub weight: i32,
    pub weight_total: i32,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header: String::new(),
            header_value: String::new(),
            header_pattern: String::new(),
            cookie: String::new(),
            weight: 0,
            weight_total: DEFAULT_CANARY_WEIGHT_TOTAL,
        }
    }
}

pub struct Canary;

impl Parser for Canary {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        if !annotations.has_asap(ENABLE_CANARY) {
            return Ok(());
        }

        let mut canary = CanaryConfig {
            enabled: annotations.bool_asap(ENABLE_CANARY)?.unwrap_or(false),
            ..Default::default()
        };

        if canary.enabled {
            let text = |key: &str| annotations.string_asap(key).unwrap_or_default().to_string();
            canary.header = text(CANARY_BY_HEADER);
            canary.header_value = text(CANARY_BY_HEADER_VALUE);
            canary.header_pattern = text(CANARY_BY_HEADER_PATTERN);
            canary.cookie = text(CANARY_BY_COOKIE);

            match annotations.int_asap(CANARY_WEIGHT) {
                Ok(Some(weight)) if weight < 0 => warn!(
                    "Ignoring negative canary weight {} of ingress {}/{}",
                    weight, config.namespace, config.name
                ),
                Ok(weight) => canary.weight = weight.unwrap_or_default(),
                Err(e) => warn!(
                    "Ignoring canary weight of ingress {}/{}: {}",
                    config.namespace, config.name, e
                ),
            }
            match annotations.int_asap(CANARY_WEIGHT_TOTAL) {
                Ok(Some(total)) if total > 0 => canary.weight_total = total,
                Ok(_) => {}
                Err(e) => warn!(
                    "Ignoring canary weight total of ingress {}/{}: {}",
                    config.namespace, config.name, e
                ),
            }
        }

        config.canary = Some(canary);
        Ok(())
    }
}

/// Split traffic: append the canary's first destination to `base`.
///
/// The appended weight is the raw canary weight; totals are normalized
/// once every canary has been merged.
pub fn apply_by_weight(base: &mut HttpRoute, canary: &HttpRoute, config: &CanaryConfig) {
    let Some(first) = canary.route.first() else {
        return;
    };

    if base.route.len() == 1 {
        // keep route-level header operations with the original destination
        if let Some(headers) = base.headers.take() {
            base.route[0].headers = Some(headers);
        }
    }

    let mut destination = first.clone();
    destination.weight = config.weight;
    if canary.headers.is_some() {
        destination.headers = canary.headers.clone();
    }
    base.route.push(destination);
}

/// Select the canary by header or cookie.
///
/// The canary inherits everything from `base` except its own name, match
/// predicates and destinations; each predicate then gains the selector.
pub fn apply_by_header(canary: &mut HttpRoute, base: &HttpRoute, config: &CanaryConfig) {
    let own_name = std::mem::take(&mut canary.name);
    let own_matches = std::mem::take(&mut canary.matches);
    let own_route = std::mem::take(&mut canary.route);

    *canary = base.clone();
    canary.name = own_name;
    canary.matches = own_matches;
    canary.route = own_route;

    if !config.header.is_empty() {
        let selector = if !config.header_value.is_empty() {
            StringMatch::Exact(config.header_value.clone())
        } else if !config.header_pattern.is_empty() {
            StringMatch::Regex(config.header_pattern.clone())
        } else {
            StringMatch::Exact(ALWAYS.to_string())
        };
        for predicate in &mut canary.matches {
            predicate
                .headers
                .insert(config.header.clone(), selector.clone());
        }
    } else if !config.cookie.is_empty() {
        let selector = StringMatch::Regex(format!(
            "^(.*?;)?({}={})(;.*)?$",
            config.cookie, ALWAYS
        ));
        for predicate in &mut canary.matches {
            predicate
                .headers
                .insert("cookie".to_string(), selector.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::annotations::tests::annotations;
    use common::{
        Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRedirect,
        HttpRouteDestination, PortSelector,
    };

    fn parse(pairs: &[(&str, &str)]) -> AnnotationConfig {
        let map = annotations(pairs);
        let mut config = AnnotationConfig::new("c1", "default", "canary");
        Canary
            .parse(Annotations::new(&map), &mut config, &mut GlobalContext::default())
            .unwrap();
        config
    }

    fn destination(host: &str, weight: i32) -> HttpRouteDestination {
        HttpRouteDestination {
            destination: Destination {
                host: host.to_string(),
                port: Some(PortSelector { number: 80 }),
                subset: None,
            },
            weight,
            headers: None,
        }
    }

    fn route(name: &str, uri: &str, host: &str) -> HttpRoute {
        HttpRoute {
            name: name.to_string(),
            matches: vec![HttpMatchRequest {
                uri: Some(StringMatch::Prefix(uri.to_string())),
                ..Default::default()
            }],
            route: vec![destination(host, 100)],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_weight_canary() {
        let config = parse(&[
            ("nginx.ingress.kubernetes.io/canary", "true"),
            ("nginx.ingress.kubernetes.io/canary-weight", "20"),
        ]);

        let canary = config.canary.as_ref().unwrap();
        assert_eq!(canary.weight, 20);
        assert_eq!(canary.weight_total, 100, "Total defaults to 100");
        assert_eq!(config.canary_kind(), (false, true));
    }

    #[test]
    fn test_parse_header_canary_and_custom_total() {
        let config = parse(&[
            ("portti.io/canary", "true"),
            ("portti.io/canary-by-header", "x-canary"),
            ("portti.io/canary-weight-total", "1000"),
        ]);

        assert_eq!(config.canary_kind(), (true, false));
        assert_eq!(config.canary.unwrap().weight_total, 1000);
    }

    #[test]
    fn test_non_positive_total_keeps_default() {
        let config = parse(&[
            ("portti.io/canary", "true"),
            ("portti.io/canary-weight-total", "0"),
        ]);
        assert_eq!(config.canary.unwrap().weight_total, 100);
    }

    #[test]
    fn test_negative_weight_is_ignored() {
        let config = parse(&[
            ("portti.io/canary", "true"),
            ("portti.io/canary-weight", "-20"),
        ]);
        assert_eq!(config.canary.as_ref().unwrap().weight, 0);
        assert_eq!(config.canary_kind(), (false, true));
    }

    #[test]
    fn test_disabled_canary_is_not_canary() {
        let config = parse(&[
            ("portti.io/canary", "false"),
            ("portti.io/canary-weight", "50"),
        ]);
        assert!(!config.is_canary());
        assert_eq!(config.canary.unwrap().weight, 0, "Settings ignored when disabled");
    }

    #[test]
    fn test_apply_by_weight_appends_destination() {
        let mut base = route("base", "/", "v1.default.svc.cluster.local");
        base.headers = Some(Headers {
            request: Some(HeaderOperations {
                remove: vec!["x-debug".to_string()],
                ..Default::default()
            }),
            response: None,
        });
        let canary = route("canary", "/", "v2.default.svc.cluster.local");
        let config = CanaryConfig {
            enabled: true,
            weight: 30,
            ..Default::default()
        };

        apply_by_weight(&mut base, &canary, &config);

        assert_eq!(base.route.len(), 2);
        assert_eq!(base.route[1].destination.host, "v2.default.svc.cluster.local");
        assert_eq!(base.route[1].weight, 30);
        assert!(base.headers.is_none(), "Route headers moved to the first destination");
        assert!(base.route[0].headers.is_some());
    }

    #[test]
    fn test_apply_by_header_inherits_base() {
        let mut base = route("base", "/api", "v1.default.svc.cluster.local");
        base.redirect = None;
        base.headers = Some(Headers::default());
        let mut canary = route("canary", "/api", "v2.default.svc.cluster.local");
        let config = CanaryConfig {
            enabled: true,
            header: "x-canary".to_string(),
            ..Default::default()
        };

        apply_by_header(&mut canary, &base, &config);

        assert_eq!(canary.name, "canary");
        assert_eq!(canary.route[0].destination.host, "v2.default.svc.cluster.local");
        assert!(canary.headers.is_some(), "Inherited from base");
        assert_eq!(
            canary.matches[0].headers.get("x-canary"),
            Some(&StringMatch::Exact("always".to_string()))
        );
    }

    #[test]
    fn test_apply_by_header_value_and_pattern() {
        let base = route("base", "/", "v1");
        let mut canary = route("canary", "/", "v2");
        let config = CanaryConfig {
            enabled: true,
            header: "x-canary".to_string(),
            header_value: "on".to_string(),
            header_pattern: "^o.*".to_string(),
            ..Default::default()
        };
        apply_by_header(&mut canary, &base, &config);
        assert_eq!(
            canary.matches[0].headers.get("x-canary"),
            Some(&StringMatch::Exact("on".to_string())),
            "Value wins over pattern"
        );

        let mut canary = route("canary", "/", "v2");
        let config = CanaryConfig {
            header_value: String::new(),
            ..config
        };
        apply_by_header(&mut canary, &base, &config);
        assert_eq!(
            canary.matches[0].headers.get("x-canary"),
            Some(&StringMatch::Regex("^o.*".to_string()))
        );
    }

    #[test]
    fn test_apply_by_cookie() {
        let mut base = route("base", "/", "v1");
        base.redirect = Some(HttpRedirect::default());
        let mut canary = route("canary", "/", "v2");
        let config = CanaryConfig {
            enabled: true,
            cookie: "user_v2".to_string(),
            ..Default::default()
        };

        apply_by_header(&mut canary, &base, &config);

        assert_eq!(
            canary.matches[0].headers.get("cookie"),
            Some(&StringMatch::Regex(
                "^(.*?;)?(user_v2=always)(;.*)?$".to_string()
            ))
        );
        assert!(canary.redirect.is_some());
    }
}
