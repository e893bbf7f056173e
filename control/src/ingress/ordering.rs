//! Route ordering
//!
//! The data plane walks a host's routes in order and takes the first match,
//! so routes are sorted most specific first. Default backends go last and a
//! bare catch-all prefix `/` just before them.

use crate::ingress::model::{PathType, WrapperHttpRoute, DEFAULT_PATH};
use std::cmp::Ordering;

/// Prefix `/` with no method, header or query condition
fn is_catch_all(route: &WrapperHttpRoute) -> bool {
    if route.origin_path_type != PathType::Prefix || route.origin_path != DEFAULT_PATH {
        return false;
    }
    route.route.matches.first().map_or(true, |predicate| {
        predicate.method.is_none()
            && predicate.headers.is_empty()
            && predicate.query_params.is_empty()
    })
}

/// `false` sorts before `true`
fn last_if(a: bool, b: bool) -> Ordering {
    a.cmp(&b)
}

fn compare_same_type(a: &WrapperHttpRoute, b: &WrapperHttpRoute) -> Ordering {
    let a_first = a.route.matches.first();
    let b_first = b.route.matches.first();

    let a_method = a_first.and_then(|m| m.method.as_ref()).map(|m| m.value().len());
    let b_method = b_first.and_then(|m| m.method.as_ref()).map(|m| m.value().len());
    let methods = match (a_method, b_method) {
        // fewer alternatives is more specific
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };

    let a_headers = a_first.map_or(0, |m| m.headers.len());
    let b_headers = b_first.map_or(0, |m| m.headers.len());
    let a_params = a_first.map_or(0, |m| m.query_params.len());
    let b_params = b_first.map_or(0, |m| m.query_params.len());

    b.origin_path
        .len()
        .cmp(&a.origin_path.len())
        .then(methods)
        .then(b_headers.cmp(&a_headers))
        .then(b_params.cmp(&a_params))
}

fn compare_types(a: PathType, b: PathType) -> Ordering {
    let rank = |t: PathType| match t {
        PathType::Exact => 0,
        PathType::Prefix => 1,
        PathType::PrefixRegex | PathType::FullPathRegex => 2,
    };
    rank(a).cmp(&rank(b))
}

pub fn compare_routes(a: &WrapperHttpRoute, b: &WrapperHttpRoute) -> Ordering {
    last_if(a.is_default_backend, b.is_default_backend)
        .then_with(|| last_if(is_catch_all(a), is_catch_all(b)))
        .then_with(|| {
            if a.origin_path_type == b.origin_path_type {
                compare_same_type(a, b)
            } else {
                compare_types(a.origin_path_type, b.origin_path_type)
            }
        })
}

/// Stable sort; equally specific routes keep their conversion order
pub fn sort_routes(routes: &mut [WrapperHttpRoute]) {
    routes.sort_by(compare_routes);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ingress::model::tests::wrapper;
    use common::{HttpMatchRequest, StringMatch};

    fn route(name: &str, path_type: PathType, path: &str) -> WrapperHttpRoute {
        let mut route = WrapperHttpRoute::new(wrapper("default", "echo"), "a.example.com", "c1");
        route.route.name = name.to_string();
        route.origin_path_type = path_type;
        route.origin_path = path.to_string();
        route.route.matches = vec![HttpMatchRequest::default()];
        route
    }

    fn names(routes: &[WrapperHttpRoute]) -> Vec<&str> {
        routes.iter().map(|r| r.route.name.as_str()).collect()
    }

    #[test]
    fn test_specificity_order() {
        let mut default_backend = route("default", PathType::Prefix, "/");
        default_backend.is_default_backend = true;

        let mut routes = vec![
            route("catch-all", PathType::Prefix, "/"),
            route("exact-b", PathType::Exact, "/b"),
            route("regex-d", PathType::PrefixRegex, "/d(.*)"),
            route("prefix-a", PathType::Prefix, "/a"),
            default_backend,
        ];
        sort_routes(&mut routes);

        assert_eq!(
            names(&routes),
            vec!["exact-b", "prefix-a", "regex-d", "catch-all", "default"]
        );
    }

    #[test]
    fn test_longer_path_first() {
        let mut routes = vec![
            route("short", PathType::Prefix, "/a"),
            route("long", PathType::Prefix, "/a/b/c"),
        ];
        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["long", "short"]);
    }

    #[test]
    fn test_constraints_break_ties() {
        let mut with_method = route("method", PathType::Prefix, "/a");
        with_method.route.matches[0].method = Some(StringMatch::Regex("GET".to_string()));
        let mut with_two_methods = route("methods", PathType::Prefix, "/a");
        with_two_methods.route.matches[0].method = Some(StringMatch::Regex("GET|PUT".to_string()));
        let mut with_header = route("header", PathType::Prefix, "/a");
        with_header.route.matches[0]
            .headers
            .insert("x-env".to_string(), StringMatch::Exact("prod".to_string()));
        let plain = route("plain", PathType::Prefix, "/a");

        let mut routes = vec![plain, with_header, with_two_methods, with_method];
        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["method", "methods", "header", "plain"]);
    }

    #[test]
    fn test_constrained_root_is_not_catch_all() {
        let mut constrained = route("constrained", PathType::Prefix, "/");
        constrained.route.matches[0]
            .headers
            .insert("x-canary".to_string(), StringMatch::Exact("always".to_string()));

        let mut routes = vec![route("catch-all", PathType::Prefix, "/"), constrained];
        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["constrained", "catch-all"]);
    }

    #[test]
    fn test_equal_routes_keep_order() {
        let mut routes = vec![
            route("first", PathType::Exact, "/x"),
            route("second", PathType::Exact, "/y"),
        ];
        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["first", "second"]);
    }
}
