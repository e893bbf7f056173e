//! Fallback backend
//!
//! When the upstream answers with one of the configured status codes the
//! proxy re-dispatches the request internally. The re-dispatched request
//! carries two marker headers that only the companion `-fallback` route
//! matches, and that route forwards to the fallback service.

use super::{
    split_namespaced_name, AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser,
    RouteHandler,
};
use common::{HttpInternalActiveRedirect, HttpRoute};
use std::collections::BTreeMap;
use tracing::warn;

const DEFAULT_BACKEND: &str = "default-backend";
const CUSTOM_HTTP_ERRORS: &str = "custom-http-errors";

const DEFAULT_HTTP_ERROR: u32 = 404;
const INTERNAL_REDIRECT_URL: &str = "/";

pub const FALLBACK_ROUTE_HEADER: &str = "x-portti-fallback-route";
pub const FALLBACK_SERVICE_HEADER: &str = "x-portti-fallback-service";
pub const FALLBACK_ROUTE_SUFFIX: &str = "-fallback";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FallbackConfig {
    pub namespace: String,
    pub service: String,
    /// First port of the fallback service
    pub port: u32,
    pub custom_http_errors: Vec<u32>,
}

impl FallbackConfig {
    /// `namespace/name` of the fallback service
    pub fn service_key(&self) -> String {
        format!("{}/{}", self.namespace, self.service)
    }
}

pub struct Fallback;

impl Parser for Fallback {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let Some(backend) = annotations.string_asap(DEFAULT_BACKEND) else {
            return Ok(());
        };

        let (namespace, name) = split_namespaced_name(backend, &config.namespace);
        let missing = || AnnotationError::MissingReference {
            key: DEFAULT_BACKEND.to_string(),
            kind: "service",
            name: format!("{}/{}", namespace, name),
        };
        let service = ctx
            .cluster_service_listers
            .get(&config.cluster_id)
            .and_then(|lister| lister.get(&namespace, &name))
            .ok_or_else(missing)?;
        let port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|port| port.port)
            .ok_or_else(|| AnnotationError::invalid(DEFAULT_BACKEND, backend, "service has no ports"))?;

        let mut custom_http_errors = Vec::new();
        if let Some(codes) = annotations.string_asap(CUSTOM_HTTP_ERRORS) {
            for code in codes.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                match code.parse::<u32>() {
                    Ok(code) => custom_http_errors.push(code),
                    Err(_) => warn!(
                        "Ignoring status code '{}' in custom-http-errors of ingress {}/{}",
                        code, config.namespace, config.name
                    ),
                }
            }
        }
        if custom_http_errors.is_empty() {
            custom_http_errors.push(DEFAULT_HTTP_ERROR);
        }

        config.fallback = Some(FallbackConfig {
            namespace,
            service: name,
            port: u32::try_from(port).unwrap_or_default(),
            custom_http_errors,
        });
        Ok(())
    }
}

impl RouteHandler for Fallback {
    fn apply_route(&self, route: &mut HttpRoute, config: &AnnotationConfig) {
        let Some(fallback) = &config.fallback else {
            return;
        };

        let mut headers = BTreeMap::new();
        headers.insert(
            FALLBACK_ROUTE_HEADER.to_string(),
            format!("{}{}", route.name, FALLBACK_ROUTE_SUFFIX),
        );
        headers.insert(FALLBACK_SERVICE_HEADER.to_string(), fallback.service_key());

        route.internal_active_redirect = Some(HttpInternalActiveRedirect {
            max_internal_redirects: 1,
            redirect_response_codes: fallback.custom_http_errors.clone(),
            redirect_url: INTERNAL_REDIRECT_URL.to_string(),
            allow_cross_scheme_redirect: true,
            request_headers_to_add: headers,
        });
    }
}
