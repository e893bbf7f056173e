//! Redirects
//!
//! `temporal-redirect` is applied first, then `permanent-redirect`, then
//! the HTTPS upgrade from `ssl-redirect`/`force-ssl-redirect`. A route that
//! redirects has no destinations. `app-root` is handled by the virtual
//! service pass, which adds one redirecting route per host.

use super::{AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser, RouteHandler};
use common::{HttpRedirect, HttpRoute};
use tracing::warn;
use url::Url;

const APP_ROOT: &str = "app-root";
const TEMPORAL_REDIRECT: &str = "temporal-redirect";
const PERMANENT_REDIRECT: &str = "permanent-redirect";
const PERMANENT_REDIRECT_CODE: &str = "permanent-redirect-code";
const SSL_REDIRECT: &str = "ssl-redirect";
const FORCE_SSL_REDIRECT: &str = "force-ssl-redirect";

const DEFAULT_PERMANENT_REDIRECT_CODE: u32 = 301;
const DEFAULT_TEMPORAL_REDIRECT_CODE: u32 = 302;
const SSL_REDIRECT_CODE: u32 = 308;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedirectConfig {
    pub app_root: String,
    pub url: String,
    pub code: u32,
    pub https_redirect: bool,
}

pub struct Redirect;

impl Parser for Redirect {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let keys = [
            APP_ROOT,
            TEMPORAL_REDIRECT,
            PERMANENT_REDIRECT,
            SSL_REDIRECT,
            FORCE_SSL_REDIRECT,
        ];
        if !keys.iter().any(|key| annotations.has_asap(key)) {
            return Ok(());
        }

        let mut redirect = RedirectConfig {
            code: DEFAULT_PERMANENT_REDIRECT_CODE,
            ..Default::default()
        };

        if let Some(app_root) = annotations.string_asap(APP_ROOT) {
            if app_root.starts_with('/') {
                redirect.app_root = app_root.to_string();
            } else {
                warn!(
                    "Ignoring app-root '{}' of ingress {}/{}: must start with /",
                    app_root, config.namespace, config.name
                );
            }
        }

        let ssl_redirect = annotations.bool_asap(SSL_REDIRECT)?.unwrap_or(false);
        let force_ssl_redirect = annotations.bool_asap(FORCE_SSL_REDIRECT)?.unwrap_or(false);
        redirect.https_redirect = ssl_redirect || force_ssl_redirect;

        if let Some(target) = annotations.string_asap(TEMPORAL_REDIRECT) {
            validate_url(TEMPORAL_REDIRECT, target)?;
            redirect.url = target.to_string();
            redirect.code = DEFAULT_TEMPORAL_REDIRECT_CODE;
        } else if let Some(target) = annotations.string_asap(PERMANENT_REDIRECT) {
            validate_url(PERMANENT_REDIRECT, target)?;
            redirect.url = target.to_string();
            redirect.code = match annotations.int_asap(PERMANENT_REDIRECT_CODE)? {
                Some(code) if (300..=308).contains(&code) => code as u32,
                _ => DEFAULT_PERMANENT_REDIRECT_CODE,
            };
        }

        config.redirect = Some(redirect);
        Ok(())
    }
}

fn validate_url(key: &str, value: &str) -> Result<Url, AnnotationError> {
    let url = Url::parse(value).map_err(|e| AnnotationError::invalid(key, value, e.to_string()))?;
    if url.host_str().is_none() {
        return Err(AnnotationError::invalid(key, value, "missing host"));
    }
    Ok(url)
}

impl RouteHandler for Redirect {
    fn apply_route(&self, route: &mut HttpRoute, config: &AnnotationConfig) {
        let Some(redirect) = &config.redirect else {
            return;
        };

        let policy = if !redirect.url.is_empty() {
            let Ok(url) = Url::parse(&redirect.url) else {
                return;
            };
            let authority = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
                (Some(host), None) => Some(host.to_string()),
                _ => None,
            };
            let uri = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            Some(HttpRedirect {
                uri: Some(uri),
                authority,
                scheme: Some(url.scheme().to_string()),
                redirect_code: redirect.code,
            })
        } else if redirect.https_redirect {
            Some(HttpRedirect {
                scheme: Some("https".to_string()),
                redirect_code: SSL_REDIRECT_CODE,
                ..Default::default()
            })
        } else {
            None
        };

        if let Some(policy) = policy {
            route.redirect = Some(policy);
            route.route.clear();
        }
    }
}
