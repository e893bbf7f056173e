//! Upstream traffic policy: load balancing and upstream TLS

use super::{
    split_namespaced_name, AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser,
    TrafficPolicyHandler,
};
use common::{ClientTlsMode, ClientTlsSettings, ConsistentHashLb, LoadBalancerSettings, SimpleLb};

const LOAD_BALANCE: &str = "load-balance";
const UPSTREAM_HASH_BY: &str = "upstream-hash-by";
const BACKEND_PROTOCOL: &str = "backend-protocol";
const PROXY_SSL_SECRET: &str = "proxy-ssl-secret";
const PROXY_SSL_NAME: &str = "proxy-ssl-name";

const DEFAULT_COOKIE_TTL: &str = "0s";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrafficPolicyConfig {
    pub load_balancer: Option<LoadBalancerSettings>,
    pub tls: Option<ClientTlsSettings>,
}

fn parse_load_balance(value: &str) -> Result<SimpleLb, AnnotationError> {
    match value.to_ascii_lowercase().as_str() {
        "round_robin" => Ok(SimpleLb::RoundRobin),
        "least_conn" => Ok(SimpleLb::LeastConn),
        "random" => Ok(SimpleLb::Random),
        _ => Err(AnnotationError::invalid(
            LOAD_BALANCE,
            value,
            "expected round_robin, least_conn or random",
        )),
    }
}

/// Translate an nginx hash variable (`$remote_addr`, `$http_x`, ...)
fn parse_hash_by(value: &str) -> Result<ConsistentHashLb, AnnotationError> {
    if value == "$remote_addr" {
        return Ok(ConsistentHashLb::UseSourceIp(true));
    }
    if let Some(header) = value.strip_prefix("$http_").filter(|h| !h.is_empty()) {
        return Ok(ConsistentHashLb::HttpHeaderName(header.replace('_', "-")));
    }
    if let Some(cookie) = value.strip_prefix("$cookie_").filter(|c| !c.is_empty()) {
        return Ok(ConsistentHashLb::HttpCookie {
            name: cookie.to_string(),
            ttl: DEFAULT_COOKIE_TTL.to_string(),
        });
    }
    if let Some(arg) = value.strip_prefix("$arg_").filter(|a| !a.is_empty()) {
        return Ok(ConsistentHashLb::HttpQueryParameterName(arg.to_string()));
    }
    Err(AnnotationError::invalid(
        UPSTREAM_HASH_BY,
        value,
        "expected $remote_addr, $http_<header>, $cookie_<name> or $arg_<name>",
    ))
}

pub struct TrafficPolicy;

impl Parser for TrafficPolicy {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let mut policy = TrafficPolicyConfig::default();

        // consistent hashing takes precedence over a simple algorithm
        if let Some(hash_by) = annotations.string_asap(UPSTREAM_HASH_BY) {
            policy.load_balancer = Some(LoadBalancerSettings::ConsistentHash(parse_hash_by(
                hash_by,
            )?));
        } else if let Some(algorithm) = annotations.string_asap(LOAD_BALANCE) {
            policy.load_balancer = Some(LoadBalancerSettings::Simple(parse_load_balance(
                algorithm,
            )?));
        }

        let upstream_tls = match annotations.string_asap(BACKEND_PROTOCOL) {
            None => false,
            Some(protocol) => match protocol.to_ascii_uppercase().as_str() {
                "HTTPS" | "GRPCS" => true,
                "HTTP" | "HTTP2" | "GRPC" | "AUTO_HTTP" => false,
                _ => {
                    return Err(AnnotationError::invalid(
                        BACKEND_PROTOCOL,
                        protocol,
                        "unsupported backend protocol",
                    ))
                }
            },
        };
        let secret = annotations.string_asap(PROXY_SSL_SECRET);
        let sni = annotations.string_asap(PROXY_SSL_NAME);

        if upstream_tls || secret.is_some() || sni.is_some() {
            let mut tls = ClientTlsSettings {
                mode: ClientTlsMode::Simple,
                credential_name: None,
                sni: sni.map(str::to_string),
            };
            if let Some(secret) = secret {
                let (namespace, name) = split_namespaced_name(secret, &config.namespace);
                tls.mode = ClientTlsMode::Mutual;
                tls.credential_name = Some(format!(
                    "kubernetes-ingress://{}/{}/{}",
                    config.cluster_id, namespace, name
                ));
                config.register_secret(ctx, &namespace, &name);
            }
            policy.tls = Some(tls);
        }

        if policy.load_balancer.is_some() || policy.tls.is_some() {
            config.traffic_policy = Some(policy);
        }
        Ok(())
    }
}

impl TrafficPolicyHandler for TrafficPolicy {
    fn apply_traffic_policy(
        &self,
        load_balancer: &mut Option<LoadBalancerSettings>,
        tls: &mut Option<ClientTlsSettings>,
        config: &AnnotationConfig,
    ) {
        let Some(policy) = &config.traffic_policy else {
            return;
        };
        if policy.load_balancer.is_some() {
            *load_balancer = policy.load_balancer.clone();
        }
        if policy.tls.is_some() {
            *tls = policy.tls.clone();
        }
    }
}
