//! Downstream TLS policy for HTTPS listeners

use super::{AnnotationConfig, AnnotationError, Annotations, GatewayHandler, GlobalContext, Parser};
use common::{Gateway, TlsProtocol};

const SSL_CIPHER: &str = "ssl-cipher";
const TLS_MIN_VERSION: &str = "tls-min-protocol-version";
const TLS_MAX_VERSION: &str = "tls-max-protocol-version";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownstreamTlsConfig {
    pub cipher_suites: Vec<String>,
    pub min_version: Option<TlsProtocol>,
    pub max_version: Option<TlsProtocol>,
}

fn parse_version(key: &str, value: &str) -> Result<TlsProtocol, AnnotationError> {
    match value {
        "TLSv1_0" => Ok(TlsProtocol::V1_0),
        "TLSv1_1" => Ok(TlsProtocol::V1_1),
        "TLSv1_2" => Ok(TlsProtocol::V1_2),
        "TLSv1_3" => Ok(TlsProtocol::V1_3),
        _ => Err(AnnotationError::invalid(
            key,
            value,
            "expected one of TLSv1_0, TLSv1_1, TLSv1_2, TLSv1_3",
        )),
    }
}

pub struct DownstreamTls;

impl Parser for DownstreamTls {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let ciphers = annotations.string_asap(SSL_CIPHER);
        let min = annotations.string_portti(TLS_MIN_VERSION);
        let max = annotations.string_portti(TLS_MAX_VERSION);
        if ciphers.is_none() && min.is_none() && max.is_none() {
            return Ok(());
        }

        let mut tls = DownstreamTlsConfig::default();
        if let Some(ciphers) = ciphers {
            tls.cipher_suites = ciphers
                .split([':', ','])
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(min) = min {
            tls.min_version = Some(parse_version(TLS_MIN_VERSION, min)?);
        }
        if let Some(max) = max {
            tls.max_version = Some(parse_version(TLS_MAX_VERSION, max)?);
        }
        if let (Some(min), Some(max)) = (tls.min_version, tls.max_version) {
            if min > max {
                return Err(AnnotationError::invalid(
                    TLS_MIN_VERSION,
                    &format!("{:?}", min),
                    "minimum version is above the maximum",
                ));
            }
        }

        config.downstream_tls = Some(tls);
        Ok(())
    }
}

impl GatewayHandler for DownstreamTls {
    fn apply_gateway(&self, gateway: &mut Gateway, config: &AnnotationConfig) {
        let Some(policy) = &config.downstream_tls else {
            return;
        };

        for server in gateway.servers.iter_mut().filter(|s| s.is_https()) {
            let Some(tls) = server.tls.as_mut() else {
                continue;
            };
            if !policy.cipher_suites.is_empty() {
                tls.cipher_suites = policy.cipher_suites.clone();
            }
            if policy.min_version.is_some() {
                tls.min_protocol_version = policy.min_version;
            }
            if policy.max_version.is_some() {
                tls.max_protocol_version = policy.max_version;
            }
        }
    }
}
