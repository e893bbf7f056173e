//! Explicit destination list
//!
//! Used by resources whose backend is the registry sentinel instead of a
//! Kubernetes service. One destination per line:
//!
//! ```text
//! 60% foo.dns:8080 v1
//! 40% bar.dns:8080
//! ```
//!
//! The weight defaults to 100 and the port and subset are optional.

use super::{AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser};
use common::{Destination as RouteTarget, HttpRouteDestination, PortSelector};
use tracing::warn;

const DESTINATION: &str = "destination";
const DEFAULT_WEIGHT: i32 = 100;

/// Backend resource that selects the annotation destination list
pub const MCP_BRIDGE_API_GROUP: &str = "networking.portti.io";
pub const MCP_BRIDGE_KIND: &str = "McpBridge";
pub const MCP_BRIDGE_NAME: &str = "default";

/// Namespace used for traffic policy of registry-provided services
pub const MCP_NAMESPACE: &str = "mcp";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DestinationConfig {
    pub destinations: Vec<HttpRouteDestination>,
    pub weight_sum: i32,
}

pub struct Destination;

impl Parser for Destination {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        _ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let Some(value) = annotations.string_portti(DESTINATION) else {
            return Ok(());
        };

        let mut destinations = Vec::new();
        let mut weight_sum: i32 = 0;
        for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let destination = parse_line(line)?;
            weight_sum = weight_sum
                .checked_add(destination.weight)
                .ok_or_else(|| AnnotationError::invalid(DESTINATION, value, "weights overflow"))?;
            destinations.push(destination);
        }

        if weight_sum != 100 {
            warn!(
                "Destination weights of ingress {}/{} sum to {}, not 100",
                config.namespace, config.name, weight_sum
            );
        }

        config.destination = Some(DestinationConfig {
            destinations,
            weight_sum,
        });
        Ok(())
    }
}

fn parse_line(line: &str) -> Result<HttpRouteDestination, AnnotationError> {
    let mut fields = line.split_whitespace().peekable();

    let mut weight = DEFAULT_WEIGHT;
    let first = fields.peek().copied();
    if let Some(percent) = first.and_then(|f| f.strip_suffix('%')) {
        weight = percent
            .parse()
            .map_err(|_| AnnotationError::invalid(DESTINATION, line, "weight is not an integer"))?;
        fields.next();
    }

    let address = fields
        .next()
        .ok_or_else(|| AnnotationError::invalid(DESTINATION, line, "missing address"))?;
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port: u32 = port
                .parse()
                .map_err(|_| AnnotationError::invalid(DESTINATION, line, "port is not a number"))?;
            (host, Some(port))
        }
        None => (address, None),
    };

    Ok(HttpRouteDestination {
        destination: RouteTarget {
            host: host.to_string(),
            port: port.filter(|p| *p > 0).map(|number| PortSelector { number }),
            subset: fields.next().map(str::to_string),
        },
        weight,
        headers: None,
    })
}
