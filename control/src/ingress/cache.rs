//! Diagnostic caches
//!
//! Every route and domain a pass touches leaves a record here. Records are
//! appended as conversion runs; [`RouteCache::extract`] and
//! [`DomainCache::extract`] replay the log once at the end of the pass and
//! split it into valid and invalid entries. Invalid entries carry a message
//! naming the resource that won the conflict.

use crate::ingress::model::{ConvertEvent, IngressRef, PathType, WrapperHttpRoute};
use chrono::{DateTime, Utc};
use common::split_service_fqdn;
use serde::Serialize;
use tracing::error;

const INVALID_ROUTE_NAME: &str = "invalid-route";
const MULTIPLE_SERVICES: &str = "Multiple";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub namespace: String,
    pub name: String,
    pub port: u32,
    pub weight: i32,
}

/// Route diagnostic, as served to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRoute {
    pub name: String,
    pub host: String,
    pub path: String,
    pub path_type: String,
    pub cluster_id: String,
    pub namespace: String,
    pub ingress: String,
    /// First backend service, or `Multiple`
    pub service_name: String,
    pub service_list: Vec<BackendService>,
    pub event: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngressRouteCollection {
    pub valid: Vec<IngressRoute>,
    pub invalid: Vec<IngressRoute>,
}

/// Mutable route record, rendered by [`IngressRouteBuilder::build`]
#[derive(Debug, Clone)]
pub struct IngressRouteBuilder {
    pub route_name: String,
    pub host: String,
    pub path: String,
    pub path_type: PathType,
    pub ingress: IngressRef,
    pub services: Vec<BackendService>,
    /// Named service port of the backend, if it used one
    pub port_name: String,
    pub event: ConvertEvent,
    /// Resource that claimed the route first
    pub pre_ingress: Option<IngressRef>,
}

impl IngressRouteBuilder {
    fn message(&self) -> String {
        let ingress = &self.ingress;
        match self.event {
            ConvertEvent::DuplicatedRoute => {
                let pre = self.pre_ingress.clone().unwrap_or_else(|| ingress.clone());
                format!(
                    "host {} and path {} in ingress {}/{} within cluster {} is already defined in ingress {}/{} within cluster {}",
                    self.host,
                    self.path,
                    ingress.namespace,
                    ingress.name,
                    ingress.cluster_id,
                    pre.namespace,
                    pre.name,
                    pre.cluster_id
                )
            }
            ConvertEvent::InvalidBackendService => format!(
                "backend service of host {} and path {} is invalid defined in ingress {}/{} within cluster {}",
                self.host, self.path, ingress.namespace, ingress.name, ingress.cluster_id
            ),
            ConvertEvent::PortNameResolveError => format!(
                "service port name {} of host {} and path {} resolves error defined in ingress {}/{} within cluster {}",
                self.port_name,
                self.host,
                self.path,
                ingress.namespace,
                ingress.name,
                ingress.cluster_id
            ),
            _ => String::new(),
        }
    }

    pub fn build(&self) -> IngressRoute {
        let service_name = match self.services.as_slice() {
            [] => String::new(),
            [only] => only.name.clone(),
            _ => MULTIPLE_SERVICES.to_string(),
        };
        IngressRoute {
            name: self.route_name.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
            path_type: self.path_type.to_string(),
            cluster_id: self.ingress.cluster_id.clone(),
            namespace: self.ingress.namespace.clone(),
            ingress: self.ingress.name.clone(),
            service_name,
            service_list: self.services.clone(),
            event: self.event.as_str().to_string(),
            message: self.message(),
        }
    }
}

/// Backend services behind a route's destinations
fn services_of(route: &WrapperHttpRoute) -> Vec<BackendService> {
    route
        .route
        .route
        .iter()
        .map(|destination| {
            let (name, namespace) = split_service_fqdn(&destination.destination.host);
            BackendService {
                namespace,
                name,
                port: destination.destination.port.as_ref().map_or(0, |p| p.number),
                weight: destination.weight,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
enum RouteRecord {
    Add(IngressRouteBuilder),
    Invalid(IngressRouteBuilder),
    Update {
        name: String,
        services: Vec<BackendService>,
    },
    Delete(String),
}

/// Route records of one pass
#[derive(Debug, Clone, Default)]
pub struct RouteCache {
    records: Vec<RouteRecord>,
}

impl RouteCache {
    /// Start a record for `route`; nothing is logged until [`RouteCache::add`]
    pub fn new_builder(&self, route: &WrapperHttpRoute) -> IngressRouteBuilder {
        IngressRouteBuilder {
            route_name: route.route.name.clone(),
            host: route.host.clone(),
            path: route.origin_path.clone(),
            path_type: route.origin_path_type,
            ingress: route.config.meta().ingress_ref(),
            services: Vec::new(),
            port_name: String::new(),
            event: ConvertEvent::Normal,
            pre_ingress: None,
        }
    }

    /// Log a finished record; non-normal records go to the invalid side
    pub fn add(&mut self, mut builder: IngressRouteBuilder) {
        if builder.event == ConvertEvent::Normal {
            self.records.push(RouteRecord::Add(builder));
        } else {
            builder.route_name = INVALID_ROUTE_NAME.to_string();
            self.records.push(RouteRecord::Invalid(builder));
        }
    }

    /// Record a synthetic route whose single backend is its first destination
    pub fn new_and_add(&mut self, route: &WrapperHttpRoute) {
        let mut builder = self.new_builder(route);
        builder.services = services_of(route).into_iter().take(1).collect();
        self.add(builder);
    }

    fn is_live(&self, name: &str) -> bool {
        let mut live = false;
        for record in &self.records {
            match record {
                RouteRecord::Add(builder) if builder.route_name == name => live = true,
                RouteRecord::Delete(deleted) if deleted == name => live = false,
                _ => {}
            }
        }
        live
    }

    /// Refresh the backend list of a valid record after its destinations changed
    pub fn update(&mut self, route: &WrapperHttpRoute) {
        if !self.is_live(&route.route.name) {
            error!(
                "Route {} of host {} is missing from the route cache",
                route.route.name, route.host
            );
            return;
        }
        self.records.push(RouteRecord::Update {
            name: route.route.name.clone(),
            services: services_of(route),
        });
    }

    pub fn delete(&mut self, route: &WrapperHttpRoute) {
        self.records.push(RouteRecord::Delete(route.route.name.clone()));
    }

    /// Replay the log into valid and invalid routes
    pub fn extract(&self) -> IngressRouteCollection {
        let mut valid: Vec<IngressRouteBuilder> = Vec::new();
        let mut invalid = Vec::new();

        for record in &self.records {
            match record {
                RouteRecord::Add(builder) => {
                    valid.retain(|b| b.route_name != builder.route_name);
                    valid.push(builder.clone());
                }
                RouteRecord::Invalid(builder) => invalid.push(builder.build()),
                RouteRecord::Update { name, services } => {
                    if let Some(builder) = valid.iter_mut().find(|b| &b.route_name == name) {
                        builder.services = services.clone();
                    }
                }
                RouteRecord::Delete(name) => valid.retain(|b| &b.route_name != name),
            }
        }

        IngressRouteCollection {
            valid: valid.iter().map(IngressRouteBuilder::build).collect(),
            invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DomainProtocol {
    Http,
    Https,
}

/// Domain diagnostic, as served to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressDomain {
    pub host: String,
    pub protocol: DomainProtocol,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
    pub cluster_id: String,
    pub namespace: String,
    pub ingress: String,
    pub event: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngressDomainCollection {
    pub valid: Vec<IngressDomain>,
    pub invalid: Vec<IngressDomain>,
}

#[derive(Debug, Clone)]
pub struct IngressDomainBuilder {
    pub host: String,
    pub protocol: DomainProtocol,
    /// `cluster/namespace/name` of the TLS secret
    pub secret_name: String,
    pub ingress: IngressRef,
    pub event: ConvertEvent,
    pub pre_ingress: Option<IngressRef>,
    pub creation_time: Option<DateTime<Utc>>,
}

impl IngressDomainBuilder {
    pub fn new(host: &str, ingress: IngressRef, creation_time: Option<DateTime<Utc>>) -> Self {
        Self {
            host: host.to_string(),
            protocol: DomainProtocol::Http,
            secret_name: String::new(),
            ingress,
            event: ConvertEvent::Normal,
            pre_ingress: None,
            creation_time,
        }
    }

    pub fn build(&self) -> IngressDomain {
        let message = match (self.event, &self.pre_ingress) {
            (ConvertEvent::DuplicatedTls, Some(pre)) => format!(
                "tls field of host {} defined in ingress {}/{} within cluster {} is conflicted with ingress {}/{} within cluster {}",
                self.host,
                self.ingress.namespace,
                self.ingress.name,
                self.ingress.cluster_id,
                pre.namespace,
                pre.name,
                pre.cluster_id
            ),
            _ => String::new(),
        };
        IngressDomain {
            host: self.host.clone(),
            protocol: self.protocol,
            secret_name: self.secret_name.clone(),
            cluster_id: self.ingress.cluster_id.clone(),
            namespace: self.ingress.namespace.clone(),
            ingress: self.ingress.name.clone(),
            event: self.event.as_str().to_string(),
            message,
            creation_time: self.creation_time,
        }
    }
}

#[derive(Debug, Clone)]
enum DomainRecord {
    Valid(IngressDomainBuilder),
    Invalid(IngressDomainBuilder),
}

/// Domain records of one pass
#[derive(Debug, Clone, Default)]
pub struct DomainCache {
    records: Vec<DomainRecord>,
}

impl DomainCache {
    /// Latest valid record of `host`
    pub fn valid(&self, host: &str) -> Option<&IngressDomainBuilder> {
        self.records.iter().rev().find_map(|record| match record {
            DomainRecord::Valid(builder) if builder.host == host => Some(builder),
            _ => None,
        })
    }

    /// Record the current valid state of a host, replacing earlier ones
    pub fn set_valid(&mut self, builder: IngressDomainBuilder) {
        self.records.push(DomainRecord::Valid(builder));
    }

    pub fn push_invalid(&mut self, builder: IngressDomainBuilder) {
        self.records.push(DomainRecord::Invalid(builder));
    }

    /// Replay the log; valid domains come out sorted by host
    pub fn extract(&self) -> IngressDomainCollection {
        let mut valid = std::collections::BTreeMap::new();
        let mut invalid = Vec::new();
        for record in &self.records {
            match record {
                DomainRecord::Valid(builder) => {
                    valid.insert(builder.host.clone(), builder.build());
                }
                DomainRecord::Invalid(builder) => invalid.push(builder.build()),
            }
        }
        IngressDomainCollection {
            valid: valid.into_values().collect(),
            invalid,
        }
    }
}
