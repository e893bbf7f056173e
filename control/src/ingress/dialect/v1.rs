//! `networking.k8s.io/v1` Ingress

use crate::annotations::matching::needs_regex_match;
use crate::annotations::Annotations;
use crate::apis::ingress::INGRESS_CLASS_ANNOTATION;
use crate::ingress::dialect::standard::{
    BackendPort, IngressBackend, IngressPath, IngressPathType, IngressRule, IngressTls,
    StandardIngressSpec,
};
use crate::ingress::dialect::{class_selected, AdapterContext, DialectResource};
use crate::ingress::model::{IngressDialect, IngressSpecKind, RawConfig};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, Ingress, IngressBackend as V1Backend, IngressRule as V1Rule, IngressSpec,
    IngressTLS,
};
use kube::ResourceExt;
use tracing::debug;

impl DialectResource for Ingress {
    fn should_process(&self, ctx: &AdapterContext) -> bool {
        let class_name = self.spec.as_ref().and_then(|s| s.ingress_class_name.as_deref());
        let class_object = class_name.and_then(|name| ctx.listers.ingress_classes.get("", name));
        let selected = class_selected(
            &ctx.options.ingress_class,
            self.annotations().get(INGRESS_CLASS_ANNOTATION).map(String::as_str),
            class_object.as_deref(),
            class_name,
        );
        selected && ctx.namespace_watched(&self.namespace().unwrap_or_default())
    }
}

pub fn list(ctx: &AdapterContext) -> Vec<RawConfig> {
    ctx.listers
        .ingresses
        .list()
        .into_iter()
        .filter(|ingress| {
            let selected = ingress.should_process(ctx);
            if !selected {
                debug!("Skipping ingress {}/{}", ingress.namespace().unwrap_or_default(), ingress.name_any());
            }
            selected
        })
        .map(|ingress| {
            let meta = ctx.resource_meta(ingress.as_ref());
            let use_regex = needs_regex_match(Annotations::new(&meta.annotations));
            let spec = ingress
                .spec
                .as_ref()
                .map(to_standard)
                .unwrap_or_default()
                .with_defaults(use_regex);
            RawConfig {
                dialect: IngressDialect::V1,
                meta,
                spec: IngressSpecKind::Standard(spec),
            }
        })
        .collect()
}

fn to_standard(spec: &IngressSpec) -> StandardIngressSpec {
    StandardIngressSpec {
        ingress_class_name: spec.ingress_class_name.clone(),
        default_backend: spec.default_backend.as_ref().map(to_backend),
        tls: spec.tls.iter().flatten().map(to_tls).collect(),
        rules: spec.rules.iter().flatten().map(to_rule).collect(),
    }
}

fn to_backend(backend: &V1Backend) -> IngressBackend {
    let Some(service) = &backend.service else {
        return IngressBackend {
            resource: backend.resource.clone(),
            ..Default::default()
        };
    };
    let service_port = match &service.port {
        Some(port) => match (&port.name, port.number) {
            (Some(name), _) if !name.is_empty() => BackendPort::Name(name.clone()),
            (_, Some(number)) => BackendPort::Number(u32::try_from(number).unwrap_or_default()),
            _ => BackendPort::Unset,
        },
        None => BackendPort::Unset,
    };
    IngressBackend {
        service_name: service.name.clone(),
        service_port,
        resource: backend.resource.clone(),
    }
}

fn to_tls(tls: &IngressTLS) -> IngressTls {
    IngressTls {
        hosts: tls.hosts.clone().unwrap_or_default(),
        secret_name: tls.secret_name.clone().unwrap_or_default(),
    }
}

fn to_path(path: &HTTPIngressPath) -> IngressPath {
    IngressPath {
        path: path.path.clone().unwrap_or_default(),
        path_type: IngressPathType::parse(&path.path_type),
        backend: to_backend(&path.backend),
    }
}

fn to_rule(rule: &V1Rule) -> IngressRule {
    IngressRule {
        host: rule.host.clone().unwrap_or_default(),
        paths: rule
            .http
            .as_ref()
            .map(|http| http.paths.iter().map(to_path).collect()),
    }
}
