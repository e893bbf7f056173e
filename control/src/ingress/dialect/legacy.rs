//! `networking.k8s.io/v1beta1` Ingress

use crate::annotations::matching::needs_regex_match;
use crate::annotations::Annotations;
use crate::apis::ingress::legacy::{
    LegacyHttpIngressPath, LegacyIngressBackend, LegacyIngressRule, LegacyIngressSpec,
    LegacyIngressTls,
};
use crate::apis::ingress::{LegacyIngress, INGRESS_CLASS_ANNOTATION};
use crate::ingress::dialect::standard::{
    BackendPort, IngressBackend, IngressPath, IngressPathType, IngressRule, IngressTls,
    StandardIngressSpec,
};
use crate::ingress::dialect::{class_selected, AdapterContext, DialectResource};
use crate::ingress::model::{IngressDialect, IngressSpecKind, RawConfig};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

impl DialectResource for LegacyIngress {
    fn should_process(&self, ctx: &AdapterContext) -> bool {
        let class_name = self.spec.ingress_class_name.as_deref();
        let class_object = class_name.and_then(|name| ctx.listers.ingress_classes.get("", name));
        class_selected(
            &ctx.options.ingress_class,
            self.annotations().get(INGRESS_CLASS_ANNOTATION).map(String::as_str),
            class_object.as_deref(),
            class_name,
        ) && ctx.namespace_watched(&self.namespace().unwrap_or_default())
    }
}

pub fn list(ctx: &AdapterContext) -> Vec<RawConfig> {
    ctx.listers
        .legacy_ingresses
        .list()
        .into_iter()
        .filter(|ingress| ingress.should_process(ctx))
        .map(|ingress| {
            let meta = ctx.resource_meta(ingress.as_ref());
            let use_regex = needs_regex_match(Annotations::new(&meta.annotations));
            RawConfig {
                dialect: IngressDialect::Legacy,
                spec: IngressSpecKind::Standard(to_standard(&ingress.spec).with_defaults(use_regex)),
                meta,
            }
        })
        .collect()
}

fn to_standard(spec: &LegacyIngressSpec) -> StandardIngressSpec {
    StandardIngressSpec {
        ingress_class_name: spec.ingress_class_name.clone(),
        default_backend: spec.backend.as_ref().map(to_backend),
        tls: spec.tls.iter().map(to_tls).collect(),
        rules: spec.rules.iter().map(to_rule).collect(),
    }
}

fn to_backend(backend: &LegacyIngressBackend) -> IngressBackend {
    let service_port = match &backend.service_port {
        Some(IntOrString::Int(number)) => BackendPort::Number(u32::try_from(*number).unwrap_or_default()),
        // numeric strings are how some clients serialize ports
        Some(IntOrString::String(value)) => match value.parse::<u32>() {
            Ok(number) => BackendPort::Number(number),
            Err(_) => BackendPort::Name(value.clone()),
        },
        None => BackendPort::Unset,
    };
    IngressBackend {
        service_name: backend.service_name.clone(),
        service_port,
        resource: backend.resource.clone(),
    }
}

fn to_tls(tls: &LegacyIngressTls) -> IngressTls {
    IngressTls {
        hosts: tls.hosts.clone(),
        secret_name: tls.secret_name.clone(),
    }
}

fn to_path(path: &LegacyHttpIngressPath) -> IngressPath {
    IngressPath {
        path: path.path.clone(),
        path_type: path.path_type.as_deref().and_then(IngressPathType::parse),
        backend: to_backend(&path.backend),
    }
}

fn to_rule(rule: &LegacyIngressRule) -> IngressRule {
    IngressRule {
        host: rule.host.clone(),
        paths: rule
            .http
            .as_ref()
            .map(|http| http.paths.iter().map(to_path).collect()),
    }
}
