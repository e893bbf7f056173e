//! Basic authentication
//!
//! Credentials come from a Secret, either as an htpasswd-style `auth` key
//! (`auth-file`) or as one key per user (`auth-map`). The routes of every
//! resource sharing a secret and realm are protected by one filter rule.

use super::{
    split_namespaced_name, AnnotationConfig, AnnotationError, Annotations, GlobalContext, Parser,
};

const AUTH_TYPE: &str = "auth-type";
const AUTH_REALM: &str = "auth-realm";
const AUTH_SECRET: &str = "auth-secret";
const AUTH_SECRET_TYPE: &str = "auth-secret-type";

const BASIC_AUTH: &str = "basic";
const AUTH_FILE_KEY: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthSecretType {
    /// htpasswd lines under the `auth` key
    #[default]
    AuthFile,
    /// every key is a user, every value its password hash
    AuthMap,
}

impl AuthSecretType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "auth-file" => Some(Self::AuthFile),
            "auth-map" => Some(Self::AuthMap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthConfig {
    pub auth_type: String,
    pub auth_realm: String,
    /// `user:hash` entries, sorted
    pub credentials: Vec<String>,
    pub secret_cluster_id: String,
    pub secret_namespace: String,
    pub secret_name: String,
}

impl AuthConfig {
    /// `namespace/name` of the credential secret
    pub fn secret_key(&self) -> String {
        format!("{}/{}", self.secret_namespace, self.secret_name)
    }
}

pub struct Auth;

impl Parser for Auth {
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError> {
        let (Some(auth_type), Some(secret)) = (
            annotations.string_asap(AUTH_TYPE),
            annotations.string_asap(AUTH_SECRET),
        ) else {
            return Ok(());
        };

        if auth_type != BASIC_AUTH {
            return Err(AnnotationError::invalid(
                AUTH_TYPE,
                auth_type,
                "only basic auth is supported",
            ));
        }

        let secret_type = match annotations.string_asap(AUTH_SECRET_TYPE) {
            None => AuthSecretType::default(),
            Some(value) => AuthSecretType::parse(value).ok_or_else(|| {
                AnnotationError::invalid(AUTH_SECRET_TYPE, value, "expected auth-file or auth-map")
            })?,
        };

        let (namespace, name) = split_namespaced_name(secret, &config.namespace);
        // watch the secret even while it is missing so its creation triggers a push
        config.register_secret(ctx, &namespace, &name);

        let missing = || AnnotationError::MissingReference {
            key: AUTH_SECRET.to_string(),
            kind: "secret",
            name: format!("{}/{}", namespace, name),
        };
        let lister = ctx
            .cluster_secret_listers
            .get(&config.cluster_id)
            .ok_or_else(missing)?;
        let auth_secret = lister.get(&namespace, &name).ok_or_else(missing)?;
        let data = auth_secret.data.clone().unwrap_or_default();
        if data.is_empty() {
            return Err(AnnotationError::invalid(
                AUTH_SECRET,
                secret,
                "secret has no data",
            ));
        }

        let mut credentials = match secret_type {
            AuthSecretType::AuthFile => {
                let users = data.get(AUTH_FILE_KEY).ok_or_else(|| {
                    AnnotationError::invalid(AUTH_SECRET, secret, "secret has no auth key")
                })?;
                String::from_utf8_lossy(&users.0)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            }
            AuthSecretType::AuthMap => data
                .iter()
                .map(|(user, password)| {
                    format!("{}:{}", user, String::from_utf8_lossy(&password.0).trim())
                })
                .collect(),
        };
        credentials.sort();

        config.auth = Some(AuthConfig {
            auth_type: auth_type.to_string(),
            auth_realm: annotations
                .string_asap(AUTH_REALM)
                .unwrap_or_default()
                .to_string(),
            credentials,
            secret_cluster_id: config.cluster_id.clone(),
            secret_namespace: namespace,
            secret_name: name,
        });
        Ok(())
    }
}
