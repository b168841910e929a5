//! Registry credentials for auto-pushing backup images.
//!
//! Read from the project document's `image.registry` section. The password is
//! preferably supplied through the environment so it never sits in the
//! document in clear text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic fallback variable for the registry password.
pub const PASSWORD_ENV: &str = "DOCKER_PASSWORD";

/// `image.registry` as stored in the project document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Namespace for pushed images; takes precedence over `username`.
    #[serde(default)]
    pub prefix: String,
}

/// Credentials after environment resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: Option<String>,
    /// Environment variable consulted first for the password.
    pub password_env: String,
}

impl RegistryCredentials {
    /// Resolve from a project document using the process environment.
    pub fn from_document(doc: &Value) -> Self {
        Self::resolve(doc, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    ///
    /// Password order: `DOCKER_PASSWORD_<USERNAME>` (upper-cased), then
    /// `DOCKER_PASSWORD`, then the document's own `password` field.
    pub fn resolve(doc: &Value, env: impl Fn(&str) -> Option<String>) -> Self {
        let settings: RegistrySettings = doc
            .get("image")
            .and_then(|i| i.get("registry"))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };

        let username = non_empty(settings.username);
        let password_env = match &username {
            Some(user) => format!("{PASSWORD_ENV}_{}", user.to_uppercase()),
            None => PASSWORD_ENV.to_string(),
        };
        let password = env(&password_env)
            .and_then(non_empty)
            .or_else(|| env(PASSWORD_ENV).and_then(non_empty))
            .or_else(|| non_empty(settings.password));
        let namespace = non_empty(settings.prefix).or_else(|| username.clone());

        Self {
            url: non_empty(settings.url),
            username,
            password,
            namespace,
            password_env,
        }
    }

    /// Registry URL, username and password are all known.
    pub fn is_complete(&self) -> bool {
        self.url.is_some() && self.username.is_some() && self.password.is_some()
    }

    /// Human-readable list of what is missing, for warnings.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.url.is_none() {
            out.push("image.registry.url");
        }
        if self.username.is_none() {
            out.push("image.registry.username");
        }
        if self.password.is_none() {
            out.push("registry password");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "image": {"registry": {
                "url": "registry.example.com",
                "username": "alice",
                "password": "from-doc",
                "prefix": ""
            }}
        })
    }

    #[test]
    fn user_specific_env_wins() {
        let creds = RegistryCredentials::resolve(&doc(), |k| match k {
            "DOCKER_PASSWORD_ALICE" => Some("user-env".into()),
            "DOCKER_PASSWORD" => Some("generic-env".into()),
            _ => None,
        });
        assert_eq!(creds.password.as_deref(), Some("user-env"));
        assert_eq!(creds.password_env, "DOCKER_PASSWORD_ALICE");
        assert!(creds.is_complete());
    }

    #[test]
    fn generic_env_then_document_fallback() {
        let creds = RegistryCredentials::resolve(&doc(), |k| {
            (k == "DOCKER_PASSWORD").then(|| "generic-env".to_string())
        });
        assert_eq!(creds.password.as_deref(), Some("generic-env"));

        let creds = RegistryCredentials::resolve(&doc(), |_| None);
        assert_eq!(creds.password.as_deref(), Some("from-doc"));
    }

    #[test]
    fn prefix_overrides_username_namespace() {
        let mut d = doc();
        d["image"]["registry"]["prefix"] = json!("team");
        let creds = RegistryCredentials::resolve(&d, |_| None);
        assert_eq!(creds.namespace.as_deref(), Some("team"));
    }

    #[test]
    fn missing_section_is_incomplete() {
        let creds = RegistryCredentials::resolve(&json!({}), |_| None);
        assert!(!creds.is_complete());
        assert_eq!(creds.password_env, "DOCKER_PASSWORD");
        assert_eq!(creds.missing().len(), 3);
    }
}
