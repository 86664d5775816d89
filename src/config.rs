use crate::error::{HotifyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder written in place of secrets in API responses
pub const REDACTED: &str = "********";

/// Named collection of service definitions, ordered by name
pub type SpecSet = BTreeMap<String, ServiceSpec>;

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address for the management API and webhooks
    #[serde(default = "default_address")]
    pub address: String,

    /// Directory where services are cloned and built
    #[serde(default = "default_services_path")]
    pub services_path: PathBuf,

    /// Shared secret used to sign management API requests.
    /// If empty, a random secret is generated at startup and logged
    #[serde(default)]
    pub secret: String,

    /// Seconds to wait after SIGTERM before killing a service (default: 5)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Captured output lines retained per service (default: 1000)
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,

    /// Caddy admin API used to publish routes. Without it routes are
    /// tracked in-process only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caddy: Option<CaddyConfig>,

    /// Managed services keyed by name
    #[serde(default)]
    pub services: SpecSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaddyConfig {
    /// Base URL of the Caddy admin endpoint
    #[serde(default = "default_caddy_admin_url")]
    pub admin_url: String,

    /// Name of the Caddy HTTP server that receives the routes
    #[serde(default = "default_caddy_server")]
    pub server: String,
}

/// Reverse-proxy rule published while a service is running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProxyRule {
    /// Host matcher, e.g. `app.example.com`
    #[serde(rename = "match", default)]
    pub match_rule: String,
    /// Upstream dial address, e.g. `localhost:8080`
    #[serde(default)]
    pub upstream: String,
}

/// Durable definition of a managed service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service name, used for logging and as folder name.
    /// Defaults to the key in the services map
    #[serde(default)]
    pub name: String,
    /// Git repository URL
    pub repo: String,
    /// Command that runs the service, executed in the checkout
    pub exec: String,
    /// Command that builds the service, executed in the checkout
    #[serde(default)]
    pub build: String,
    /// Restart the service when it exits unexpectedly
    #[serde(default)]
    pub restart: bool,
    /// Maximum number of automatic restarts before giving up
    #[serde(default, alias = "max_restarts")]
    pub max_restarts: u32,
    /// Webhook secret; webhooks are unauthenticated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyRule>,
}

impl ServiceSpec {
    /// Collapse empty optional fields the way clients send them
    /// (`"secret": ""`, `"proxy": {"match": ""}`) into `None`.
    pub fn normalize(&mut self) {
        if self.secret.as_deref().is_some_and(str::is_empty) {
            self.secret = None;
        }
        if self
            .proxy
            .as_ref()
            .is_some_and(|p| p.match_rule.trim().is_empty())
        {
            self.proxy = None;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !is_valid_service_name(&self.name) {
            return Err(format!(
                "Service '{}' has an invalid name (use 1-64 of [A-Za-z0-9._-])",
                self.name
            ));
        }
        if self.repo.trim().is_empty() {
            return Err(format!("Service '{}' requires 'repo'", self.name));
        }
        if self.exec.trim().is_empty() {
            return Err(format!("Service '{}' requires 'exec'", self.name));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.upstream.trim().is_empty() {
                return Err(format!(
                    "Service '{}' proxy rule '{}' requires 'upstream'",
                    self.name, proxy.match_rule
                ));
            }
        }
        Ok(())
    }

    pub fn redacted(&self) -> Self {
        let mut spec = self.clone();
        if spec.secret.is_some() {
            spec.secret = Some(REDACTED.to_string());
        }
        spec
    }
}

/// Names become directory names under `servicesPath`
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn default_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_services_path() -> PathBuf {
    PathBuf::from("./services")
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_max_log_lines() -> usize {
    1000
}

fn default_caddy_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_caddy_server() -> String {
    "srv0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            services_path: default_services_path(),
            secret: String::new(),
            stop_timeout_secs: default_stop_timeout(),
            max_log_lines: default_max_log_lines(),
            caddy: None,
            services: SpecSet::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HotifyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse, fill in defaults derived from keys, and validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| HotifyError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HotifyError::Config(e.to_string()))
    }

    fn normalize(&mut self) {
        for (key, spec) in self.services.iter_mut() {
            if spec.name.is_empty() {
                spec.name = key.clone();
            }
            spec.normalize();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (key, spec) in &self.services {
            if spec.name != *key {
                errors.push(format!(
                    "Service key '{}' does not match its name '{}'",
                    key, spec.name
                ));
            }
            if let Err(e) = spec.validate() {
                errors.push(e);
            }
        }

        if self.address.trim().is_empty() {
            errors.push("'address' must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(HotifyError::Config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn service_path(&self, name: &str) -> PathBuf {
        self.services_path.join(name)
    }

    /// Copy with every secret replaced by a placeholder
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.secret.is_empty() {
            config.secret = REDACTED.to_string();
        }
        for spec in config.services.values_mut() {
            *spec = spec.redacted();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
address = "0.0.0.0:8000"
servicesPath = "/srv/hotify"
secret = "s3cret"

[caddy]
adminUrl = "http://127.0.0.1:2019"

[services.api]
repo = "https://example.com/api.git"
exec = "./api"
build = "make"
restart = true
maxRestarts = 3
secret = "hook"

[services.api.proxy]
match = "api.example.com"
upstream = "localhost:8080"

[services.worker]
repo = "https://example.com/worker.git"
exec = "python worker.py"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.address, "0.0.0.0:8000");
        assert_eq!(config.services_path, PathBuf::from("/srv/hotify"));
        assert_eq!(config.caddy.as_ref().unwrap().server, "srv0");
        assert_eq!(config.services.len(), 2);

        let api = &config.services["api"];
        assert_eq!(api.name, "api");
        assert!(api.restart);
        assert_eq!(api.max_restarts, 3);
        assert_eq!(api.secret.as_deref(), Some("hook"));
        assert_eq!(api.proxy.as_ref().unwrap().match_rule, "api.example.com");

        let worker = &config.services["worker"];
        assert_eq!(worker.name, "worker");
        assert!(!worker.restart);
        assert_eq!(worker.build, "");
        assert!(worker.proxy.is_none());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.address, "127.0.0.1:3000");
        assert_eq!(config.services_path, PathBuf::from("./services"));
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_log_lines, 1000);
        assert!(config.caddy.is_none());
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_empty_optional_fields_are_dropped() {
        let toml = r#"
[services.app]
repo = "https://example.com/app.git"
exec = "./run.sh"
secret = ""

[services.app.proxy]
match = ""
upstream = ""
"#;
        let config = Config::from_toml(toml).unwrap();
        let app = &config.services["app"];
        assert!(app.secret.is_none());
        assert!(app.proxy.is_none());
    }

    #[test]
    fn test_validate_requires_repo_and_exec() {
        let toml = r#"
[services.app]
repo = ""
exec = "./run.sh"

[services.other]
repo = "https://example.com/other.git"
exec = ""
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("'app' requires 'repo'"));
        assert!(err.contains("'other' requires 'exec'"));
    }

    #[test]
    fn test_validate_proxy_requires_upstream() {
        let toml = r#"
[services.app]
repo = "https://example.com/app.git"
exec = "./run.sh"
proxy = { match = "app.example.com" }
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("requires 'upstream'"));
    }

    #[test]
    fn test_validate_rejects_mismatched_name() {
        let toml = r#"
[services.app]
name = "other"
repo = "https://example.com/app.git"
exec = "./run.sh"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_service_names() {
        assert!(is_valid_service_name("app"));
        assert!(is_valid_service_name("my-app_2.v1"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name(".."));
        assert!(!is_valid_service_name("../etc"));
        assert!(!is_valid_service_name("a/b"));
        assert!(!is_valid_service_name(&"x".repeat(65)));
    }

    #[test]
    fn test_json_service_spec_uses_camel_case() {
        let spec: ServiceSpec = serde_json::from_str(
            r#"{"name":"app","repo":"r","exec":"e","build":"b","restart":true,"maxRestarts":4,
                "secret":"","proxy":{"match":"app.local","upstream":"localhost:1"}}"#,
        )
        .unwrap();
        assert_eq!(spec.max_restarts, 4);
        assert_eq!(spec.proxy.unwrap().upstream, "localhost:1");
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = Config {
            secret: "top".to_string(),
            ..Default::default()
        };
        config.services.insert(
            "app".to_string(),
            ServiceSpec {
                name: "app".to_string(),
                repo: "r".to_string(),
                exec: "e".to_string(),
                secret: Some("hook".to_string()),
                ..Default::default()
            },
        );

        let redacted = config.redacted();
        assert_eq!(redacted.secret, REDACTED);
        assert_eq!(redacted.services["app"].secret.as_deref(), Some(REDACTED));
        assert_eq!(config.services["app"].secret.as_deref(), Some("hook"));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config {
            secret: "s".to_string(),
            ..Default::default()
        };
        config.services.insert(
            "app".to_string(),
            ServiceSpec {
                name: "app".to_string(),
                repo: "https://example.com/app.git".to_string(),
                exec: "./run.sh".to_string(),
                build: "make".to_string(),
                restart: true,
                max_restarts: 2,
                secret: Some("hook".to_string()),
                proxy: Some(ProxyRule {
                    match_rule: "app.example.com".to_string(),
                    upstream: "localhost:8080".to_string(),
                }),
            },
        );

        let text = config.to_toml().unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
