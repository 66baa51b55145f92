//! Server configuration.
//!
//! Defaults are suitable for tests and single-host deployments; every
//! value can be overridden through `ROOKERY_*` environment variables.

use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Primary domain this server is authoritative for.
    pub domain: String,
    /// Additional domains served alongside the primary one.
    #[serde(default)]
    pub extra_domains: Vec<String>,
    #[serde(default)]
    pub muc: MucConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MucConfig {
    /// Label prepended to the server domain to form the conference
    /// address, e.g. `conference` for `conference.example.org`.
    #[serde(default = "default_muc_subdomain")]
    pub subdomain: String,
}

fn default_muc_subdomain() -> String {
    "conference".to_string()
}

impl Default for MucConfig {
    fn default() -> Self {
        Self {
            subdomain: default_muc_subdomain(),
        }
    }
}

impl ServerConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            extra_domains: Vec::new(),
            muc: MucConfig::default(),
        }
    }

    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let domain = std::env::var("ROOKERY_DOMAIN").unwrap_or_else(|_| "localhost".to_string());
        let extra_domains = std::env::var("ROOKERY_EXTRA_DOMAINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let muc = MucConfig {
            subdomain: std::env::var("ROOKERY_MUC_SUBDOMAIN")
                .unwrap_or_else(|_| default_muc_subdomain()),
        };
        let config = Self {
            domain,
            extra_domains,
            muc,
        };
        info!(domain = %config.domain, muc = %config.muc_domain(), "configuration loaded");
        config
    }

    /// Full conference domain, derived from the primary domain.
    pub fn muc_domain(&self) -> String {
        format!("{}.{}", self.muc.subdomain, self.domain)
    }
}
