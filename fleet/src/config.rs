//! YAML configuration for discovery, caching, and RPC behavior.
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::selector::{self, Selector};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path, time::Duration};
use thiserror::Error;

/// Errors that can occur when loading a [Config].
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid selector {field}: {source}")]
    Selector {
        field: &'static str,
        source: selector::Error,
    },
    #[error("no voter roles configured")]
    NoVoterRoles,
    #[error("invalid {0}: must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Policy for building URLs to cluster-internal services.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Direct when running inside the cluster, proxied otherwise.
    #[default]
    Auto,
    /// Always use the in-cluster service DNS name.
    Direct,
    /// Always go through the API server's service proxy.
    Proxy,
}

impl ConnectionMode {
    /// Collapse [ConnectionMode::Auto] given whether the caller runs inside the cluster.
    pub fn resolve(self, in_cluster: bool) -> Self {
        match self {
            Self::Auto if in_cluster => Self::Direct,
            Self::Auto => Self::Proxy,
            other => other,
        }
    }
}

/// Label keys used to group and classify workloads.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LabelKeys {
    pub network: String,
    pub app: String,
    pub role: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            network: "network".to_string(),
            app: "app".to_string(),
            role: "role".to_string(),
        }
    }
}

/// A named service port with a fallback number.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub name: String,
    pub default: u16,
}

/// Ports exposed by each sequencer's service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Ports {
    pub conductor: PortConfig,
    pub node: PortConfig,
    pub raft: PortConfig,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            conductor: PortConfig {
                name: "conductor-rpc".to_string(),
                default: 8547,
            },
            node: PortConfig {
                name: "node-rpc".to_string(),
                default: 9545,
            },
            raft: PortConfig {
                name: "raft".to_string(),
                default: 50050,
            },
        }
    }
}

/// Access to the cluster's metadata API from outside the cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Base URL of the API server (overrides the kubeconfig).
    pub api_server: Option<String>,
    /// Bearer token (overrides the kubeconfig).
    pub token: Option<String>,
    /// File containing a bearer token.
    pub token_file: Option<String>,
    /// Path to a kubeconfig (defaults to `$KUBECONFIG` or `~/.kube/config`).
    pub kubeconfig: Option<String>,
    /// Skip TLS verification of the API server.
    pub insecure: bool,
}

/// Configuration consumed by discovery, the repository, and the controller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Namespaces to search (empty searches every visible namespace).
    pub namespaces: Vec<String>,
    /// Secondary filter applied to namespace labels.
    pub namespace_selector: Option<String>,
    pub workload_selector: String,
    pub service_selector: String,
    pub labels: LabelKeys,
    /// Role label values that make a sequencer a voter.
    pub voter_roles: Vec<String>,
    pub ports: Ports,
    pub connection_mode: ConnectionMode,
    pub cluster_domain: String,
    pub discovery_ttl_secs: u64,
    pub status_ttl_secs: u64,
    pub rpc_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub kubernetes: KubernetesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            namespace_selector: None,
            workload_selector: "app.kubernetes.io/component=sequencer".to_string(),
            service_selector: "app.kubernetes.io/component=sequencer".to_string(),
            labels: LabelKeys::default(),
            voter_roles: vec!["voter".to_string()],
            ports: Ports::default(),
            connection_mode: ConnectionMode::Auto,
            cluster_domain: "cluster.local".to_string(),
            discovery_ttl_secs: 300,
            status_ttl_secs: 5,
            rpc_timeout_secs: 5,
            refresh_timeout_secs: 10,
            action_timeout_secs: 30,
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Config = {
            let mut contents = String::new();
            File::open(path)?.read_to_string(&mut contents)?;
            if contents.trim().is_empty() {
                Config::default()
            } else {
                serde_yaml::from_str(&contents)?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that selectors parse and required values are present.
    pub fn validate(&self) -> Result<(), Error> {
        self.workload_selector()?;
        self.service_selector()?;
        self.namespace_selector()?;
        if self.voter_roles.is_empty() {
            return Err(Error::NoVoterRoles);
        }
        if self.rpc_timeout_secs == 0 {
            return Err(Error::ZeroDuration("rpc_timeout_secs"));
        }
        if self.refresh_timeout_secs == 0 {
            return Err(Error::ZeroDuration("refresh_timeout_secs"));
        }
        if self.action_timeout_secs == 0 {
            return Err(Error::ZeroDuration("action_timeout_secs"));
        }
        Ok(())
    }

    pub fn workload_selector(&self) -> Result<Selector, Error> {
        Selector::parse(&self.workload_selector).map_err(|source| Error::Selector {
            field: "workload_selector",
            source,
        })
    }

    pub fn service_selector(&self) -> Result<Selector, Error> {
        Selector::parse(&self.service_selector).map_err(|source| Error::Selector {
            field: "service_selector",
            source,
        })
    }

    pub fn namespace_selector(&self) -> Result<Option<Selector>, Error> {
        self.namespace_selector
            .as_deref()
            .map(Selector::parse)
            .transpose()
            .map_err(|source| Error::Selector {
                field: "namespace_selector",
                source,
            })
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}
