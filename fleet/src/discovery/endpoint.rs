//! URL construction for cluster-internal services.

use crate::config::ConnectionMode;

/// Builds reachable addresses for services under a resolved [ConnectionMode].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    mode: ConnectionMode,
    api_server: String,
    cluster_domain: String,
}

impl Endpoints {
    /// Resolve `mode` against `in_cluster` and capture what URL construction needs.
    pub fn new(mode: ConnectionMode, in_cluster: bool, api_server: &str, cluster_domain: &str) -> Self {
        Self {
            mode: mode.resolve(in_cluster),
            api_server: api_server.trim_end_matches('/').to_string(),
            cluster_domain: cluster_domain.to_string(),
        }
    }

    /// The resolved mode (never [ConnectionMode::Auto]).
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// In-cluster DNS name of `service`.
    pub fn host(&self, service: &str, namespace: &str) -> String {
        format!("{service}.{namespace}.svc.{}", self.cluster_domain)
    }

    /// HTTP URL for `port` on `service`.
    pub fn url(&self, service: &str, namespace: &str, port: u16) -> String {
        match self.mode {
            ConnectionMode::Proxy => format!(
                "{}/api/v1/namespaces/{namespace}/services/{service}:{port}/proxy/",
                self.api_server
            ),
            ConnectionMode::Direct | ConnectionMode::Auto => {
                format!("http://{}:{port}", self.host(service, namespace))
            }
        }
    }

    /// Consensus transport address of `service`.
    ///
    /// Always the in-cluster DNS form: peers dial it directly and it cannot be proxied.
    pub fn raft_addr(&self, service: &str, namespace: &str, port: u16) -> String {
        format!("{}:{port}", self.host(service, namespace))
    }
}
