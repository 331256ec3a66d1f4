//! JSON-RPC over HTTP implementations of [Conductor] and [Node].

use super::{ClusterMembership, Conductor, Connector, Error, Node, ServerInfo, SyncStatus, Tls};
use alloy_primitives::B256;
use jsonrpsee::{
    core::{client::ClientT, params::ArrayParams},
    http_client::{CustomCertStore, HeaderMap, HeaderValue, HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default timeout applied to each request by the underlying transport.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds [ConductorClient]s and [NodeClient]s sharing the same transport settings.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    timeout: Duration,
    headers: HeaderMap,
    tls: Option<CustomCertStore>,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            headers: HeaderMap::new(),
            tls: None,
        }
    }

    /// Attach `Authorization: Bearer <token>` to every request (needed when calls are
    /// proxied through the cluster's API server).
    pub fn with_bearer_token(mut self, token: &str) -> Result<Self, Error> {
        let mut value =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| Error::InvalidToken)?;
        value.set_sensitive(true);
        self.headers.insert("authorization", value);
        Ok(self)
    }

    /// Verify HTTPS endpoints (and authenticate to them) with `tls` instead of the platform
    /// defaults.
    pub fn with_tls(mut self, tls: &Tls) -> Result<Self, Error> {
        self.tls = if tls.is_default() {
            None
        } else {
            Some(tls.client_config()?)
        };
        Ok(self)
    }

    fn build(&self, url: &str) -> Result<HttpClient, Error> {
        let mut builder = HttpClientBuilder::default()
            .request_timeout(self.timeout)
            .set_headers(self.headers.clone());
        if let Some(tls) = &self.tls {
            builder = builder.with_custom_cert_store(tls.clone());
        }
        builder
            .build(url)
            .map_err(|source| Error::Build {
                url: url.to_string(),
                source,
            })
    }
}

impl Connector for HttpConnector {
    type Conductor = ConductorClient;
    type Node = NodeClient;

    fn connect(
        &self,
        conductor_url: &str,
        node_url: &str,
    ) -> Result<(Self::Conductor, Self::Node), Error> {
        let conductor = ConductorClient(self.build(conductor_url)?);
        let node = NodeClient(self.build(node_url)?);
        debug!(conductor_url, node_url, "built rpc clients");
        Ok((conductor, node))
    }
}

async fn request<T: DeserializeOwned>(
    client: &HttpClient,
    method: &'static str,
    params: ArrayParams,
) -> Result<T, Error> {
    client
        .request(method, params)
        .await
        .map_err(|source| Error::Call { method, source })
}

/// Conductor reached over JSON-RPC.
#[derive(Clone, Debug)]
pub struct ConductorClient(HttpClient);

impl Conductor for ConductorClient {
    async fn active(&self) -> Result<bool, Error> {
        request(&self.0, "conductor_active", rpc_params![]).await
    }

    async fn leader(&self) -> Result<bool, Error> {
        request(&self.0, "conductor_leader", rpc_params![]).await
    }

    async fn paused(&self) -> Result<bool, Error> {
        request(&self.0, "conductor_paused", rpc_params![]).await
    }

    async fn stopped(&self) -> Result<bool, Error> {
        request(&self.0, "conductor_stopped", rpc_params![]).await
    }

    async fn sequencer_healthy(&self) -> Result<bool, Error> {
        request(&self.0, "conductor_sequencerHealthy", rpc_params![]).await
    }

    async fn pause(&self) -> Result<(), Error> {
        request(&self.0, "conductor_pause", rpc_params![]).await
    }

    async fn resume(&self) -> Result<(), Error> {
        request(&self.0, "conductor_resume", rpc_params![]).await
    }

    async fn transfer_leader(&self) -> Result<(), Error> {
        request(&self.0, "conductor_transferLeader", rpc_params![]).await
    }

    async fn transfer_leader_to_server(&self, id: &str, addr: &str) -> Result<(), Error> {
        request(
            &self.0,
            "conductor_transferLeaderToServer",
            rpc_params![id, addr],
        )
        .await
    }

    async fn override_leader(&self, value: bool) -> Result<(), Error> {
        request(&self.0, "conductor_overrideLeader", rpc_params![value]).await
    }

    async fn leader_with_id(&self) -> Result<ServerInfo, Error> {
        request(&self.0, "conductor_leaderWithID", rpc_params![]).await
    }

    async fn cluster_membership(&self) -> Result<ClusterMembership, Error> {
        request(&self.0, "conductor_clusterMembership", rpc_params![]).await
    }

    async fn add_server_as_voter(&self, id: &str, addr: &str, version: u64) -> Result<(), Error> {
        request(
            &self.0,
            "conductor_addServerAsVoter",
            rpc_params![id, addr, version],
        )
        .await
    }

    async fn add_server_as_nonvoter(
        &self,
        id: &str,
        addr: &str,
        version: u64,
    ) -> Result<(), Error> {
        request(
            &self.0,
            "conductor_addServerAsNonvoter",
            rpc_params![id, addr, version],
        )
        .await
    }

    async fn remove_server(&self, id: &str, version: u64) -> Result<(), Error> {
        request(&self.0, "conductor_removeServer", rpc_params![id, version]).await
    }
}

/// Rollup node reached over JSON-RPC.
#[derive(Clone, Debug)]
pub struct NodeClient(HttpClient);

impl Node for NodeClient {
    async fn sequencer_active(&self) -> Result<bool, Error> {
        request(&self.0, "admin_sequencerActive", rpc_params![]).await
    }

    async fn sync_status(&self) -> Result<SyncStatus, Error> {
        request(&self.0, "optimism_syncStatus", rpc_params![]).await
    }

    async fn stop_sequencer(&self) -> Result<B256, Error> {
        request(&self.0, "admin_stopSequencer", rpc_params![]).await
    }

    async fn start_sequencer(&self, hash: B256) -> Result<(), Error> {
        request(&self.0, "admin_startSequencer", rpc_params![hash]).await
    }

    async fn override_leader(&self) -> Result<(), Error> {
        request(&self.0, "admin_overrideLeader", rpc_params![]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;

    #[tokio::test]
    async fn test_connect_builds_clients() {
        let connector = HttpConnector::new(Duration::from_secs(1));
        connector
            .connect("http://seq-0.ns.svc.cluster.local:8547", "http://seq-0.ns.svc.cluster.local:9545")
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let connector = HttpConnector::default();
        let result = connector.connect("not a url", "http://localhost:9545");
        assert!(matches!(result, Err(Error::Build { .. })));
    }

    #[tokio::test]
    async fn test_proxied_connector_with_cluster_ca() {
        let tls = Tls {
            ca: Some(mocks::CA_PEM.as_bytes().to_vec()),
            identity: Some(mocks::identity()),
            insecure: false,
        };
        let connector = HttpConnector::default()
            .with_bearer_token("abc")
            .unwrap()
            .with_tls(&tls)
            .unwrap();
        assert!(connector.tls.is_some());
        let proxy = "https://api.mock:6443/api/v1/namespaces/alpha/services/seq-0:8547/proxy/";
        connector.connect(proxy, proxy).unwrap();
    }

    #[test]
    fn test_tls_settings() {
        // Platform defaults need no custom store
        let connector = HttpConnector::default().with_tls(&Tls::default()).unwrap();
        assert!(connector.tls.is_none());

        // Skipping verification needs no roots
        let insecure = Tls {
            insecure: true,
            ..Tls::default()
        };
        assert!(HttpConnector::default().with_tls(&insecure).unwrap().tls.is_some());

        // Unparseable material is rejected up front
        let garbage = Tls {
            ca: Some(b"not a certificate".to_vec()),
            ..Tls::default()
        };
        assert!(matches!(
            HttpConnector::default().with_tls(&garbage),
            Err(Error::Tls(_))
        ));
        let keyless = Tls {
            ca: Some(mocks::CA_PEM.as_bytes().to_vec()),
            identity: Some(crate::rpc::Identity {
                certificate: mocks::CLIENT_CERT_PEM.as_bytes().to_vec(),
                key: Vec::new(),
            }),
            insecure: false,
        };
        assert!(matches!(
            HttpConnector::default().with_tls(&keyless),
            Err(Error::Tls(_))
        ));
    }

    #[test]
    fn test_bearer_token_header() {
        let connector = HttpConnector::default().with_bearer_token("abc").unwrap();
        assert_eq!(connector.headers.get("authorization").unwrap(), "Bearer abc");
        assert!(matches!(
            HttpConnector::default().with_bearer_token("bad\ntoken"),
            Err(Error::InvalidToken)
        ));
    }
}
