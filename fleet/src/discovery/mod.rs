//! Resolve the fleet from cluster metadata.
//!
//! A [Provider] turns whatever describes the fleet into [Network]s of unconnected
//! [Sequencer]s. [ClusterProvider] reads namespaces, workloads, and services through a
//! [ClusterApi] and assembles sequencers from their labels:
//!
//! * the network label on a workload names the [Network] it belongs to,
//! * the app label links a workload to the service exposing it,
//! * the role label decides whether it may vote.
//!
//! Resources that cannot be assembled (missing labels, no matching service) are logged and
//! skipped. Only failures of the metadata API itself fail discovery.

use crate::{
    config::{self, Config, LabelKeys, PortConfig, Ports},
    context::Context,
    network::Network,
    rpc::Connector,
    selector::Selector,
    sequencer::{self, Sequencer},
};
use futures::future::try_join_all;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

mod endpoint;
pub use endpoint::Endpoints;

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

/// Errors that can occur when reading cluster metadata.
#[derive(Error, Debug)]
pub enum Error {
    #[cfg(feature = "kubernetes")]
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[cfg(feature = "kubernetes")]
    #[error("request {path} failed: {source}")]
    Http {
        path: String,
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata api unavailable: {0}")]
    Unavailable(String),
}

/// A namespace and its labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A replicated workload (one sequencer each).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// A port exposed by a [Service].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
}

/// A network service fronting a [Workload].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

impl Service {
    /// The port named `port.name`, or `port.default` if no port carries that name.
    pub fn port(&self, port: &PortConfig) -> u16 {
        self.ports
            .iter()
            .find(|p| p.name.as_deref() == Some(port.name.as_str()))
            .map(|p| p.port)
            .unwrap_or(port.default)
    }
}

/// Read access to cluster metadata.
pub trait ClusterApi: Send + Sync + 'static {
    /// Whether the caller runs inside the cluster it reads.
    fn in_cluster(&self) -> bool;

    /// Base URL of the cluster's API server.
    fn api_server(&self) -> &str;

    /// Namespaces matching `selector`.
    fn list_namespaces(
        &self,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Namespace>, Error>> + Send;

    /// The namespace called `name`, if it exists.
    fn get_namespace(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Namespace>, Error>> + Send;

    /// Workloads in `namespace` matching `selector`.
    fn list_workloads(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Workload>, Error>> + Send;

    /// Services in `namespace` matching `selector`.
    fn list_services(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Service>, Error>> + Send;
}

/// Source of the fleet topology.
pub trait Provider: Send + Sync + 'static {
    type Connector: Connector;

    /// Resolve every [Network]. Sequencers are returned unconnected and without status.
    fn discover(
        &self,
        ctx: &Context,
    ) -> impl Future<Output = Result<Vec<Network<Self::Connector>>, crate::Error>> + Send;
}

/// Discovery settings resolved from a [Config].
#[derive(Clone, Debug)]
struct Settings {
    namespaces: Vec<String>,
    namespace_selector: Option<Selector>,
    workload_selector: Selector,
    service_selector: Selector,
    labels: LabelKeys,
    voter_roles: Vec<String>,
    ports: Ports,
    rpc_timeout: Duration,
}

/// [Provider] backed by labeled cluster resources.
pub struct ClusterProvider<A: ClusterApi, C: Connector> {
    api: A,
    connector: C,
    endpoints: Endpoints,
    settings: Settings,
}

impl<A: ClusterApi, C: Connector> ClusterProvider<A, C> {
    pub fn new(api: A, connector: C, cfg: &Config) -> Result<Self, config::Error> {
        let settings = Settings {
            namespaces: cfg.namespaces.clone(),
            namespace_selector: cfg.namespace_selector()?,
            workload_selector: cfg.workload_selector()?,
            service_selector: cfg.service_selector()?,
            labels: cfg.labels.clone(),
            voter_roles: cfg.voter_roles.clone(),
            ports: cfg.ports.clone(),
            rpc_timeout: cfg.rpc_timeout(),
        };
        let endpoints = Endpoints::new(
            cfg.connection_mode,
            api.in_cluster(),
            api.api_server(),
            &cfg.cluster_domain,
        );
        info!(
            mode = ?endpoints.mode(),
            in_cluster = api.in_cluster(),
            "configured discovery"
        );
        Ok(Self {
            api,
            connector,
            endpoints,
            settings,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Namespaces in scope: the configured list, or every visible namespace, filtered by
    /// the namespace selector when one is set.
    async fn namespaces(&self) -> Result<Vec<String>, Error> {
        let selector = self.settings.namespace_selector.as_ref();
        if self.settings.namespaces.is_empty() {
            let everything = Selector::everything();
            let namespaces = self
                .api
                .list_namespaces(selector.unwrap_or(&everything))
                .await?;
            let mut names = namespaces.into_iter().map(|ns| ns.name).collect::<Vec<_>>();
            names.sort();
            return Ok(names);
        }
        let Some(selector) = selector else {
            return Ok(self.settings.namespaces.clone());
        };
        let mut names = Vec::new();
        for name in &self.settings.namespaces {
            match self.api.get_namespace(name).await? {
                Some(ns) if selector.matches(&ns.labels) => names.push(ns.name),
                Some(_) => debug!(namespace = name.as_str(), "namespace excluded by selector"),
                None => warn!(namespace = name.as_str(), "configured namespace not found"),
            }
        }
        Ok(names)
    }

    /// Assemble sequencer configurations for one namespace.
    async fn scan(&self, namespace: &str) -> Result<Vec<sequencer::Config>, Error> {
        let (mut workloads, services) = futures::try_join!(
            self.api
                .list_workloads(namespace, &self.settings.workload_selector),
            self.api
                .list_services(namespace, &self.settings.service_selector),
        )?;
        workloads.sort_by(|a, b| a.name.cmp(&b.name));

        let app = self.settings.labels.app.as_str();
        let mut by_app: HashMap<&str, &Service> = HashMap::new();
        for service in &services {
            let Some(value) = service.labels.get(app) else {
                debug!(namespace, service = service.name.as_str(), "service has no app label");
                continue;
            };
            if by_app.insert(value.as_str(), service).is_some() {
                warn!(namespace, app = value.as_str(), "multiple services share an app label");
            }
        }

        let mut configs = Vec::with_capacity(workloads.len());
        for workload in &workloads {
            let Some(network) = workload.labels.get(&self.settings.labels.network) else {
                warn!(
                    namespace,
                    workload = workload.name.as_str(),
                    label = self.settings.labels.network.as_str(),
                    "workload missing network label"
                );
                continue;
            };
            let Some(service) = workload
                .labels
                .get(app)
                .and_then(|value| by_app.get(value.as_str()))
            else {
                warn!(
                    namespace,
                    workload = workload.name.as_str(),
                    "no service matches workload"
                );
                continue;
            };
            configs.push(self.assemble(workload, service, network));
        }
        Ok(configs)
    }

    fn assemble(&self, workload: &Workload, service: &Service, network: &str) -> sequencer::Config {
        let ports = &self.settings.ports;
        let voting = workload
            .labels
            .get(&self.settings.labels.role)
            .is_some_and(|role| self.settings.voter_roles.contains(role));
        sequencer::Config {
            id: workload.name.clone(),
            network: network.to_string(),
            raft_addr: self.endpoints.raft_addr(
                &service.name,
                &service.namespace,
                service.port(&ports.raft),
            ),
            conductor_url: self.endpoints.url(
                &service.name,
                &service.namespace,
                service.port(&ports.conductor),
            ),
            node_url: self.endpoints.url(
                &service.name,
                &service.namespace,
                service.port(&ports.node),
            ),
            voting,
            timeout: self.settings.rpc_timeout,
        }
    }

    async fn resolve(&self) -> Result<Vec<Network<C>>, crate::Error> {
        let namespaces = self.namespaces().await?;
        let scanned = try_join_all(namespaces.iter().map(|ns| self.scan(ns))).await?;

        let mut grouped: BTreeMap<String, Vec<Arc<Sequencer<C>>>> = BTreeMap::new();
        for cfg in scanned.into_iter().flatten() {
            let members = grouped.entry(cfg.network.clone()).or_default();
            if members.iter().any(|s| s.id() == cfg.id) {
                warn!(
                    network = cfg.network.as_str(),
                    sequencer = cfg.id.as_str(),
                    "duplicate sequencer id"
                );
                continue;
            }
            members.push(Arc::new(Sequencer::new(cfg, self.connector.clone())));
        }
        let networks = grouped
            .into_iter()
            .map(|(name, sequencers)| Network::new(name, sequencers))
            .collect::<Vec<_>>();
        info!(
            namespaces = namespaces.len(),
            networks = networks.len(),
            sequencers = networks.iter().map(|n| n.len()).sum::<usize>(),
            "discovered fleet"
        );
        Ok(networks)
    }
}

impl<A: ClusterApi, C: Connector> Provider for ClusterProvider<A, C> {
    type Connector = C;

    async fn discover(&self, ctx: &Context) -> Result<Vec<Network<C>>, crate::Error> {
        ctx.run(self.resolve()).await
    }
}
