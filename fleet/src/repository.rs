//! Cached access to the fleet.
//!
//! The [Repository] keeps two independently aging layers:
//!
//! * the topology (which networks and sequencers exist), refreshed by rediscovery once it
//!   is older than the discovery TTL, and
//! * each network's member statuses, refreshed on read once older than the status TTL.
//!
//! A failed rediscovery never clears the topology: readers keep getting the last known
//! networks until discovery succeeds again. Only a failure with nothing cached is an error.

use crate::{
    context::Context,
    discovery::Provider,
    network::Network,
    rpc::Connector,
    Error,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

/// Networks by name.
pub type Networks<C> = BTreeMap<String, Arc<Network<C>>>;

/// Default bound on a single rediscovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache lifetimes and refresh bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Age after which the topology is rediscovered.
    pub discovery_ttl: Duration,
    /// Age after which a network's statuses are refreshed on read.
    pub status_ttl: Duration,
    /// Upper bound on a network status refresh.
    pub refresh_timeout: Duration,
    /// Upper bound on a rediscovery.
    pub discovery_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from(&crate::Config::default())
    }
}

impl From<&crate::Config> for Config {
    fn from(cfg: &crate::Config) -> Self {
        Self {
            discovery_ttl: cfg.discovery_ttl(),
            status_ttl: cfg.status_ttl(),
            refresh_timeout: cfg.refresh_timeout(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

struct Topology<C: Connector> {
    networks: Networks<C>,
    discovered_at: Option<Instant>,
}

/// Two-level cache over a [Provider].
pub struct Repository<P: Provider> {
    provider: P,
    cfg: Config,
    topology: RwLock<Topology<P::Connector>>,
    /// Serializes rediscovery.
    discovering: Mutex<()>,
}

impl<P: Provider> Repository<P> {
    pub fn new(provider: P, cfg: Config) -> Self {
        Self {
            provider,
            cfg,
            topology: RwLock::new(Topology {
                networks: BTreeMap::new(),
                discovered_at: None,
            }),
            discovering: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Cached networks without refreshing anything.
    pub fn cached(&self) -> Networks<P::Connector> {
        self.topology.read().unwrap().networks.clone()
    }

    /// When the topology was last discovered successfully.
    pub fn discovered_at(&self) -> Option<Instant> {
        self.topology.read().unwrap().discovered_at
    }

    fn discovery_stale(&self) -> bool {
        match self.topology.read().unwrap().discovered_at {
            Some(at) => at.elapsed() >= self.cfg.discovery_ttl,
            None => true,
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<Network<P::Connector>>> {
        self.topology.read().unwrap().networks.get(name).cloned()
    }

    /// Replace the topology with the result of a fresh discovery.
    ///
    /// Concurrent callers are serialized; unless `force` is set, a caller that waited for
    /// another discovery reuses its result.
    async fn rediscover(&self, ctx: &Context, force: bool) -> Result<(), Error> {
        let _guard = self.discovering.lock().await;
        if !force && !self.discovery_stale() {
            return Ok(());
        }
        let ctx = ctx.or_timeout(self.cfg.discovery_timeout);
        let networks = self.provider.discover(&ctx).await?;
        let networks = networks
            .into_iter()
            .map(|network| (network.name().to_string(), Arc::new(network)))
            .collect::<Networks<_>>();
        info!(networks = networks.len(), "rediscovered topology");
        let mut topology = self.topology.write().unwrap();
        topology.networks = networks;
        topology.discovered_at = Some(Instant::now());
        Ok(())
    }

    /// Rediscover if the topology is stale, falling back to the cache on failure.
    async fn ensure_topology(&self, ctx: &Context) -> Result<bool, Error> {
        if !self.discovery_stale() {
            return Ok(false);
        }
        match self.rediscover(ctx, false).await {
            Ok(()) => Ok(true),
            Err(err) => {
                if self.topology.read().unwrap().networks.is_empty() {
                    return Err(Error::CacheEmpty(Box::new(err)));
                }
                warn!(error = %err, "rediscovery failed, serving cached topology");
                Ok(true)
            }
        }
    }

    /// Refresh `network` if its statuses are older than the status TTL.
    ///
    /// Failures are recorded on the network and its members, never returned.
    async fn refresh_if_stale(&self, ctx: &Context, network: &Network<P::Connector>) {
        if !network.is_stale(self.cfg.status_ttl) {
            return;
        }
        let ctx = ctx.child_with_timeout(self.cfg.refresh_timeout);
        if let Err(err) = network.update(&ctx).await {
            debug!(network = network.name(), error = %err, "serving partially stale status");
        }
    }

    /// All networks, with topology and statuses refreshed as their TTLs require.
    pub async fn list_networks(&self, ctx: &Context) -> Result<Networks<P::Connector>, Error> {
        self.ensure_topology(ctx).await?;
        let networks = self.cached();
        for network in networks.values() {
            self.refresh_if_stale(ctx, network).await;
        }
        Ok(networks)
    }

    /// The network called `name`, with statuses refreshed if stale.
    ///
    /// An unknown name triggers one rediscovery before failing with
    /// [Error::NetworkNotFound].
    pub async fn get_network(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<Arc<Network<P::Connector>>, Error> {
        let attempted = self.ensure_topology(ctx).await?;
        let network = match self.lookup(name) {
            Some(network) => network,
            None if attempted => return Err(Error::NetworkNotFound(name.to_string())),
            None => {
                if let Err(err) = self.rediscover(ctx, true).await {
                    warn!(network = name, error = %err, "rediscovery for unknown network failed");
                }
                self.lookup(name)
                    .ok_or_else(|| Error::NetworkNotFound(name.to_string()))?
            }
        };
        self.refresh_if_stale(ctx, &network).await;
        Ok(network)
    }

    /// Rediscover now, regardless of the discovery TTL.
    ///
    /// On failure the cached topology is kept unchanged.
    pub async fn refresh_cache(&self, ctx: &Context) -> Result<(), Error> {
        self.rediscover(ctx, true).await
    }

    /// Drop `name` from the cache and mark the topology stale.
    pub fn invalidate_network(&self, name: &str) {
        let mut topology = self.topology.write().unwrap();
        topology.networks.remove(name);
        topology.discovered_at = None;
        debug!(network = name, "invalidated network");
    }

    /// Drop everything cached.
    pub fn invalidate_all(&self) {
        let mut topology = self.topology.write().unwrap();
        topology.networks.clear();
        topology.discovered_at = None;
        debug!("invalidated topology");
    }
}
