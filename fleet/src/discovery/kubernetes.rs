//! [ClusterApi] over the Kubernetes REST API.
//!
//! Workloads are StatefulSets. Inside a pod the client authenticates with the mounted
//! service-account credentials; elsewhere it reads a kubeconfig (or explicit overrides from
//! [KubernetesConfig]). Bearer tokens and client certificates are supported; credential
//! plugins are not.

use super::{ClusterApi, Error, Namespace, Service, ServicePort, Workload};
use crate::{
    config::KubernetesConfig,
    rpc::{Identity, Tls},
    selector::Selector,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Certificate, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether the process runs inside a pod with a mounted service account.
pub fn in_cluster() -> bool {
    env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        && env::var_os("KUBERNETES_SERVICE_PORT").is_some()
        && Path::new(SERVICE_ACCOUNT_DIR).join("token").exists()
}

#[derive(Clone, Debug)]
enum Token {
    None,
    Static(String),
    /// Re-read on every request (service-account tokens rotate).
    File(PathBuf),
}

/// Kubernetes API client.
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    base: String,
    token: Token,
    tls: Tls,
    in_cluster: bool,
}

impl Client {
    /// Build a client from the pod's service-account mount.
    pub fn from_service_account() -> Result<Self, Error> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Kubeconfig("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| Error::Kubeconfig("KUBERNETES_SERVICE_PORT not set".to_string()))?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let tls = Tls {
            ca: Some(std::fs::read(dir.join("ca.crt"))?),
            ..Tls::default()
        };
        Ok(Self {
            http: http_client(&tls)?,
            base: format!("https://{host}:{port}"),
            token: Token::File(dir.join("token")),
            tls,
            in_cluster: true,
        })
    }

    /// Build a client from a kubeconfig and explicit overrides.
    pub fn from_config(cfg: &KubernetesConfig) -> Result<Self, Error> {
        let kubeconfig = match kubeconfig_path(cfg) {
            Some(path) if cfg.kubeconfig.is_some() || cfg.api_server.is_none() => {
                Some(Kubeconfig::load(&path)?)
            }
            _ => None,
        };
        let current = kubeconfig.as_ref().map(Kubeconfig::current).transpose()?;

        let base = match (&cfg.api_server, &current) {
            (Some(server), _) => server.clone(),
            (None, Some((cluster, _))) => cluster.server.clone(),
            (None, None) => {
                return Err(Error::Kubeconfig(
                    "no api server configured and no kubeconfig found".to_string(),
                ))
            }
        };
        let user = current.as_ref().map(|(_, user)| user);
        let token = match (&cfg.token, &cfg.token_file, user) {
            (Some(token), _, _) => Token::Static(token.clone()),
            (None, Some(file), _) => Token::File(PathBuf::from(file)),
            (None, None, Some(user)) => user.token(),
            (None, None, None) => Token::None,
        };
        let identity = user.map(UserEntry::identity).transpose()?.flatten();
        if matches!(token, Token::None) && identity.is_none() {
            if let Some(plugin) = user.and_then(UserEntry::plugin) {
                return Err(Error::Kubeconfig(format!(
                    "unsupported user authentication: {plugin} (set kubernetes.token or reach the api server through kubectl proxy)"
                )));
            }
        }
        let tls = match &current {
            Some((cluster, _)) => Tls {
                ca: cluster.ca()?,
                identity,
                insecure: cfg.insecure || cluster.insecure,
            },
            None => Tls {
                insecure: cfg.insecure,
                ..Tls::default()
            },
        };
        Ok(Self {
            http: http_client(&tls)?,
            base: base.trim_end_matches('/').to_string(),
            token,
            tls,
            in_cluster: false,
        })
    }

    /// Use the service account when running in a pod, the kubeconfig otherwise.
    pub fn detect(cfg: &KubernetesConfig) -> Result<Self, Error> {
        if cfg.api_server.is_none() && cfg.kubeconfig.is_none() && in_cluster() {
            return Self::from_service_account();
        }
        Self::from_config(cfg)
    }

    /// The bearer token presented to the API server, if any.
    pub async fn token(&self) -> Result<Option<String>, Error> {
        match &self.token {
            Token::None => Ok(None),
            Token::Static(token) => Ok(Some(token.clone())),
            Token::File(path) => Ok(Some(
                tokio::fs::read_to_string(path).await?.trim().to_string(),
            )),
        }
    }

    /// TLS material used to reach the API server (and anything proxied through it).
    pub fn tls(&self) -> &Tls {
        &self.tls
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        selector: Option<&Selector>,
    ) -> Result<Option<T>, Error> {
        let mut request = self.http.get(format!("{}{path}", self.base));
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            request = request.query(&[("labelSelector", selector.to_string())]);
        }
        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| Error::Http {
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| Error::Http {
            path: path.to_string(),
            source,
        })?;
        debug!(path, status = status.as_u16(), "metadata request");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| Error::Decode {
                path: path.to_string(),
                source,
            })
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        selector: &Selector,
    ) -> Result<Vec<T>, Error> {
        let list: Option<List<T>> = self.get(path, Some(selector)).await?;
        Ok(list.and_then(|l| l.items).unwrap_or_default())
    }
}

fn http_client(tls: &Tls) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(tls.insecure);
    if let Some(ca) = &tls.ca {
        for cert in Certificate::from_pem_bundle(ca).map_err(Error::Client)? {
            builder = builder.add_root_certificate(cert);
        }
    }
    if let Some(identity) = &tls.identity {
        let identity = reqwest::Identity::from_pem(&identity.pem()).map_err(Error::Client)?;
        builder = builder.identity(identity);
    }
    builder.build().map_err(Error::Client)
}

impl ClusterApi for Client {
    fn in_cluster(&self) -> bool {
        self.in_cluster
    }

    fn api_server(&self) -> &str {
        &self.base
    }

    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>, Error> {
        let items: Vec<Object> = self.list("/api/v1/namespaces", selector).await?;
        Ok(items.into_iter().map(Object::into_namespace).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let object: Option<Object> = self.get(&format!("/api/v1/namespaces/{name}"), None).await?;
        Ok(object.map(Object::into_namespace))
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Workload>, Error> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/statefulsets");
        let items: Vec<Object> = self.list(&path, selector).await?;
        Ok(items
            .into_iter()
            .map(|o| o.into_workload(namespace))
            .collect())
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Service>, Error> {
        let path = format!("/api/v1/namespaces/{namespace}/services");
        let items: Vec<ServiceObject> = self.list(&path, selector).await?;
        Ok(items
            .into_iter()
            .map(|o| o.into_service(namespace))
            .collect())
    }
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Option::default")]
    items: Option<Vec<T>>,
}

#[derive(Deserialize, Default)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Object {
    metadata: ObjectMeta,
}

impl Object {
    fn into_namespace(self) -> Namespace {
        Namespace {
            name: self.metadata.name,
            labels: self.metadata.labels,
        }
    }

    fn into_workload(self, namespace: &str) -> Workload {
        Workload {
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string()),
            name: self.metadata.name,
            labels: self.metadata.labels,
        }
    }
}

#[derive(Deserialize)]
struct ServiceObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Deserialize, Default)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<PortSpec>,
}

#[derive(Deserialize)]
struct PortSpec {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

impl ServiceObject {
    fn into_service(self, namespace: &str) -> Service {
        Service {
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string()),
            name: self.metadata.name,
            labels: self.metadata.labels,
            ports: self
                .spec
                .ports
                .into_iter()
                .map(|p| ServicePort {
                    name: p.name,
                    port: p.port,
                })
                .collect(),
        }
    }
}

fn kubeconfig_path(cfg: &KubernetesConfig) -> Option<PathBuf> {
    if let Some(path) = &cfg.kubeconfig {
        return Some(PathBuf::from(path));
    }
    if let Some(paths) = env::var_os("KUBECONFIG") {
        if let Some(first) = env::split_paths(&paths).find(|p| p.exists()) {
            return Some(first);
        }
    }
    let default = PathBuf::from(env::var_os("HOME")?).join(".kube").join("config");
    default.exists().then_some(default)
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Deserialize, Debug)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize, Debug)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<String>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<String>,
    #[serde(default)]
    client_certificate: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    exec: Option<serde_yaml::Value>,
    #[serde(default)]
    auth_provider: Option<serde_yaml::Value>,
}

impl UserEntry {
    fn token(&self) -> Token {
        match (&self.token, &self.token_file) {
            (Some(token), _) => Token::Static(token.clone()),
            (None, Some(file)) => Token::File(PathBuf::from(file)),
            (None, None) => Token::None,
        }
    }

    /// Client certificate and key, if the user authenticates with one.
    fn identity(&self) -> Result<Option<Identity>, Error> {
        let certificate = pem(
            "client-certificate",
            &self.client_certificate_data,
            &self.client_certificate,
        )?;
        let key = pem("client-key", &self.client_key_data, &self.client_key)?;
        match (certificate, key) {
            (Some(certificate), Some(key)) => Ok(Some(Identity { certificate, key })),
            (None, None) => Ok(None),
            _ => Err(Error::Kubeconfig(
                "client-certificate and client-key must be set together".to_string(),
            )),
        }
    }

    /// Name of the credential plugin this user relies on, if any.
    fn plugin(&self) -> Option<&'static str> {
        if self.exec.is_some() {
            Some("exec")
        } else if self.auth_provider.is_some() {
            Some("auth-provider")
        } else {
            None
        }
    }
}

/// PEM contents of `{field}-data` (base64) or, failing that, of the file at `{field}`.
fn pem(field: &str, data: &Option<String>, path: &Option<String>) -> Result<Option<Vec<u8>>, Error> {
    if let Some(data) = data {
        let pem = BASE64
            .decode(data.trim())
            .map_err(|err| Error::Kubeconfig(format!("{field}-data: {err}")))?;
        return Ok(Some(pem));
    }
    match path {
        Some(path) => Ok(Some(std::fs::read(path)?)),
        None => Ok(None),
    }
}

/// Cluster settings of the current context.
struct ClusterSettings {
    server: String,
    ca: Option<String>,
    ca_data: Option<String>,
    insecure: bool,
}

impl ClusterSettings {
    /// PEM bundle of the cluster's certificate authority, if configured.
    fn ca(&self) -> Result<Option<Vec<u8>>, Error> {
        pem("certificate-authority", &self.ca_data, &self.ca)
    }
}

impl Kubeconfig {
    fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, Error> {
        serde_yaml::from_str(contents).map_err(|err| Error::Kubeconfig(err.to_string()))
    }

    /// Resolve the cluster and user of the current context.
    fn current(&self) -> Result<(ClusterSettings, UserEntry), Error> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .ok_or_else(|| {
                Error::Kubeconfig(format!("context not found: {}", self.current_context))
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| {
                Error::Kubeconfig(format!("cluster not found: {}", context.context.cluster))
            })?;
        let user = match &context.context.user {
            Some(name) => self
                .users
                .iter()
                .find(|u| &u.name == name)
                .map(|u| u.user.clone())
                .ok_or_else(|| Error::Kubeconfig(format!("user not found: {name}")))?,
            None => UserEntry::default(),
        };
        let settings = ClusterSettings {
            server: cluster.cluster.server.clone(),
            ca: cluster.cluster.certificate_authority.clone(),
            ca_data: cluster.cluster.certificate_authority_data.clone(),
            insecure: cluster.cluster.insecure_skip_tls_verify,
        };
        Ok((settings, user))
    }
}
