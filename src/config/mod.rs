//! Configuration for the operator itself (`OperatorConfig`) and for the connection to the
//! Kubernetes api server (`ClientConfig`).
//!
//! Both can be built in code, but the binary loads them from the environment: `OperatorConfig::from_env`
//! reads the `SIAB_*` variables, and `ClientConfig` prefers the in-cluster service account and falls
//! back to the kubeconfig file.
mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use std::fmt::{self, Debug, Display};
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_OPERATOR_NAME: &str = "siab-operator";
pub const DEFAULT_MESH_NAMESPACE: &str = "istio-system";
pub const DEFAULT_STORAGE_CLASS: &str = "local-path";
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
pub const DEFAULT_SERVER_PORT: u16 = 8080;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

const ENV_OPERATOR_NAME: &str = "SIAB_OPERATOR_NAME";
const ENV_WATCH_NAMESPACE: &str = "SIAB_WATCH_NAMESPACE";
const ENV_MESH_NAMESPACE: &str = "SIAB_MESH_NAMESPACE";
const ENV_DEFAULT_STORAGE_CLASS: &str = "SIAB_DEFAULT_STORAGE_CLASS";
const ENV_WORKERS: &str = "SIAB_WORKERS";
const ENV_RESYNC_SECONDS: &str = "SIAB_RESYNC_SECONDS";
const ENV_MAX_BACKOFF_SECONDS: &str = "SIAB_MAX_BACKOFF_SECONDS";
const ENV_SERVER_PORT: &str = "SIAB_SERVER_PORT";
const ENV_EXPOSE_METRICS: &str = "SIAB_EXPOSE_METRICS";
const ENV_EXPOSE_HEALTH: &str = "SIAB_EXPOSE_HEALTH";

/// Error returned when an environment variable holds a value that can't be parsed
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidValue { variable: &'static str, value: String },
    InvalidWorkerCount,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { variable, value } => {
                write!(f, "Invalid value for {}: '{}'", variable, value)
            }
            ConfigError::InvalidWorkerCount => f.write_str("Worker count must be at least 1"),
        }
    }
}
impl std::error::Error for ConfigError {}

/// Settings that control how the operator watches, schedules and builds resources
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Used as the `app.kubernetes.io/managed-by` label value and the client user agent
    pub operator_name: String,
    /// Restricts watches to a single namespace. `None` watches the whole cluster.
    pub namespace: Option<String>,
    /// Namespace of the service mesh control plane, which is always allowed to reach workloads
    pub mesh_namespace: String,
    /// Storage class used for claims that don't name one
    pub default_storage_class: String,
    /// Maximum number of reconciliations running at the same time
    pub workers: usize,
    /// How long after a successful reconcile an application is reconciled again. `None` disables it.
    pub resync_period: Option<Duration>,
    /// Upper bound for the retry backoff after a failed reconcile
    pub max_backoff: Duration,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl Default for OperatorConfig {
    fn default() -> OperatorConfig {
        OperatorConfig::new(DEFAULT_OPERATOR_NAME)
    }
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> OperatorConfig {
        OperatorConfig {
            operator_name: operator_name.into(),
            namespace: None,
            mesh_namespace: DEFAULT_MESH_NAMESPACE.to_owned(),
            default_storage_class: DEFAULT_STORAGE_CLASS.to_owned(),
            workers: DEFAULT_WORKER_COUNT,
            resync_period: Some(DEFAULT_RESYNC_PERIOD),
            max_backoff: DEFAULT_MAX_BACKOFF,
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    /// Builds the configuration from `SIAB_*` environment variables. Unset variables keep their defaults.
    pub fn from_env() -> Result<OperatorConfig, ConfigError> {
        OperatorConfig::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<OperatorConfig, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let name = lookup(ENV_OPERATOR_NAME).unwrap_or_else(|| DEFAULT_OPERATOR_NAME.to_owned());
        let mut config = OperatorConfig::new(name);

        if let Some(ns) = lookup(ENV_WATCH_NAMESPACE).filter(|ns| !ns.is_empty()) {
            config = config.within_namespace(ns);
        }
        if let Some(mesh) = lookup(ENV_MESH_NAMESPACE).filter(|ns| !ns.is_empty()) {
            config.mesh_namespace = mesh;
        }
        if let Some(class) = lookup(ENV_DEFAULT_STORAGE_CLASS).filter(|c| !c.is_empty()) {
            config.default_storage_class = class;
        }
        if let Some(workers) = parse_var::<usize, _>(&lookup, ENV_WORKERS)? {
            config = config.with_workers(workers)?;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_RESYNC_SECONDS)? {
            let period = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
            config = config.resync_every(period);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_MAX_BACKOFF_SECONDS)? {
            config.max_backoff = Duration::from_secs(secs.max(1));
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, ENV_SERVER_PORT)? {
            config.server_port = port;
        }
        if let Some(expose) = parse_var::<bool, _>(&lookup, ENV_EXPOSE_METRICS)? {
            config = config.expose_metrics(expose);
        }
        if let Some(expose) = parse_var::<bool, _>(&lookup, ENV_EXPOSE_HEALTH)? {
            config = config.expose_health(expose);
        }
        Ok(config)
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_mesh_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.mesh_namespace = namespace.into();
        self
    }

    pub fn with_default_storage_class(mut self, class: impl Into<String>) -> Self {
        self.default_storage_class = class.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        self.workers = workers;
        Ok(self)
    }

    pub fn resync_every(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = expose;
        self
    }

    pub fn expose_health(mut self, expose: bool) -> Self {
        self.expose_health = expose;
        self
    }
}

fn parse_var<T, F>(lookup: &F, variable: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(variable) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { variable, value }),
        _ => Ok(None),
    }
}

/// Where to find the certificate authority that signed the api server's certificate
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// Path to a PEM file
    File(String),
    /// Base64 encoded PEM contents, as they appear in a kubeconfig file
    Contents(String),
}

/// How the client authenticates with the api server
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// A complete `Authorization` header value
    Header(String),
    /// Base64 encoded client certificate and private key
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    /// Paths to a PEM encoded client certificate and private key
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    /// The value for the `Authorization` header, if these credentials are sent as a header
    pub fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

// never print secrets
impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Header(_) => f.write_str("Credentials::Header(<redacted>)"),
            Credentials::Pem { .. } => f.write_str("Credentials::Pem(<redacted>)"),
            Credentials::PemPath {
                certificate_path,
                private_key_path,
            } => write!(
                f,
                "Credentials::PemPath {{ certificate_path: {:?}, private_key_path: {:?} }}",
                certificate_path, private_key_path
            ),
        }
    }
}

/// Everything the http client needs in order to talk to the api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration from the service account that's mounted into every pod
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::bearer_token(&token),
            ca_data,
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the configuration from `$KUBECONFIG` or `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }

    /// Tries the service account first, and falls back to the kubeconfig file
    pub fn load(user_agent: &str) -> Result<ClientConfig, KubeConfigError> {
        ClientConfig::from_service_account(user_agent).or_else(|err| {
            log::debug!(
                "Failed to load ClientConfig from service account ({}), so trying to load from kubeconfig",
                err
            );
            ClientConfig::from_kubeconfig(user_agent)
        })
    }
}
