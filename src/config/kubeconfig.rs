//! Just enough of the kubeconfig format to connect to a cluster from outside of it, which is how the
//! operator runs during development.
use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

const MISSING_CREDENTIAL_MESSAGE: &str = "No supported credentials found in kubeconfig file for the selected context. Supported mechanisms are token, username/password, client certificate, and exec";
const NO_HOME_DIR_MESSAGE: &str = "Unable to determine HOME directory to load ~/.kube/config";

/// Error representing a problem with loading a kubeconfig file, or creating a `ClientConfig`
/// from it.
#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    MissingCredentials,
    NoHomeDir,
    InvalidKubeconfig(String),
    ExecErr(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KubeConfigError::Io(ref e) => write!(f, "IO error: {}", e),
            KubeConfigError::Format(ref e) => write!(f, "Kubeconfig format error: {}", e),
            KubeConfigError::MissingCredentials => f.write_str(MISSING_CREDENTIAL_MESSAGE),
            KubeConfigError::NoHomeDir => f.write_str(NO_HOME_DIR_MESSAGE),
            KubeConfigError::InvalidKubeconfig(ref msg) => {
                write!(f, "Invalid kubeconfig file: {}", msg)
            }
            KubeConfigError::ExecErr(ref msg) => write!(f, "exec error: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

fn kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    std::env::var("KUBECONFIG")
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|home| home.join(".kube").join("config")))
        .ok_or(KubeConfigError::NoHomeDir)
}

pub fn load_kubeconfig(
    user_agent: String,
    file_path: impl AsRef<Path>,
) -> Result<ClientConfig, KubeConfigError> {
    let path = file_path.as_ref();
    let kubeconfig = KubeConfig::load_file(path)?;
    let dir = path.parent().ok_or_else(|| {
        KubeConfigError::InvalidKubeconfig(format!(
            "Cannot determine parent directory of kube config file at path: '{}'",
            path.display()
        ))
    })?;
    kubeconfig.create_client_config(user_agent, dir)
}

pub fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let path = kubeconfig_path()?;
    log::debug!("Loading kubeconfig from '{}'", path.display());
    load_kubeconfig(user_agent, path)
}

fn credentials_for(user: &UserInfo) -> Result<Credentials, KubeConfigError> {
    if let Some(token) = user.token.as_ref() {
        log::debug!("Using auth token from kubeconfig");
        return Ok(Credentials::bearer_token(token));
    }
    if let Some(username) = user.username.as_ref() {
        let pass = user.password.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig("Username is specified but not password".to_owned())
        })?;
        log::debug!("Using username/password from kubeconfig");
        return Ok(Credentials::basic(username, pass));
    }
    if let Some(exec) = user.exec.as_ref() {
        return exec_token(exec).map(|token| Credentials::bearer_token(&token));
    }
    if let Some(certificate_path) = user.client_certificate.as_ref() {
        let private_key_path = user.client_key.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate' is specified, but 'client-key' is missing".to_owned(),
            )
        })?;
        return Ok(Credentials::PemPath {
            certificate_path: certificate_path.clone(),
            private_key_path: private_key_path.clone(),
        });
    }
    if let Some(certificate) = user.client_certificate_data.as_ref() {
        let private_key = user.client_key_data.as_ref().ok_or_else(|| {
            KubeConfigError::InvalidKubeconfig(
                "'client-certificate-data' is specified, but 'client-key-data' is missing"
                    .to_owned(),
            )
        })?;
        return Ok(Credentials::Pem {
            certificate_base64: certificate.clone(),
            private_key_base64: private_key.clone(),
        });
    }

    Err(KubeConfigError::MissingCredentials)
}

fn exec_token(exec: &Exec) -> Result<String, KubeConfigError> {
    use std::process::Command;

    log::debug!("Getting credentials from command: '{}'", exec.command);
    let mut cmd = Command::new(exec.command.as_str());
    cmd.args(exec.args.iter());
    for var in exec.env.iter() {
        cmd.env(var.name.as_str(), var.value.as_str());
    }

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(KubeConfigError::ExecErr(format!(
            "command '{}' exited with {}",
            exec.command, output.status
        )));
    }
    let credential: ExecCredential =
        serde_yaml::from_slice(output.stdout.as_slice()).map_err(|err| {
            KubeConfigError::ExecErr(format!(
                "Invalid stdout from exec command: '{}' : err: {}",
                exec.command, err
            ))
        })?;

    log::info!(
        "Got token from command: '{}' with expiration: {:?}",
        exec.command,
        credential.status.expiration_timestamp
    );
    Ok(credential.status.token)
}

/// output of an `exec` credential plugin
#[derive(Deserialize, Clone, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<String>,
}

// The structs below only cover the parts of the kubeconfig that we read. They're not complete
// definitions, so they stay private to this module.

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedCluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    #[serde(rename = "as")]
    as_user: Option<String>,
    #[serde(default)]
    as_groups: Vec<String>,
    exec: Option<Exec>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecEnv {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Exec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnv>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedUser {
    name: String,
    user: UserInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedContext {
    name: String,
    context: ContextInfo,
}

/// A kubeconfig file that's been loaded into memory
#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
}

impl KubeConfig {
    /// Loads the kubeconfig from `$KUBECONFIG`, or `~/.kube/config` if that's unset, and returns
    /// the path it was loaded from alongside it.
    pub fn load() -> Result<(KubeConfig, PathBuf), KubeConfigError> {
        let path = kubeconfig_path()?;
        let conf = KubeConfig::load_file(&path)?;
        Ok((conf, path))
    }

    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        let reader = File::open(path)?;
        let conf = serde_yaml::from_reader(reader)?;
        Ok(conf)
    }

    /// Creates a `ClientConfig` for the current context. Relative certificate paths are resolved
    /// against `kubeconfig_parent_dir`.
    pub fn create_client_config(
        &self,
        user_agent: String,
        kubeconfig_parent_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        self.resolve(user_agent, kubeconfig_parent_dir, None)
    }

    /// Same as `create_client_config`, but uses the given `credentials` instead of the ones from
    /// the file.
    pub fn create_client_config_with_credentials(
        &self,
        user_agent: String,
        kubeconfig_parent_dir: &Path,
        credentials: Credentials,
    ) -> Result<ClientConfig, KubeConfigError> {
        self.resolve(user_agent, kubeconfig_parent_dir, Some(credentials))
    }

    fn resolve(
        &self,
        user_agent: String,
        kube_config_dir: &Path,
        override_credentials: Option<Credentials>,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = self
            .contexts
            .iter()
            .find(|ctx| ctx.name == self.current_context)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "No context found for current context: '{}'",
                    self.current_context
                ))
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|cluster| cluster.name == context.context.cluster)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "No cluster found for name: '{}'",
                    context.context.cluster
                ))
            })?;
        let user = self
            .users
            .iter()
            .find(|user| user.name == context.context.user)
            .ok_or_else(|| {
                KubeConfigError::InvalidKubeconfig(format!(
                    "No user found for name: '{}'",
                    context.context.user
                ))
            })?;

        let credentials = match override_credentials {
            Some(creds) => creds,
            None => credentials_for(&user.user)?,
        };

        let ca_data = cluster
            .cluster
            .certificate_authority_data
            .clone()
            .map(CAData::Contents)
            .or_else(|| {
                cluster.cluster.certificate_authority.as_ref().map(|ca_path| {
                    let resolved = kube_config_dir.join(ca_path).to_string_lossy().to_string();
                    log::debug!(
                        "Resolved cluster certificate-authority path '{}' to '{}'",
                        ca_path.display(),
                        resolved
                    );
                    CAData::File(resolved)
                })
            });

        Ok(ClientConfig {
            user_agent,
            credentials,
            impersonate: user.user.as_user.clone(),
            impersonate_groups: user.user.as_groups.clone(),
            api_server_endpoint: cluster.cluster.server.clone(),
            ca_data,
            verify_ssl_certs: !cluster.cluster.insecure_skip_tls_verify,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loads_kubeconfig_with_cluster_ca_file() {
        let file = "src/config/test-data/kubeconfig-with-ca-file.yaml";
        let loaded =
            load_kubeconfig("siab-test".to_string(), file).expect("failed to load kubeconfig");
        let expected = CAData::File("src/config/test-data/./dummy-ca.crt".to_string());
        assert_eq!(Some(expected), loaded.ca_data);
        assert_eq!("https://127.0.0.1:6443", loaded.api_server_endpoint);
        assert_eq!(Some("Bearer dev-token"), loaded.credentials.header_value());
        assert_eq!("siab-test", loaded.user_agent);
        assert!(loaded.verify_ssl_certs);
    }

    #[test]
    fn resolves_client_certificate_data_and_impersonation() {
        let yaml = r#"
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: Q0EtREFUQQ==
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: admin
users:
  - name: admin
    user:
      client-certificate-data: Q0VSVA==
      client-key-data: S0VZ
      as: operator
      as-groups: ["system:masters"]
"#;
        let conf: KubeConfig = serde_yaml::from_str(yaml).expect("failed to parse kubeconfig");
        let client_config = conf
            .create_client_config("ua".to_owned(), Path::new("/tmp"))
            .expect("failed to resolve");

        assert_eq!(
            Credentials::Pem {
                certificate_base64: "Q0VSVA==".to_owned(),
                private_key_base64: "S0VZ".to_owned(),
            },
            client_config.credentials
        );
        assert_eq!(Some(CAData::Contents("Q0EtREFUQQ==".to_owned())), client_config.ca_data);
        assert_eq!(Some("operator"), client_config.impersonate.as_deref());
        assert_eq!(vec!["system:masters".to_owned()], client_config.impersonate_groups);
    }

    #[test]
    fn missing_context_is_an_error() {
        let yaml = r#"
current-context: missing
clusters: []
contexts: []
users: []
"#;
        let conf: KubeConfig = serde_yaml::from_str(yaml).expect("failed to parse kubeconfig");
        let err = conf
            .create_client_config("ua".to_owned(), Path::new("/tmp"))
            .expect_err("should fail");
        assert!(matches!(err, KubeConfigError::InvalidKubeconfig(_)));
    }
}
