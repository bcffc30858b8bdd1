use crate::error::{ProbeError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an external kubeconfig file
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";
/// Where the kubelet mounts the service account into pods
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Bearer token for API requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Static(String),
    /// Re-read on every request so rotated service account tokens are used
    File(PathBuf),
}

impl TokenSource {
    pub async fn token(&self) -> Result<String> {
        match self {
            TokenSource::Static(t) => Ok(t.clone()),
            TokenSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| t.trim().to_string())
                .map_err(|e| {
                    ProbeError::internal_error(format!(
                        "Failed to read token file {}: {}",
                        path.display(),
                        e
                    ))
                }),
        }
    }
}

/// Everything needed to build an authenticated API client
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// API server base URL, e.g. `https://10.96.0.1:443`
    pub server: String,
    /// PEM bundle of trusted cluster CAs
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub token: Option<TokenSource>,
    /// PEM client certificate followed by its private key
    pub client_identity_pem: Option<Vec<u8>>,
}

impl Credentials {
    /// Resolve credentials the way the binary does at startup: the kubeconfig
    /// named by `KUBECONFIG` if set, in-cluster service account otherwise.
    pub fn discover() -> Result<Self> {
        match std::env::var_os(KUBECONFIG_ENV).filter(|p| !p.is_empty()) {
            Some(path) => {
                info!("Loading credentials from kubeconfig {:?}", path);
                Self::from_kubeconfig(Path::new(&path))
            }
            None => {
                info!("KUBECONFIG not set, using in-cluster configuration");
                Self::in_cluster()
            }
        }
    }

    /// Load the current context of a kubeconfig file
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::kubeconfig_error(
                path.display().to_string(),
                e.to_string(),
                "Check that KUBECONFIG points at a readable file",
            )
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig_str(&raw, base_dir).map_err(|e| match e {
            ProbeError::KubeconfigError {
                message,
                suggestion,
                ..
            } => ProbeError::kubeconfig_error(path.display().to_string(), message, suggestion),
            other => other,
        })
    }

    /// Parse kubeconfig YAML. Relative file references resolve against `base_dir`.
    pub fn from_kubeconfig_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let config: Kubeconfig = serde_yaml::from_str(raw).map_err(|e| {
            ProbeError::kubeconfig_error(
                "<inline>",
                format!("YAML parse error: {}", e),
                "Validate the file with `kubectl config view`",
            )
        })?;

        let context_name = config.current_context.as_deref().ok_or_else(|| {
            ProbeError::kubeconfig_error(
                "<inline>",
                "no current-context set",
                "Select a context with `kubectl config use-context <name>`",
            )
        })?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| {
                ProbeError::kubeconfig_error(
                    "<inline>",
                    format!("context '{}' not found", context_name),
                    "List contexts with `kubectl config get-contexts`",
                )
            })?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                ProbeError::kubeconfig_error(
                    "<inline>",
                    format!("cluster '{}' not found", context.cluster),
                    "The current context references a cluster missing from the clusters list",
                )
            })?;
        let user = match &context.user {
            Some(name) => Some(
                config
                    .users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| {
                        ProbeError::kubeconfig_error(
                            "<inline>",
                            format!("user '{}' not found", name),
                            "The current context references a user missing from the users list",
                        )
                    })?,
            ),
            None => None,
        };

        debug!(
            "Using kubeconfig context '{}' (cluster '{}')",
            context_name, context.cluster
        );

        let ca_pem = load_material(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
            "certificate-authority",
        )?;

        let mut credentials = Credentials {
            server: cluster.server.trim_end_matches('/').to_string(),
            ca_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            ..Default::default()
        };

        if let Some(user) = user {
            credentials.token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(TokenSource::Static(token.clone())),
                (None, Some(file)) => Some(TokenSource::File(resolve(base_dir, file))),
                (None, None) => None,
            };

            let cert = load_material(
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                base_dir,
                "client-certificate",
            )?;
            let key = load_material(
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                base_dir,
                "client-key",
            )?;
            credentials.client_identity_pem = match (cert, key) {
                (Some(mut cert), Some(key)) => {
                    if !cert.ends_with(b"\n") {
                        cert.push(b'\n');
                    }
                    cert.extend_from_slice(&key);
                    Some(cert)
                }
                (None, None) => None,
                _ => {
                    return Err(ProbeError::kubeconfig_error(
                        "<inline>",
                        "client certificate and client key must be given together",
                        "Set both client-certificate(-data) and client-key(-data) for the user",
                    ))
                }
            };
        }

        Ok(credentials)
    }

    /// In-cluster configuration from the pod environment
    pub fn in_cluster() -> Result<Self> {
        Self::in_cluster_from(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            Path::new(SERVICE_ACCOUNT_DIR),
        )
    }

    pub fn in_cluster_from(
        host: Option<String>,
        port: Option<String>,
        service_account_dir: &Path,
    ) -> Result<Self> {
        let (host, port) = match (host, port) {
            (Some(h), Some(p)) if !h.is_empty() && !p.is_empty() => (h, p),
            _ => {
                return Err(ProbeError::in_cluster_error(
                    "KUBERNETES_SERVICE_HOST and KUBERNETES_SERVICE_PORT must be defined",
                ))
            }
        };

        let token_path = service_account_dir.join("token");
        if !token_path.exists() {
            return Err(ProbeError::in_cluster_error(format!(
                "service account token not found at {}",
                token_path.display()
            )));
        }

        let ca_path = service_account_dir.join("ca.crt");
        let ca_pem = std::fs::read(&ca_path).map_err(|e| {
            ProbeError::in_cluster_error(format!(
                "failed to read CA bundle {}: {}",
                ca_path.display(),
                e
            ))
        })?;

        // IPv6 service hosts need brackets
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        Ok(Credentials {
            server: format!("https://{}:{}", host, port),
            ca_pem: Some(ca_pem),
            insecure_skip_tls_verify: false,
            token: Some(TokenSource::File(token_path)),
            client_identity_pem: None,
        })
    }
}

fn resolve(base_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Inline base64 data wins over a file reference
fn load_material(
    data: Option<&str>,
    file: Option<&str>,
    base_dir: &Path,
    field: &str,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        let decoded = STANDARD.decode(data.trim()).map_err(|e| {
            ProbeError::kubeconfig_error(
                "<inline>",
                format!("{}-data is not valid base64: {}", field, e),
                "Re-export the kubeconfig, the embedded data is corrupt",
            )
        })?;
        return Ok(Some(decoded));
    }
    if let Some(file) = file {
        let path = resolve(base_dir, file);
        let bytes = std::fs::read(&path).map_err(|e| {
            ProbeError::kubeconfig_error(
                "<inline>",
                format!("failed to read {} {}: {}", field, path.display(), e),
                "Relative paths are resolved against the kubeconfig's directory",
            )
        })?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
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

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "tokenFile", default)]
    token_file: Option<String>,
    #[serde(default)]
    client_certificate: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
}
