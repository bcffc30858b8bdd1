use crate::credentials::{Credentials, TokenSource};
use crate::error::{ProbeError, Result};
use crate::traits::ClusterApi;
use crate::types::DeletePolicy;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::DeleteOptions;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-request timeout for API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lightweight HTTP client for the core/v1 API of a Kubernetes API server
pub struct ApiClient {
    base_url: String,
    client: Client,
    token: Option<TokenSource>,
}

impl ApiClient {
    /// Unauthenticated client, mostly useful against a local proxy
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
        }
    }

    /// Build an authenticated client from discovered credentials
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT);

        if let Some(ca) = &credentials.ca_pem {
            for cert in Certificate::from_pem_bundle(ca)
                .map_err(|e| ProbeError::http_error(format!("Invalid CA bundle: {}", e)))?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(pem) = &credentials.client_identity_pem {
            let identity = Identity::from_pem(pem).map_err(|e| {
                ProbeError::http_error(format!("Invalid client certificate/key: {}", e))
            })?;
            builder = builder.identity(identity);
        }

        if credentials.insecure_skip_tls_verify {
            warn!("TLS verification of the API server is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ProbeError::http_error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: credentials.server.trim_end_matches('/').to_string(),
            client,
            token: credentials.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut req = self.client.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.token().await?);
        }
        Ok(req)
    }

    async fn send(req: RequestBuilder) -> Result<Response> {
        req.send()
            .await
            .map_err(|e| ProbeError::http_error(e.to_string()))
    }

    async fn status_error(operation: &str, resp: Response) -> ProbeError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        ProbeError::api_status(operation, status.as_u16(), body)
    }

    /// GET a list endpoint and decode each entry of `items`.
    ///
    /// Entries that fail to decode are skipped with a warning rather than
    /// failing the whole listing.
    async fn get_items<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let req = self.request(Method::GET, path).await?.query(query);
        let resp = Self::send(req).await?;

        if !resp.status().is_success() {
            return Err(Self::status_error(operation, resp).await);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProbeError::decode_error(operation, e.to_string()))?;

        let items = body["items"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value(item) {
                Ok(v) => out.push(v),
                Err(e) => warn!("Failed to parse entry of {}: {}", operation, e),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ClusterApi for ApiClient {
    /// GET /api/v1/nodes
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get_items("list nodes", "/api/v1/nodes", &[]).await
    }

    /// PUT /api/v1/nodes/{name}/status
    async fn update_node_status(&self, name: &str, node: &Node) -> Result<Node> {
        let path = format!("/api/v1/nodes/{}/status", name);
        let resp = Self::send(self.request(Method::PUT, &path).await?.json(node)).await?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<Node>()
                .await
                .map_err(|e| ProbeError::decode_error("node", e.to_string())),
            StatusCode::NOT_FOUND => Err(ProbeError::not_found("Node", name)),
            _ => Err(Self::status_error("PUT node status", resp).await),
        }
    }

    /// GET /api/v1/pods?labelSelector=...
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        self.get_items("list pods", "/api/v1/pods", &[("labelSelector", label_selector)])
            .await
    }

    /// POST /api/v1/namespaces/{namespace}/pods
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let path = format!("/api/v1/namespaces/{}/pods", namespace);
        let resp = Self::send(self.request(Method::POST, &path).await?.json(pod)).await?;

        match resp.status() {
            s if s.is_success() => resp
                .json::<Pod>()
                .await
                .map_err(|e| ProbeError::decode_error("pod", e.to_string())),
            StatusCode::CONFLICT => Err(ProbeError::already_exists(
                "Pod",
                pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
            )),
            _ => Err(Self::status_error("POST pod", resp).await),
        }
    }

    /// DELETE /api/v1/namespaces/{namespace}/pods/{name}
    async fn delete_pod(&self, namespace: &str, name: &str, policy: DeletePolicy) -> Result<()> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", namespace, name);
        let mut req = self.request(Method::DELETE, &path).await?;
        if let Some(grace) = policy.grace_period_seconds() {
            req = req.json(&DeleteOptions {
                grace_period_seconds: Some(grace),
                ..Default::default()
            });
        }

        let resp = Self::send(req).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ProbeError::not_found("Pod", name)),
            _ => Err(Self::status_error("DELETE pod", resp).await),
        }
    }
}
