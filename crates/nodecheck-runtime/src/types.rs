use crate::error::{ProbeError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Node, NodeCondition, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Label key carried by every probe pod
pub const PROBE_LABEL_KEY: &str = "app";
/// Label value carried by every probe pod
pub const PROBE_LABEL_VALUE: &str = "k8s-node-check";
/// Probe pods are named `<prefix><node uid>`
pub const PROBE_NAME_PREFIX: &str = "k8s-node-check-";
/// Name of the single container in a probe pod
pub const PROBE_CONTAINER_NAME: &str = "probe";
/// Message written into the signal condition on remediation
pub const SIGNAL_MESSAGE: &str = "k8s-node-check";

/// Label selector matching all probe pods
pub fn probe_label_selector() -> String {
    format!("{}={}", PROBE_LABEL_KEY, PROBE_LABEL_VALUE)
}

/// Deterministic probe pod name for a node UID
pub fn probe_pod_name(node_uid: &str) -> String {
    format!("{}{}", PROBE_NAME_PREFIX, node_uid)
}

/// Convert a std duration to a chrono duration, saturating on overflow
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Tunables for one run of the prober
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Max time a probe may sit in Pending before the node is flagged
    pub create_threshold: Duration,
    /// Max time a probe may sit in Terminating before the node is flagged
    pub terminate_threshold: Duration,
    /// Target cadence between reconciliation passes
    pub tick_interval: Duration,
    /// Namespace probe pods are created in
    pub namespace: String,
    /// Image of the probe container
    pub image: String,
    /// Node condition type rewritten when a node fails a probe
    pub signal_condition: String,
    /// Nodes younger than this are not judged on Pending probes
    pub node_warmup: Duration,
    /// Wait between failed listings during the bootstrap sweep
    pub bootstrap_backoff: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            create_threshold: Duration::from_secs(10),
            terminate_threshold: Duration::from_secs(15),
            tick_interval: Duration::from_secs(5),
            namespace: "default".to_string(),
            image: "ghcr.io/matti/bause:user".to_string(),
            signal_condition: "PIDPressure".to_string(),
            node_warmup: Duration::from_secs(60),
            bootstrap_backoff: Duration::from_secs(1),
        }
    }
}

/// How a pod deletion should be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Platform-default grace period
    Graceful,
    /// Zero grace period, skips normal termination
    Force,
}

impl DeletePolicy {
    pub fn grace_period_seconds(&self) -> Option<i64> {
        match self {
            DeletePolicy::Graceful => None,
            DeletePolicy::Force => Some(0),
        }
    }
}

/// Point-in-time copy of a Node, taken once per tick
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub uid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub unschedulable: bool,
    pub conditions: Vec<NodeCondition>,
    /// Full deep copy, used as the base object for status updates
    pub node: Node,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Result<Self> {
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| ProbeError::internal_error("Node has no name"))?;
        let created_at = node
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .ok_or_else(|| {
                ProbeError::internal_error(format!("Node {} has no creation timestamp", name))
            })?;

        Ok(Self {
            uid: node.metadata.uid.clone(),
            created_at,
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            conditions: node
                .status
                .as_ref()
                .and_then(|s| s.conditions.clone())
                .unwrap_or_default(),
            node: node.clone(),
            name,
        })
    }

    /// Schedulable and reporting Ready=True
    pub fn is_eligible(&self) -> bool {
        !self.unschedulable
            && self
                .conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Lifecycle phase of a probe pod as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbePhase {
    Pending,
    Running,
    /// Running with a deletion timestamp
    Terminating,
    Other(String),
}

impl ProbePhase {
    pub fn classify(phase: Option<&str>, deletion_requested: bool) -> Self {
        match phase.unwrap_or("") {
            "Pending" => ProbePhase::Pending,
            "Running" if deletion_requested => ProbePhase::Terminating,
            "Running" => ProbePhase::Running,
            "Terminating" => ProbePhase::Terminating,
            other => ProbePhase::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbePhase::Pending => write!(f, "Pending"),
            ProbePhase::Running => write!(f, "Running"),
            ProbePhase::Terminating => write!(f, "Terminating"),
            ProbePhase::Other(s) if s.is_empty() => write!(f, "<none>"),
            ProbePhase::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Point-in-time copy of a probe pod
#[derive(Debug, Clone)]
pub struct ProbePod {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub phase: ProbePhase,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub deletion_grace_period: Option<Duration>,
}

impl ProbePod {
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| ProbeError::internal_error("Pod has no name"))?;
        let created_at = pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .ok_or_else(|| {
                ProbeError::internal_error(format!("Pod {} has no creation timestamp", name))
            })?;
        let deletion_timestamp = pod.metadata.deletion_timestamp.as_ref().map(|t| t.0);
        let deletion_grace_period = pod
            .metadata
            .deletion_grace_period_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64));
        let phase = ProbePhase::classify(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            deletion_timestamp.is_some(),
        );

        Ok(Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            created_at,
            phase,
            deletion_timestamp,
            deletion_grace_period,
            name,
        })
    }

    pub fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Time spent terminating: `grace - (deletionTimestamp - now)`.
    ///
    /// The platform sets the deletion timestamp to request time plus grace
    /// period, so this is the time since deletion was requested.
    pub fn time_in_terminating(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let deadline = self.deletion_timestamp?;
        let grace = self.deletion_grace_period?;
        Some(to_chrono(grace) - (deadline - now))
    }
}

/// Build the probe pod pinned to a node
pub fn build_probe_pod(node_uid: &str, node_name: &str, settings: &ProbeSettings) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(PROBE_LABEL_KEY.to_string(), PROBE_LABEL_VALUE.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(probe_pod_name(node_uid)),
            namespace: Some(settings.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            containers: vec![Container {
                name: PROBE_CONTAINER_NAME.to_string(),
                image: Some(settings.image.clone()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}
