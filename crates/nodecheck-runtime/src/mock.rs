use crate::clock::Clock;
use crate::error::{ProbeError, Result};
use crate::traits::ClusterApi;
use crate::types::DeletePolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Grace period the mock applies to graceful deletes, like the platform default
pub const MOCK_GRACE_PERIOD_SECS: i64 = 30;

/// Manually driven clock for tests
///
/// `sleep` returns immediately after advancing the clock and recording the
/// requested duration.
pub struct MockClock {
    // `Clock::now` is synchronous, so this cannot be an async lock
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += crate::types::to_chrono(by);
    }

    /// Durations passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

/// A call made against the mock cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListNodes,
    ListPods,
    CreatePod { name: String },
    DeletePod { name: String, policy: DeletePolicy },
    UpdateNodeStatus { name: String },
}

#[derive(Default)]
struct MockState {
    nodes: Vec<Node>,
    /// Keyed by (namespace, name)
    pods: BTreeMap<(String, String), Pod>,
    calls: Vec<ApiCall>,
    fail_node_lists: VecDeque<bool>,
    fail_pod_lists: VecDeque<bool>,
    fail_creates: bool,
    fail_deletes: bool,
    fail_status_updates: bool,
}

/// In-memory cluster for testing the prober
///
/// Emulates the parts of API server behaviour the prober relies on: name
/// collisions on create, graceful deletion leaving the pod Terminating with a
/// deletion timestamp, forced deletion removing it outright, and status
/// updates replacing node status. Failures can be scripted per call.
pub struct MockCluster {
    // std locks: never held across an await, and test setup stays synchronous
    state: Mutex<MockState>,
    clock: Arc<dyn Clock>,
    latency: Mutex<Option<(Arc<MockClock>, Duration)>>,
}

impl MockCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            clock,
            latency: Mutex::new(None),
        }
    }

    /// Advance `clock` by `per_call` on every API call
    pub fn set_latency(&self, clock: Arc<MockClock>, per_call: Duration) {
        *self.latency.lock().unwrap() = Some((clock, per_call));
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn remove_node(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .retain(|n| n.metadata.name.as_deref() != Some(name));
    }

    pub fn insert_pod(&self, pod: Pod) {
        let key = pod_key(&pod);
        self.state.lock().unwrap().pods.insert(key, pod);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.values().cloned().collect()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .values()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    /// Set the phase the platform reports for a pod
    pub fn set_pod_phase(&self, name: &str, phase: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pod) = state
            .pods
            .values_mut()
            .find(|p| p.metadata.name.as_deref() == Some(name))
        {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }
    }

    /// Finish termination of a pod, as the kubelet would
    pub fn complete_deletion(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .pods
            .retain(|_, p| p.metadata.name.as_deref() != Some(name));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Script outcomes of upcoming node listings: `true` fails that call
    pub fn script_node_list_failures(&self, script: &[bool]) {
        self.state
            .lock()
            .unwrap()
            .fail_node_lists
            .extend(script.iter().copied());
    }

    /// Script outcomes of upcoming pod listings: `true` fails that call
    pub fn script_pod_list_failures(&self, script: &[bool]) {
        self.state
            .lock()
            .unwrap()
            .fail_pod_lists
            .extend(script.iter().copied());
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn fail_status_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_status_updates = fail;
    }

    fn record(&self, call: ApiCall) -> std::sync::MutexGuard<'_, MockState> {
        if let Some((clock, per_call)) = self.latency.lock().unwrap().as_ref() {
            clock.advance(*per_call);
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

fn matches_selector(pod: &Pod, label_selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    label_selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut state = self.record(ApiCall::ListNodes);
        if state.fail_node_lists.pop_front().unwrap_or(false) {
            return Err(ProbeError::http_error("mock: node list failure"));
        }
        Ok(state.nodes.clone())
    }

    async fn update_node_status(&self, name: &str, node: &Node) -> Result<Node> {
        let mut state = self.record(ApiCall::UpdateNodeStatus {
            name: name.to_string(),
        });
        if state.fail_status_updates {
            return Err(ProbeError::api_status("PUT node status", 500, "mock failure"));
        }
        let existing = state
            .nodes
            .iter_mut()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .ok_or_else(|| ProbeError::not_found("Node", name))?;
        existing.status = node.status.clone();
        debug!("Mock: node status updated: {}", name);
        Ok(existing.clone())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let mut state = self.record(ApiCall::ListPods);
        if state.fail_pod_lists.pop_front().unwrap_or(false) {
            return Err(ProbeError::http_error("mock: pod list failure"));
        }
        Ok(state
            .pods
            .values()
            .filter(|p| matches_selector(p, label_selector))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let now = self.clock.now();
        let mut state = self.record(ApiCall::CreatePod { name: name.clone() });
        if state.fail_creates {
            return Err(ProbeError::api_status("POST pod", 500, "mock failure"));
        }

        let key = (namespace.to_string(), name.clone());
        if state.pods.contains_key(&key) {
            return Err(ProbeError::already_exists("Pod", name));
        }

        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.creation_timestamp = Some(Time(now));
        created.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pods.insert(key, created.clone());
        debug!("Mock: pod created: {}/{}", namespace, name);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, policy: DeletePolicy) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.record(ApiCall::DeletePod {
            name: name.to_string(),
            policy,
        });
        if state.fail_deletes {
            return Err(ProbeError::api_status("DELETE pod", 500, "mock failure"));
        }

        let key = (namespace.to_string(), name.to_string());
        match policy {
            DeletePolicy::Force => {
                state
                    .pods
                    .remove(&key)
                    .ok_or_else(|| ProbeError::not_found("Pod", name))?;
            }
            DeletePolicy::Graceful => {
                let pod = state
                    .pods
                    .get_mut(&key)
                    .ok_or_else(|| ProbeError::not_found("Pod", name))?;
                // Repeated graceful deletes do not move the deadline
                if pod.metadata.deletion_timestamp.is_none() {
                    pod.metadata.deletion_grace_period_seconds = Some(MOCK_GRACE_PERIOD_SECS);
                    pod.metadata.deletion_timestamp =
                        Some(Time(now + chrono::Duration::seconds(MOCK_GRACE_PERIOD_SECS)));
                }
            }
        }
        debug!("Mock: pod delete ({:?}): {}/{}", policy, namespace, name);
        Ok(())
    }
}
