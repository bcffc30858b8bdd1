use crate::clock::{residual_delay, Clock};
use crate::error::Result;
use crate::remediation::raise_signal;
use crate::traits::ClusterApi;
use crate::types::{
    build_probe_pod, probe_label_selector, to_chrono, DeletePolicy, NodeRecord, ProbePhase,
    ProbePod, ProbeSettings,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a step of the tick did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NodeListFailed,
    ProbeListFailed,
}

/// Result of one step of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Skipped(SkipReason),
}

/// Which half of the probe lifecycle a node failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// Probe stayed Pending past the create threshold
    Create,
    /// Probe stayed Terminating past the terminate threshold
    Terminate,
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemKind::Create => write!(f, "CREATE"),
            ProblemKind::Terminate => write!(f, "TERMINATING"),
        }
    }
}

/// A node judged unhealthy during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeProblem {
    pub node_name: String,
    pub kind: ProblemKind,
    pub elapsed: chrono::Duration,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub snapshot: StepOutcome,
    pub stale_deletion: StepOutcome,
    pub creation: StepOutcome,
    pub evaluation: StepOutcome,
    /// Probes force-deleted because they predate their node
    pub force_deleted: Vec<String>,
    /// Probes created this tick
    pub created: Vec<String>,
    /// Running probes asked to terminate
    pub deletion_requested: Vec<String>,
    /// Probes whose node disappeared
    pub orphans: Vec<String>,
    pub problems: Vec<ProbeProblem>,
    /// Nodes whose signal condition was pushed successfully
    pub signalled: Vec<String>,
}

impl TickReport {
    fn new() -> Self {
        Self {
            snapshot: StepOutcome::Completed,
            stale_deletion: StepOutcome::Completed,
            creation: StepOutcome::Completed,
            evaluation: StepOutcome::Completed,
            force_deleted: Vec::new(),
            created: Vec::new(),
            deletion_requested: Vec::new(),
            orphans: Vec::new(),
            problems: Vec::new(),
            signalled: Vec::new(),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        let skipped = StepOutcome::Skipped(reason);
        Self {
            snapshot: skipped,
            stale_deletion: skipped,
            creation: skipped,
            evaluation: skipped,
            ..Self::new()
        }
    }
}

/// Nodes and probes as seen at the start of a tick
struct Inventory {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
    /// `None` when the probe listing failed
    probes: Option<Vec<ProbePod>>,
}

impl Inventory {
    fn node(&self, name: Option<&str>) -> Option<&NodeRecord> {
        name.and_then(|n| self.by_name.get(n))
            .map(|&idx| &self.nodes[idx])
    }
}

fn format_elapsed(d: chrono::Duration) -> String {
    format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0)
}

/// Keeps one probe pod per eligible node and flags nodes whose probes do not
/// start or terminate in time
pub struct NodeProber {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    settings: ProbeSettings,
}

impl NodeProber {
    pub fn new(api: Arc<dyn ClusterApi>, clock: Arc<dyn Clock>, settings: ProbeSettings) -> Self {
        Self {
            api,
            clock,
            settings,
        }
    }

    /// Sweep leftovers, then tick at the configured cadence until cancelled.
    ///
    /// Cancellation is observed before a tick starts and while waiting for
    /// the next one; a started tick always runs to completion.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting node prober (create: {:?}, terminate: {:?}, every: {:?})",
            self.settings.create_threshold,
            self.settings.terminate_threshold,
            self.settings.tick_interval
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Node prober cancelled during bootstrap sweep");
                return;
            }
            _ = self.bootstrap_sweep() => {}
        }

        while !token.is_cancelled() {
            let started = self.clock.now();
            let report = self.tick().await;
            debug!(?report, "Tick finished");

            if let Some(delay) =
                residual_delay(self.settings.tick_interval, started, self.clock.now())
            {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = self.clock.sleep(delay) => {}
                }
            }
        }

        info!("Node prober shutting down");
    }

    /// One tick followed by the cadence wait
    pub async fn step(&self) -> TickReport {
        let started = self.clock.now();
        let report = self.tick().await;
        if let Some(delay) = residual_delay(self.settings.tick_interval, started, self.clock.now())
        {
            self.clock.sleep(delay).await;
        }
        report
    }

    /// Delete every probe pod left over from a previous run.
    ///
    /// Retries the listing forever with a fixed backoff; returns once a
    /// listing succeeds, with the number of deletions accepted.
    pub async fn bootstrap_sweep(&self) -> usize {
        let selector = probe_label_selector();
        loop {
            match self.api.list_pods(&selector).await {
                Ok(pods) => {
                    let mut deleted = 0;
                    for pod in &pods {
                        let name = match pod.metadata.name.as_deref() {
                            Some(n) => n,
                            None => continue,
                        };
                        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
                        match self
                            .api
                            .delete_pod(namespace, name, DeletePolicy::Graceful)
                            .await
                        {
                            Ok(()) => deleted += 1,
                            Err(e) if e.is_not_found() => {}
                            Err(e) => warn!("Failed to delete leftover probe {}: {}", name, e),
                        }
                    }
                    info!("Bootstrap sweep removed {} leftover probe pods", deleted);
                    return deleted;
                }
                Err(e) => {
                    warn!(
                        "Failed to list leftover probe pods, retrying in {:?}: {}",
                        self.settings.bootstrap_backoff, e
                    );
                    self.clock.sleep(self.settings.bootstrap_backoff).await;
                }
            }
        }
    }

    /// Run one reconciliation pass: snapshot, stale deletion, creation,
    /// evaluation. Never fails; skipped steps are reported.
    pub async fn tick(&self) -> TickReport {
        let inventory = match self.snapshot().await {
            Ok(inv) => inv,
            Err(e) => {
                error!("node list error: {}", e);
                return TickReport::skipped(SkipReason::NodeListFailed);
            }
        };

        let mut report = TickReport::new();

        report.stale_deletion = match &inventory.probes {
            Some(probes) => {
                self.enforce_stale_deletions(&inventory, probes, &mut report)
                    .await;
                StepOutcome::Completed
            }
            None => StepOutcome::Skipped(SkipReason::ProbeListFailed),
        };

        self.create_probes(&inventory, &mut report).await;
        report.creation = StepOutcome::Completed;

        // Evaluation depends on the same probe view as stale deletion
        if inventory.probes.is_none() {
            report.evaluation = StepOutcome::Skipped(SkipReason::ProbeListFailed);
            return report;
        }

        // Re-list so freshly created probes and platform-side changes are seen
        report.evaluation = match self.list_probes().await {
            Ok(probes) => {
                self.evaluate_probes(&inventory, &probes, &mut report).await;
                StepOutcome::Completed
            }
            Err(e) => {
                warn!("Failed to list probe pods for evaluation: {}", e);
                StepOutcome::Skipped(SkipReason::ProbeListFailed)
            }
        };

        report
    }

    async fn snapshot(&self) -> Result<Inventory> {
        let nodes = self.api.list_nodes().await?;

        let mut records = Vec::with_capacity(nodes.len());
        let mut by_name = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            match NodeRecord::from_node(node) {
                Ok(record) => {
                    by_name.insert(record.name.clone(), records.len());
                    records.push(record);
                }
                Err(e) => warn!("Skipping node: {}", e),
            }
        }

        let probes = match self.list_probes().await {
            Ok(probes) => Some(probes),
            Err(e) => {
                warn!("Failed to list probe pods: {}", e);
                None
            }
        };

        Ok(Inventory {
            nodes: records,
            by_name,
            probes,
        })
    }

    async fn list_probes(&self) -> Result<Vec<ProbePod>> {
        let pods = self.api.list_pods(&probe_label_selector()).await?;
        Ok(pods
            .iter()
            .filter_map(|pod| match ProbePod::from_pod(pod) {
                Ok(probe) => Some(probe),
                Err(e) => {
                    warn!("Skipping probe pod: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Force-delete terminating probes that are older than their node: the
    /// node was recreated under the same name while the old probe drained.
    async fn enforce_stale_deletions(
        &self,
        inventory: &Inventory,
        probes: &[ProbePod],
        report: &mut TickReport,
    ) {
        let now = self.clock.now();

        for probe in probes.iter().filter(|p| p.deletion_requested()) {
            // Missing nodes are left to the orphan cleanup in evaluation
            let node = match inventory.node(probe.node_name.as_deref()) {
                Some(n) => n,
                None => continue,
            };

            let node_age = node.age(now);
            let pod_age = probe.age(now);
            if pod_age > node_age {
                info!(
                    "Probe {} ({}) is older than node {} ({}), force deleting",
                    probe.name,
                    format_elapsed(pod_age),
                    node.name,
                    format_elapsed(node_age)
                );
                if self.delete_probe(probe, DeletePolicy::Force).await {
                    report.force_deleted.push(probe.name.clone());
                }
            }
        }
    }

    async fn create_probes(&self, inventory: &Inventory, report: &mut TickReport) {
        for node in inventory.nodes.iter().filter(|n| n.is_eligible()) {
            let uid = match node.uid.as_deref() {
                Some(uid) => uid,
                None => {
                    warn!("Node {} has no UID, cannot name its probe", node.name);
                    continue;
                }
            };

            let pod = build_probe_pod(uid, &node.name, &self.settings);
            match self.api.create_pod(&self.settings.namespace, &pod).await {
                Ok(created) => {
                    let name = created
                        .metadata
                        .name
                        .or(pod.metadata.name)
                        .unwrap_or_default();
                    debug!("Created probe {} on node {}", name, node.name);
                    report.created.push(name);
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => error!("pod create failed for node {}: {}", node.name, e),
            }
        }
    }

    async fn evaluate_probes(
        &self,
        inventory: &Inventory,
        probes: &[ProbePod],
        report: &mut TickReport,
    ) {
        let create_threshold = to_chrono(self.settings.create_threshold);
        let terminate_threshold = to_chrono(self.settings.terminate_threshold);
        let node_warmup = to_chrono(self.settings.node_warmup);

        for probe in probes {
            let node = match inventory.node(probe.node_name.as_deref()) {
                Some(n) => n,
                None => {
                    info!(
                        "Node {} no longer present, deleting probe {}",
                        probe.node_name.as_deref().unwrap_or("<none>"),
                        probe.name
                    );
                    if self.delete_probe(probe, DeletePolicy::Graceful).await {
                        report.orphans.push(probe.name.clone());
                    }
                    continue;
                }
            };

            let now = self.clock.now();
            let pod_age = probe.age(now);
            let node_age = node.age(now);

            match &probe.phase {
                ProbePhase::Pending => {
                    if node_age < node_warmup {
                        debug!(
                            "Node {} is {} old, too young to judge",
                            node.name,
                            format_elapsed(node_age)
                        );
                        continue;
                    }
                    if pod_age > create_threshold {
                        self.signal_problem(node, ProblemKind::Create, pod_age, now, report)
                            .await;
                    }
                }
                ProbePhase::Running => {
                    // Reaching Running proves scheduling; now prove termination
                    if self.delete_probe(probe, DeletePolicy::Graceful).await {
                        report.deletion_requested.push(probe.name.clone());
                    }
                }
                ProbePhase::Terminating => {
                    if let Some(in_terminating) = probe.time_in_terminating(now) {
                        if in_terminating > terminate_threshold {
                            self.signal_problem(
                                node,
                                ProblemKind::Terminate,
                                in_terminating,
                                now,
                                report,
                            )
                            .await;
                        }
                    }
                }
                ProbePhase::Other(_) => {
                    warn!("UNKNOWN PHASE {} for probe {}", probe.phase, probe.name);
                }
            }
        }
    }

    /// Returns whether the platform accepted the deletion
    async fn delete_probe(&self, probe: &ProbePod, policy: DeletePolicy) -> bool {
        match self
            .api
            .delete_pod(&probe.namespace, &probe.name, policy)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!("Probe {} already gone", probe.name);
                false
            }
            Err(e) => {
                error!("Failed to delete probe {} ({:?}): {}", probe.name, policy, e);
                false
            }
        }
    }

    async fn signal_problem(
        &self,
        node: &NodeRecord,
        kind: ProblemKind,
        elapsed: chrono::Duration,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        warn!(
            node = %node.name,
            kind = %kind,
            elapsed = %format_elapsed(elapsed),
            "PROBLEM {} {} {}",
            kind,
            node.name,
            format_elapsed(elapsed)
        );
        report.problems.push(ProbeProblem {
            node_name: node.name.clone(),
            kind,
            elapsed,
        });

        let updated = match raise_signal(&node.node, &self.settings.signal_condition, now) {
            Some(n) => n,
            None => {
                warn!(
                    "Node {} has no {} condition to raise",
                    node.name, self.settings.signal_condition
                );
                return;
            }
        };

        match self.api.update_node_status(&node.name, &updated).await {
            Ok(_) => {
                info!(
                    "Raised {} on node {}",
                    self.settings.signal_condition, node.name
                );
                report.signalled.push(node.name.clone());
            }
            Err(e) => error!("Failed to update status of node {}: {}", node.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ApiCall, MockClock, MockCluster};
    use crate::types::probe_pod_name;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::time::Duration;

    struct Harness {
        clock: Arc<MockClock>,
        cluster: Arc<MockCluster>,
        prober: NodeProber,
    }

    impl Harness {
        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        fn count(&self, call: &ApiCall) -> usize {
            self.cluster.calls().iter().filter(|c| *c == call).count()
        }

        fn deletes(&self) -> Vec<(String, DeletePolicy)> {
            self.cluster
                .calls()
                .into_iter()
                .filter_map(|c| match c {
                    ApiCall::DeletePod { name, policy } => Some((name, policy)),
                    _ => None,
                })
                .collect()
        }

        fn status_updates(&self) -> usize {
            self.cluster
                .calls()
                .iter()
                .filter(|c| matches!(c, ApiCall::UpdateNodeStatus { .. }))
                .count()
        }

        /// (status, message) of the node's PIDPressure condition
        fn pid_pressure(&self, node: &str) -> (String, Option<String>) {
            let node = self.cluster.node(node).unwrap();
            let cond = node
                .status
                .unwrap()
                .conditions
                .unwrap()
                .into_iter()
                .find(|c| c.type_ == "PIDPressure")
                .unwrap();
            (cond.status, cond.message)
        }
    }

    fn harness() -> Harness {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let cluster = Arc::new(MockCluster::new(clock.clone()));
        let prober = NodeProber::new(cluster.clone(), clock.clone(), ProbeSettings::default());
        Harness {
            clock,
            cluster,
            prober,
        }
    }

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            message: Some("kubelet reported".to_string()),
            ..Default::default()
        }
    }

    fn make_node(name: &str, age_secs: i64, now: DateTime<Utc>) -> Node {
        make_node_with(
            name,
            age_secs,
            now,
            false,
            vec![condition("Ready", "True"), condition("PIDPressure", "False")],
        )
    }

    fn make_node_with(
        name: &str,
        age_secs: i64,
        now: DateTime<Utc>,
        unschedulable: bool,
        conditions: Vec<NodeCondition>,
    ) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-{}", name)),
                creation_timestamp: Some(Time(now - chrono::Duration::seconds(age_secs))),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
        }
    }

    fn make_probe(uid: &str, node_name: &str, created: DateTime<Utc>, phase: &str) -> Pod {
        let mut pod = build_probe_pod(uid, node_name, &ProbeSettings::default());
        pod.metadata.creation_timestamp = Some(Time(created));
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn probe_for(node_name: &str) -> String {
        probe_pod_name(&format!("uid-{}", node_name))
    }

    #[tokio::test]
    async fn test_creates_probe_only_for_eligible_nodes() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("ready", 600, now));
        h.cluster.add_node(make_node_with(
            "cordoned",
            600,
            now,
            true,
            vec![condition("Ready", "True")],
        ));
        h.cluster.add_node(make_node_with(
            "notready",
            600,
            now,
            false,
            vec![condition("Ready", "False")],
        ));
        h.cluster.add_node(make_node_with(
            "unknown",
            600,
            now,
            false,
            vec![condition("Ready", "Unknown")],
        ));
        h.cluster
            .add_node(make_node_with("noconditions", 600, now, false, vec![]));

        let report = h.prober.tick().await;

        assert_eq!(report.created, vec![probe_for("ready")]);
        let pods = h.cluster.pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(
            pods[0].spec.as_ref().unwrap().node_name.as_deref(),
            Some("ready")
        );
        assert_eq!(
            h.count(&ApiCall::CreatePod {
                name: probe_for("ready")
            }),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_creation_is_swallowed() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));

        let first = h.prober.tick().await;
        h.clock.advance(Duration::from_secs(1));
        let second = h.prober.tick().await;

        assert_eq!(first.created, vec![probe_for("a")]);
        assert!(second.created.is_empty());
        assert_eq!(second.creation, StepOutcome::Completed);
        assert_eq!(h.count(&ApiCall::CreatePod { name: probe_for("a") }), 2);
        assert_eq!(h.cluster.pods().len(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_probe_per_node_across_ticks() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));
        h.cluster.add_node(make_node("b", 600, h.now()));

        for i in 0..6 {
            h.prober.step().await;
            // Let the platform start the probes after a couple of ticks
            if i == 1 {
                h.cluster.set_pod_phase(&probe_for("a"), "Running");
            }
            for node in ["a", "b"] {
                let on_node = h
                    .cluster
                    .pods()
                    .iter()
                    .filter(|p| p.spec.as_ref().unwrap().node_name.as_deref() == Some(node))
                    .count();
                assert!(on_node <= 1, "node {} has {} probes", node, on_node);
            }
        }
    }

    #[tokio::test]
    async fn test_pending_probe_past_threshold_signals_node() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(11),
            "Pending",
        ));

        let report = h.prober.tick().await;

        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].kind, ProblemKind::Create);
        assert_eq!(report.problems[0].node_name, "a");
        assert_eq!(report.problems[0].elapsed, chrono::Duration::seconds(11));
        assert_eq!(report.signalled, vec!["a".to_string()]);
        assert_eq!(h.status_updates(), 1);
        assert_eq!(
            h.pid_pressure("a"),
            ("True".to_string(), Some("k8s-node-check".to_string()))
        );
    }

    #[tokio::test]
    async fn test_pending_probe_within_threshold_is_left_alone() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(9),
            "Pending",
        ));

        let report = h.prober.tick().await;

        assert!(report.problems.is_empty());
        assert_eq!(h.status_updates(), 0);
        assert!(h.deletes().is_empty());
        assert_eq!(h.pid_pressure("a").0, "False");
    }

    #[tokio::test]
    async fn test_pending_probe_signals_once_per_tick() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(30),
            "Pending",
        ));

        h.prober.tick().await;
        h.prober.tick().await;

        assert_eq!(h.status_updates(), 2);
        let conditions = h
            .cluster
            .node("a")
            .unwrap()
            .status
            .unwrap()
            .conditions
            .unwrap();
        assert_eq!(conditions.len(), 2);
    }

    #[tokio::test]
    async fn test_young_node_is_not_judged_on_pending_probe() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("fresh", 30, now));
        h.cluster.insert_pod(make_probe(
            "uid-fresh",
            "fresh",
            now - chrono::Duration::seconds(300),
            "Pending",
        ));

        let report = h.prober.tick().await;

        assert!(report.problems.is_empty());
        assert_eq!(h.status_updates(), 0);
    }

    #[tokio::test]
    async fn test_running_probe_gets_single_deletion_request() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(2),
            "Running",
        ));

        let first = h.prober.tick().await;
        assert_eq!(first.deletion_requested, vec![probe_for("a")]);
        assert_eq!(
            h.deletes(),
            vec![(probe_for("a"), DeletePolicy::Graceful)]
        );

        // Now Running with a deletion timestamp, i.e. terminating
        h.clock.advance(Duration::from_secs(5));
        h.cluster.clear_calls();
        let second = h.prober.tick().await;

        assert!(second.deletion_requested.is_empty());
        assert!(second.problems.is_empty());
        assert!(h.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_terminating_probe_past_threshold_signals_node() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        let mut pod = make_probe("uid-a", "a", now - chrono::Duration::seconds(40), "Running");
        // grace 30s, 14s left: terminating for 16s > 15s
        pod.metadata.deletion_grace_period_seconds = Some(30);
        pod.metadata.deletion_timestamp = Some(Time(now + chrono::Duration::seconds(14)));
        h.cluster.insert_pod(pod);

        let report = h.prober.tick().await;

        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].kind, ProblemKind::Terminate);
        assert_eq!(report.problems[0].elapsed, chrono::Duration::seconds(16));
        assert_eq!(h.pid_pressure("a").0, "True");
        assert!(h.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_terminating_probe_within_threshold_is_left_alone() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        let mut pod = make_probe("uid-a", "a", now - chrono::Duration::seconds(40), "Running");
        // grace 30s, 16s left: terminating for 14s
        pod.metadata.deletion_grace_period_seconds = Some(30);
        pod.metadata.deletion_timestamp = Some(Time(now + chrono::Duration::seconds(16)));
        h.cluster.insert_pod(pod);

        let report = h.prober.tick().await;

        assert!(report.problems.is_empty());
        assert_eq!(h.status_updates(), 0);
    }

    #[tokio::test]
    async fn test_terminating_without_grace_period_takes_no_action() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        let mut pod = make_probe("uid-a", "a", now - chrono::Duration::seconds(400), "Running");
        pod.metadata.deletion_timestamp = Some(Time(now - chrono::Duration::seconds(300)));
        h.cluster.insert_pod(pod);

        let report = h.prober.tick().await;

        assert!(report.problems.is_empty());
        assert!(h.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_probe_older_than_its_node_is_force_deleted() {
        let h = harness();
        let now = h.now();
        // Node recreated a minute ago under the same name with a new UID
        h.cluster.add_node(make_node("a", 60, now));
        let mut stale = make_probe("old-uid", "a", now - chrono::Duration::seconds(600), "Running");
        // Only 1s into a 30s grace period, far from the terminate threshold
        stale.metadata.deletion_grace_period_seconds = Some(30);
        stale.metadata.deletion_timestamp = Some(Time(now + chrono::Duration::seconds(29)));
        h.cluster.insert_pod(stale);

        let report = h.prober.tick().await;

        let stale_name = probe_pod_name("old-uid");
        assert_eq!(report.force_deleted, vec![stale_name.clone()]);
        assert!(h.cluster.pod(&stale_name).is_none());
        assert_eq!(h.deletes(), vec![(stale_name, DeletePolicy::Force)]);
        // The new incarnation gets its own probe
        assert_eq!(report.created, vec![probe_for("a")]);
        assert!(report.problems.is_empty());
    }

    #[tokio::test]
    async fn test_stale_deletion_runs_before_creation() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 60, now));
        let mut stale = make_probe("old-uid", "a", now - chrono::Duration::seconds(600), "Running");
        stale.metadata.deletion_grace_period_seconds = Some(30);
        stale.metadata.deletion_timestamp = Some(Time(now));
        h.cluster.insert_pod(stale);

        h.prober.tick().await;

        let calls = h.cluster.calls();
        let force_at = calls
            .iter()
            .position(|c| matches!(c, ApiCall::DeletePod { policy: DeletePolicy::Force, .. }))
            .unwrap();
        let create_at = calls
            .iter()
            .position(|c| matches!(c, ApiCall::CreatePod { .. }))
            .unwrap();
        assert!(force_at < create_at);
    }

    #[tokio::test]
    async fn test_orphan_probe_is_deleted_gracefully() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-gone",
            "gone",
            now - chrono::Duration::seconds(5),
            "Pending",
        ));

        let report = h.prober.tick().await;

        assert_eq!(report.orphans, vec![probe_for("gone")]);
        assert_eq!(
            h.deletes(),
            vec![(probe_for("gone"), DeletePolicy::Graceful)]
        );
        assert!(report.problems.is_empty());
    }

    #[tokio::test]
    async fn test_terminating_orphan_is_not_force_deleted() {
        let h = harness();
        let now = h.now();
        let mut pod = make_probe("uid-gone", "gone", now - chrono::Duration::seconds(600), "Running");
        pod.metadata.deletion_grace_period_seconds = Some(30);
        pod.metadata.deletion_timestamp = Some(Time(now - chrono::Duration::seconds(500)));
        h.cluster.insert_pod(pod);

        let report = h.prober.tick().await;

        assert!(report.force_deleted.is_empty());
        assert_eq!(
            h.deletes(),
            vec![(probe_for("gone"), DeletePolicy::Graceful)]
        );
    }

    #[tokio::test]
    async fn test_removed_node_leaves_orphan_that_is_cleaned_up() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));

        let first = h.prober.tick().await;
        assert_eq!(first.created, vec![probe_for("a")]);

        h.cluster.remove_node("a");
        h.clock.advance(Duration::from_secs(5));
        h.cluster.clear_calls();
        let second = h.prober.tick().await;

        assert_eq!(second.orphans, vec![probe_for("a")]);
        assert!(second.created.is_empty());
        assert!(second.problems.is_empty());
        assert_eq!(
            h.deletes(),
            vec![(probe_for("a"), DeletePolicy::Graceful)]
        );

        // Once the kubelet finishes, nothing is left to act on
        h.cluster.complete_deletion(&probe_for("a"));
        h.clock.advance(Duration::from_secs(5));
        h.cluster.clear_calls();
        let third = h.prober.tick().await;

        assert!(third.orphans.is_empty());
        assert!(h.deletes().is_empty());
        assert!(h.cluster.pods().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deletion_request_is_retried_next_tick() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(2),
            "Running",
        ));
        h.cluster.fail_deletes(true);

        let first = h.prober.tick().await;

        assert_eq!(first.evaluation, StepOutcome::Completed);
        assert!(first.deletion_requested.is_empty());
        assert_eq!(h.deletes().len(), 1);
        assert_eq!(h.status_updates(), 0);

        h.cluster.fail_deletes(false);
        h.clock.advance(Duration::from_secs(5));
        h.cluster.clear_calls();
        let second = h.prober.tick().await;

        assert_eq!(second.deletion_requested, vec![probe_for("a")]);
        assert_eq!(
            h.deletes(),
            vec![(probe_for("a"), DeletePolicy::Graceful)]
        );
    }

    #[tokio::test]
    async fn test_node_list_failure_skips_whole_tick() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));
        h.cluster.script_node_list_failures(&[true]);

        let report = h.prober.tick().await;

        let skipped = StepOutcome::Skipped(SkipReason::NodeListFailed);
        assert_eq!(report.snapshot, skipped);
        assert_eq!(report.stale_deletion, skipped);
        assert_eq!(report.creation, skipped);
        assert_eq!(report.evaluation, skipped);
        assert_eq!(h.cluster.calls(), vec![ApiCall::ListNodes]);

        // Next tick recovers
        let report = h.prober.tick().await;
        assert_eq!(report.snapshot, StepOutcome::Completed);
        assert_eq!(report.created, vec![probe_for("a")]);
    }

    #[tokio::test]
    async fn test_first_pod_list_failure_skips_stale_deletion_and_evaluation() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 60, now));
        let mut stale = make_probe("old-uid", "a", now - chrono::Duration::seconds(600), "Running");
        stale.metadata.deletion_grace_period_seconds = Some(30);
        stale.metadata.deletion_timestamp = Some(Time(now + chrono::Duration::seconds(29)));
        h.cluster.insert_pod(stale);
        h.cluster.script_pod_list_failures(&[true, false]);

        let report = h.prober.tick().await;

        assert_eq!(report.snapshot, StepOutcome::Completed);
        assert_eq!(
            report.stale_deletion,
            StepOutcome::Skipped(SkipReason::ProbeListFailed)
        );
        assert_eq!(report.creation, StepOutcome::Completed);
        assert_eq!(
            report.evaluation,
            StepOutcome::Skipped(SkipReason::ProbeListFailed)
        );
        assert!(report.force_deleted.is_empty());
        assert!(report.deletion_requested.is_empty());
        assert_eq!(report.created, vec![probe_for("a")]);
        assert!(h.cluster.pod(&probe_pod_name("old-uid")).is_some());
        assert!(h.deletes().is_empty());
        assert_eq!(h.status_updates(), 0);
    }

    #[tokio::test]
    async fn test_first_pod_list_failure_leaves_running_pod_alone() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(2),
            "Running",
        ));
        h.cluster.script_pod_list_failures(&[true, false]);

        let report = h.prober.tick().await;

        assert_eq!(
            report.evaluation,
            StepOutcome::Skipped(SkipReason::ProbeListFailed)
        );
        assert!(h.deletes().is_empty());
        assert_eq!(h.count(&ApiCall::ListPods), 1);
        assert!(h.cluster.pod(&probe_for("a")).is_some());
    }

    #[tokio::test]
    async fn test_second_probe_list_failure_skips_evaluation() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(2),
            "Running",
        ));
        h.cluster.script_pod_list_failures(&[false, true]);

        let report = h.prober.tick().await;

        assert_eq!(report.stale_deletion, StepOutcome::Completed);
        assert_eq!(report.creation, StepOutcome::Completed);
        assert_eq!(
            report.evaluation,
            StepOutcome::Skipped(SkipReason::ProbeListFailed)
        );
        assert!(h.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_phase_takes_no_action() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(120),
            "Succeeded",
        ));

        let report = h.prober.tick().await;

        assert!(report.problems.is_empty());
        assert!(report.deletion_requested.is_empty());
        assert!(h.deletes().is_empty());
        assert_eq!(h.status_updates(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_not_fatal() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));
        h.cluster.add_node(make_node("b", 600, h.now()));
        h.cluster.fail_creates(true);

        let report = h.prober.tick().await;

        assert!(report.created.is_empty());
        assert_eq!(report.creation, StepOutcome::Completed);
        assert_eq!(report.evaluation, StepOutcome::Completed);
        assert_eq!(
            h.cluster
                .calls()
                .iter()
                .filter(|c| matches!(c, ApiCall::CreatePod { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_status_update_failure_is_not_retried_within_tick() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node("a", 600, now));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(60),
            "Pending",
        ));
        h.cluster.fail_status_updates(true);

        let report = h.prober.tick().await;

        assert_eq!(report.problems.len(), 1);
        assert!(report.signalled.is_empty());
        assert_eq!(h.status_updates(), 1);
    }

    #[tokio::test]
    async fn test_node_without_signal_condition_is_not_updated() {
        let h = harness();
        let now = h.now();
        h.cluster.add_node(make_node_with(
            "a",
            600,
            now,
            false,
            vec![condition("Ready", "True")],
        ));
        h.cluster.insert_pod(make_probe(
            "uid-a",
            "a",
            now - chrono::Duration::seconds(60),
            "Pending",
        ));

        let report = h.prober.tick().await;

        assert_eq!(report.problems.len(), 1);
        assert!(report.signalled.is_empty());
        assert_eq!(h.status_updates(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_sweep_retries_until_listing_succeeds() {
        let h = harness();
        let now = h.now();
        h.cluster.insert_pod(make_probe("uid-a", "a", now, "Running"));
        h.cluster.insert_pod(make_probe("uid-b", "b", now, "Pending"));
        let mut unrelated = Pod::default();
        unrelated.metadata.name = Some("nginx".to_string());
        unrelated.metadata.namespace = Some("default".to_string());
        h.cluster.insert_pod(unrelated);
        h.cluster.script_pod_list_failures(&[true, true, false]);

        let deleted = h.prober.bootstrap_sweep().await;

        assert_eq!(deleted, 2);
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
        assert_eq!(h.count(&ApiCall::ListPods), 3);
        let mut deletes = h.deletes();
        deletes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            deletes,
            vec![
                (probe_for("a"), DeletePolicy::Graceful),
                (probe_for("b"), DeletePolicy::Graceful),
            ]
        );
        assert!(h
            .cluster
            .pod("nginx")
            .unwrap()
            .metadata
            .deletion_timestamp
            .is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_sweep_with_nothing_to_do() {
        let h = harness();

        assert_eq!(h.prober.bootstrap_sweep().await, 0);
        assert!(h.clock.sleeps().is_empty());
        assert_eq!(h.cluster.calls(), vec![ApiCall::ListPods]);
    }

    #[tokio::test]
    async fn test_step_sleeps_residual_interval() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));
        h.cluster
            .set_latency(h.clock.clone(), Duration::from_millis(500));

        // list nodes, list pods, create, list pods: 2s of a 5s budget
        h.prober.step().await;

        assert_eq!(h.cluster.calls().len(), 4);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(3)]);
    }

    #[tokio::test]
    async fn test_step_overrun_starts_next_tick_immediately() {
        let h = harness();
        h.cluster.add_node(make_node("a", 600, h.now()));
        h.cluster.set_latency(h.clock.clone(), Duration::from_secs(2));

        h.prober.step().await;

        assert!(h.clock.sleeps().is_empty());
    }

    /// Clock that cancels a token once it has slept a given number of times
    struct CancellingClock {
        inner: MockClock,
        token: CancellationToken,
        after: usize,
    }

    #[async_trait]
    impl Clock for CancellingClock {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.inner.sleep(duration).await;
            if self.inner.sleeps().len() >= self.after {
                self.token.cancel();
            }
        }
    }

    #[tokio::test]
    async fn test_run_ticks_until_cancelled() {
        let token = CancellationToken::new();
        let clock = Arc::new(CancellingClock {
            inner: MockClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            token: token.clone(),
            after: 2,
        });
        let cluster = Arc::new(MockCluster::new(clock.clone()));
        cluster.add_node(make_node("a", 600, clock.now()));
        let prober = NodeProber::new(cluster.clone(), clock.clone(), ProbeSettings::default());

        prober.run(token).await;

        let calls = cluster.calls();
        assert_eq!(calls.iter().filter(|c| **c == ApiCall::ListNodes).count(), 2);
        // Bootstrap listing comes before the first tick
        assert_eq!(calls[0], ApiCall::ListPods);
        assert_eq!(calls[1], ApiCall::ListNodes);
        assert_eq!(
            clock.inner.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );
    }

    #[tokio::test]
    async fn test_run_with_cancelled_token_does_nothing() {
        let h = harness();
        let token = CancellationToken::new();
        token.cancel();

        h.prober.run(token).await;

        assert!(h.cluster.calls().is_empty());
    }
}
