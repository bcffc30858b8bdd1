// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Nodecheck runtime - probe-pod reconciliation for Kubernetes node health
//!
//! Keeps one short-lived probe pod per schedulable, ready node and raises a
//! node condition when a probe takes too long to start or to terminate.

pub mod api_client;
pub mod clock;
pub mod credentials;
pub mod error;
pub mod mock;
pub mod prober;
pub mod remediation;
pub mod traits;
pub mod types;

// Re-export primary types
pub use api_client::ApiClient;
pub use clock::{Clock, SystemClock};
pub use credentials::{Credentials, TokenSource};
pub use error::{ProbeError, Result};
pub use mock::{MockClock, MockCluster};
pub use prober::{NodeProber, ProbeProblem, ProblemKind, SkipReason, StepOutcome, TickReport};
pub use traits::ClusterApi;
pub use types::{DeletePolicy, NodeRecord, ProbePhase, ProbePod, ProbeSettings};
