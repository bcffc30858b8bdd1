use crate::types::SIGNAL_MESSAGE;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Build a copy of `node` with every condition of type `condition_type`
/// raised: status True, the fixed diagnostic message, and heartbeat and
/// transition times set to `now`.
///
/// Conditions are rewritten in place and never appended, so applying this
/// twice yields the same condition list apart from timestamps. Returns `None`
/// if the node carries no condition of that type.
pub fn raise_signal(node: &Node, condition_type: &str, now: DateTime<Utc>) -> Option<Node> {
    let mut updated = node.clone();
    let conditions = updated.status.as_mut()?.conditions.as_mut()?;

    let mut touched = false;
    for condition in conditions.iter_mut().filter(|c| c.type_ == condition_type) {
        condition.last_heartbeat_time = Some(Time(now));
        condition.last_transition_time = Some(Time(now));
        condition.message = Some(SIGNAL_MESSAGE.to_string());
        condition.status = "True".to_string();
        touched = true;
    }

    touched.then_some(updated)
}
