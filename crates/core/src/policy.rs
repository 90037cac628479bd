//! Status policy: derive `(Status, reason)` from a raw Deployment or Pod.
//!
//! Both functions are pure; they never look at the relationship tree.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use smallvec::SmallVec;

use crate::{concat_reason, Status};

const PROGRESSING: &str = "Progressing";

/// Succeeded only when every replica counter matches the desired count and
/// the controller has observed the current generation.
pub fn deployment_status(d: &Deployment) -> (Status, String) {
    let reason = d
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == PROGRESSING))
        .map(|c| concat_reason(c.message.as_deref().unwrap_or(""), c.reason.as_deref().unwrap_or("")))
        .unwrap_or_default();

    // The API server defaults spec.replicas to 1.
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = d.metadata.generation.unwrap_or(0);
    let ok = match d.status.as_ref() {
        Some(s) => {
            s.updated_replicas.unwrap_or(0) == desired
                && s.replicas.unwrap_or(0) == desired
                && s.available_replicas.unwrap_or(0) == desired
                && s.observed_generation.unwrap_or(0) >= generation
        }
        None => desired == 0 && generation == 0,
    };
    if ok { (Status::Succeeded, reason) } else { (Status::Failed, reason) }
}

/// Phase based. Pending/Running pods fail as soon as one container is waiting
/// or terminated; Failed/Unknown pods carry the pod-level message.
pub fn pod_status(p: &Pod) -> (Status, String) {
    let Some(status) = p.status.as_ref() else { return (Status::Succeeded, String::new()) };
    match status.phase.as_deref().unwrap_or("") {
        "Pending" | "Running" => {
            let reasons: SmallVec<[String; 4]> = status
                .container_statuses
                .iter()
                .flatten()
                .filter_map(container_reason)
                .collect();
            if reasons.is_empty() {
                (Status::Succeeded, String::new())
            } else {
                (Status::Failed, reasons.join("\n"))
            }
        }
        "Failed" | "Unknown" => (
            Status::Failed,
            concat_reason(status.message.as_deref().unwrap_or(""), status.reason.as_deref().unwrap_or("")),
        ),
        _ => (Status::Succeeded, String::new()),
    }
}

fn container_reason(cs: &ContainerStatus) -> Option<String> {
    let state = cs.state.as_ref()?;
    let (placeholder, message, reason) = if let Some(w) = state.waiting.as_ref() {
        ("Waiting", w.message.as_deref(), w.reason.as_deref())
    } else if let Some(t) = state.terminated.as_ref() {
        ("Terminated", t.message.as_deref(), t.reason.as_deref())
    } else {
        return None;
    };
    let joined = concat_reason(message.unwrap_or(""), reason.unwrap_or(""));
    Some(if joined.is_empty() { placeholder.to_string() } else { joined })
}
