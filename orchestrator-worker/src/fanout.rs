//! Large-batch fanout (spec §4.2 point 3, Open Question 1): a remote job
//! whose payload carries more than `fanoutThreshold` subunits is split into
//! up to `fanoutMaxSiblings` sibling submissions against the same
//! `RemoteEndpoint`, polled in parallel. The parent `Job` record (the only
//! one visible through `JobStore`) completes only once every sibling has;
//! any sibling failure fails the parent with `PartialFailure` and cancels
//! the rest.
//!
//! Sibling bookkeeping is dispatcher-local, not persisted: if the process
//! restarts mid-fanout the parent job is recovered like any other stranded
//! SUBMITTED job and resubmitted from scratch, which is acceptable because
//! `RemoteEndpoint.Submit` is expected to be safe to call again for the same
//! logical unit of work.

use serde_json::Value;

use orchestrator_common::capability::RemoteState;

/// Extracts the `subunits` array from a job payload, if the payload is
/// shaped for fanout at all.
pub fn subunits(payload: &Value) -> Option<&Vec<Value>> {
    payload.get("subunits").and_then(Value::as_array)
}

pub fn should_fanout(payload: &Value, threshold: usize) -> bool {
    subunits(payload).map(|units| units.len() > threshold).unwrap_or(false)
}

/// Splits `units` into at most `max_siblings` roughly-equal chunks, each
/// becoming one sibling submission's payload (cloning the parent payload and
/// swapping in that chunk's `subunits`).
pub fn plan_chunks(parent_payload: &Value, max_siblings: usize) -> Vec<Value> {
    let units = subunits(parent_payload).cloned().unwrap_or_default();
    let siblings = max_siblings.max(1).min(units.len().max(1));
    let chunk_size = units.len().div_ceil(siblings);

    units
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            let mut payload = parent_payload.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("subunits".to_owned(), Value::Array(chunk.to_vec()));
            }
            payload
        })
        .collect()
}

/// Per-sibling state tracked while a fanout parent is in flight.
#[derive(Debug, Clone)]
pub struct SiblingState {
    pub remote_job_id: String,
    pub state: Option<RemoteState>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FanoutState {
    pub siblings: Vec<SiblingState>,
}

impl FanoutState {
    pub fn all_terminal(&self) -> bool {
        self.siblings.iter().all(|s| {
            matches!(
                s.state,
                Some(
                    RemoteState::Completed
                        | RemoteState::Failed
                        | RemoteState::Cancelled
                        | RemoteState::TimedOut
                )
            )
        })
    }

    pub fn any_failed(&self) -> bool {
        self.siblings.iter().any(|s| {
            matches!(
                s.state,
                Some(RemoteState::Failed | RemoteState::Cancelled | RemoteState::TimedOut)
            )
        })
    }

    pub fn merged_output(&self) -> Value {
        Value::Array(
            self.siblings
                .iter()
                .map(|s| s.output.clone().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_fanout_only_past_threshold() {
        let small = json!({"subunits": [1, 2, 3]});
        let large = json!({"subunits": (0..60).collect::<Vec<_>>()});
        assert!(!should_fanout(&small, 50));
        assert!(should_fanout(&large, 50));
    }

    #[test]
    fn plan_chunks_respects_sibling_cap() {
        let payload = json!({"subunits": (0..100).collect::<Vec<_>>()});
        let chunks = plan_chunks(&payload, 3);
        assert!(chunks.len() <= 3);
        let total: usize = chunks
            .iter()
            .map(|c| subunits(c).unwrap().len())
            .sum();
        assert_eq!(total, 100);
    }
}
