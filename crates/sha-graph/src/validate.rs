use std::collections::HashMap;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use sha_domain::{Job, JobId};

use crate::error::GraphError;

/// Result returned by [`validate`] on success.
#[derive(Debug)]
pub struct ResolvedForest {
    /// Jobs in topological order (parents before children).
    pub topo_order: Vec<JobId>,
}

/// Validate a job forest's parent-chain structure.
///
/// Checks:
/// 1. Every non-`None` `parent_job_id` refers to a job present in `jobs`.
/// 2. The parent-chain graph has no cycle.
///
/// Used before a job forest is handed to the tracker for creation, and again
/// whenever a `FailoverTest`/`FailoverLive` rollback job chain is assembled —
/// both cases build the forest in memory first so a cycle is caught before
/// anything is persisted.
pub fn validate(jobs: &[Job]) -> Result<ResolvedForest, GraphError> {
    let by_id: HashMap<JobId, &Job> = jobs.iter().map(|j| (j.id, j)).collect();

    let mut errors: Vec<GraphError> = Vec::new();
    for job in jobs {
        if let Some(parent_id) = job.parent_job_id {
            if !by_id.contains_key(&parent_id) {
                errors.push(GraphError::DanglingParent {
                    job_id: job.id,
                    parent_job_id: parent_id,
                });
            }
        }
    }

    if !errors.is_empty() {
        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        return Err(GraphError::Multiple(errors));
    }

    let mut graph: DiGraph<JobId, ()> = DiGraph::new();
    let node_map: HashMap<JobId, NodeIndex> =
        jobs.iter().map(|j| (j.id, graph.add_node(j.id))).collect();

    for job in jobs {
        if let Some(parent_id) = job.parent_job_id {
            let from = node_map[&parent_id];
            let to = node_map[&job.id];
            graph.add_edge(from, to, ());
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(GraphError::CycleDetected);
    }

    let topo = petgraph::algo::toposort(&graph, None).map_err(|_| GraphError::CycleDetected)?;
    let topo_order = topo.into_iter().map(|idx| graph[idx]).collect();

    Ok(ResolvedForest { topo_order })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sha_domain::JobKind;

    fn make_job(parent: Option<JobId>) -> Job {
        Job::new(parent, JobKind::Replicate, "op", None, serde_json::json!({}), Utc::now())
    }

    #[test]
    fn single_job_passes() {
        let job = make_job(None);
        let result = validate(&[job]);
        assert!(result.is_ok());
    }

    #[test]
    fn dangling_parent_detected() {
        let child = make_job(Some(JobId::new()));
        let result = validate(&[child]);
        assert!(matches!(result, Err(GraphError::DanglingParent { .. })));
    }

    #[test]
    fn parent_before_child_in_topo_order() {
        let parent = make_job(None);
        let child = make_job(Some(parent.id));
        let forest = validate(&[parent.clone(), child.clone()]).unwrap();
        let pos_parent = forest.topo_order.iter().position(|id| *id == parent.id).unwrap();
        let pos_child = forest.topo_order.iter().position(|id| *id == child.id).unwrap();
        assert!(pos_parent < pos_child);
    }

    #[test]
    fn cycle_detected() {
        let mut a = make_job(None);
        let mut b = make_job(None);
        // Wire a cycle by hand: a's parent is b, b's parent is a.
        a.parent_job_id = Some(b.id);
        b.parent_job_id = Some(a.id);
        let result = validate(&[a, b]);
        assert!(matches!(result, Err(GraphError::CycleDetected)));
    }
}
