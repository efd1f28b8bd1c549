//! Flow producer for parent/children job trees.
//!
//! The FlowProducer is responsible for:
//! - Validating a flow tree before anything is inserted
//! - Inserting the parent first (`waiting-children`) and its children after
//! - Submitting many independent trees with per-tree outcomes

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::queue::{
    ChildFailurePolicy, ChildRef, Job, JobHandle, JobOptions, JobPayload, JobQueue, JobState,
    ParentRef,
};
use crate::{Error, Result};

/// Maximum nesting depth of a flow tree.
pub const MAX_FLOW_DEPTH: usize = 64;

/// One node of a flow tree: a job and the children it waits for.
#[derive(Debug, Clone)]
pub struct FlowNode {
    queue: String,
    name: String,
    payload: std::result::Result<serde_json::Value, String>,
    options: JobOptions,
    child_failure: ChildFailurePolicy,
    children: Vec<FlowNode>,
}

impl FlowNode {
    /// Build a node for `P::QUEUE`. Payload problems surface from `add_flow`.
    pub fn new<P: JobPayload>(name: impl Into<String>, payload: &P) -> Self {
        let payload = payload
            .validate()
            .map_err(|e| e.to_string())
            .and_then(|_| serde_json::to_value(payload).map_err(|e| e.to_string()));
        Self {
            queue: P::QUEUE.to_string(),
            name: name.into(),
            payload,
            options: JobOptions::default(),
            child_failure: ChildFailurePolicy::default(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: FlowNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = FlowNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_child_failure(mut self, policy: ChildFailurePolicy) -> Self {
        self.child_failure = policy;
        self
    }

    /// Queue-qualified name, the key of this node in its parent's children values.
    pub fn key(&self) -> String {
        format!("{}:{}", self.queue, self.name)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handles of a submitted flow tree.
#[derive(Debug, Clone, Serialize)]
pub struct FlowHandle {
    pub job: JobHandle,
    pub children: Vec<FlowHandle>,
}

impl FlowHandle {
    /// Id of the root job.
    pub fn id(&self) -> &str {
        &self.job.id
    }

    /// Ids of every job in the tree, parents before children.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids = vec![self.job.id.clone()];
        for child in &self.children {
            ids.extend(child.job_ids());
        }
        ids
    }
}

/// Submits flow trees to the job queue.
pub struct FlowProducer {
    queue: Arc<JobQueue>,
}

impl FlowProducer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Validate and insert one flow tree.
    ///
    /// A tree that fails validation inserts nothing.
    pub async fn add_flow(&self, root: FlowNode) -> Result<FlowHandle> {
        let mut explicit_ids = HashSet::new();
        self.validate(&root, 1, &mut explicit_ids)?;

        let mut jobs = Vec::new();
        let handle = self.build(&root, None, &mut jobs);
        let total = jobs.len();

        self.queue.insert_flow(jobs).await?;

        info!(
            job_id = %handle.job.id,
            key = %root.key(),
            jobs = total,
            "Added flow"
        );
        Ok(handle)
    }

    /// Submit independent trees. One tree failing does not stop the others;
    /// the outcome of each tree is reported in input order.
    pub async fn add_bulk(&self, roots: Vec<FlowNode>) -> Vec<Result<FlowHandle>> {
        let mut results = Vec::with_capacity(roots.len());
        for root in roots {
            let key = root.key();
            let result = self.add_flow(root).await;
            if let Err(e) = &result {
                warn!(key = %key, error = %e, "Failed to add flow");
            }
            results.push(result);
        }
        results
    }

    /// Wait until the root job of `handle` finishes.
    pub async fn wait_for(&self, handle: &FlowHandle, timeout: Duration) -> Result<Job> {
        self.queue.wait_until_finished(handle.id(), timeout).await
    }

    fn validate(
        &self,
        node: &FlowNode,
        depth: usize,
        explicit_ids: &mut HashSet<String>,
    ) -> Result<()> {
        if depth > MAX_FLOW_DEPTH {
            return Err(Error::validation(format!(
                "flow is nested deeper than {} levels",
                MAX_FLOW_DEPTH
            )));
        }
        if let Err(reason) = &node.payload {
            return Err(Error::invalid_payload(&node.queue, reason.clone()));
        }
        if node.options.repeat.is_some() {
            return Err(Error::validation(format!(
                "flow job '{}' cannot be repeatable",
                node.key()
            )));
        }
        if let Some(id) = &node.options.job_id {
            if !explicit_ids.insert(id.clone()) || self.queue.contains(id) {
                return Err(Error::DuplicateJob(id.clone()));
            }
        }

        let mut sibling_keys = HashSet::new();
        for child in &node.children {
            if !sibling_keys.insert(child.key()) {
                return Err(Error::validation(format!(
                    "flow job '{}' has two children keyed '{}'",
                    node.key(),
                    child.key()
                )));
            }
            self.validate(child, depth + 1, explicit_ids)?;
        }
        Ok(())
    }

    /// Flatten the tree into job records, parent before children.
    fn build(&self, node: &FlowNode, parent: Option<ParentRef>, jobs: &mut Vec<Job>) -> FlowHandle {
        let id = node
            .options
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let payload = node.payload.clone().unwrap_or_default();

        let mut job = self
            .queue
            .build_job(&id, &node.queue, &node.name, payload, &node.options);
        job.parent = parent;
        job.child_failure = node.child_failure;
        if !node.children.is_empty() {
            job.state = JobState::WaitingChildren;
            job.run_at = None;
        }

        let slot = jobs.len();
        jobs.push(job);

        let me = ParentRef {
            id: id.clone(),
            queue: node.queue.clone(),
        };
        let mut child_handles = Vec::with_capacity(node.children.len());
        let mut child_refs = Vec::with_capacity(node.children.len());
        for child in &node.children {
            let handle = self.build(child, Some(me.clone()), jobs);
            child_refs.push(ChildRef {
                key: child.key(),
                job_id: handle.job.id.clone(),
                outcome: None,
            });
            child_handles.push(handle);
        }
        jobs[slot].children = child_refs;

        FlowHandle {
            job: jobs[slot].handle(true),
            children: child_handles,
        }
    }
}
