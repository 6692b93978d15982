//! Parent/child job graphs.
//!
//! A parent job only becomes claimable once every child has completed;
//! children therefore run first. A child carrying the fail-parent flag
//! aborts the whole ancestor chain when it fails terminally.

use serde_json::Value;

use crate::queue::job::EnqueueOpts;

/// One node of a job graph, built root-first.
#[derive(Debug)]
pub struct DagNode {
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub opts: EnqueueOpts,
    /// When this node fails terminally, abort its waiting ancestors.
    pub fail_parent_on_failure: bool,
    pub children: Vec<DagNode>,
}

impl DagNode {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
            payload,
            opts: EnqueueOpts::default(),
            fail_parent_on_failure: false,
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: EnqueueOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn fail_parent(mut self, flag: bool) -> Self {
        self.fail_parent_on_failure = flag;
        self
    }

    pub fn child(mut self, node: DagNode) -> Self {
        self.children.push(node);
        self
    }

    /// Total number of jobs in this graph.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.size()).sum::<usize>()
    }

    /// Every node of the graph, root first.
    pub fn iter(&self) -> impl Iterator<Item = &DagNode> {
        let mut nodes = Vec::with_capacity(self.size());
        collect(self, &mut nodes);
        nodes.into_iter()
    }
}

fn collect<'a>(node: &'a DagNode, out: &mut Vec<&'a DagNode>) {
    out.push(node);
    for child in &node.children {
        collect(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_counts_all_nodes() {
        let dag = DagNode::new("a", "root", json!({}))
            .child(DagNode::new("b", "mid", json!({})).child(DagNode::new("c", "leaf", json!({}))))
            .child(DagNode::new("d", "leaf2", json!({})));

        assert_eq!(dag.size(), 4);
    }

    #[test]
    fn test_iter_is_root_first() {
        let dag = DagNode::new("a", "root", json!({}))
            .child(DagNode::new("b", "mid", json!({})).child(DagNode::new("c", "leaf", json!({}))));

        let names: Vec<&str> = dag.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["root", "mid", "leaf"]);
    }

    #[test]
    fn test_fail_parent_flag() {
        let dag = DagNode::new("a", "root", json!({}))
            .child(DagNode::new("b", "child", json!({})).fail_parent(true));

        assert!(!dag.fail_parent_on_failure);
        assert!(dag.children[0].fail_parent_on_failure);
    }
}
