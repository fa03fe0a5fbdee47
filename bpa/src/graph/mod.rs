use super::*;
use thiserror::Error;

mod contact;
mod plan;

#[cfg(test)]
mod plan_tests;

pub use contact::{Contact, Priority};
pub use plan::{ContactPlan, PlanDiff};

/// A specialized `Result` type for graph verification.
pub type Result<T> = core::result::Result<T, VerifyError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("node has no EID")]
    MissingEid,

    #[error("contact window [{from}, {to}) is empty or inverted")]
    InvalidWindow { from: u64, to: u64 },

    #[error("two contacts of the same node overlap")]
    Overlap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeFlags {
    pub internet_access: bool,
}

/// A peer node: its reachable endpoints and its scheduled contacts.
#[derive(Debug, Default)]
pub struct Node {
    pub eid: Arc<str>,
    pub cla_addr: Option<String>,
    pub flags: NodeFlags,
    /// Endpoints reachable via this node. Sorted and deduplicated after
    /// [`Node::prepare_and_verify`].
    pub endpoints: Vec<String>,
    pub contacts: ContactPlan,
}

impl Node {
    pub fn new(eid: impl Into<Arc<str>>) -> Self {
        Self {
            eid: eid.into(),
            ..Default::default()
        }
    }

    /// Sorts contacts by start time, strips and sorts all endpoint lists,
    /// and checks the schedule invariants: every window non-empty, no two
    /// contacts of this node overlapping.
    pub fn prepare_and_verify(&mut self) -> Result<()> {
        if self.eid.is_empty() {
            return Err(VerifyError::MissingEid);
        }

        strip_and_sort(&mut self.endpoints);
        self.contacts.sort();

        let contacts = self.contacts.as_slice();
        for c in contacts {
            debug_assert_eq!(c.node_eid, self.eid);
            if c.from >= c.to {
                return Err(VerifyError::InvalidWindow {
                    from: c.from,
                    to: c.to,
                });
            }
        }
        // Sorted by `from`, so overlap implies adjacent overlap
        if contacts.windows(2).any(|w| w[0].overlaps(&w[1])) {
            return Err(VerifyError::Overlap);
        }

        for c in self.contacts.iter_mut() {
            strip_and_sort(&mut c.endpoints);
        }
        Ok(())
    }
}

/// All known peer nodes, keyed by EID.
///
/// Owned by the bundle-processor task; the routing engine reaches it through
/// the forwarder callbacks.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: std::collections::HashMap<Arc<str>, Node>,
}

impl NodeTable {
    /// Inserts a node, returning the node it replaced, if any.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.eid.clone(), node)
    }

    pub fn get(&self, eid: &str) -> Option<&Node> {
        self.nodes.get(eid)
    }

    pub fn get_mut(&mut self, eid: &str) -> Option<&mut Node> {
        self.nodes.get_mut(eid)
    }

    pub fn remove(&mut self, eid: &str) -> Option<Node> {
        self.nodes.remove(eid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

/// Merges `b` into `a`, keeping `a` sorted and free of duplicates.
pub fn endpoint_union(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut ai = a.into_iter().peekable();
    let mut bi = b.into_iter().peekable();
    loop {
        let next = match (ai.peek(), bi.peek()) {
            (Some(x), Some(y)) => {
                if x <= y {
                    ai.next()
                } else {
                    bi.next()
                }
            }
            (Some(_), None) => ai.next(),
            (None, Some(_)) => bi.next(),
            (None, None) => break,
        }
        .trace_expect("peeked entry vanished");

        if out.last() != Some(&next) {
            out.push(next);
        }
    }
    out
}

/// Removes every EID in `b` from `a`.
pub fn endpoint_difference(a: &mut Vec<String>, b: &[String]) {
    a.retain(|eid| !b.contains(eid));
}

/// Deduplicates and sorts an endpoint list in place.
pub fn strip_and_sort(list: &mut Vec<String>) {
    list.sort_unstable();
    list.dedup();
}
