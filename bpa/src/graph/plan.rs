use super::*;
use std::collections::HashMap;

/// A contact list ordered by start time.
///
/// This is the unit the route ingest path operates on: the schedule of a
/// single node, or the router's merged view across all nodes. The union and
/// difference operations are single merge passes over both sorted inputs.
#[derive(Debug, Default)]
pub struct ContactPlan {
    contacts: Vec<Contact>,
}

/// The outcome of [`ContactPlan::difference`].
#[derive(Debug, Default)]
pub struct PlanDiff {
    /// Indices (into the post-difference plan) of contacts whose per-contact
    /// endpoints were reduced.
    pub modified: Vec<usize>,
    /// Contacts removed from the plan. Ownership passes to the caller, which
    /// must keep any `active` contact alive until it closes.
    pub deleted: Vec<Contact>,
}

impl ContactPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, contact: Contact) {
        self.contacts.push(contact);
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn as_slice(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn get(&self, index: usize) -> Option<&Contact> {
        self.contacts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Contact> {
        self.contacts.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.contacts.iter_mut()
    }

    pub(crate) fn sort(&mut self) {
        self.contacts.sort_by_key(|c| c.from);
    }

    /// Merges `other` into this plan.
    ///
    /// Both plans must be sorted by start time. Same-node contacts with
    /// overlapping windows are merged (see [`Contact::merge`]); merging
    /// cascades, so a candidate bridging two previously separate contacts
    /// collapses all three into one. Everything else is spliced in at its
    /// sorted position.
    ///
    /// Returns the deduplicated indices of contacts whose capacity-relevant
    /// fields changed.
    pub fn union(&mut self, other: ContactPlan) -> Vec<usize> {
        let mut out: Vec<Contact> =
            Vec::with_capacity(self.contacts.len() + other.contacts.len());
        let mut modified = Vec::new();
        let mut last_by_node: HashMap<Arc<str>, usize> = HashMap::new();

        let mut ai = std::mem::take(&mut self.contacts).into_iter().peekable();
        let mut bi = other.contacts.into_iter().peekable();
        loop {
            let candidate = match (ai.peek(), bi.peek()) {
                (Some(a), Some(b)) => {
                    if a.from <= b.from {
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

            if let Some(&i) = last_by_node.get(&candidate.node_eid) {
                if out[i].overlaps(&candidate) {
                    if out[i].merge(candidate) && !modified.contains(&i) {
                        modified.push(i);
                    }
                    continue;
                }
            }
            last_by_node.insert(candidate.node_eid.clone(), out.len());
            out.push(candidate);
        }

        self.contacts = out;
        modified
    }

    /// Subtracts `other` from this plan.
    ///
    /// A candidate matches a plan entry when node, `from` and `to` are all
    /// equal. A matching candidate with no per-contact endpoints removes the
    /// entry; one with endpoints subtracts them and records the entry as
    /// modified.
    pub fn difference(&mut self, other: &ContactPlan) -> PlanDiff {
        let mut to_modify = Vec::new();
        let mut to_delete = Vec::new();

        let mut ai = 0;
        for b in &other.contacts {
            while ai < self.contacts.len() && self.contacts[ai].from < b.from {
                ai += 1;
            }
            let mut j = ai;
            while j < self.contacts.len() && self.contacts[j].from == b.from {
                let a = &self.contacts[j];
                if a.node_eid == b.node_eid && a.to == b.to {
                    if b.endpoints.is_empty() {
                        to_delete.push(j);
                    } else {
                        to_modify.push(j);
                        let a = &mut self.contacts[j];
                        endpoint_difference(&mut a.endpoints, &b.endpoints);
                    }
                    break;
                }
                j += 1;
            }
        }

        to_modify.sort_unstable();
        to_modify.dedup();
        to_delete.sort_unstable();
        to_delete.dedup();

        let mut diff = PlanDiff::default();
        let mut kept = Vec::with_capacity(self.contacts.len() - to_delete.len());
        for (i, contact) in std::mem::take(&mut self.contacts).into_iter().enumerate() {
            if to_delete.binary_search(&i).is_ok() {
                diff.deleted.push(contact);
            } else {
                if to_modify.binary_search(&i).is_ok() {
                    diff.modified.push(kept.len());
                }
                kept.push(contact);
            }
        }
        self.contacts = kept;
        diff
    }
}

impl FromIterator<Contact> for ContactPlan {
    fn from_iter<T: IntoIterator<Item = Contact>>(iter: T) -> Self {
        let mut plan = Self {
            contacts: iter.into_iter().collect(),
        };
        plan.sort();
        plan
    }
}

impl IntoIterator for ContactPlan {
    type Item = Contact;
    type IntoIter = std::vec::IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}
