//! Copy-on-write subtree prototype.
//!
//! Snapshots are immutable value trees whose children are shared through
//! `Arc` handles. Applying a mutation path-copies from the root down to
//! the touched node and shares every untouched sibling, so a snapshot is
//! cheap to keep and cheap to derive from. The generation counter lives in
//! the prototype, not the nodes; every accepted mutation stamps the new
//! snapshot with the next generation.
//!
//! Two snapshots represent the same state exactly when they share the same
//! root handle. Structural equality is never consulted.

use std::collections::BTreeMap;
use std::sync::Arc;

use histree_durability::{SnapshotEntry, SnapshotImage};

/// One immutable node of a snapshot tree.
#[derive(Debug, Default)]
pub(crate) struct CowNode {
    pub(crate) payload: Option<Arc<Vec<u8>>>,
    pub(crate) children: BTreeMap<String, Arc<CowNode>>,
}

/// An immutable subtree value tagged with its generation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub(crate) root: Option<Arc<CowNode>>,
    pub(crate) generation: u64,
}

impl Snapshot {
    /// Identity comparison: same root handle means same state.
    pub(crate) fn same_state(&self, other: &Snapshot) -> bool {
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

}

/// A payload write at a component path.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub(crate) components: Vec<String>,
    pub(crate) payload: Arc<Vec<u8>>,
}

/// Payload metrics over one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SnapshotMetrics {
    pub(crate) payload_bytes: usize,
}

/// Factory and generation authority for one root's snapshots.
#[derive(Debug)]
pub(crate) struct CowPrototype {
    next_generation: u64,
}

impl Default for CowPrototype {
    fn default() -> Self {
        CowPrototype { next_generation: 1 }
    }
}

impl CowPrototype {
    pub(crate) fn new() -> Self {
        CowPrototype::default()
    }

    /// The empty snapshot: no tree, generation zero.
    pub(crate) fn empty_snapshot(&self) -> Snapshot {
        Snapshot::default()
    }

    /// Derive a new snapshot with `mutation` applied, sharing every
    /// untouched node with `base`.
    pub(crate) fn apply(&mut self, base: &Snapshot, mutation: &Mutation) -> Snapshot {
        let root = Self::apply_node(
            base.root.as_deref(),
            &mutation.components,
            &mutation.payload,
        );
        let generation = self.next_generation;
        self.next_generation += 1;
        Snapshot {
            root: Some(root),
            generation,
        }
    }

    fn apply_node(node: Option<&CowNode>, components: &[String], payload: &Arc<Vec<u8>>) -> Arc<CowNode> {
        let mut copy = CowNode {
            payload: node.and_then(|n| n.payload.clone()),
            children: node.map(|n| n.children.clone()).unwrap_or_default(),
        };
        match components.split_first() {
            None => copy.payload = Some(payload.clone()),
            Some((head, rest)) => {
                let child = copy.children.get(head).map(Arc::as_ref);
                let replaced = Self::apply_node(child, rest, payload);
                copy.children.insert(head.clone(), replaced);
            }
        }
        Arc::new(copy)
    }

    /// Sum the payload bytes held by a snapshot.
    pub(crate) fn analyze(&self, snapshot: &Snapshot) -> SnapshotMetrics {
        fn walk(node: &CowNode, total: &mut usize) {
            if let Some(payload) = &node.payload {
                *total += payload.len();
            }
            for child in node.children.values() {
                walk(child, total);
            }
        }
        let mut payload_bytes = 0;
        if let Some(root) = &snapshot.root {
            walk(root, &mut payload_bytes);
        }
        SnapshotMetrics { payload_bytes }
    }

    /// Seed the generation counter so restored generations are never
    /// reused. Only moves forward.
    pub(crate) fn set_next_generation(&mut self, next: u64) {
        self.next_generation = self.next_generation.max(next);
    }

    /// Rebuild a snapshot from its codec image by replaying the entries
    /// onto an empty snapshot, then pinning the recorded generation.
    pub(crate) fn from_image(&mut self, image: &SnapshotImage) -> Snapshot {
        let mut snapshot = self.empty_snapshot();
        for entry in &image.entries {
            let mutation = Mutation {
                components: entry.components.clone(),
                payload: Arc::new(entry.payload.clone()),
            };
            snapshot = self.apply(&snapshot, &mutation);
        }
        snapshot.generation = image.generation;
        snapshot
    }
}

/// Flatten a snapshot into its codec image: every payload-bearing node in
/// depth-first order.
pub(crate) fn to_image(snapshot: &Snapshot) -> SnapshotImage {
    fn walk(node: &CowNode, components: &mut Vec<String>, out: &mut Vec<SnapshotEntry>) {
        if let Some(payload) = &node.payload {
            if !payload.is_empty() {
                out.push(SnapshotEntry {
                    components: components.clone(),
                    payload: payload.as_ref().clone(),
                });
            }
        }
        for (name, child) in &node.children {
            components.push(name.clone());
            walk(child, components, out);
            components.pop();
        }
    }

    let mut entries = Vec::new();
    if let Some(root) = &snapshot.root {
        let mut components = Vec::new();
        walk(root, &mut components, &mut entries);
    }
    SnapshotImage {
        generation: snapshot.generation,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(path: &[&str], payload: &[u8]) -> Mutation {
        Mutation {
            components: path.iter().map(|s| s.to_string()).collect(),
            payload: Arc::new(payload.to_vec()),
        }
    }

    #[test]
    fn test_apply_shares_untouched_siblings() {
        let mut prototype = CowPrototype::new();
        let base = prototype.empty_snapshot();
        let with_a = prototype.apply(&base, &mutation(&["a"], &[1]));
        let with_b = prototype.apply(&with_a, &mutation(&["b"], &[2]));

        let a_before = with_a.root.as_ref().unwrap().children.get("a").unwrap();
        let a_after = with_b.root.as_ref().unwrap().children.get("a").unwrap();
        assert!(Arc::ptr_eq(a_before, a_after));
    }

    #[test]
    fn test_generations_advance_monotonically() {
        let mut prototype = CowPrototype::new();
        let base = prototype.empty_snapshot();
        assert_eq!(base.generation, 0);

        let first = prototype.apply(&base, &mutation(&["a"], &[1]));
        let second = prototype.apply(&first, &mutation(&["a"], &[2]));
        assert!(second.generation > first.generation);
    }

    #[test]
    fn test_identity_comparison() {
        let mut prototype = CowPrototype::new();
        let base = prototype.empty_snapshot();
        let one = prototype.apply(&base, &mutation(&["a"], &[1]));
        let same = one.clone();
        let other = prototype.apply(&base, &mutation(&["a"], &[1]));

        assert!(one.same_state(&same));
        // Structurally equal trees are still different states.
        assert!(!one.same_state(&other));
        assert!(base.same_state(&prototype.empty_snapshot()));
    }

    #[test]
    fn test_analyze_sums_payload_bytes() {
        let mut prototype = CowPrototype::new();
        let base = prototype.empty_snapshot();
        let snapshot = prototype.apply(&base, &mutation(&["a"], &[0; 10]));
        let snapshot = prototype.apply(&snapshot, &mutation(&["b", "c"], &[0; 5]));

        assert_eq!(prototype.analyze(&snapshot).payload_bytes, 15);
        assert_eq!(prototype.analyze(&base).payload_bytes, 0);
    }

    #[test]
    fn test_image_round_trip() {
        let mut prototype = CowPrototype::new();
        let base = prototype.empty_snapshot();
        let snapshot = prototype.apply(&base, &mutation(&["a"], &[1, 2]));
        let snapshot = prototype.apply(&snapshot, &mutation(&["b", "c"], &[3]));

        let image = to_image(&snapshot);
        assert_eq!(image.generation, snapshot.generation);
        assert_eq!(image.entries.len(), 2);

        let mut loader = CowPrototype::new();
        let rebuilt = loader.from_image(&image);
        assert_eq!(rebuilt.generation, snapshot.generation);
        assert_eq!(to_image(&rebuilt).entries, image.entries);
    }

    #[test]
    fn test_set_next_generation_never_rewinds() {
        let mut prototype = CowPrototype::new();
        prototype.set_next_generation(10);
        let base = prototype.empty_snapshot();
        let snapshot = prototype.apply(&base, &mutation(&["a"], &[1]));
        assert_eq!(snapshot.generation, 10);

        prototype.set_next_generation(5);
        let next = prototype.apply(&snapshot, &mutation(&["a"], &[2]));
        assert_eq!(next.generation, 11);
    }
}
