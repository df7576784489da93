//! The inner path-addressed store.
//!
//! A deliberately small hierarchical store: each node holds an optional
//! payload queue ([`NodeData`]), a nested-store marker, and named
//! children. Insert appends a slot at a path; take pops the front; read
//! peeks. The history engine walks and rewrites subtrees through the
//! crate-internal accessors.
//!
//! One mutex guards the whole tree. Every public operation takes the lock
//! once and releases it before returning; per-root serialization of
//! mutations is the engine's job, not the store's.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use histree_core::{Error, NodeData, PayloadSlot, Result};

/// One node of the store tree.
#[derive(Debug, Default)]
pub(crate) struct Node {
    pub(crate) data: Option<NodeData>,
    pub(crate) nested: bool,
    pub(crate) children: BTreeMap<String, Node>,
}

impl Node {
    pub(crate) fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub(crate) fn child_mut_or_create(&mut self, name: &str) -> &mut Node {
        self.children.entry(name.to_string()).or_default()
    }

    /// Drop payloads, the nested marker, and every child below this node.
    pub(crate) fn clear_subtree(&mut self) {
        self.data = None;
        self.nested = false;
        self.children.clear();
    }
}

/// Payload view of one node, cloned out under the store lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapturedNode {
    pub(crate) data: Option<NodeData>,
    pub(crate) nested: bool,
}

/// The in-memory hierarchical store.
#[derive(Debug, Default)]
pub(crate) struct PathStore {
    root: Mutex<Node>,
}

impl PathStore {
    pub(crate) fn new() -> Self {
        PathStore::default()
    }

    fn node_at<'a>(root: &'a Node, components: &[String]) -> Option<&'a Node> {
        let mut node = root;
        for component in components {
            node = node.child(component)?;
        }
        Some(node)
    }

    /// Append a payload slot at `components`, creating nodes on the way.
    pub(crate) fn insert_slot(&self, components: &[String], slot: PayloadSlot) {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for component in components {
            node = node.child_mut_or_create(component);
        }
        node.data.get_or_insert_with(NodeData::new).push_slot(slot);
    }

    /// Mark the node at `components` as holding a nested store.
    pub(crate) fn mount_nested(&self, components: &[String]) {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for component in components {
            node = node.child_mut_or_create(component);
        }
        node.nested = true;
    }

    /// Clone the front payload slot at `components`.
    pub(crate) fn read_front(&self, components: &[String]) -> Result<PayloadSlot> {
        let root = self.root.lock();
        let node = Self::node_at(&root, components)
            .ok_or_else(|| Error::NoObjectFound("no value at path".into()))?;
        node.data
            .as_ref()
            .and_then(|data| data.front().cloned())
            .ok_or_else(|| Error::NoObjectFound("no value at path".into()))
    }

    /// Pop the front payload slot at `components`. A queue emptied by the
    /// pop is removed entirely.
    pub(crate) fn take_front(&self, components: &[String]) -> Result<PayloadSlot> {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for component in components {
            node = node
                .children
                .get_mut(component)
                .ok_or_else(|| Error::NoObjectFound("no value at path".into()))?;
        }
        let data = node
            .data
            .as_mut()
            .ok_or_else(|| Error::NoObjectFound("no value at path".into()))?;
        let slot = data
            .pop_front()
            .ok_or_else(|| Error::NoObjectFound("no value at path".into()))?;
        if data.is_empty() {
            node.data = None;
        }
        Ok(slot)
    }

    /// Clone the payload state of the node at `components`.
    /// `None` when the node does not exist.
    pub(crate) fn capture_node(&self, components: &[String]) -> Option<CapturedNode> {
        let root = self.root.lock();
        let node = Self::node_at(&root, components)?;
        Some(CapturedNode {
            data: node.data.clone(),
            nested: node.nested,
        })
    }

    /// Replace the payload of the node at `components`.
    ///
    /// `Some(data)` creates missing nodes and installs the payload;
    /// `None` clears the payload of an existing node and is a no-op for a
    /// missing one. Returns the payload-byte estimate before and after.
    pub(crate) fn set_node_data(
        &self,
        components: &[String],
        data: Option<NodeData>,
    ) -> (usize, usize) {
        let after_bytes = data.as_ref().map(NodeData::payload_bytes).unwrap_or(0);
        let mut root = self.root.lock();

        if data.is_none() {
            let mut node = &mut *root;
            for component in components {
                match node.children.get_mut(component) {
                    Some(child) => node = child,
                    None => return (0, 0),
                }
            }
            let before_bytes = node.data.as_ref().map(NodeData::payload_bytes).unwrap_or(0);
            node.data = None;
            return (before_bytes, 0);
        }

        let mut node = &mut *root;
        for component in components {
            node = node.child_mut_or_create(component);
        }
        let before_bytes = node.data.as_ref().map(NodeData::payload_bytes).unwrap_or(0);
        node.data = data;
        (before_bytes, after_bytes)
    }

    /// Walk the subtree at `components` depth-first, handing each node and
    /// its relative component path to `visit`. Returns `Ok(false)` when
    /// the subtree root does not exist; the visitor's error aborts the
    /// walk.
    pub(crate) fn visit_subtree(
        &self,
        components: &[String],
        visit: &mut dyn FnMut(&[String], &Node) -> Result<()>,
    ) -> Result<bool> {
        let root = self.root.lock();
        let Some(node) = Self::node_at(&root, components) else {
            return Ok(false);
        };

        fn walk(
            node: &Node,
            relative: &mut Vec<String>,
            visit: &mut dyn FnMut(&[String], &Node) -> Result<()>,
        ) -> Result<()> {
            visit(relative, node)?;
            for (name, child) in &node.children {
                relative.push(name.clone());
                walk(child, relative, visit)?;
                relative.pop();
            }
            Ok(())
        }

        let mut relative = Vec::new();
        walk(node, &mut relative, visit)?;
        Ok(true)
    }

    /// Run `apply` against the mutable subtree root at `components`.
    /// With `create` the path is materialized; otherwise `None` is
    /// returned when it does not exist.
    pub(crate) fn with_subtree_mut<R>(
        &self,
        components: &[String],
        create: bool,
        apply: impl FnOnce(&mut Node) -> R,
    ) -> Option<R> {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for component in components {
            if create {
                node = node.child_mut_or_create(component);
            } else {
                node = node.children.get_mut(component)?;
            }
        }
        Some(apply(node))
    }

    /// Sum of payload-byte estimates across the subtree at `components`.
    pub(crate) fn subtree_payload_bytes(&self, components: &[String]) -> usize {
        let mut total = 0;
        let _ = self.visit_subtree(components, &mut |_, node| {
            if let Some(data) = &node.data {
                total += data.payload_bytes();
            }
            Ok(())
        });
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    fn bytes_slot(value: u8) -> PayloadSlot {
        PayloadSlot::Bytes(vec![value])
    }

    #[test]
    fn test_insert_read_take_fifo() {
        let store = PathStore::new();
        let path = components(&["doc", "value"]);

        store.insert_slot(&path, bytes_slot(1));
        store.insert_slot(&path, bytes_slot(2));

        assert_eq!(store.read_front(&path).unwrap(), bytes_slot(1));
        assert_eq!(store.take_front(&path).unwrap(), bytes_slot(1));
        assert_eq!(store.take_front(&path).unwrap(), bytes_slot(2));
        assert!(matches!(
            store.take_front(&path),
            Err(Error::NoObjectFound(_))
        ));
    }

    #[test]
    fn test_take_to_empty_removes_queue() {
        let store = PathStore::new();
        let path = components(&["doc"]);
        store.insert_slot(&path, bytes_slot(1));
        store.take_front(&path).unwrap();

        let captured = store.capture_node(&path).unwrap();
        assert!(captured.data.is_none());
    }

    #[test]
    fn test_capture_missing_node() {
        let store = PathStore::new();
        assert!(store.capture_node(&components(&["absent"])).is_none());
    }

    #[test]
    fn test_set_node_data_roundtrip() {
        let store = PathStore::new();
        let path = components(&["doc", "title"]);

        let mut data = NodeData::new();
        data.push_value(&"alpha".to_string()).unwrap();
        let payload_bytes = data.payload_bytes();

        let (before, after) = store.set_node_data(&path, Some(data.clone()));
        assert_eq!((before, after), (0, payload_bytes));

        let captured = store.capture_node(&path).unwrap();
        assert_eq!(captured.data.unwrap(), data);

        let (before, after) = store.set_node_data(&path, None);
        assert_eq!((before, after), (payload_bytes, 0));
        assert!(store.capture_node(&path).unwrap().data.is_none());
    }

    #[test]
    fn test_set_node_data_none_on_missing_path_is_noop() {
        let store = PathStore::new();
        let (before, after) = store.set_node_data(&components(&["a", "b"]), None);
        assert_eq!((before, after), (0, 0));
        assert!(store.capture_node(&components(&["a"])).is_none());
    }

    #[test]
    fn test_visit_subtree_order_and_missing_root() {
        let store = PathStore::new();
        store.insert_slot(&components(&["doc", "a"]), bytes_slot(1));
        store.insert_slot(&components(&["doc", "b", "c"]), bytes_slot(2));

        let mut seen = Vec::new();
        let found = store
            .visit_subtree(&components(&["doc"]), &mut |relative, _| {
                seen.push(relative.join("/"));
                Ok(())
            })
            .unwrap();
        assert!(found);
        assert_eq!(seen, vec!["", "a", "b", "b/c"]);

        let found = store
            .visit_subtree(&components(&["missing"]), &mut |_, _| Ok(()))
            .unwrap();
        assert!(!found);
    }

    #[test]
    fn test_subtree_payload_bytes() {
        let store = PathStore::new();
        store.insert_slot(&components(&["doc", "a"]), PayloadSlot::Bytes(vec![0; 10]));
        store.insert_slot(&components(&["doc", "b"]), PayloadSlot::Bytes(vec![0; 5]));
        store.insert_slot(&components(&["other"]), PayloadSlot::Bytes(vec![0; 99]));

        assert_eq!(store.subtree_payload_bytes(&components(&["doc"])), 15);
    }

    #[test]
    fn test_nested_marker() {
        let store = PathStore::new();
        let path = components(&["doc", "inner"]);
        store.mount_nested(&path);
        assert!(store.capture_node(&path).unwrap().nested);
    }
}
