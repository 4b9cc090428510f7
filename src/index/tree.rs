//! AVL-balanced interval tree keyed by `(start, window_id)`, augmented with
//! the subtree's maximum `end` so overlap queries can prune whole branches.

use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::{Ms, Span};

/// One indexed availability window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexedWindow {
    pub window_id: Ulid,
    pub spot_id: Ulid,
    pub span: Span,
}

impl IndexedWindow {
    fn key(&self) -> (Ms, Ulid) {
        (self.span.start, self.window_id)
    }
}

struct Node {
    entry: IndexedWindow,
    height: i32,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    subtree_max_end: Ms,
}

impl Node {
    fn new(entry: IndexedWindow) -> Self {
        Self {
            entry,
            height: 1,
            left: None,
            right: None,
            subtree_max_end: entry.span.end,
        }
    }

    fn update_augmentation(&mut self) {
        self.subtree_max_end = self.entry.span.end;
        self.height = 1;
        if let Some(ref left) = self.left {
            self.subtree_max_end = self.subtree_max_end.max(left.subtree_max_end);
            self.height = left.height + 1;
        }
        if let Some(ref right) = self.right {
            self.subtree_max_end = self.subtree_max_end.max(right.subtree_max_end);
            self.height = self.height.max(right.height + 1);
        }
    }

    fn balance_factor(&self) -> i32 {
        let lh = self.left.as_ref().map_or(0, |n| n.height);
        let rh = self.right.as_ref().map_or(0, |n| n.height);
        lh - rh
    }
}

fn rotate_right(mut node: Box<Node>) -> Box<Node> {
    let Some(mut new_root) = node.left.take() else {
        return node;
    };
    node.left = new_root.right.take();
    node.update_augmentation();
    new_root.right = Some(node);
    new_root.update_augmentation();
    new_root
}

fn rotate_left(mut node: Box<Node>) -> Box<Node> {
    let Some(mut new_root) = node.right.take() else {
        return node;
    };
    node.right = new_root.left.take();
    node.update_augmentation();
    new_root.left = Some(node);
    new_root.update_augmentation();
    new_root
}

fn balance(mut node: Box<Node>) -> Box<Node> {
    node.update_augmentation();
    let bf = node.balance_factor();

    if bf > 1 {
        // Left-Right case
        if let Some(left) = node.left.take() {
            node.left = Some(if left.balance_factor() < 0 {
                rotate_left(left)
            } else {
                left
            });
        }
        return rotate_right(node);
    }

    if bf < -1 {
        // Right-Left case
        if let Some(right) = node.right.take() {
            node.right = Some(if right.balance_factor() > 0 {
                rotate_right(right)
            } else {
                right
            });
        }
        return rotate_left(node);
    }

    node
}

/// Returns the new subtree and whether a new entry was added (false on replace).
fn insert_node(node: Option<Box<Node>>, entry: IndexedWindow) -> (Box<Node>, bool) {
    let Some(mut node) = node else {
        return (Box::new(Node::new(entry)), true);
    };

    let added = match entry.key().cmp(&node.entry.key()) {
        Ordering::Less => {
            let (child, added) = insert_node(node.left.take(), entry);
            node.left = Some(child);
            added
        }
        Ordering::Greater => {
            let (child, added) = insert_node(node.right.take(), entry);
            node.right = Some(child);
            added
        }
        Ordering::Equal => {
            node.entry = entry;
            false
        }
    };

    (balance(node), added)
}

fn take_min(mut node: Box<Node>) -> (Option<Box<Node>>, IndexedWindow) {
    match node.left.take() {
        None => (node.right.take(), node.entry),
        Some(left) => {
            let (rest, min) = take_min(left);
            node.left = rest;
            (Some(balance(node)), min)
        }
    }
}

fn remove_node(
    node: Option<Box<Node>>,
    key: (Ms, Ulid),
) -> (Option<Box<Node>>, Option<IndexedWindow>) {
    let Some(mut node) = node else {
        return (None, None);
    };

    match key.cmp(&node.entry.key()) {
        Ordering::Less => {
            let (child, removed) = remove_node(node.left.take(), key);
            node.left = child;
            (Some(balance(node)), removed)
        }
        Ordering::Greater => {
            let (child, removed) = remove_node(node.right.take(), key);
            node.right = child;
            (Some(balance(node)), removed)
        }
        Ordering::Equal => {
            let removed = node.entry;
            match (node.left.take(), node.right.take()) {
                (None, None) => (None, Some(removed)),
                (Some(child), None) | (None, Some(child)) => (Some(child), Some(removed)),
                (Some(left), Some(right)) => {
                    let (rest, successor) = take_min(right);
                    node.entry = successor;
                    node.left = Some(left);
                    node.right = rest;
                    (Some(balance(node)), Some(removed))
                }
            }
        }
    }
}

fn collect_overlapping(node: &Option<Box<Node>>, query: &Span, out: &mut Vec<IndexedWindow>) {
    let Some(n) = node else { return };

    // Nothing in this subtree ends after the query starts.
    if n.subtree_max_end <= query.start {
        return;
    }

    collect_overlapping(&n.left, query, out);

    // Everything to the right starts at or after this node.
    if n.entry.span.start >= query.end {
        return;
    }
    if n.entry.span.end > query.start {
        out.push(n.entry);
    }

    collect_overlapping(&n.right, query, out);
}

fn inorder(node: &Option<Box<Node>>, out: &mut Vec<IndexedWindow>) {
    if let Some(n) = node {
        inorder(&n.left, out);
        out.push(n.entry);
        inorder(&n.right, out);
    }
}

#[derive(Default)]
pub struct IntervalTree {
    root: Option<Box<Node>>,
    len: usize,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any entry with the same `(start, window_id)`.
    pub fn insert(&mut self, entry: IndexedWindow) {
        let (root, added) = insert_node(self.root.take(), entry);
        self.root = Some(root);
        if added {
            self.len += 1;
        }
    }

    pub fn remove(&mut self, start: Ms, window_id: Ulid) -> Option<IndexedWindow> {
        let (root, removed) = remove_node(self.root.take(), (start, window_id));
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// All entries overlapping `[query.start, query.end)`, sorted by start.
    pub fn overlapping(&self, query: &Span) -> Vec<IndexedWindow> {
        let mut out = Vec::new();
        collect_overlapping(&self.root, query, &mut out);
        out
    }

    pub fn iter_sorted(&self) -> Vec<IndexedWindow> {
        let mut out = Vec::with_capacity(self.len);
        inorder(&self.root, &mut out);
        out
    }

    pub fn height(&self) -> i32 {
        self.root.as_ref().map_or(0, |n| n.height)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
