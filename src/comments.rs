//! Comment tree kept as an arena of nodes plus the flattened, depth-annotated
//! sequence a list view renders.
//!
//! Each node owns the ids of its direct replies; top-level nodes are owned by
//! the root list. The visible sequence is the pre-order walk of that tree with
//! the descendants of collapsed nodes left out. Every mutation keeps both in
//! step and reports the visible index range it touched.
//!
//! Operations that name a node which is gone, or an index that no longer fits
//! the sequence, do nothing and report [`Change::Unchanged`]: such calls come
//! from network responses racing local edits, not from programming errors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::listing::{Comment, CommentChild, MoreChildren, ThingData};

/// A tree shared between the thread applying network results and the UI.
pub type SharedTree = Arc<Mutex<CommentTree>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq)]
pub enum CommentNode {
    Comment(Box<Comment>),
    More(MoreChildren),
}

impl CommentNode {
    pub fn depth(&self) -> i32 {
        match self {
            CommentNode::Comment(comment) => comment.depth,
            CommentNode::More(more) => more.depth,
        }
    }

    fn set_depth(&mut self, depth: i32) {
        match self {
            CommentNode::Comment(comment) => comment.depth = depth,
            CommentNode::More(more) => more.depth = depth,
        }
    }

    pub fn fullname(&self) -> String {
        match self {
            CommentNode::Comment(comment) => comment.fullname(),
            CommentNode::More(more) => more.fullname(),
        }
    }

    pub fn is_more(&self) -> bool {
        matches!(self, CommentNode::More(_))
    }

    pub fn as_comment(&self) -> Option<&Comment> {
        match self {
            CommentNode::Comment(comment) => Some(&**comment),
            CommentNode::More(_) => None,
        }
    }

    pub fn as_more(&self) -> Option<&MoreChildren> {
        match self {
            CommentNode::More(more) => Some(more),
            CommentNode::Comment(_) => None,
        }
    }
}

impl From<Comment> for CommentNode {
    fn from(comment: Comment) -> Self {
        CommentNode::Comment(Box::new(comment))
    }
}

impl From<MoreChildren> for CommentNode {
    fn from(more: MoreChildren) -> Self {
        CommentNode::More(more)
    }
}

/// Flattens nested API children into pre-order, labelling each node with its
/// nesting level starting at `depth`. Nested replies move out of their
/// comment; the tree owns the structure from here on.
pub fn flatten_children(children: Vec<CommentChild>, depth: i32) -> Vec<CommentNode> {
    let mut out = Vec::new();
    flatten_into(children, depth, &mut out);
    out
}

fn flatten_into(children: Vec<CommentChild>, depth: i32, out: &mut Vec<CommentNode>) {
    for child in children {
        match child {
            CommentChild::Comment(mut comment) => {
                let replies = std::mem::take(&mut comment.replies);
                comment.depth = depth;
                out.push(CommentNode::Comment(comment));
                flatten_into(replies, depth + 1, out);
            }
            CommentChild::More(mut more) => {
                more.depth = depth;
                out.push(CommentNode::More(more));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    item: CommentNode,
    parent: Option<NodeId>,
    replies: Vec<NodeId>,
    live: bool,
}

impl Node {
    pub fn item(&self) -> &CommentNode {
        &self.item
    }

    pub fn depth(&self) -> i32 {
        self.item.depth()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn replies(&self) -> &[NodeId] {
        &self.replies
    }
}

/// Visible index range touched by a mutation, for minimal list updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Inserted { at: usize, len: usize },
    Removed { at: usize, len: usize },
    Replaced { at: usize, removed: usize, inserted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Existing(NodeId),
    Batch(usize),
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    owner: Option<Slot>,
    after: Option<Slot>,
}

#[derive(Debug, Default, Clone)]
pub struct CommentTree {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    visible: Vec<NodeId>,
    hidden: HashSet<NodeId>,
    by_name: HashMap<String, NodeId>,
}

impl CommentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from a pre-order list such as [`flatten_children`] returns.
    pub fn from_flat(nodes: Vec<CommentNode>) -> Self {
        let mut tree = Self::new();
        let count = nodes.len();
        if tree.insert_range(nodes, 0) == Change::Unchanged && count > 0 {
            debug!("comments: flat list of {count} nodes has inconsistent depths");
        }
        tree
    }

    pub fn into_shared(self) -> SharedTree {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    /// The visible sequence, in display order.
    pub fn visible(&self) -> &[NodeId] {
        &self.visible
    }

    pub fn iter_visible(&self) -> impl Iterator<Item = &Node> + '_ {
        self.visible.iter().map(move |id| &self.nodes[id.0])
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).filter(|node| node.live)
    }

    pub fn node_at(&self, index: usize) -> Option<&Node> {
        self.visible.get(index).map(|id| &self.nodes[id.0])
    }

    pub fn id_at(&self, index: usize) -> Option<NodeId> {
        self.visible.get(index).copied()
    }

    pub fn comment_mut(&mut self, id: NodeId) -> Option<&mut Comment> {
        match self.nodes.get_mut(id.0) {
            Some(Node {
                item: CommentNode::Comment(comment),
                live: true,
                ..
            }) => Some(&mut **comment),
            _ => None,
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.visible.iter().position(|candidate| *candidate == id)
    }

    /// Looks a live node up by fullname. "Continue this thread" placeholders
    /// all share one id and are not indexed; reach them by position.
    pub fn find(&self, fullname: &str) -> Option<NodeId> {
        self.by_name.get(fullname).copied()
    }

    pub fn is_hidden(&self, id: NodeId) -> bool {
        self.hidden.contains(&id)
    }

    pub fn add_top_level(&mut self, item: CommentNode) -> (NodeId, Change) {
        let id = self.alloc(item, None);
        self.roots.push(id);
        self.visible.push(id);
        (
            id,
            Change::Inserted {
                at: self.visible.len() - 1,
                len: 1,
            },
        )
    }

    /// Places `item` as the first reply of `parent`. The caller sets the
    /// depth beforehand. A reply under a collapsed or off-screen parent joins
    /// the tree without becoming visible. Returns `None` when `parent` is gone
    /// or is a "more" placeholder, which is always a leaf.
    pub fn add_reply(&mut self, item: CommentNode, parent: NodeId) -> Option<(NodeId, Change)> {
        let owner = self.get(parent)?;
        if owner.item.is_more() {
            debug!("comments: {parent:?} is a placeholder and takes no replies");
            return None;
        }
        let id = self.alloc(item, Some(parent));
        self.nodes[parent.0].replies.insert(0, id);

        if self.hidden.contains(&parent) {
            return Some((id, Change::Unchanged));
        }
        let change = match self.position(parent) {
            Some(pos) => {
                self.visible.insert(pos + 1, id);
                Change::Inserted { at: pos + 1, len: 1 }
            }
            None => Change::Unchanged,
        };
        Some((id, change))
    }

    /// [`add_reply`](Self::add_reply) for a freshly posted comment whose depth
    /// is still unattached.
    pub fn attach_reply(&mut self, mut comment: Comment, parent: NodeId) -> Option<(NodeId, Change)> {
        let depth = self.get(parent)?.depth();
        comment.depth = depth + 1;
        self.add_reply(comment.into(), parent)
    }

    /// Inserts a pre-ordered batch at visible index `at`, keeping input order.
    /// Each node is owned by the nearest preceding node one level up. A batch
    /// whose depths do not fit the surrounding sequence, or which would land
    /// under a collapsed node, is dropped.
    pub fn insert_range(&mut self, items: Vec<CommentNode>, at: usize) -> Change {
        if items.is_empty() || at > self.visible.len() {
            return Change::Unchanged;
        }
        let depths: Vec<i32> = items.iter().map(CommentNode::depth).collect();
        if let Some(next) = self.visible.get(at) {
            let min = depths.iter().copied().min().unwrap_or(0);
            if self.nodes[next.0].depth() > min {
                debug!("comments: batch at {at} would re-parent following nodes");
                return Change::Unchanged;
            }
        }
        let chain = match at.checked_sub(1) {
            Some(prev) => self.chain_of(self.visible[prev]),
            None => Vec::new(),
        };
        let Some(plan) = self.plan(chain, &items, false) else {
            debug!("comments: batch at {at} does not fit the tree");
            return Change::Unchanged;
        };
        let ids = self.apply(items, plan);
        let len = ids.len();
        self.visible.splice(at..at, ids);
        Change::Inserted { at, len }
    }

    /// Removes `id` together with its subtree, from both the visible
    /// sequence and its owner's reply list.
    pub fn remove(&mut self, id: NodeId) -> Change {
        if self.get(id).is_none() {
            return Change::Unchanged;
        }
        let position = self.position(id);
        self.detach(id);
        match position {
            Some(pos) => {
                let span = self.descendant_span(pos);
                self.visible.drain(pos..pos + 1 + span);
                Change::Removed { at: pos, len: span + 1 }
            }
            None => Change::Unchanged,
        }
    }

    /// Index of the nearest top-level node after `from`, or `from` when none.
    pub fn next_top_level_position(&self, from: usize) -> usize {
        let start = from.saturating_add(1);
        (start..self.visible.len())
            .find(|&idx| self.nodes[self.visible[idx].0].depth() == 0)
            .unwrap_or(from)
    }

    /// Index of the nearest top-level node before `from`, or `from` when none.
    pub fn previous_top_level_position(&self, from: usize) -> usize {
        let end = from.min(self.visible.len());
        (0..end)
            .rev()
            .find(|&idx| self.nodes[self.visible[idx].0].depth() == 0)
            .unwrap_or(from)
    }

    /// Hides every descendant of `id`; the node's own row stays. The owned
    /// replies are kept so [`expand`](Self::expand) can bring them back.
    pub fn collapse(&mut self, id: NodeId) -> Change {
        if self.get(id).is_none() || !self.hidden.insert(id) {
            return Change::Unchanged;
        }
        let Some(pos) = self.position(id) else {
            return Change::Unchanged;
        };
        let span = self.descendant_span(pos);
        if span == 0 {
            return Change::Unchanged;
        }
        self.visible.drain(pos + 1..pos + 1 + span);
        Change::Removed { at: pos + 1, len: span }
    }

    /// Shows the descendants of `id` again, except those below a node that
    /// is itself still collapsed.
    pub fn expand(&mut self, id: NodeId) -> Change {
        if !self.hidden.remove(&id) {
            return Change::Unchanged;
        }
        let Some(pos) = self.position(id) else {
            return Change::Unchanged;
        };
        let mut shown = Vec::new();
        self.collect_shown(id, &mut shown);
        let span = self.descendant_span(pos);
        let inserted = shown.len();
        self.visible.splice(pos + 1..pos + 1 + span, shown);
        match (span, inserted) {
            (0, 0) => Change::Unchanged,
            (0, len) => Change::Inserted { at: pos + 1, len },
            (removed, inserted) => Change::Replaced {
                at: pos + 1,
                removed,
                inserted,
            },
        }
    }

    /// Replaces a "more" placeholder with the comments fetched for it. The
    /// fetched nodes join the placeholder's owner (the root list for a
    /// top-level placeholder) in the placeholder's slot; deeper fetched nodes
    /// are owned by the nearest preceding fetched node one level up.
    pub fn load_more(&mut self, placeholder: NodeId, fetched: Vec<CommentNode>) -> Change {
        let Some(node) = self.get(placeholder) else {
            debug!("comments: placeholder {placeholder:?} is gone");
            return Change::Unchanged;
        };
        if !node.item.is_more() {
            return Change::Unchanged;
        }
        let base = node.depth();
        let owner = node.parent;
        let first = fetched.first().map(CommentNode::depth).unwrap_or(base);
        if first != base || fetched.iter().any(|item| item.depth() < base) {
            debug!("comments: fetched batch does not start at depth {base}");
            return Change::Unchanged;
        }

        let siblings = self.children(owner);
        let slot = siblings
            .iter()
            .position(|candidate| *candidate == placeholder)
            .unwrap_or(siblings.len());
        let mut chain = match owner {
            Some(owner) => self.chain_of(owner),
            None => Vec::new(),
        };
        if let Some(pred) = slot.checked_sub(1).map(|idx| siblings[idx]) {
            chain.push((base, Slot::Existing(pred)));
        }
        let Some(plan) = self.plan(chain, &fetched, true) else {
            debug!("comments: fetched batch does not fit under its placeholder");
            return Change::Unchanged;
        };

        let position = self.position(placeholder);
        self.detach(placeholder);
        let ids = self.apply(fetched, plan);
        match position {
            Some(pos) => {
                let inserted = ids.len();
                self.visible.splice(pos..pos + 1, ids);
                Change::Replaced {
                    at: pos,
                    removed: 1,
                    inserted,
                }
            }
            None => Change::Unchanged,
        }
    }

    /// Checks that the visible sequence is the pre-order projection of the
    /// owned tree, that depths follow ownership, and that each visible node
    /// is followed by exactly its shown descendants.
    pub fn check_invariant(&self) -> Result<(), String> {
        let mut expected = Vec::new();
        for root in &self.roots {
            expected.push(*root);
            if !self.hidden.contains(root) {
                self.collect_shown(*root, &mut expected);
            }
        }
        if expected != self.visible {
            return Err(format!(
                "visible sequence {:?} differs from projection {:?}",
                self.visible, expected
            ));
        }

        for (idx, id) in self.visible.iter().enumerate() {
            let node = &self.nodes[id.0];
            let want = node
                .parent
                .map(|parent| self.nodes[parent.0].depth() + 1)
                .unwrap_or(0);
            if node.depth() != want {
                return Err(format!(
                    "node {id:?} at {idx} has depth {} but its owner implies {want}",
                    node.depth()
                ));
            }
            let mut shown = Vec::new();
            if !self.hidden.contains(id) {
                self.collect_shown(*id, &mut shown);
            }
            let span = self.descendant_span(idx);
            if self.visible[idx + 1..idx + 1 + span] != shown[..] {
                return Err(format!(
                    "span after {id:?} at {idx} is not its shown descendants"
                ));
            }
        }
        Ok(())
    }

    fn alloc(&mut self, item: CommentNode, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if !item.as_more().is_some_and(MoreChildren::is_continue_thread) {
            self.by_name.insert(item.fullname(), id);
        }
        self.nodes.push(Node {
            item,
            parent,
            replies: Vec::new(),
            live: true,
        });
        id
    }

    fn children(&self, owner: Option<NodeId>) -> &[NodeId] {
        match owner {
            Some(id) => &self.nodes[id.0].replies,
            None => &self.roots,
        }
    }

    fn children_mut(&mut self, owner: Option<NodeId>) -> &mut Vec<NodeId> {
        match owner {
            Some(id) => &mut self.nodes[id.0].replies,
            None => &mut self.roots,
        }
    }

    /// Number of nodes right after `pos` that are deeper than the node at `pos`.
    fn descendant_span(&self, pos: usize) -> usize {
        let depth = self.nodes[self.visible[pos].0].depth();
        self.visible[pos + 1..]
            .iter()
            .take_while(|id| self.nodes[id.0].depth() > depth)
            .count()
    }

    fn collect_shown(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for reply in &self.nodes[id.0].replies {
            out.push(*reply);
            if !self.hidden.contains(reply) {
                self.collect_shown(*reply, out);
            }
        }
    }

    /// `id` and its owners, outermost first, with their depths.
    fn chain_of(&self, id: NodeId) -> Vec<(i32, Slot)> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.0];
            chain.push((node.depth(), Slot::Existing(current)));
            cursor = node.parent;
        }
        chain.reverse();
        chain
    }

    /// Works out owner and preceding sibling for each node of a batch that
    /// follows `chain`. `None` if a depth skips a level, if an owner would be
    /// a "more" placeholder, or if an owner is collapsed and `under_hidden`
    /// is false.
    fn plan(
        &self,
        mut chain: Vec<(i32, Slot)>,
        items: &[CommentNode],
        under_hidden: bool,
    ) -> Option<Vec<Placement>> {
        let mut placements = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let depth = item.depth();
            if depth < 0 {
                return None;
            }
            let after = chain
                .iter()
                .find(|(level, _)| *level == depth)
                .map(|(_, slot)| *slot);
            chain.retain(|(level, _)| *level < depth);
            let owner = match chain.last() {
                None if depth == 0 => None,
                Some((level, slot)) if *level == depth - 1 => Some(*slot),
                _ => return None,
            };
            match owner {
                Some(Slot::Existing(owner)) => {
                    if self.nodes[owner.0].item.is_more() {
                        return None;
                    }
                    if !under_hidden && self.hidden.contains(&owner) {
                        return None;
                    }
                }
                Some(Slot::Batch(owner)) if items[owner].is_more() => return None,
                _ => {}
            }
            placements.push(Placement { owner, after });
            chain.push((depth, Slot::Batch(idx)));
        }
        Some(placements)
    }

    fn apply(&mut self, items: Vec<CommentNode>, plan: Vec<Placement>) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = Vec::with_capacity(items.len());
        for (item, placement) in items.into_iter().zip(plan) {
            let resolve = |slot: Slot, ids: &[NodeId]| match slot {
                Slot::Existing(id) => id,
                Slot::Batch(idx) => ids[idx],
            };
            let owner = placement.owner.map(|slot| resolve(slot, &ids));
            let after = placement.after.map(|slot| resolve(slot, &ids));
            let id = self.alloc(item, owner);
            let siblings = self.children_mut(owner);
            let index = after
                .and_then(|after| siblings.iter().position(|candidate| *candidate == after))
                .map(|idx| idx + 1)
                .unwrap_or(0);
            siblings.insert(index, id);
            ids.push(id);
        }
        ids
    }

    /// Drops `id` and its subtree from ownership and lookups. The visible
    /// sequence is left to the caller.
    fn detach(&mut self, id: NodeId) {
        let owner = self.nodes[id.0].parent;
        self.children_mut(owner).retain(|candidate| *candidate != id);

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &mut self.nodes[current.0];
            node.live = false;
            stack.extend(node.replies.iter().copied());
            let name = node.item.fullname();
            if self.by_name.get(&name) == Some(&current) {
                self.by_name.remove(&name);
            }
            self.hidden.remove(&current);
        }
    }
}

impl CommentNode {
    /// Sets a depth on a node built outside the tree, e.g. before
    /// [`CommentTree::insert_range`].
    pub fn with_depth(mut self, depth: i32) -> Self {
        self.set_depth(depth);
        self
    }
}
