use crate::types::NodeId;

/// Which processes a tree spans.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    /// All nodes `[0, num_nodes)`
    Range(u32),
    /// An explicit member list (group collectives); positions are list
    /// indices
    List(Vec<NodeId>),
}

/// Per-process view of a k-ary spanning tree over a membership.
///
/// Purely structural: given the same membership, fanout and root, every
/// process computes identical parent/children relations. The default tree
/// spans `[0, num_nodes)` with node 0 as root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanningTree {
    membership: Membership,
    fanout: u32,
    root: NodeId,
    this: NodeId,
}

impl SpanningTree {
    /// The default tree: all nodes, rooted at 0.
    pub fn default_tree(num_nodes: u32, fanout: u32, this: NodeId) -> Self {
        Self::rooted_at(num_nodes, fanout, this, NodeId(0))
    }

    /// A tree over all nodes rooted at an arbitrary node, computed by
    /// rotating ranks so the root occupies position 0. Broadcasts and
    /// rooted-epoch waves use this.
    pub fn rooted_at(num_nodes: u32, fanout: u32, this: NodeId, root: NodeId) -> Self {
        assert!(num_nodes > 0, "tree must span at least one node");
        assert!(fanout > 0, "tree fanout must be positive");
        assert!(this.0 < num_nodes && root.0 < num_nodes);
        Self {
            membership: Membership::Range(num_nodes),
            fanout,
            root,
            this,
        }
    }

    /// A tree over an explicit member list, rooted at the first member.
    /// The list order must be identical on every participating process.
    pub fn for_group(members: Vec<NodeId>, fanout: u32, this: NodeId) -> Self {
        assert!(!members.is_empty(), "group must have at least one member");
        assert!(fanout > 0, "tree fanout must be positive");
        assert!(
            members.contains(&this),
            "node {} is not a member of this group",
            this
        );
        let root = members[0];
        Self {
            membership: Membership::List(members),
            fanout,
            root,
            this,
        }
    }

    pub fn num_nodes(&self) -> u32 {
        match &self.membership {
            Membership::Range(n) => *n,
            Membership::List(members) => members.len() as u32,
        }
    }

    /// Position of `node` in the virtual rank order (root at 0).
    fn position(&self, node: NodeId) -> u32 {
        match &self.membership {
            Membership::Range(n) => (node.0 + n - self.root.0) % n,
            Membership::List(members) => members
                .iter()
                .position(|m| *m == node)
                .expect("node is a member") as u32,
        }
    }

    fn node_at(&self, position: u32) -> NodeId {
        match &self.membership {
            Membership::Range(n) => NodeId((position + self.root.0) % n),
            Membership::List(members) => members[position as usize],
        }
    }

    pub fn is_root(&self) -> bool {
        self.this == self.root
    }

    /// Parent of the local process; `NodeId::UNINITIALIZED` iff root.
    pub fn parent(&self) -> NodeId {
        if self.is_root() {
            return NodeId::UNINITIALIZED;
        }
        let position = self.position(self.this);
        self.node_at((position - 1) / self.fanout)
    }

    /// Ordered children of the local process. Stable across calls and
    /// identical on every process given the same membership.
    pub fn children(&self) -> Vec<NodeId> {
        self.children_of(self.this)
    }

    pub fn children_of(&self, node: NodeId) -> Vec<NodeId> {
        let n = self.num_nodes();
        let position = self.position(node);
        let first = position
            .checked_mul(self.fanout)
            .and_then(|p| p.checked_add(1));
        let mut children = Vec::new();
        if let Some(first) = first {
            for offset in 0..self.fanout {
                let child = first + offset;
                if child >= n {
                    break;
                }
                children.push(self.node_at(child));
            }
        }
        children
    }

    pub fn num_children(&self) -> usize {
        self.children().len()
    }

    /// Count of all descendants of the local process (excluding itself),
    /// iterative to bound recursion depth.
    pub fn num_descendants(&self) -> u32 {
        let n = self.num_nodes();
        let mut count = 0u32;
        let mut frontier = vec![self.position(self.this)];
        while let Some(position) = frontier.pop() {
            let first = position * self.fanout + 1;
            for offset in 0..self.fanout {
                let child = first + offset;
                if child >= n {
                    break;
                }
                count += 1;
                frontier.push(child);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tree_parents_and_children() {
        // fanout 2 over 7 nodes: 0 -> (1, 2), 1 -> (3, 4), 2 -> (5, 6)
        let t0 = SpanningTree::default_tree(7, 2, NodeId(0));
        assert!(t0.is_root());
        assert_eq!(t0.parent(), NodeId::UNINITIALIZED);
        assert_eq!(t0.children(), vec![NodeId(1), NodeId(2)]);

        let t5 = SpanningTree::default_tree(7, 2, NodeId(5));
        assert!(!t5.is_root());
        assert_eq!(t5.parent(), NodeId(2));
        assert!(t5.children().is_empty());
    }

    #[test]
    fn parent_child_relations_agree() {
        for num in [1u32, 2, 3, 5, 8, 16, 33] {
            for fanout in [2u32, 3, 4] {
                for node in 0..num {
                    let tree = SpanningTree::default_tree(num, fanout, NodeId(node));
                    for child in tree.children() {
                        let child_tree = SpanningTree::default_tree(num, fanout, child);
                        assert_eq!(child_tree.parent(), NodeId(node));
                    }
                }
            }
        }
    }

    #[test]
    fn rotation_moves_the_root() {
        let tree = SpanningTree::rooted_at(4, 2, NodeId(2), NodeId(2));
        assert!(tree.is_root());
        // positions: 2->0, 3->1, 0->2, 1->3; children of root are 3 and 0
        assert_eq!(tree.children(), vec![NodeId(3), NodeId(0)]);

        let leaf = SpanningTree::rooted_at(4, 2, NodeId(1), NodeId(2));
        assert_eq!(leaf.parent(), NodeId(3));
        assert!(leaf.children().is_empty());
    }

    #[test]
    fn descendant_count_partitions_the_tree() {
        let num = 13;
        let root = SpanningTree::default_tree(num, 3, NodeId(0));
        assert_eq!(root.num_descendants(), num - 1);

        let total: u32 = root
            .children()
            .iter()
            .map(|c| SpanningTree::default_tree(num, 3, *c).num_descendants() + 1)
            .sum();
        assert_eq!(total, num - 1);
    }

    #[test]
    fn group_tree_roots_at_first_member() {
        let members = vec![NodeId(4), NodeId(1), NodeId(9)];
        let tree = SpanningTree::for_group(members.clone(), 2, NodeId(4));
        assert!(tree.is_root());
        assert_eq!(tree.children(), vec![NodeId(1), NodeId(9)]);

        let leaf = SpanningTree::for_group(members, 2, NodeId(9));
        assert_eq!(leaf.parent(), NodeId(4));
    }

    #[test]
    fn single_node_tree() {
        let tree = SpanningTree::default_tree(1, 2, NodeId(0));
        assert!(tree.is_root());
        assert!(tree.children().is_empty());
        assert_eq!(tree.num_descendants(), 0);
    }
}
