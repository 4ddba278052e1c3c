//! Search-graph renderer
//!
//! A pure sink recording the shape of the exploration: nodes, their true and
//! false children, subsumption edges, and per-node path conditions with an
//! `ITP` tag once a condition lands in an interpolant. `render` emits the
//! whole history as a Graphviz digraph. Every hook is a no-op unless the
//! graph was enabled at construction.

use crate::tree::{NodeRef, PathCondition};
use itp_ir::expr::ExprRef;
use itp_ir::Result;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
struct GraphNode {
    display_id: u64,
    name: String,
    subsumed: bool,
    false_child: Option<u64>,
    true_child: Option<u64>,
    /// (path-condition serial, rendered constraint, in-interpolant)
    path_conditions: Vec<(u64, String, bool)>,
}

/// Recorded search tree for dot output.
#[derive(Debug)]
pub struct SearchGraph {
    enabled: bool,
    /// Keyed by tree-node serial
    nodes: HashMap<u64, GraphNode>,
    root: Option<u64>,
    next_display_id: u64,
    /// (subsumed node, subsuming node) pairs, dashed in the output
    subsumption_edges: Vec<(u64, u64)>,
    /// Which node owns each path condition, by serial
    pc_owner: HashMap<u64, u64>,
    /// Program point → node that tabled an entry there (subsumption edge
    /// targets)
    entry_nodes: HashMap<u64, u64>,
}

impl SearchGraph {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            nodes: HashMap::new(),
            root: None,
            next_display_id: 1,
            subsumption_edges: vec![],
            pc_owner: HashMap::new(),
            entry_nodes: HashMap::new(),
        }
    }

    fn ensure_node(&mut self, serial: u64) -> &mut GraphNode {
        let display = &mut self.next_display_id;
        let entry = self.nodes.entry(serial).or_insert_with(|| {
            let node = GraphNode {
                display_id: *display,
                ..GraphNode::default()
            };
            *display += 1;
            node
        });
        entry
    }

    /// Record the root node.
    pub fn set_root(&mut self, root: &NodeRef) {
        if !self.enabled {
            return;
        }
        let serial = root.borrow().serial();
        self.ensure_node(serial);
        self.root = Some(serial);
    }

    /// Record a split: false child first, true child second.
    pub fn add_children(&mut self, parent: &NodeRef, false_child: &NodeRef, true_child: &NodeRef) {
        if !self.enabled {
            return;
        }
        let f = false_child.borrow().serial();
        let t = true_child.borrow().serial();
        self.ensure_node(f);
        self.ensure_node(t);
        let p = self.ensure_node(parent.borrow().serial());
        p.false_child = Some(f);
        p.true_child = Some(t);
    }

    /// Name a node after the program point it settled at.
    pub fn set_current_node(&mut self, node: &NodeRef, description: &str) {
        if !self.enabled {
            return;
        }
        let serial = node.borrow().serial();
        let entry = self.ensure_node(serial);
        if entry.name.is_empty() {
            entry.name = description.to_string();
        }
    }

    /// Record a constraint added at a node.
    pub fn add_path_condition(&mut self, node: &NodeRef, pc: &PathCondition, constraint: &ExprRef) {
        if !self.enabled {
            return;
        }
        let serial = node.borrow().serial();
        self.ensure_node(serial)
            .path_conditions
            .push((pc.serial(), constraint.to_string(), false));
        self.pc_owner.insert(pc.serial(), serial);
    }

    /// Tag a path condition as included in an interpolant.
    pub fn include_in_interpolant(&mut self, pc: &PathCondition) {
        if !self.enabled {
            return;
        }
        let Some(owner) = self.pc_owner.get(&pc.serial()).copied() else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&owner) {
            for (serial, _, tagged) in &mut node.path_conditions {
                if *serial == pc.serial() {
                    *tagged = true;
                }
            }
        }
    }

    /// Record that `node` tabled an entry at its program point.
    pub fn add_table_entry(&mut self, node: &NodeRef, program_point: u64) {
        if !self.enabled {
            return;
        }
        let serial = node.borrow().serial();
        self.ensure_node(serial);
        self.entry_nodes.insert(program_point, serial);
    }

    /// Record a subsumption: dashed edge from the subsumed node to the node
    /// whose entry covered it.
    pub fn mark_as_subsumed(&mut self, node: &NodeRef, program_point: u64) {
        if !self.enabled {
            return;
        }
        let serial = node.borrow().serial();
        self.ensure_node(serial).subsumed = true;
        if let Some(target) = self.entry_nodes.get(&program_point).copied() {
            self.subsumption_edges.push((serial, target));
        }
    }

    fn render_node(&self, serial: u64, out: &mut String) {
        let Some(node) = self.nodes.get(&serial) else {
            return;
        };
        out.push_str(&format!(
            "Node{} [shape=record,label=\"{{{}: {}\\l",
            node.display_id, node.display_id, node.name
        ));
        for (_, constraint, in_itp) in &node.path_conditions {
            out.push_str(constraint);
            if *in_itp {
                out.push_str(" ITP");
            }
            out.push_str("\\l");
        }
        if node.subsumed {
            out.push_str("(subsumed)\\l");
        }
        if node.false_child.is_some() || node.true_child.is_some() {
            out.push_str("|{<s0>F|<s1>T}");
        }
        out.push_str("}\"];\n");

        let child_display = |serial: &u64| self.nodes.get(serial).map(|n| n.display_id);
        if let Some(display) = node.false_child.as_ref().and_then(child_display) {
            out.push_str(&format!("Node{}:s0 -> Node{display};\n", node.display_id));
        }
        if let Some(display) = node.true_child.as_ref().and_then(child_display) {
            out.push_str(&format!("Node{}:s1 -> Node{display};\n", node.display_id));
        }
        if let Some(child) = node.false_child {
            self.render_node(child, out);
        }
        if let Some(child) = node.true_child {
            self.render_node(child, out);
        }
    }

    /// The recorded tree as a Graphviz digraph.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("digraph search_tree {\n");
        if let Some(root) = self.root {
            self.render_node(root, &mut out);
        }
        for (from, to) in &self.subsumption_edges {
            if let (Some(f), Some(t)) = (self.nodes.get(from), self.nodes.get(to)) {
                out.push_str(&format!(
                    "Node{} -> Node{} [style=dashed];\n",
                    f.display_id, t.display_id
                ));
            }
        }
        out.push_str("}\n");
        out
    }

    /// Write the rendered graph to a file. No-op when disabled.
    pub fn save(&self, path: &Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::IdSource;
    use crate::instr::TargetData;
    use crate::tree::Tree;
    use itp_ir::expr::Expr;
    use itp_ir::InterpConfig;
    use std::rc::Rc;

    fn tree() -> Tree {
        Tree::new(
            Rc::new(TargetData::default()),
            Rc::new(InterpConfig::default()),
            IdSource::new(),
        )
    }

    #[test]
    fn test_disabled_graph_renders_empty() {
        let mut graph = SearchGraph::new(false);
        let tree = tree();
        graph.set_root(&tree.root());
        assert_eq!(graph.render(), "digraph search_tree {\n}\n");
    }

    #[test]
    fn test_render_tree_with_children() {
        let mut graph = SearchGraph::new(true);
        let mut tree = tree();
        let root = tree.root();
        graph.set_root(&root);
        graph.set_current_node(&root, "main entry");
        let (left, right) = tree.split(&root);
        graph.add_children(&root, &left, &right);

        let dot = graph.render();
        assert!(dot.starts_with("digraph search_tree {"));
        assert!(dot.contains("main entry"));
        assert!(dot.contains("{<s0>F|<s1>T}"));
        assert!(dot.contains(":s0 -> "));
        assert!(dot.contains(":s1 -> "));
    }

    #[test]
    fn test_subsumption_edge_is_dashed() {
        let mut graph = SearchGraph::new(true);
        let mut tree = tree();
        let root = tree.root();
        graph.set_root(&root);
        let (left, right) = tree.split(&root);
        graph.add_children(&root, &left, &right);
        graph.add_table_entry(&left, 7);
        graph.mark_as_subsumed(&right, 7);

        let dot = graph.render();
        assert!(dot.contains("[style=dashed]"));
        assert!(dot.contains("(subsumed)"));
    }

    #[test]
    fn test_path_condition_itp_tag() {
        let mut graph = SearchGraph::new(true);
        let mut tree = tree();
        let root = tree.root();
        graph.set_root(&root);
        let pc = tree.add_constraint(Expr::true_(), crate::instr::ValueId(1));
        graph.add_path_condition(&root, &pc, &Expr::true_());
        assert!(!graph.render().contains("ITP"));
        graph.include_in_interpolant(&pc);
        assert!(graph.render().contains("ITP"));
    }
}
