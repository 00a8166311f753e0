use super::ir::IrNode;
use crate::types::{Node, NodeId, NodeKind, Program};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Lower a verified rule tree into the flat arena the engine runs on.
///
/// Nodes are assigned ids in pre-order, so walking a subscription list in
/// id order re-evaluates conditions in pre-order. The program version is
/// the SHA-256 of the rule source.
pub fn lower(rules: &[IrNode], source: &str) -> Program {
    let mut ctx = Lowering {
        nodes: Vec::new(),
        paths: Vec::new(),
        subscriptions: BTreeMap::new(),
    };

    let roots: Vec<NodeId> = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| ctx.add(rule, None, format!("{}[{}]", rule.tag(), i)))
        .collect();

    Program {
        nodes: ctx.nodes,
        roots,
        paths: ctx.paths,
        subscriptions: ctx.subscriptions,
        version: compute_version(source),
    }
}

/// SHA-256 over the canonical rule text.
pub fn compute_version(source: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

struct Lowering {
    nodes: Vec<Node>,
    paths: Vec<String>,
    subscriptions: BTreeMap<String, Vec<NodeId>>,
}

impl Lowering {
    fn add(&mut self, ir: &IrNode, parent: Option<NodeId>, path: String) -> NodeId {
        // Reserve the slot first so children index after their parent.
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent,
            kind: placeholder(ir),
        });
        self.paths.push(path.clone());

        // Subscribe before recursing so a signal read by both a parent
        // and a descendant re-evaluates the parent first.
        if let IrNode::Condition { expr, .. } = ir {
            for name in expr.operands() {
                self.subscriptions.entry(name).or_default().push(id);
            }
        }

        let child_ids: Vec<NodeId> = ir
            .children()
            .iter()
            .enumerate()
            .map(|(j, child)| {
                self.add(child, Some(id), format!("{}/{}[{}]", path, child.tag(), j))
            })
            .collect();

        match &mut self.nodes[id].kind {
            NodeKind::Condition { children, .. }
            | NodeKind::Parallel { children }
            | NodeKind::Sequence { children } => *children = child_ids,
            NodeKind::Emit { .. } => {}
        }
        id
    }
}

fn placeholder(ir: &IrNode) -> NodeKind {
    match ir {
        IrNode::Condition {
            text,
            expr,
            start_ms,
            stop_ms,
            ..
        } => NodeKind::Condition {
            expr: expr.clone(),
            text: text.clone(),
            start_ms: *start_ms,
            stop_ms: *stop_ms,
            children: Vec::new(),
        },
        IrNode::Parallel { .. } => NodeKind::Parallel {
            children: Vec::new(),
        },
        IrNode::Sequence { .. } => NodeKind::Sequence {
            children: Vec::new(),
        },
        IrNode::Emit {
            signal,
            value,
            delay_ms,
        } => NodeKind::Emit {
            signal: signal.clone(),
            value: value.clone(),
            delay_ms: *delay_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_rules;

    const RULES: &str = r#"
- condition: "transmission.gear == 'reverse'"
  parallel:
    - condition: "camera.backup.active == true"
      start: 200
      stop: 1000
      emit:
        signal: alarm.on
        value: true
- emit:
    signal: boot.banner
    value: 1
"#;

    #[test]
    fn arena_is_preorder_with_back_links() {
        let rules = parse_rules(RULES).unwrap();
        let program = lower(&rules, RULES);

        assert_eq!(program.roots, vec![0, 4]);
        assert_eq!(program.nodes.len(), 5);
        assert_eq!(program.path(0), "condition[0]");
        assert_eq!(program.path(1), "condition[0]/parallel[0]");
        assert_eq!(program.path(2), "condition[0]/parallel[0]/condition[0]");
        assert_eq!(
            program.path(3),
            "condition[0]/parallel[0]/condition[0]/emit[0]"
        );
        assert_eq!(program.path(4), "emit[1]");

        assert_eq!(program.nodes[2].parent, Some(1));
        assert!(program.is_descendant(3, 0));
        assert!(!program.is_descendant(4, 0));
        assert!(program.is_monitored(2));
        assert!(!program.is_monitored(0));
        assert_eq!(program.ancestor_conditions(3), vec![2, 0]);
    }

    #[test]
    fn subscriptions_point_at_condition_nodes() {
        let rules = parse_rules(RULES).unwrap();
        let program = lower(&rules, RULES);
        assert_eq!(program.subscriptions["transmission.gear"], vec![0]);
        assert_eq!(program.subscriptions["camera.backup.active"], vec![2]);
    }

    #[test]
    fn shared_operand_lists_parent_before_child() {
        let src = "- condition: \"x > 0\"\n  parallel:\n    - condition: \"x > 10\"\n";
        let rules = parse_rules(src).unwrap();
        let program = lower(&rules, src);
        assert_eq!(program.subscriptions["x"], vec![0, 2]);
    }

    #[test]
    fn version_tracks_source() {
        let rules = parse_rules(RULES).unwrap();
        let a = lower(&rules, RULES).version;
        let b = lower(&rules, "something else").version;
        assert_ne!(a, b);
        assert_eq!(a, compute_version(RULES));
    }
}
