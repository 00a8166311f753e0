use super::ir::IrNode;
use crate::signals::SignalMap;

/// Verification errors.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub path: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "[{}] {}", path, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Verify structural invariants of the parsed rule tree.
///
/// Returns a list of errors. Empty list means the rules are valid.
/// When a signal map is supplied, every signal named by a rule must be in
/// it; without one the check is skipped.
pub fn verify(rules: &[IrNode], map: Option<&SignalMap>) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        let path = format!("{}[{}]", rule.tag(), i);
        check_node(rule, &path, map, &mut errors);
    }
    errors
}

fn check_node(
    node: &IrNode,
    path: &str,
    map: Option<&SignalMap>,
    errors: &mut Vec<VerifyError>,
) {
    match node {
        IrNode::Condition { expr, children, .. } => {
            check_signals(expr.operands().iter().map(String::as_str), path, map, errors);

            // At most one emit child per condition.
            let emits = children
                .iter()
                .filter(|c| matches!(c, IrNode::Emit { .. }))
                .count();
            if emits > 1 {
                errors.push(VerifyError {
                    message: format!("condition has {} emit children (at most one)", emits),
                    path: Some(path.to_string()),
                });
            }
            check_children(children, path, map, errors);
        }
        IrNode::Parallel { children } | IrNode::Sequence { children } => {
            if children.is_empty() {
                errors.push(VerifyError {
                    message: format!("empty {}", node.tag()),
                    path: Some(path.to_string()),
                });
            }
            // Wrappers take conditions or further wrappers, never emit.
            for (j, child) in children.iter().enumerate() {
                if matches!(child, IrNode::Emit { .. }) {
                    errors.push(VerifyError {
                        message: format!("{} may not contain a direct emit", node.tag()),
                        path: Some(format!("{}/emit[{}]", path, j)),
                    });
                }
            }
            check_children(children, path, map, errors);
        }
        IrNode::Emit { signal, value, .. } => {
            check_signals(std::iter::once(signal.as_str()), path, map, errors);
            check_signals(value.operands().iter().map(String::as_str), path, map, errors);
        }
    }
}

fn check_children(
    children: &[IrNode],
    path: &str,
    map: Option<&SignalMap>,
    errors: &mut Vec<VerifyError>,
) {
    for (j, child) in children.iter().enumerate() {
        let child_path = format!("{}/{}[{}]", path, child.tag(), j);
        check_node(child, &child_path, map, errors);
    }
}

fn check_signals<'a>(
    names: impl Iterator<Item = &'a str>,
    path: &str,
    map: Option<&SignalMap>,
    errors: &mut Vec<VerifyError>,
) {
    let Some(map) = map else { return };
    for name in names {
        if !map.contains(name) {
            errors.push(VerifyError {
                message: format!("unknown signal `{}`", name),
                path: Some(path.to_string()),
            });
        }
    }
}
