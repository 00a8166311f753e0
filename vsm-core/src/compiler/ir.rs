use crate::expr::Expr;
use serde::{Deserialize, Serialize};

/// Parsed rule tree — one node per rule-file item, still shaped like the
/// document. Verified and then lowered into the flat arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IrNode {
    Condition {
        /// Expression source text, kept for violation reports.
        text: String,
        expr: Expr,
        start_ms: Option<u64>,
        stop_ms: Option<u64>,
        children: Vec<IrNode>,
    },
    Parallel {
        children: Vec<IrNode>,
    },
    Sequence {
        children: Vec<IrNode>,
    },
    Emit {
        signal: String,
        value: Expr,
        delay_ms: u64,
    },
}

impl IrNode {
    pub fn tag(&self) -> &'static str {
        match self {
            IrNode::Condition { .. } => "condition",
            IrNode::Parallel { .. } => "parallel",
            IrNode::Sequence { .. } => "sequence",
            IrNode::Emit { .. } => "emit",
        }
    }

    pub fn children(&self) -> &[IrNode] {
        match self {
            IrNode::Condition { children, .. }
            | IrNode::Parallel { children }
            | IrNode::Sequence { children } => children,
            IrNode::Emit { .. } => &[],
        }
    }
}
