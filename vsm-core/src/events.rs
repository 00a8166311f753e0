use crate::types::{SignalId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A released signal emission, already applied to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub at: Timestamp,
    pub name: String,
    pub id: Option<SignalId>,
    pub value: Value,
}

/// One operand of a condition expression with its value at violation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperandSnapshot {
    pub name: String,
    pub value: Value,
}

/// A condition frozen for a violation report: where it sits in the tree,
/// what it tests, and what its operands held.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub path: String,
    pub expr: String,
    pub operands: Vec<OperandSnapshot>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// `T_START` elapsed while the expression had not yet turned true.
    StartWindowExpired,
    /// The expression fell inside the stop window.
    FalseWithinStopWindow,
}

impl ViolationKind {
    pub fn message(self) -> &'static str {
        match self {
            ViolationKind::StartWindowExpired => {
                "condition not satisfied before start window"
            }
            ViolationKind::FalseWithinStopWindow => {
                "condition went false within stop window"
            }
        }
    }
}

/// Monitor violation record: the violating condition plus every ancestor
/// condition, each with operand snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub at: Timestamp,
    pub kind: ViolationKind,
    pub condition: ConditionSnapshot,
    pub ancestors: Vec<ConditionSnapshot>,
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "violation at {}ms: {} [{}] `{}`",
            self.at,
            self.kind.message(),
            self.condition.path,
            self.condition.expr
        )?;
        write_operands(f, &self.condition.operands)?;
        for ancestor in &self.ancestors {
            write!(f, "; within [{}] `{}`", ancestor.path, ancestor.expr)?;
            write_operands(f, &ancestor.operands)?;
        }
        Ok(())
    }
}

fn write_operands(f: &mut fmt::Formatter<'_>, operands: &[OperandSnapshot]) -> fmt::Result {
    f.write_str(" {")?;
    for (i, op) in operands.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}={}", op.name, op.value)?;
    }
    f.write_str("}")
}

/// Everything the engine hands back to the driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutputEvent {
    Emission(Emission),
    Violation(ViolationReport),
}
