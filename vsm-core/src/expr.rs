use crate::signals::SignalStore;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ─── AST ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    And,
    Or,
    Xor,
}

/// A condition or emit-value expression over signals and constants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Signal(String),
    Unary { op: UnOp, operand: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    /// Evaluate against the current signal environment. Pure; soft errors
    /// (unknown signal, type mismatch, division by zero) yield `Undefined`.
    pub fn eval(&self, store: &SignalStore) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Signal(name) => store.get(name),
            Expr::Unary { op, operand } => eval_unary(*op, operand.eval(store)),
            Expr::Binary { op, lhs, rhs } => {
                eval_binary(*op, lhs.eval(store), rhs.eval(store))
            }
        }
    }

    /// Every signal name the expression reads. Feeds the reverse index.
    pub fn operands(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_operands(&mut out);
        out
    }

    fn collect_operands(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Signal(name) => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_operands(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_operands(out);
                rhs.collect_operands(out);
            }
        }
    }
}

// ─── Evaluation ───────────────────────────────────────────────

fn eval_unary(op: UnOp, v: Value) -> Value {
    match (op, v) {
        (UnOp::Neg, Value::Int(n)) => {
            n.checked_neg().map(Value::Int).unwrap_or(Value::Undefined)
        }
        (UnOp::Neg, Value::Float(f)) => Value::Float(-f),
        (UnOp::Not, Value::Bool(b)) => Value::Bool(!b),
        _ => Value::Undefined,
    }
}

fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> Value {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            eval_arith(op, lhs, rhs)
        }
        BinOp::Lt | BinOp::Le | BinOp::Eq | BinOp::Ne | BinOp::Ge | BinOp::Gt => {
            eval_compare(op, lhs, rhs)
        }
        // Connectives gate an Undefined operand to false so a condition can
        // turn true while one side has never been observed; any other
        // non-Boolean operand is a type mismatch.
        BinOp::And | BinOp::Or | BinOp::Xor => {
            match (gate(&lhs), gate(&rhs)) {
                (Some(a), Some(b)) => Value::Bool(match op {
                    BinOp::And => a && b,
                    BinOp::Or => a || b,
                    _ => a ^ b,
                }),
                _ => Value::Undefined,
            }
        }
    }
}

fn gate(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Undefined => Some(false),
        _ => None,
    }
}

fn eval_arith(op: BinOp, lhs: Value, rhs: Value) -> Value {
    // Int op Int stays integral; integer division truncates toward zero.
    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int),
            BinOp::Sub => a.checked_sub(b).map(Value::Int),
            BinOp::Mul => a.checked_mul(b).map(Value::Int),
            BinOp::Div => a.checked_div(b).map(Value::Int),
            BinOp::Mod => a.checked_rem(b).map(Value::Int),
            _ => unreachable!(),
        }
        .unwrap_or(Value::Undefined);
    }
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => match op {
            BinOp::Add => Value::Float(a + b),
            BinOp::Sub => Value::Float(a - b),
            BinOp::Mul => Value::Float(a * b),
            BinOp::Div if b == 0.0 => Value::Undefined,
            BinOp::Div => Value::Float(a / b),
            BinOp::Mod if b == 0.0 => Value::Undefined,
            BinOp::Mod => Value::Float(a % b),
            _ => unreachable!(),
        },
        _ => Value::Undefined,
    }
}

fn eval_compare(op: BinOp, lhs: Value, rhs: Value) -> Value {
    // Numeric pairs coerce to float; strings compare to strings;
    // Booleans permit equality only. Everything else is a mismatch.
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return Value::Bool(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Ge => a >= b,
            BinOp::Gt => a > b,
            _ => unreachable!(),
        });
    }
    match (&lhs, &rhs) {
        (Value::Str(a), Value::Str(b)) => Value::Bool(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Ge => a >= b,
            BinOp::Gt => a > b,
            _ => unreachable!(),
        }),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinOp::Eq => Value::Bool(a == b),
            BinOp::Ne => Value::Bool(a != b),
            _ => Value::Undefined,
        },
        _ => Value::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_expression;

    fn store_with(pairs: &[(&str, Value)]) -> SignalStore {
        let mut store = SignalStore::new();
        for (name, value) in pairs {
            store.set(name, value.clone(), 0);
        }
        store
    }

    fn eval(text: &str, store: &SignalStore) -> Value {
        parse_expression(text).unwrap().eval(store)
    }

    #[test]
    fn arithmetic_and_coercion() {
        let store = store_with(&[("engine.rpm", Value::Int(3000))]);
        assert_eq!(eval("engine.rpm + 500", &store), Value::Int(3500));
        assert_eq!(eval("engine.rpm / 2.0", &store), Value::Float(1500.0));
        assert_eq!(eval("7 / 2", &store), Value::Int(3));
        assert_eq!(eval("-7 / 2", &store), Value::Int(-3));
        assert_eq!(eval("7 % 3", &store), Value::Int(1));
    }

    #[test]
    fn division_by_zero_is_soft() {
        let store = SignalStore::new();
        assert_eq!(eval("1 / 0", &store), Value::Undefined);
        assert_eq!(eval("1.0 / 0.0", &store), Value::Undefined);
        assert_eq!(eval("1 % 0", &store), Value::Undefined);
    }

    #[test]
    fn comparison_rules() {
        let store = store_with(&[("gear", Value::Str("reverse".into()))]);
        assert_eq!(eval("gear == 'reverse'", &store), Value::Bool(true));
        assert_eq!(eval("gear == 1", &store), Value::Undefined);
        assert_eq!(eval("1 == 1.0", &store), Value::Bool(true));
        assert_eq!(eval("2 >= 1.5", &store), Value::Bool(true));
        assert_eq!(eval("true == true", &store), Value::Bool(true));
        assert_eq!(eval("true < false", &store), Value::Undefined);
    }

    #[test]
    fn undefined_propagates_through_arithmetic() {
        let store = SignalStore::new();
        assert_eq!(eval("missing + 1", &store), Value::Undefined);
        assert_eq!(eval("missing == 'x'", &store), Value::Undefined);
        assert_eq!(eval("!missing", &store), Value::Undefined);
    }

    #[test]
    fn connectives_gate_undefined_to_false() {
        let store = store_with(&[("a", Value::Bool(true))]);
        assert_eq!(eval("a ^^ b", &store), Value::Bool(true));
        assert_eq!(eval("a && b", &store), Value::Bool(false));
        assert_eq!(eval("a || b", &store), Value::Bool(true));
        // Non-Boolean operands are still a type mismatch.
        assert_eq!(eval("a && 1", &store), Value::Undefined);
    }

    #[test]
    fn xor_is_logical() {
        let store = store_with(&[("a", Value::Bool(true)), ("b", Value::Bool(true))]);
        assert_eq!(eval("a ^^ b", &store), Value::Bool(false));
        let store = store_with(&[("a", Value::Bool(true)), ("b", Value::Bool(false))]);
        assert_eq!(eval("a ^^ b", &store), Value::Bool(true));
    }

    #[test]
    fn operand_collection() {
        let expr = parse_expression("a.b + 1 > c && !d.e.f").unwrap();
        let names: Vec<_> = expr.operands().into_iter().collect();
        assert_eq!(names, vec!["a.b", "c", "d.e.f"]);
    }
}
