//! Rule-file front end: the YAML document walk and the nom grammar for
//! condition/emit expressions.

use super::ir::IrNode;
use crate::expr::{BinOp, Expr, UnOp};
use crate::types::Value;
use anyhow::{anyhow, bail, Context, Result};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of},
    combinator::{all_consuming, map, map_opt, map_res, not, opt, recognize, value},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

// ─── Entry points ─────────────────────────────────────────────

/// Parse a whole rule document (YAML list of rule items).
pub fn parse_rules(source: &str) -> Result<Vec<IrNode>> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(source).context("malformed rule file")?;
    let items = doc
        .as_sequence()
        .ok_or_else(|| anyhow!("rule file top level must be a list"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_node(item).with_context(|| format!("rule {}", i)))
        .collect()
}

/// Parse one expression string into an AST.
pub fn parse_expression(text: &str) -> Result<Expr> {
    match all_consuming(expr)(text) {
        Ok((_, e)) => Ok(e),
        Err(err) => bail!("invalid expression `{}`: {}", text, err),
    }
}

/// Parse a bare value literal (input lines, capture log fields).
pub fn parse_value_literal(text: &str) -> Result<Value> {
    match all_consuming(lexeme(value_literal))(text) {
        Ok((_, v)) => Ok(v),
        Err(err) => bail!("invalid value literal `{}`: {}", text, err),
    }
}

// ─── YAML document walk ───────────────────────────────────────

fn parse_node(item: &serde_yaml::Value) -> Result<IrNode> {
    let map = item
        .as_mapping()
        .ok_or_else(|| anyhow!("rule item must be a mapping"))?;

    if map.iter().any(|(k, _)| k.as_str() == Some("condition")) {
        return parse_condition(map);
    }
    if map.len() == 1 {
        let (key, val) = map.iter().next().unwrap();
        return match key.as_str().unwrap_or_default() {
            "parallel" => Ok(IrNode::Parallel {
                children: parse_children(val, "parallel")?,
            }),
            "sequence" => Ok(IrNode::Sequence {
                children: parse_children(val, "sequence")?,
            }),
            "emit" => parse_emit(val),
            other => bail!("unknown rule item `{}`", other),
        };
    }
    bail!("rule item must be a condition, parallel, sequence, or emit")
}

fn parse_condition(map: &serde_yaml::Mapping) -> Result<IrNode> {
    let mut text = None;
    let mut start_ms = None;
    let mut stop_ms = None;
    let mut children = Vec::new();

    // Walk in document order so emit/wrapper children keep their order.
    for (key, val) in map {
        match key.as_str().unwrap_or_default() {
            "condition" => {
                text = Some(
                    val.as_str()
                        .ok_or_else(|| anyhow!("`condition` must be an expression string"))?
                        .to_string(),
                );
            }
            "start" => start_ms = Some(millis_field(val, "start")?),
            "stop" => stop_ms = Some(millis_field(val, "stop")?),
            "emit" => children.push(parse_emit(val)?),
            "parallel" => children.push(IrNode::Parallel {
                children: parse_children(val, "parallel")?,
            }),
            "sequence" => children.push(IrNode::Sequence {
                children: parse_children(val, "sequence")?,
            }),
            other => bail!("unknown key `{}` in condition", other),
        }
    }

    let text = text.ok_or_else(|| anyhow!("condition is missing its expression"))?;
    let expr = parse_expression(&text)?;
    Ok(IrNode::Condition {
        text,
        expr,
        start_ms,
        stop_ms,
        children,
    })
}

fn parse_children(val: &serde_yaml::Value, wrapper: &str) -> Result<Vec<IrNode>> {
    let items = val
        .as_sequence()
        .ok_or_else(|| anyhow!("`{}` must be a list", wrapper))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            parse_node(item).with_context(|| format!("{} child {}", wrapper, i))
        })
        .collect()
}

fn parse_emit(val: &serde_yaml::Value) -> Result<IrNode> {
    let map = val
        .as_mapping()
        .ok_or_else(|| anyhow!("`emit` must be a mapping"))?;
    let mut signal = None;
    let mut value_expr = None;
    let mut delay_ms = 0;

    for (key, item) in map {
        match key.as_str().unwrap_or_default() {
            "signal" => {
                signal = Some(
                    item.as_str()
                        .ok_or_else(|| anyhow!("emit `signal` must be a name"))?
                        .to_string(),
                );
            }
            "value" => value_expr = Some(emit_value_expr(item)?),
            "delay" => delay_ms = millis_field(item, "delay")?,
            other => bail!("unknown key `{}` in emit", other),
        }
    }

    Ok(IrNode::Emit {
        signal: signal.ok_or_else(|| anyhow!("emit is missing `signal`"))?,
        value: value_expr.ok_or_else(|| anyhow!("emit is missing `value`"))?,
        delay_ms,
    })
}

/// Emit values are expressions: YAML scalars become literals, strings go
/// through the expression grammar (so `"engine.rpm + 1"` reads the store
/// and a string constant is written `"'active'"`).
fn emit_value_expr(val: &serde_yaml::Value) -> Result<Expr> {
    match val {
        serde_yaml::Value::Bool(b) => Ok(Expr::Literal(Value::Bool(*b))),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Expr::Literal(Value::Int(i)))
            } else {
                Ok(Expr::Literal(Value::Float(
                    n.as_f64().ok_or_else(|| anyhow!("unrepresentable number"))?,
                )))
            }
        }
        serde_yaml::Value::String(s) => parse_expression(s),
        other => bail!("emit `value` must be a scalar, got {:?}", other),
    }
}

fn millis_field(val: &serde_yaml::Value, field: &str) -> Result<u64> {
    val.as_u64()
        .ok_or_else(|| anyhow!("`{}` must be a non-negative integer (milliseconds)", field))
}

// ─── Expression grammar ───────────────────────────────────────
//
// Precedence, loosest first: `||`, `^^`, `&&`, `!`, comparison,
// additive, multiplicative, unary `-`.

fn lexeme<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    or_expr(input)
}

fn binary_chain<'a>(
    mut operand: impl FnMut(&'a str) -> IResult<&'a str, Expr>,
    mut operator: impl FnMut(&'a str) -> IResult<&'a str, BinOp>,
    input: &'a str,
) -> IResult<&'a str, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        let Ok((rest, op)) = operator(input) else {
            return Ok((input, lhs));
        };
        let (rest, rhs) = operand(rest)?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
        input = rest;
    }
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(xor_expr, lexeme(value(BinOp::Or, tag("||"))), input)
}

fn xor_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(and_expr, lexeme(value(BinOp::Xor, tag("^^"))), input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    binary_chain(not_expr, lexeme(value(BinOp::And, tag("&&"))), input)
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(lexeme(terminated(char('!'), not(char('=')))), not_expr),
            |operand| Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(operand),
            },
        ),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, tail) = opt(pair(lexeme(cmp_op), additive))(input)?;
    Ok((
        input,
        match tail {
            Some((op, rhs)) => Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            None => lhs,
        },
    ))
}

fn cmp_op(input: &str) -> IResult<&str, BinOp> {
    alt((
        value(BinOp::Le, tag("<=")),
        value(BinOp::Ge, tag(">=")),
        value(BinOp::Eq, tag("==")),
        value(BinOp::Ne, tag("!=")),
        value(BinOp::Lt, tag("<")),
        value(BinOp::Gt, tag(">")),
    ))(input)
}

fn additive(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        multiplicative,
        lexeme(alt((
            value(BinOp::Add, char('+')),
            value(BinOp::Sub, char('-')),
        ))),
        input,
    )
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    binary_chain(
        unary,
        lexeme(alt((
            value(BinOp::Mul, char('*')),
            value(BinOp::Div, char('/')),
            value(BinOp::Mod, char('%')),
        ))),
        input,
    )
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(lexeme(char('-')), unary), |operand| Expr::Unary {
            op: UnOp::Neg,
            operand: Box::new(operand),
        }),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    lexeme(alt((
        delimited(char('('), expr, char(')')),
        map(string_lit, Expr::Literal),
        map(number_lit, Expr::Literal),
        signal_or_keyword,
    )))(input)
}

fn signal_or_keyword(input: &str) -> IResult<&str, Expr> {
    map(dotted_name, |name: &str| match name {
        "true" | "True" => Expr::Literal(Value::Bool(true)),
        "false" | "False" => Expr::Literal(Value::Bool(false)),
        _ => Expr::Signal(name.to_string()),
    })(input)
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn dotted_name(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(char('.'), ident))(input)
}

// ─── Shared literal parsers ───────────────────────────────────

pub(crate) fn value_literal(input: &str) -> IResult<&str, Value> {
    alt((string_lit, number_lit, bool_word))(input)
}

fn bool_word(input: &str) -> IResult<&str, Value> {
    map_opt(ident, |word| match word {
        "true" | "True" => Some(Value::Bool(true)),
        "false" | "False" => Some(Value::Bool(false)),
        _ => None,
    })(input)
}

fn number_lit(input: &str) -> IResult<&str, Value> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: &str| {
            if s.contains('.') {
                s.parse::<f64>().map(Value::Float).map_err(|_| ())
            } else {
                s.parse::<i64>().map(Value::Int).map_err(|_| ())
            }
        },
    )(input)
}

fn string_lit(input: &str) -> IResult<&str, Value> {
    map(
        delimited(
            char('\''),
            many0(alt((
                preceded(
                    char('\\'),
                    alt((value('\'', char('\'')), value('\\', char('\\')))),
                ),
                none_of("\\'"),
            ))),
            char('\''),
        ),
        |chars: Vec<char>| Value::Str(chars.into_iter().collect()),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_chain() {
        // `!` binds looser than comparison, `^^` sits between && and ||.
        let e = parse_expression("!a == b").unwrap();
        assert_eq!(
            e,
            Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(Expr::Binary {
                    op: BinOp::Eq,
                    lhs: Box::new(Expr::Signal("a".into())),
                    rhs: Box::new(Expr::Signal("b".into())),
                }),
            }
        );

        let e = parse_expression("a && b ^^ c || d").unwrap();
        match e {
            Expr::Binary { op: BinOp::Or, lhs, .. } => match *lhs {
                Expr::Binary { op: BinOp::Xor, lhs, .. } => {
                    assert!(matches!(*lhs, Expr::Binary { op: BinOp::And, .. }))
                }
                other => panic!("expected xor below or, got {:?}", other),
            },
            other => panic!("expected or at root, got {:?}", other),
        }
    }

    #[test]
    fn arithmetic_precedence_and_parens() {
        let store = crate::signals::SignalStore::new();
        let v = parse_expression("1 + 2 * 3").unwrap().eval(&store);
        assert_eq!(v, Value::Int(7));
        let v = parse_expression("(1 + 2) * 3").unwrap().eval(&store);
        assert_eq!(v, Value::Int(9));
        let v = parse_expression("-2 * 3").unwrap().eval(&store);
        assert_eq!(v, Value::Int(-6));
    }

    #[test]
    fn literals_and_names() {
        assert_eq!(parse_value_literal("42").unwrap(), Value::Int(42));
        assert_eq!(parse_value_literal("-1.5").unwrap(), Value::Float(-1.5));
        assert_eq!(parse_value_literal("True").unwrap(), Value::Bool(true));
        assert_eq!(
            parse_value_literal("'re\\'verse'").unwrap(),
            Value::Str("re'verse".into())
        );
        assert_eq!(parse_value_literal("''").unwrap(), Value::Str("".into()));
        assert!(parse_value_literal("reverse").is_err());
        // `trueish` is a signal, not a Boolean literal.
        assert_eq!(
            parse_expression("trueish").unwrap(),
            Expr::Signal("trueish".into())
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_expression("a == b extra").is_err());
        assert!(parse_expression("a ==").is_err());
    }

    #[test]
    fn parses_condition_with_emit_and_timing() {
        let rules = parse_rules(
            r#"
- condition: "transmission.gear == 'reverse'"
  parallel:
    - condition: "camera.backup.active == true"
      start: 200
      stop: 1000
      emit:
        signal: car.stop
        value: true
"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        let IrNode::Condition { children, start_ms, .. } = &rules[0] else {
            panic!("expected condition");
        };
        assert_eq!(*start_ms, None);
        let IrNode::Parallel { children } = &children[0] else {
            panic!("expected parallel");
        };
        let IrNode::Condition { start_ms, stop_ms, children, .. } = &children[0] else {
            panic!("expected monitored condition");
        };
        assert_eq!((*start_ms, *stop_ms), (Some(200), Some(1000)));
        assert!(matches!(children[0], IrNode::Emit { delay_ms: 0, .. }));
    }

    #[test]
    fn parses_standalone_emit_with_delay() {
        let rules = parse_rules(
            r#"
- emit:
    signal: lights.external.headlights
    value: "'auto'"
    delay: 2000
"#,
        )
        .unwrap();
        let IrNode::Emit { signal, value, delay_ms } = &rules[0] else {
            panic!("expected emit");
        };
        assert_eq!(signal, "lights.external.headlights");
        assert_eq!(*delay_ms, 2000);
        assert_eq!(*value, Expr::Literal(Value::Str("auto".into())));
    }

    #[test]
    fn rejects_negative_timing_and_unknown_keys() {
        assert!(parse_rules("- condition: \"a == 1\"\n  start: -5\n").is_err());
        assert!(parse_rules("- condition: \"a == 1\"\n  bogus: 1\n").is_err());
        assert!(parse_rules("- emit:\n    signal: x\n").is_err());
    }
}
