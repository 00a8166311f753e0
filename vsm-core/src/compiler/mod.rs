//! Rule compiler: YAML document → parsed tree → verified → flat arena.

pub mod ir;
pub mod lowering;
pub mod parser;
pub mod verifier;

use crate::signals::SignalMap;
use crate::types::Program;
use anyhow::{anyhow, Result};

/// Compile rule source into an executable program. Verification failures
/// are load errors and abort with every located message.
pub fn compile(source: &str, map: Option<&SignalMap>) -> Result<Program> {
    let rules = parser::parse_rules(source)?;
    let errors = verifier::verify(&rules, map);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow!("rule verification failed:\n{}", msgs.join("\n")));
    }
    Ok(lowering::lower(&rules, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_joins_all_verifier_errors() {
        let err = compile(
            "- parallel:\n    - emit:\n        signal: x\n        value: 1\n- sequence: []\n",
            None,
        )
        .unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("direct emit"));
        assert!(text.contains("empty sequence"));
    }
}
