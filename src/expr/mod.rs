//! Rule expression compilation.
//!
//! An expression goes through two stages: [`rewrite`] turns dotted and
//! JSONPath tokens into evaluator-safe `v_…` variables while recording the
//! path each variable came from, and [`eval`] parses the rewritten text
//! into an AST evaluated against per-event parameters.

pub mod eval;
pub mod path;
pub mod rewrite;

use std::collections::HashMap;

use serde_json::Value;

/// Expression compilation / evaluation errors.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("parse error in expression '{expr}': {message}")]
    Parse { expr: String, message: String },
    #[error("evaluation error: {0}")]
    Eval(#[from] eval::EvalError),
}

/// A compiled rule expression: parsed AST plus the variables it references
/// and the source path behind each one.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: eval::Ast,
    vars: Vec<String>,
    var_paths: HashMap<String, String>,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let rewritten = rewrite::rewrite(source);
        let ast = eval::parse(&rewritten.expr).map_err(|e| ExprError::Parse {
            expr: source.to_string(),
            message: e.to_string(),
        })?;
        let vars = eval::variables(&ast);
        Ok(Self {
            source: source.to_string(),
            ast,
            vars,
            var_paths: rewritten.var_paths,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variable names the expression references, in first-use order.
    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    /// Generated variable name → source JSONPath.
    pub fn var_paths(&self) -> &HashMap<String, String> {
        &self.var_paths
    }

    pub fn evaluate(&self, params: &HashMap<String, Value>) -> Result<Value, ExprError> {
        Ok(eval::evaluate(&self.ast, params)?)
    }
}
