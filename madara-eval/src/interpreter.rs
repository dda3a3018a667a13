// Compiles KaRL source against a Context, memoizing by source string (spec
// §4.2 "Compilation is memoized keyed on source string").

use std::any::Any;
use std::sync::Arc;

use madara_context::{Context, UpdateSettings};
use madara_lang::Record;

use crate::ast::ExprTree;
use crate::error::Result;
use crate::parser;

pub struct Interpreter;

impl Interpreter {
    /// Tokenizes, parses and prunes `source`, caching the pruned tree on
    /// `context` keyed by the source text verbatim. A cache hit skips
    /// parsing and pruning entirely.
    pub fn compile(context: &Context, source: &str) -> Result<Arc<ExprTree>> {
        if let Some(cached) = context.cache_get(source) {
            if let Ok(tree) = cached.downcast::<ExprTree>() {
                return Ok(tree);
            }
        }
        let tree = parser::parse(source)?;
        let (pruned, _can_change) = tree.prune()?;
        let compiled = Arc::new(pruned);
        context.cache_put(source, compiled.clone() as Arc<dyn Any + Send + Sync>);
        Ok(compiled)
    }

    pub fn evaluate(context: &Context, source: &str, settings: &UpdateSettings) -> Result<Record> {
        let tree = Self::compile(context, source)?;
        tree.evaluate(context, settings)
    }
}

/// Entry point for the `#eval` system call: compiling and evaluating a
/// string at runtime lives in this module, not `syscalls`, to avoid
/// `syscalls` depending back on the parser for one call.
pub fn compile_and_evaluate(source: &str, context: &Context, settings: &UpdateSettings) -> Result<Record> {
    Interpreter::evaluate(context, source, settings)
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::Context;

    #[test]
    fn repeated_compile_of_identical_source_hits_the_cache() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        context.set("x", 41i64, &settings);
        let a = Interpreter::compile(&context, "x + 1").unwrap();
        let b = Interpreter::compile(&context, "x + 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn evaluate_runs_the_compiled_tree_against_the_context() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        context.set("x", 41i64, &settings);
        let result = Interpreter::evaluate(&context, "x + 1", &settings).unwrap();
        assert_eq!(result.value, madara_lang::RecordValue::Integer(42));
    }

    #[test]
    fn compile_error_is_structured_not_a_panic() {
        let context = Context::new("self", 1);
        assert!(Interpreter::compile(&context, "1 +").is_err());
    }
}
