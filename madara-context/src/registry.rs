use std::any::Any;
use std::sync::Arc;

use madara_base::Result;
use madara_lang::Record;

use crate::Context;

/// A name-bound function callable from KaRL (spec §3 "function registry").
/// `Karl` holds an opaque compiled tree handle (downcast by `madara-eval`,
/// which owns the concrete `ExprTree` type) so this crate never has to
/// depend on the expression engine.
#[derive(Clone)]
pub enum RegisteredFunction {
    Native(Arc<dyn Fn(&Context, &[Record]) -> Result<Record> + Send + Sync>),
    Karl(Arc<dyn Any + Send + Sync>),
    Foreign(Arc<dyn Fn(&[Record]) -> Result<Record> + Send + Sync>),
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            RegisteredFunction::Native(_) => "Native",
            RegisteredFunction::Karl(_) => "Karl",
            RegisteredFunction::Foreign(_) => "Foreign",
        };
        write!(f, "RegisteredFunction::{kind}")
    }
}
