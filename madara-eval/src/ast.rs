// ExprTree node variants and their prune()/evaluate() behaviour (spec
// §4.2). Compilation (tokenize + parse) lives in `parser.rs`; this module
// only defines the tree and its two traversal operations.

use madara_context::{Context, RegisteredFunction, UpdateSettings};
use madara_lang::{Record, RecordValue};

use crate::error::{KarlError, Result};
use crate::syscalls;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Implies,
    Assign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqKind {
    /// `;` — evaluate every item, return the element-wise maximum.
    Both,
    /// `;>` — evaluate every item, return the last.
    ReturnRight,
}

#[derive(Clone, Debug)]
pub enum ExprTree {
    Leaf(RecordValue),
    Variable { key: String },
    ArrayReference { var: Box<ExprTree>, index: Box<ExprTree> },
    Unary { op: UnaryOp, operand: Box<ExprTree> },
    Binary { op: BinaryOp, lhs: Box<ExprTree>, rhs: Box<ExprTree> },
    Sequence { kind: SeqKind, items: Vec<ExprTree> },
    ConstArray(Vec<ExprTree>),
    SystemCall { name: String, args: Vec<ExprTree> },
    /// A call to the function registry (spec §3 "name -> {native, KaRL,
    /// foreign}"), as opposed to a `#`-prefixed SystemCall.
    Call { name: String, args: Vec<ExprTree> },
}

fn record_of(v: RecordValue) -> Record {
    let mut r = Record::new(v);
    r.status = madara_lang::Status::Modified;
    r
}

fn division_by_zero_record() -> Record {
    record_of(RecordValue::from("Division by Zero".to_string()))
}

fn numeric_binary(op: BinaryOp, lhs: &RecordValue, rhs: &RecordValue) -> Record {
    let is_double = lhs.is_double() || rhs.is_double();
    match op {
        BinaryOp::Add if matches!(lhs, RecordValue::Text(_)) || matches!(rhs, RecordValue::Text(_)) => {
            record_of(RecordValue::from(format!(
                "{}{}",
                lhs.to_display_string(""),
                rhs.to_display_string("")
            )))
        }
        BinaryOp::Add if is_double => record_of(RecordValue::from(lhs.as_double() + rhs.as_double())),
        BinaryOp::Add => record_of(RecordValue::from(lhs.as_integer() + rhs.as_integer())),
        BinaryOp::Sub if is_double => record_of(RecordValue::from(lhs.as_double() - rhs.as_double())),
        BinaryOp::Sub => record_of(RecordValue::from(lhs.as_integer() - rhs.as_integer())),
        BinaryOp::Mul if is_double => record_of(RecordValue::from(lhs.as_double() * rhs.as_double())),
        BinaryOp::Mul => record_of(RecordValue::from(lhs.as_integer() * rhs.as_integer())),
        BinaryOp::Div if is_double => {
            if rhs.as_double() == 0.0 {
                division_by_zero_record()
            } else {
                record_of(RecordValue::from(lhs.as_double() / rhs.as_double()))
            }
        }
        BinaryOp::Div => {
            if rhs.as_integer() == 0 {
                division_by_zero_record()
            } else {
                record_of(RecordValue::from(lhs.as_integer() / rhs.as_integer()))
            }
        }
        BinaryOp::Mod => {
            if rhs.as_integer() == 0 {
                division_by_zero_record()
            } else {
                record_of(RecordValue::from(lhs.as_integer() % rhs.as_integer()))
            }
        }
        _ => unreachable!("numeric_binary called with non-arithmetic op"),
    }
}

fn compare(op: BinaryOp, lhs: &RecordValue, rhs: &RecordValue) -> Record {
    let truth = match (lhs, rhs) {
        (RecordValue::Text(a), RecordValue::Text(b)) => match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!(),
        },
        _ => {
            let a = lhs.as_double();
            let b = rhs.as_double();
            match op {
                BinaryOp::Eq => a == b,
                BinaryOp::Ne => a != b,
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::Ge => a >= b,
                _ => unreachable!(),
            }
        }
    };
    record_of(RecordValue::Integer(truth as i64))
}

fn pick_max(a: Record, b: Record) -> Record {
    if b.value.as_double() >= a.value.as_double() {
        b
    } else {
        a
    }
}

impl ExprTree {
    /// Post-order constant folding (spec §4.2 "Prune"). Returns the
    /// pruned tree and whether it can still change at evaluation time.
    pub fn prune(self) -> Result<(ExprTree, bool)> {
        match self {
            ExprTree::Leaf(v) => Ok((ExprTree::Leaf(v), false)),
            ExprTree::Variable { key } => Ok((ExprTree::Variable { key }, true)),
            ExprTree::ArrayReference { var, index } => {
                let (var, _) = var.prune()?;
                let (index, _) = index.prune()?;
                Ok((
                    ExprTree::ArrayReference {
                        var: Box::new(var),
                        index: Box::new(index),
                    },
                    true,
                ))
            }
            ExprTree::Unary { op, operand } => {
                let (operand, can_change) = operand.prune()?;
                if matches!(op, UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec) {
                    return Ok((ExprTree::Unary { op, operand: Box::new(operand) }, true));
                }
                if !can_change {
                    if let ExprTree::Leaf(v) = &operand {
                        let folded = match op {
                            UnaryOp::Negate if v.is_double() => RecordValue::from(-v.as_double()),
                            UnaryOp::Negate => RecordValue::from(-v.as_integer()),
                            UnaryOp::Not => RecordValue::Integer(!v.is_truthy() as i64),
                            _ => unreachable!(),
                        };
                        return Ok((ExprTree::Leaf(folded), false));
                    }
                }
                Ok((ExprTree::Unary { op, operand: Box::new(operand) }, can_change))
            }
            ExprTree::Binary { op, lhs, rhs } => {
                let (lhs, lc) = lhs.prune()?;
                let (rhs, rc) = rhs.prune()?;
                let can_change = lc || rc || matches!(op, BinaryOp::Assign);

                if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
                    if let ExprTree::Leaf(rv) = &rhs {
                        let is_zero = if rv.is_double() { rv.as_double() == 0.0 } else { rv.as_integer() == 0 };
                        if is_zero && !rc {
                            return Err(KarlError::ConstantDivideByZero);
                        }
                    }
                }

                if !can_change {
                    if let (ExprTree::Leaf(l), ExprTree::Leaf(r)) = (&lhs, &rhs) {
                        let folded = eval_binary_values(op, l, r);
                        return Ok((ExprTree::Leaf(folded.value), false));
                    }
                }
                Ok((ExprTree::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, can_change))
            }
            ExprTree::Sequence { kind, items } => {
                let mut pruned = Vec::with_capacity(items.len());
                let mut can_change = false;
                for item in items {
                    let (p, c) = item.prune()?;
                    can_change |= c;
                    pruned.push(p);
                }
                Ok((ExprTree::Sequence { kind, items: pruned }, can_change))
            }
            ExprTree::ConstArray(items) => {
                let mut pruned = Vec::with_capacity(items.len());
                let mut can_change = false;
                for item in items {
                    let (p, c) = item.prune()?;
                    can_change |= c;
                    pruned.push(p);
                }
                if !can_change {
                    let mut ints = Vec::new();
                    let mut doubles = Vec::new();
                    let mut all_numeric = true;
                    for p in &pruned {
                        match p {
                            ExprTree::Leaf(RecordValue::Integer(i)) => {
                                ints.push(*i);
                                doubles.push(*i as f64);
                            }
                            ExprTree::Leaf(RecordValue::Double(d)) => {
                                doubles.push(d.0);
                                all_numeric = false; // forces double array below
                            }
                            _ => {
                                all_numeric = false;
                                doubles.clear();
                            }
                        }
                    }
                    if !pruned.is_empty() && doubles.len() == pruned.len() {
                        let folded = if all_numeric {
                            RecordValue::from(ints)
                        } else {
                            RecordValue::from(doubles)
                        };
                        return Ok((ExprTree::Leaf(folded), false));
                    }
                }
                Ok((ExprTree::ConstArray(pruned), can_change))
            }
            ExprTree::SystemCall { name, args } => {
                syscalls::check_arity(&name, args.len())?;
                let mut pruned = Vec::with_capacity(args.len());
                for a in args {
                    let (p, _) = a.prune()?;
                    pruned.push(p);
                }
                Ok((ExprTree::SystemCall { name, args: pruned }, true))
            }
            ExprTree::Call { name, args } => {
                let mut pruned = Vec::with_capacity(args.len());
                for a in args {
                    let (p, _) = a.prune()?;
                    pruned.push(p);
                }
                Ok((ExprTree::Call { name, args: pruned }, true))
            }
        }
    }

    /// Evaluates the tree against `context`, applying `settings` to any
    /// writes performed along the way (spec §4.2 "Evaluate").
    pub fn evaluate(&self, context: &Context, settings: &UpdateSettings) -> Result<Record> {
        match self {
            ExprTree::Leaf(v) => Ok(record_of(v.clone())),
            ExprTree::Variable { key } => {
                let resolved = if settings.expand_variables && key.contains('{') {
                    context.expand_key(key)
                } else {
                    key.clone()
                };
                Ok(context.get(&resolved))
            }
            ExprTree::ArrayReference { var, index } => {
                let key = self.lvalue_key(var, context, settings)?;
                let idx = index.evaluate(context, settings)?.value.as_integer();
                Ok(context.retrieve_index(&key, idx.max(0) as usize))
            }
            ExprTree::Unary { op, operand } => self.evaluate_unary(*op, operand, context, settings),
            ExprTree::Binary { op, lhs, rhs } => self.evaluate_binary(*op, lhs, rhs, context, settings),
            ExprTree::Sequence { kind, items } => {
                let mut last = Record::zero();
                let mut max = Record::zero();
                let mut first = true;
                for item in items {
                    let v = item.evaluate(context, settings)?;
                    if first {
                        max = v.clone();
                        first = false;
                    } else {
                        max = pick_max(max, v.clone());
                    }
                    last = v;
                }
                Ok(match kind {
                    SeqKind::Both => max,
                    SeqKind::ReturnRight => last,
                })
            }
            ExprTree::ConstArray(items) => {
                let mut ints = Vec::new();
                let mut doubles = Vec::new();
                let mut any_double = false;
                for item in items {
                    let v = item.evaluate(context, settings)?.value;
                    if v.is_double() {
                        any_double = true;
                    }
                    doubles.push(v.as_double());
                    ints.push(v.as_integer());
                }
                Ok(record_of(if any_double {
                    RecordValue::from(doubles)
                } else {
                    RecordValue::from(ints)
                }))
            }
            ExprTree::SystemCall { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for a in args {
                    evaluated.push(a.evaluate(context, settings)?);
                }
                syscalls::call(name, &evaluated, context)
            }
            ExprTree::Call { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for a in args {
                    evaluated.push(a.evaluate(context, settings)?);
                }
                self.call_registered(name, &evaluated, context, settings)
            }
        }
    }

    /// Dispatches a `name(args)` call through the Context's function
    /// registry (spec §3). A `Karl`-registered function receives its
    /// arguments bound as local keys `.arg0`, `.arg1`, ... before its
    /// compiled tree is evaluated — the registry stores an opaque
    /// compiled tree with no parameter list, so this is the convention
    /// this implementation picks for passing arguments into it (see
    /// DESIGN.md).
    fn call_registered(
        &self,
        name: &str,
        args: &[Record],
        context: &Context,
        settings: &UpdateSettings,
    ) -> Result<Record> {
        match context.lookup_function(name) {
            Some(RegisteredFunction::Native(f)) => {
                f(context, args).map_err(|e| KarlError::Other(e.to_string()))
            }
            Some(RegisteredFunction::Foreign(f)) => {
                f(args).map_err(|e| KarlError::Other(e.to_string()))
            }
            Some(RegisteredFunction::Karl(compiled)) => {
                let tree = compiled
                    .downcast::<ExprTree>()
                    .map_err(|_| KarlError::Other(format!("registry entry '{name}' is not an ExprTree")))?;
                let always = UpdateSettings { always_overwrite: true, ..*settings };
                for (i, arg) in args.iter().enumerate() {
                    context.set(&format!(".arg{i}"), arg.value.clone(), &always);
                }
                tree.evaluate(context, settings)
            }
            None => Err(KarlError::Other(format!("call to unregistered function '{name}'"))),
        }
    }

    fn evaluate_unary(
        &self,
        op: UnaryOp,
        operand: &ExprTree,
        context: &Context,
        settings: &UpdateSettings,
    ) -> Result<Record> {
        match op {
            UnaryOp::Negate => {
                let v = operand.evaluate(context, settings)?.value;
                Ok(record_of(if v.is_double() {
                    RecordValue::from(-v.as_double())
                } else {
                    RecordValue::from(-v.as_integer())
                }))
            }
            UnaryOp::Not => {
                let v = operand.evaluate(context, settings)?;
                Ok(record_of(RecordValue::Integer(!v.is_truthy() as i64)))
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let key = self.lvalue_key(operand, context, settings)?;
                let old = context.get(&key);
                let delta = if matches!(op, UnaryOp::PreInc | UnaryOp::PostInc) { 1.0 } else { -1.0 };
                context.inc(&key, delta, settings);
                let new = context.get(&key);
                Ok(match op {
                    UnaryOp::PreInc | UnaryOp::PreDec => new,
                    UnaryOp::PostInc | UnaryOp::PostDec => old,
                })
            }
        }
    }

    fn evaluate_binary(
        &self,
        op: BinaryOp,
        lhs: &ExprTree,
        rhs: &ExprTree,
        context: &Context,
        settings: &UpdateSettings,
    ) -> Result<Record> {
        match op {
            BinaryOp::And => {
                let l = lhs.evaluate(context, settings)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                rhs.evaluate(context, settings)
            }
            BinaryOp::Or => {
                let l = lhs.evaluate(context, settings)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                rhs.evaluate(context, settings)
            }
            BinaryOp::Implies => {
                let l = lhs.evaluate(context, settings)?;
                if l.is_truthy() {
                    rhs.evaluate(context, settings)?;
                }
                Ok(l)
            }
            BinaryOp::Assign => {
                let value = rhs.evaluate(context, settings)?.value;
                match lhs {
                    ExprTree::Variable { key } => {
                        let resolved = if settings.expand_variables && key.contains('{') {
                            context.expand_key(key)
                        } else {
                            key.clone()
                        };
                        context.set(&resolved, value.clone(), settings);
                    }
                    ExprTree::ArrayReference { var, index } => {
                        let key = self.lvalue_key(var, context, settings)?;
                        let idx = index.evaluate(context, settings)?.value.as_integer().max(0) as usize;
                        context.set_index(&key, idx, value.as_double(), settings);
                    }
                    _ => return Err(KarlError::InvalidLvalue),
                }
                Ok(record_of(value))
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let l = lhs.evaluate(context, settings)?.value;
                let r = rhs.evaluate(context, settings)?.value;
                Ok(compare(op, &l, &r))
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let l = lhs.evaluate(context, settings)?.value;
                let r = rhs.evaluate(context, settings)?.value;
                Ok(numeric_binary(op, &l, &r))
            }
        }
    }

    fn lvalue_key(&self, node: &ExprTree, context: &Context, settings: &UpdateSettings) -> Result<String> {
        match node {
            ExprTree::Variable { key } => Ok(if settings.expand_variables && key.contains('{') {
                context.expand_key(key)
            } else {
                key.clone()
            }),
            _ => Err(KarlError::InvalidLvalue),
        }
    }
}

fn eval_binary_values(op: BinaryOp, l: &RecordValue, r: &RecordValue) -> Record {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => numeric_binary(op, l, r),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, l, r),
        _ => unreachable!("eval_binary_values only folds pure arithmetic/comparison ops"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::Context;

    fn ctx() -> Context {
        Context::new("self", 1)
    }

    #[test]
    fn constant_folds_pure_arithmetic() {
        let tree = ExprTree::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(ExprTree::Leaf(RecordValue::Integer(1))),
            rhs: Box::new(ExprTree::Leaf(RecordValue::Integer(2))),
        };
        let (pruned, can_change) = tree.prune().unwrap();
        assert!(!can_change);
        assert!(matches!(pruned, ExprTree::Leaf(RecordValue::Integer(3))));
    }

    #[test]
    fn constant_divide_by_zero_fails_at_prune() {
        let tree = ExprTree::Binary {
            op: BinaryOp::Div,
            lhs: Box::new(ExprTree::Leaf(RecordValue::Integer(1))),
            rhs: Box::new(ExprTree::Leaf(RecordValue::Integer(0))),
        };
        assert!(tree.prune().is_err());
    }

    #[test]
    fn runtime_divide_by_zero_yields_distinguished_record() {
        let context = ctx();
        let settings = UpdateSettings::new();
        context.set("zero", 0i64, &settings);
        let tree = ExprTree::Binary {
            op: BinaryOp::Div,
            lhs: Box::new(ExprTree::Leaf(RecordValue::Integer(5))),
            rhs: Box::new(ExprTree::Variable { key: "zero".to_string() }),
        };
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::from("Division by Zero".to_string()));
    }

    #[test]
    fn assignment_writes_through_to_context() {
        let context = ctx();
        let settings = UpdateSettings::new();
        let tree = ExprTree::Binary {
            op: BinaryOp::Assign,
            lhs: Box::new(ExprTree::Variable { key: "x".to_string() }),
            rhs: Box::new(ExprTree::Leaf(RecordValue::Integer(42))),
        };
        tree.evaluate(&context, &settings).unwrap();
        assert_eq!(context.get("x").value, RecordValue::Integer(42));
    }

    #[test]
    fn implies_returns_left_value_but_evaluates_right_for_effect() {
        let context = ctx();
        let settings = UpdateSettings::new();
        let tree = ExprTree::Binary {
            op: BinaryOp::Implies,
            lhs: Box::new(ExprTree::Leaf(RecordValue::Integer(7))),
            rhs: Box::new(ExprTree::Binary {
                op: BinaryOp::Assign,
                lhs: Box::new(ExprTree::Variable { key: "y".to_string() }),
                rhs: Box::new(ExprTree::Leaf(RecordValue::Integer(9))),
            }),
        };
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(7));
        assert_eq!(context.get("y").value, RecordValue::Integer(9));
    }

    #[test]
    fn sequence_both_returns_max_of_evaluated_values() {
        let context = ctx();
        let settings = UpdateSettings::new();
        let tree = ExprTree::Sequence {
            kind: SeqKind::Both,
            items: vec![
                ExprTree::Leaf(RecordValue::Integer(1)),
                ExprTree::Leaf(RecordValue::Integer(9)),
                ExprTree::Leaf(RecordValue::Integer(3)),
            ],
        };
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(9));
    }

    #[test]
    fn sequence_return_right_returns_last() {
        let context = ctx();
        let settings = UpdateSettings::new();
        let tree = ExprTree::Sequence {
            kind: SeqKind::ReturnRight,
            items: vec![ExprTree::Leaf(RecordValue::Integer(1)), ExprTree::Leaf(RecordValue::Integer(9))],
        };
        let result = tree.evaluate(&context, &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(9));
    }
}
