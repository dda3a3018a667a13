// Built-in system calls, prefix `#` (spec §6). Arity is validated at
// compile (prune) time; runtime dispatch lives in `call`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};

use madara_context::{Context, UpdateSettings};
use madara_lang::{FileType, Record, RecordValue, Status};

use crate::error::{KarlError, Result};
use crate::interpreter::compile_and_evaluate;

fn record_of(v: RecordValue) -> Record {
    let mut r = Record::new(v);
    r.status = Status::Modified;
    r
}

/// `(name, min_args, max_args)`; `max_args = None` means unbounded.
const ARITY: &[(&str, usize, Option<usize>)] = &[
    ("get_time", 0, Some(0)),
    ("get_clock", 0, Some(1)),
    ("set_clock", 1, Some(2)),
    ("rand_int", 2, Some(3)),
    ("rand_double", 2, Some(2)),
    ("pow", 2, Some(2)),
    ("sin", 1, Some(1)),
    ("cos", 1, Some(1)),
    ("tan", 1, Some(1)),
    ("size", 1, Some(1)),
    ("type", 1, Some(1)),
    ("sqrt", 1, Some(1)),
    ("sleep", 1, Some(1)),
    ("read_file", 1, Some(2)),
    ("write_file", 2, Some(2)),
    ("print", 1, Some(2)),
    ("log_level", 0, Some(1)),
    ("set_precision", 1, Some(1)),
    ("set_fixed", 0, Some(0)),
    ("set_scientific", 0, Some(0)),
    ("expand_statement", 1, Some(1)),
    ("expand_env", 1, Some(1)),
    ("fragment", 3, Some(3)),
    ("to_integer", 1, Some(1)),
    ("to_double", 1, Some(1)),
    ("to_string", 1, Some(2)),
    ("to_integers", 1, Some(1)),
    ("to_doubles", 1, Some(1)),
    ("to_buffer", 1, Some(1)),
    ("to_host_dirs", 1, Some(1)),
    ("isinf", 1, Some(1)),
    ("clear_var", 1, Some(1)),
    ("delete_var", 1, Some(1)),
    ("eval", 1, Some(1)),
];

pub fn check_arity(name: &str, got: usize) -> Result<()> {
    let (_, min, max) = ARITY
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| KarlError::UnknownSystemCall { name: name.to_string() })?;
    let ok = got >= *min && max.map(|m| got <= m).unwrap_or(true);
    if !ok {
        let expected = match max {
            Some(m) if m == *min => min.to_string(),
            Some(m) => format!("{min}-{m}"),
            None => format!("at least {min}"),
        };
        return Err(KarlError::ArityMismatch { name: name.to_string(), expected, got });
    }
    Ok(())
}

fn precision_key() -> &'static str {
    ".karl.precision"
}
fn fixed_key() -> &'static str {
    ".karl.fixed"
}
fn scientific_key() -> &'static str {
    ".karl.scientific"
}
fn log_level_key() -> &'static str {
    ".karl.log_level"
}

fn format_double(context: &Context, d: f64) -> String {
    let precision = context.get(precision_key());
    let fixed = context.get(fixed_key()).is_truthy();
    let scientific = context.get(scientific_key()).is_truthy();
    if scientific {
        match precision.exists() {
            true => format!("{:.*e}", precision.value.as_integer().max(0) as usize, d),
            false => format!("{d:e}"),
        }
    } else if fixed || precision.exists() {
        let p = if precision.exists() { precision.value.as_integer().max(0) as usize } else { 6 };
        format!("{d:.p$}")
    } else {
        d.to_string()
    }
}

pub fn call(name: &str, args: &[Record], context: &Context) -> Result<Record> {
    let settings = UpdateSettings::new();
    let always = UpdateSettings::always_overwriting();

    match name {
        "get_time" => Ok(record_of(RecordValue::Integer(now_micros() as i64))),

        "get_clock" => {
            if let Some(var) = args.first() {
                let key = var.value.to_display_string(",");
                Ok(record_of(RecordValue::Integer(context.get(&key).clock as i64)))
            } else {
                Ok(record_of(RecordValue::Integer(context.clock() as i64)))
            }
        }

        "set_clock" => {
            if args.len() == 1 {
                context.set_clock(args[0].value.as_integer().max(0) as u64);
                Ok(record_of(RecordValue::Integer(0)))
            } else {
                let key = args[0].value.to_display_string(",");
                let clock = args[1].value.as_integer().max(0) as u64;
                let current = context.get(&key);
                context.apply_remote_write(
                    &key,
                    current.value,
                    clock,
                    current.quality,
                    context.writer().clone(),
                    current.toi,
                    &always,
                );
                Ok(record_of(RecordValue::Integer(0)))
            }
        }

        "rand_int" => {
            let lo = args[0].value.as_integer();
            let hi = args[1].value.as_integer();
            let v = if hi > lo {
                match args.get(2) {
                    Some(seed) => {
                        let mut rng = rand::rngs::StdRng::seed_from_u64(seed.value.as_integer() as u64);
                        rng.gen_range(lo..=hi)
                    }
                    None => rand::thread_rng().gen_range(lo..=hi),
                }
            } else {
                lo
            };
            Ok(record_of(RecordValue::Integer(v)))
        }

        "rand_double" => {
            let lo = args[0].value.as_double();
            let hi = args[1].value.as_double();
            let mut rng = rand::thread_rng();
            let v = if hi > lo { rng.gen_range(lo..hi) } else { lo };
            Ok(record_of(RecordValue::from(v)))
        }

        "pow" => Ok(record_of(RecordValue::from(args[0].value.as_double().powf(args[1].value.as_double())))),
        "sin" => Ok(record_of(RecordValue::from(args[0].value.as_double().sin()))),
        "cos" => Ok(record_of(RecordValue::from(args[0].value.as_double().cos()))),
        "tan" => Ok(record_of(RecordValue::from(args[0].value.as_double().tan()))),
        "sqrt" => Ok(record_of(RecordValue::from(args[0].value.as_double().sqrt()))),
        "isinf" => Ok(record_of(RecordValue::Integer(args[0].value.as_double().is_infinite() as i64))),

        "size" => Ok(record_of(RecordValue::Integer(args[0].value.size() as i64))),
        "type" => Ok(record_of(RecordValue::Integer(args[0].value.type_tag() as u32 as i64))),

        "sleep" => {
            let secs = args[0].value.as_double().max(0.0);
            std::thread::sleep(Duration::from_secs_f64(secs));
            Ok(record_of(RecordValue::Integer(0)))
        }

        "read_file" => {
            let path = args[0].value.to_display_string(",");
            let as_kind = args.get(1).map(|r| r.value.to_display_string(",")).unwrap_or_else(|| "text".to_string());
            let bytes = std::fs::read(&path).map_err(|e| KarlError::Other(format!("read_file {path}: {e}")))?;
            Ok(record_of(match as_kind.as_str() {
                "xml" => RecordValue::File(FileType::Xml, std::sync::Arc::new(bytes)),
                "jpeg" => RecordValue::File(FileType::Jpeg, std::sync::Arc::new(bytes)),
                _ => RecordValue::from(String::from_utf8_lossy(&bytes).into_owned()),
            }))
        }

        "write_file" => {
            let path = args[1].value.to_display_string(",");
            let bytes = match &args[0].value {
                RecordValue::Blob(b) | RecordValue::File(_, b) => (**b).clone(),
                other => other.to_display_string(",").into_bytes(),
            };
            std::fs::write(&path, &bytes).map_err(|e| KarlError::Other(format!("write_file {path}: {e}")))?;
            Ok(record_of(RecordValue::Integer(bytes.len() as i64)))
        }

        "print" => {
            let text = args[0].value.to_display_string(",");
            let level = args.get(1).map(|r| r.value.to_display_string(",")).unwrap_or_else(|| "info".to_string());
            match level.as_str() {
                "error" => tracing::error!(target: "madara::karl", "{text}"),
                "warn" => tracing::warn!(target: "madara::karl", "{text}"),
                "debug" => tracing::debug!(target: "madara::karl", "{text}"),
                "trace" => tracing::trace!(target: "madara::karl", "{text}"),
                _ => tracing::info!(target: "madara::karl", "{text}"),
            }
            Ok(record_of(RecordValue::Integer(0)))
        }

        "log_level" => {
            if let Some(level) = args.first() {
                context.set(log_level_key(), level.value.as_integer(), &always);
                Ok(record_of(RecordValue::Integer(0)))
            } else {
                Ok(record_of(RecordValue::Integer(context.get(log_level_key()).value.as_integer())))
            }
        }

        "set_precision" => {
            context.set(precision_key(), args[0].value.as_integer(), &always);
            Ok(record_of(RecordValue::Integer(0)))
        }
        "set_fixed" => {
            context.set(fixed_key(), 1i64, &always);
            context.set(scientific_key(), 0i64, &always);
            Ok(record_of(RecordValue::Integer(0)))
        }
        "set_scientific" => {
            context.set(scientific_key(), 1i64, &always);
            context.set(fixed_key(), 0i64, &always);
            Ok(record_of(RecordValue::Integer(0)))
        }

        "expand_statement" => {
            let s = args[0].value.to_display_string(",");
            Ok(record_of(RecordValue::from(context.expand_key(&s))))
        }

        "expand_env" => {
            let s = args[0].value.to_display_string(",");
            Ok(record_of(RecordValue::from(expand_env(&s))))
        }

        "fragment" => {
            let s = args[0].value.to_display_string(",");
            let lo = args[1].value.as_integer().max(0) as usize;
            let hi = args[2].value.as_integer().max(0) as usize;
            let bytes = s.as_bytes();
            let hi = hi.min(bytes.len());
            let lo = lo.min(hi);
            Ok(record_of(RecordValue::from(String::from_utf8_lossy(&bytes[lo..hi]).into_owned())))
        }

        "to_integer" => Ok(record_of(RecordValue::Integer(args[0].value.as_integer()))),
        "to_double" => Ok(record_of(RecordValue::from(args[0].value.as_double()))),
        "to_string" => {
            let delim = args.get(1).map(|r| r.value.to_display_string(",")).unwrap_or_else(|| ",".to_string());
            let text = match &args[0].value {
                RecordValue::Double(d) => format_double(context, d.0),
                RecordValue::DoubleArray(a) => a
                    .iter()
                    .map(|d| format_double(context, d.0))
                    .collect::<Vec<_>>()
                    .join(&delim),
                other => other.to_display_string(&delim),
            };
            Ok(record_of(RecordValue::from(text)))
        }
        "to_integers" => {
            let v = match &args[0].value {
                RecordValue::IntegerArray(a) => (**a).clone(),
                RecordValue::DoubleArray(a) => a.iter().map(|d| d.0 as i64).collect(),
                RecordValue::Text(s) => s
                    .split(',')
                    .filter_map(|p| p.trim().parse::<i64>().ok())
                    .collect(),
                other => vec![other.as_integer()],
            };
            Ok(record_of(RecordValue::from(v)))
        }
        "to_doubles" => {
            let v = match &args[0].value {
                RecordValue::DoubleArray(a) => a.iter().map(|d| d.0).collect(),
                RecordValue::IntegerArray(a) => a.iter().map(|i| *i as f64).collect(),
                RecordValue::Text(s) => s
                    .split(',')
                    .filter_map(|p| p.trim().parse::<f64>().ok())
                    .collect(),
                other => vec![other.as_double()],
            };
            Ok(record_of(RecordValue::from(v)))
        }
        "to_buffer" => {
            let bytes = match &args[0].value {
                RecordValue::Blob(b) | RecordValue::File(_, b) => (**b).clone(),
                other => other.to_display_string(",").into_bytes(),
            };
            Ok(record_of(RecordValue::Blob(std::sync::Arc::new(bytes))))
        }
        "to_host_dirs" => {
            let path = args[0].value.to_display_string(",");
            let normalized = path.replace('\\', "/");
            Ok(record_of(RecordValue::from(normalized)))
        }

        "clear_var" => {
            let key = args[0].value.to_display_string(",");
            context.set(&key, 0i64, &always);
            Ok(record_of(RecordValue::Integer(0)))
        }
        "delete_var" => {
            let key = args[0].value.to_display_string(",");
            context.erase(&key);
            Ok(record_of(RecordValue::Integer(0)))
        }

        "eval" => {
            let source = args[0].value.to_display_string(",");
            compile_and_evaluate(&source, context, &settings)
        }

        _ => Err(KarlError::UnknownSystemCall { name: name.to_string() }),
    }
}

fn expand_env(s: &str) -> String {
    let mut out = String::new();
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek().map(|(_, c)| *c) == Some('{') {
            chars.next();
            let mut name = String::new();
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            out.push_str(&std::env::var(&name).unwrap_or_default());
        } else {
            let mut name = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::Context;

    #[test]
    fn arity_rejects_too_few_args() {
        assert!(check_arity("pow", 1).is_err());
        assert!(check_arity("pow", 2).is_ok());
    }

    #[test]
    fn unknown_system_call_is_rejected() {
        assert!(check_arity("frobnicate", 0).is_err());
    }

    #[test]
    fn size_and_type_reflect_the_value() {
        let ctx = Context::new("self", 1);
        let r = record_of(RecordValue::from("hello"));
        let out = call("size", &[r], &ctx).unwrap();
        assert_eq!(out.value, RecordValue::Integer(5));
    }

    #[test]
    fn to_string_respects_precision() {
        let ctx = Context::new("self", 1);
        let always = UpdateSettings::always_overwriting();
        ctx.set(".karl.precision", 2i64, &always);
        let out = call("to_string", &[record_of(RecordValue::from(3.14159))], &ctx).unwrap();
        assert_eq!(out.value, RecordValue::from("3.14".to_string()));
    }

    #[test]
    fn clear_var_zeroes_without_erasing() {
        let ctx = Context::new("self", 1);
        let always = UpdateSettings::always_overwriting();
        ctx.set("x", 5i64, &always);
        call("clear_var", &[record_of(RecordValue::from("x"))], &ctx).unwrap();
        assert!(ctx.exists("x"));
        assert_eq!(ctx.get("x").value, RecordValue::Integer(0));
    }

    #[test]
    fn delete_var_erases() {
        let ctx = Context::new("self", 1);
        let always = UpdateSettings::always_overwriting();
        ctx.set("x", 5i64, &always);
        call("delete_var", &[record_of(RecordValue::from("x"))], &ctx).unwrap();
        assert!(!ctx.exists("x"));
    }

    #[test]
    fn rand_int_with_a_seed_is_reproducible() {
        let ctx = Context::new("self", 1);
        let args = [record_of(RecordValue::Integer(0)), record_of(RecordValue::Integer(1000)), record_of(RecordValue::Integer(42))];
        let a = call("rand_int", &args, &ctx).unwrap();
        let b = call("rand_int", &args, &ctx).unwrap();
        assert_eq!(a.value, b.value);
    }
}
