// Blocking/polling evaluation loop over a compiled tree (spec §4.3).

use std::sync::Arc;
use std::time::{Duration, Instant};

use madara_context::{Context, UpdateSettings};
use madara_lang::Record;

use crate::ast::ExprTree;
use crate::error::{KarlError, Result};
use crate::interpreter::Interpreter;

#[derive(Clone, Debug)]
pub struct WaitSettings {
    pub max_wait_time: Option<Duration>,
    pub poll_frequency: Option<Duration>,
    pub pre_print_statement: Option<String>,
    pub post_print_statement: Option<String>,
    pub update: UpdateSettings,
}

impl Default for WaitSettings {
    fn default() -> Self {
        WaitSettings {
            max_wait_time: None,
            poll_frequency: None,
            pre_print_statement: None,
            post_print_statement: None,
            update: UpdateSettings::new(),
        }
    }
}

pub struct Waiter {
    tree: Arc<ExprTree>,
    settings: WaitSettings,
}

impl Waiter {
    pub fn new(tree: Arc<ExprTree>, settings: WaitSettings) -> Self {
        Waiter { tree, settings }
    }

    /// Compiles `source` against `context` and wraps the result, per the
    /// usual KaRL entry point (compile once, wait many times).
    pub fn compile(context: &Context, source: &str, settings: WaitSettings) -> Result<Self> {
        let tree = Interpreter::compile(context, source)?;
        Ok(Waiter::new(tree, settings))
    }

    /// Runs the 5-step algorithm: evaluate, return if truthy, return on
    /// deadline, otherwise sleep or block for a change, then repeat.
    pub fn wait(&self, context: &Context) -> Result<Record> {
        if let Some(pre) = &self.settings.pre_print_statement {
            Interpreter::evaluate(context, pre, &self.settings.update)?;
        }

        let start = Instant::now();
        let result = loop {
            let result = self.tree.evaluate(context, &self.settings.update)?;
            if !self.settings.update.delay_sending_modifieds {
                self.trigger_send(context)?;
            }
            if result.is_truthy() {
                break result;
            }
            let elapsed = start.elapsed();
            if let Some(max) = self.settings.max_wait_time {
                if elapsed >= max {
                    break result;
                }
            }
            let remaining = self.settings.max_wait_time.map(|m| m.saturating_sub(elapsed));
            match self.settings.poll_frequency {
                Some(freq) if freq > Duration::ZERO => {
                    std::thread::sleep(next_epoch_sleep(elapsed, freq).min(remaining.unwrap_or(Duration::MAX)));
                }
                _ => context.wait_for_change(remaining),
            }
        };

        if let Some(post) = &self.settings.post_print_statement {
            Interpreter::evaluate(context, post, &self.settings.update)?;
        }
        Ok(result)
    }

    fn trigger_send(&self, context: &Context) -> Result<()> {
        context.trigger_send().map_err(|e| KarlError::Other(e.to_string()))
    }
}

/// Time remaining until the next multiple of `freq` since `elapsed` began
/// (spec §4.3 step 4: "sleep until the next poll epoch").
fn next_epoch_sleep(elapsed: Duration, freq: Duration) -> Duration {
    let elapsed_s = elapsed.as_secs_f64();
    let freq_s = freq.as_secs_f64();
    let next = ((elapsed_s / freq_s).floor() + 1.0) * freq_s;
    Duration::from_secs_f64((next - elapsed_s).max(0.0))
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_context::Context;
    use madara_lang::RecordValue;

    #[test]
    fn s4_returns_immediately_when_already_truthy() {
        let context = Context::new("self", 1);
        let settings = UpdateSettings::new();
        context.set(".a", 1i64, &settings);
        let waiter = Waiter::compile(&context, ".a", WaitSettings::default()).unwrap();
        let result = waiter.wait(&context).unwrap();
        assert_eq!(result.value, RecordValue::Integer(1));
    }

    #[test]
    fn returns_current_value_once_deadline_exceeded() {
        let context = Context::new("self", 1);
        let wait_settings = WaitSettings {
            max_wait_time: Some(Duration::from_millis(20)),
            poll_frequency: Some(Duration::from_millis(5)),
            ..WaitSettings::default()
        };
        let waiter = Waiter::compile(&context, ".never", wait_settings).unwrap();
        let result = waiter.wait(&context).unwrap();
        assert_eq!(result.value, RecordValue::Integer(0));
    }

    #[test]
    fn reevaluation_observes_a_write_from_another_thread() {
        let context = Context::new("self", 1);
        let wait_settings = WaitSettings {
            max_wait_time: Some(Duration::from_secs(2)),
            poll_frequency: None,
            ..WaitSettings::default()
        };
        let waiter = Waiter::compile(&context, ".flag", wait_settings).unwrap();

        let writer_ctx = context.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer_ctx.set(".flag", 1i64, &UpdateSettings::new());
        });

        let result = waiter.wait(&context).unwrap();
        handle.join().unwrap();
        assert_eq!(result.value, RecordValue::Integer(1));
    }
}
