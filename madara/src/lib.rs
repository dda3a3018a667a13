// Top-level facade gluing Context, Transport and the KaRL engine into a
// single handle, mirroring the teacher's thin root crate.

use std::sync::Arc;
use std::thread::JoinHandle;

use madara_base::Result;

pub use madara_context::{Context, ModifiedSink, SetResult, UpdateSettings, VariableReference};
pub use madara_eval::{
    compile_and_evaluate, tokenize, BinaryOp, ExprTree, Interpreter, KarlError, SeqKind, UnaryOp, WaitSettings,
    Waiter,
};
pub use madara_lang::{FileType, Record, RecordTypeTag, RecordValue, Status, WriterId};
pub use madara_net::{
    BandwidthMonitor, Diagnostics, FilterKind, FilterPipeline, PacketScheduler, Reassembler, Transport,
    TransportContext, TransportKind, TransportSettings,
};

/// A Context plus, optionally, the Transport replicating it. Most callers
/// only need `context()`, `eval()` and `wait()`; direct `Context`/
/// `Transport` access stays available for anything this facade doesn't
/// wrap.
pub struct KnowledgeBase {
    context: Context,
    transport: Option<Transport>,
    read_threads: Vec<JoinHandle<()>>,
}

impl KnowledgeBase {
    pub fn new(writer: impl Into<WriterId>, write_quality: u32) -> Self {
        KnowledgeBase {
            context: Context::new(writer, write_quality),
            transport: None,
            read_threads: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    /// Binds a Transport over this Context, attaches it so KaRL's Waiter
    /// can trigger sends through it, and launches its read threads.
    pub fn attach_transport(&mut self, settings: TransportSettings, filters: FilterPipeline) -> Result<()> {
        let transport = Transport::new(self.context.clone(), settings, filters)?;
        self.context.attach_transport(Arc::new(transport.clone()));
        self.read_threads = transport.spawn_read_threads();
        self.transport = Some(transport);
        Ok(())
    }

    pub fn set(&self, key: &str, value: impl Into<RecordValue>, settings: &UpdateSettings) -> SetResult {
        self.context.set(key, value, settings)
    }

    pub fn get(&self, key: &str) -> Record {
        self.context.get(key)
    }

    /// Compiles (or reuses the memoized compile of) `source` and evaluates
    /// it once against this Context.
    pub fn eval(&self, source: &str, settings: &UpdateSettings) -> madara_eval::Result<Record> {
        Interpreter::evaluate(&self.context, source, settings)
    }

    /// Compiles `source` and runs the Waiter's evaluate/sleep/retry loop
    /// against this Context until it returns truthy or the deadline in
    /// `wait_settings` passes.
    pub fn wait(&self, source: &str, wait_settings: WaitSettings) -> madara_eval::Result<Record> {
        let waiter = Waiter::compile(&self.context, source, wait_settings)?;
        waiter.wait(&self.context)
    }

    /// Closes the Transport (if any) and detaches it from the Context.
    /// Read threads are daemon-style: `close()` signals them to stop but
    /// does not block waiting for them to land.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
            self.context.detach_transport();
        }
        self.read_threads.clear();
    }
}

impl Drop for KnowledgeBase {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_and_eval_round_trip_without_a_transport() {
        let kb = KnowledgeBase::new("self", 1);
        let settings = UpdateSettings::new();
        kb.set("x", 41i64, &settings);
        let result = kb.eval("x + 1", &settings).unwrap();
        assert_eq!(result.value, RecordValue::Integer(42));
    }

    #[test]
    fn wait_returns_immediately_on_an_already_truthy_expression() {
        let kb = KnowledgeBase::new("self", 1);
        let settings = UpdateSettings::new();
        kb.set(".ready", 1i64, &settings);
        let result = kb.wait(".ready", WaitSettings::default()).unwrap();
        assert_eq!(result.value, RecordValue::Integer(1));
    }

    #[test]
    fn attach_transport_lets_trigger_send_reach_the_wire() {
        let mut kb = KnowledgeBase::new("self", 1);
        let mut settings = TransportSettings::default();
        settings.hosts = vec!["127.0.0.1:0".parse().unwrap()];
        settings.domain = "kb-test".to_string();
        kb.attach_transport(settings, FilterPipeline::new()).unwrap();
        kb.set("x", 1i64, &UpdateSettings::new());
        assert!(kb.context().trigger_send().is_ok());
        kb.close();
    }
}
