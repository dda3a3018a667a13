use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use madara_base::{err, Result};
use madara_lang::{is_local_key, validate_key_braces, Record, RecordValue, Status, WriterId};

use crate::conflict::{resolve_write, Outcome};
use crate::registry::RegisteredFunction;
use crate::settings::{SetResult, UpdateSettings};

/// A stable slot behind every keyed entry. Kept behind its own `Mutex` and
/// wrapped in `Option` so `erase` can atomically null it, invalidating any
/// outstanding `VariableReference` without needing raw pointers (spec §9's
/// suggested arena-and-index strategy, realized here as an indirection
/// cell rather than an index).
type Slot = Arc<Mutex<Option<Record>>>;

/// Lets `Waiter` (in `madara-eval`) trigger a transport send without this
/// crate depending on `madara-net`.
pub trait ModifiedSink: Send + Sync {
    fn send_modifieds(&self) -> Result<()>;
}

struct State {
    map: HashMap<String, Slot>,
    global_clock: u64,
    global_modified: BTreeSet<String>,
    local_modified: BTreeSet<String>,
    functions: HashMap<String, RegisteredFunction>,
    karl_cache: HashMap<String, Arc<dyn Any + Send + Sync>>,
    history_capacity: usize,
    modified_sink: Option<Arc<dyn ModifiedSink>>,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    writer: WriterId,
    write_quality: u32,
}

/// The Knowledge Context: a thread-safe keyed store of `Record`s plus its
/// modification-tracking and change signalling (spec §4.1).
#[derive(Clone)]
pub struct Context(Arc<Shared>);

/// A handle into one map entry obtained via `get_ref`. Mutating through a
/// `VariableReference` skips the key lookup and brace-expansion path
/// (spec §4.1).
#[derive(Clone)]
pub struct VariableReference {
    slot: Slot,
    key: String,
}

impl Context {
    pub fn new(writer: impl Into<WriterId>, write_quality: u32) -> Self {
        Context(Arc::new(Shared {
            state: Mutex::new(State {
                map: HashMap::new(),
                global_clock: 0,
                global_modified: BTreeSet::new(),
                local_modified: BTreeSet::new(),
                functions: HashMap::new(),
                karl_cache: HashMap::new(),
                history_capacity: 1,
                modified_sink: None,
            }),
            changed: Condvar::new(),
            writer: writer.into(),
            write_quality,
        }))
    }

    pub fn writer(&self) -> &WriterId {
        &self.0.writer
    }

    pub fn write_quality(&self) -> u32 {
        self.0.write_quality
    }

    pub fn set_history_capacity(&self, capacity: usize) {
        self.0.state.lock().history_capacity = capacity.max(1);
    }

    pub fn attach_transport(&self, sink: Arc<dyn ModifiedSink>) {
        self.0.state.lock().modified_sink = Some(sink);
    }

    pub fn detach_transport(&self) {
        self.0.state.lock().modified_sink = None;
    }

    /// Invoked by `Waiter` after each re-evaluation unless
    /// `delay_sending_modifieds` is set.
    pub fn trigger_send(&self) -> Result<()> {
        let sink = self.0.state.lock().modified_sink.clone();
        if let Some(sink) = sink {
            sink.send_modifieds()?;
        }
        Ok(())
    }

    /// Context's own Lamport clock, advanced when a message clock must be
    /// assigned (spec §4.5 send pipeline step 5).
    pub fn inc_clock(&self) -> u64 {
        let mut state = self.0.state.lock();
        state.global_clock += 1;
        state.global_clock
    }

    pub fn clock(&self) -> u64 {
        self.0.state.lock().global_clock
    }

    /// Forcibly sets the Context's Lamport clock, bypassing the usual
    /// increment-by-one path. Used by KaRL's `#set_clock` system call.
    pub fn set_clock(&self, value: u64) {
        self.0.state.lock().global_clock = value;
    }

    fn slot_for(state: &mut State, key: &str) -> Slot {
        state
            .map
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Resolves brace-delimited expansion segments against this Context
    /// (spec §3 "Key conventions"). Innermost braces resolve first.
    pub fn expand_key(&self, key: &str) -> String {
        let mut result = key.to_string();
        loop {
            let Some(start) = result.find('{') else {
                break;
            };
            let mut depth = 0i32;
            let mut end = None;
            for (i, c) in result[start..].char_indices() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(start + i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let Some(end) = end else { break };
            let inner_key = result[start + 1..end].to_string();
            let inner_key = if inner_key.contains('{') {
                self.expand_key(&inner_key)
            } else {
                inner_key
            };
            let resolved = self.get(&inner_key);
            let replacement = resolved.value.to_display_string(",");
            result.replace_range(start..=end, &replacement);
        }
        result
    }

    fn resolve_key(&self, key: &str, settings: &UpdateSettings) -> String {
        if settings.expand_variables && key.contains('{') {
            self.expand_key(key)
        } else {
            key.to_string()
        }
    }

    /// `exists` per spec I3: a record with status UNCREATED is invisible.
    pub fn exists(&self, key: &str) -> bool {
        let state = self.0.state.lock();
        state
            .map
            .get(key)
            .map(|slot| slot.lock().as_ref().map(|r| r.exists()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Typed getter. Missing or UNCREATED keys yield a zero integer Record
    /// (spec I3, §6).
    pub fn get(&self, key: &str) -> Record {
        let state = self.0.state.lock();
        match state.map.get(key) {
            Some(slot) => match &*slot.lock() {
                Some(r) if r.exists() => r.clone(),
                _ => Record::zero(),
            },
            None => Record::zero(),
        }
    }

    pub fn get_ref(&self, key: &str) -> VariableReference {
        let mut state = self.0.state.lock();
        let slot = Self::slot_for(&mut state, key);
        VariableReference {
            slot,
            key: key.to_string(),
        }
    }

    /// Core write path shared by local setters and `Transport`'s receive
    /// pipeline (spec §4.1 "Conflict resolution"). `incoming_clock = None`
    /// means "compute a fresh local clock"; `Some` is used for
    /// remote-origin writes whose clock came off the wire.
    #[allow(clippy::too_many_arguments)]
    fn apply_write(
        &self,
        key: &str,
        value: RecordValue,
        incoming_clock: Option<u64>,
        quality: u32,
        writer: WriterId,
        toi: u64,
        settings: &UpdateSettings,
    ) -> SetResult {
        if key.is_empty() {
            return SetResult::InvalidKey;
        }
        if validate_key_braces(key).is_err() {
            return SetResult::InvalidKey;
        }
        let resolved_key = self.resolve_key(key, settings);
        if resolved_key.is_empty() {
            return SetResult::InvalidKey;
        }

        let mut state = self.0.state.lock();
        let slot = Self::slot_for(&mut state, &resolved_key);
        let mut guard = slot.lock();

        let (current_clock, current_quality, current_writer) = match &*guard {
            Some(r) => (r.clock, r.quality, r.writer.clone()),
            None => (0, 0, WriterId::default()),
        };
        let clock = incoming_clock.unwrap_or(current_clock + settings.clock_increment);

        let outcome = resolve_write(
            current_clock,
            current_quality,
            &current_writer,
            clock,
            quality,
            &writer,
            settings.always_overwrite,
        );

        let (new_clock, new_quality) = match outcome {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => {
                trace!(target: "madara::context", key = %resolved_key, "write rejected by conflict rule");
                return SetResult::QualityRejected;
            }
        };

        let mut record = guard.take().unwrap_or_else(|| {
            Record::new(RecordValue::zero_integer()).with_history_capacity(state.history_capacity)
        });
        record.value = value;
        record.clock = new_clock;
        record.quality = new_quality;
        record.write_quality = self.0.write_quality;
        record.writer = writer;
        record.toi = toi;
        record.status = Status::Modified;
        record.push_history();
        *guard = Some(record);
        drop(guard);

        let is_local_only = settings.treat_globals_as_locals || is_local_key(&resolved_key);
        if !is_local_only {
            state.global_modified.insert(resolved_key.clone());
        }
        if settings.track_local_changes || is_local_only {
            state.local_modified.insert(resolved_key.clone());
        }
        drop(state);

        if settings.signal_changes {
            self.0.changed.notify_all();
        }
        debug!(target: "madara::context", key = %resolved_key, clock = new_clock, quality = new_quality, "write accepted");
        SetResult::Accepted
    }

    /// Entry point used by `Transport`'s receive pipeline (spec §4.5 step
    /// 5): applies a write whose clock/quality/writer came off the wire,
    /// rather than being computed locally.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_remote_write(
        &self,
        key: &str,
        value: RecordValue,
        clock: u64,
        quality: u32,
        writer: WriterId,
        toi: u64,
        settings: &UpdateSettings,
    ) -> SetResult {
        self.apply_write(key, value, Some(clock), quality, writer, toi, settings)
    }

    pub fn set(&self, key: &str, value: impl Into<RecordValue>, settings: &UpdateSettings) -> SetResult {
        self.apply_write(
            key,
            value.into(),
            None,
            self.0.write_quality,
            self.0.writer.clone(),
            now_micros(),
            settings,
        )
    }

    pub fn set_text(&self, key: &str, value: impl Into<String>, settings: &UpdateSettings) -> SetResult {
        self.set(key, RecordValue::from(value.into()), settings)
    }

    pub fn set_xml(&self, key: &str, xml: Vec<u8>, settings: &UpdateSettings) -> SetResult {
        self.set(key, RecordValue::File(madara_lang::FileType::Xml, Arc::new(xml)), settings)
    }

    pub fn set_jpeg(&self, key: &str, jpeg: Vec<u8>, settings: &UpdateSettings) -> SetResult {
        self.set(key, RecordValue::File(madara_lang::FileType::Jpeg, Arc::new(jpeg)), settings)
    }

    pub fn set_file(&self, key: &str, bytes: Vec<u8>, settings: &UpdateSettings) -> SetResult {
        self.set(key, RecordValue::Blob(Arc::new(bytes)), settings)
    }

    /// Sets a single element of an integer or double array, growing the
    /// array with zeros if `index` is past the current length. Rejects
    /// (-3) if the existing record is a non-array, non-numeric type.
    pub fn set_index(&self, key: &str, index: usize, value: f64, settings: &UpdateSettings) -> SetResult {
        let resolved_key = self.resolve_key(key, settings);
        if resolved_key.is_empty() {
            return SetResult::InvalidKey;
        }
        let current = self.get(&resolved_key);
        let new_value = if !current.exists() {
            let mut v = vec![0.0f64; index + 1];
            v[index] = value;
            RecordValue::from(v)
        } else {
            match &current.value {
                RecordValue::DoubleArray(a) => {
                    let mut v = (**a).clone();
                    if index >= v.len() {
                        v.resize(index + 1, ordered_float_zero());
                    }
                    v[index] = ordered_float(value);
                    RecordValue::DoubleArray(Arc::new(v))
                }
                RecordValue::IntegerArray(a) => {
                    let mut v = (**a).clone();
                    if index >= v.len() {
                        v.resize(index + 1, 0);
                    }
                    v[index] = value as i64;
                    RecordValue::IntegerArray(Arc::new(v))
                }
                _ => return SetResult::TypeRejected,
            }
        };
        self.set(&resolved_key, new_value, settings)
    }

    pub fn retrieve_index(&self, key: &str, index: usize) -> Record {
        let r = self.get(key);
        let value = match &r.value {
            RecordValue::IntegerArray(a) => RecordValue::Integer(a.get(index).copied().unwrap_or(0)),
            RecordValue::DoubleArray(a) => {
                RecordValue::Double(a.get(index).copied().unwrap_or(ordered_float_zero()))
            }
            _ => RecordValue::zero_integer(),
        };
        Record::new(value)
    }

    pub fn inc(&self, key: &str, amount: f64, settings: &UpdateSettings) -> SetResult {
        let current = self.get(key);
        if current.exists() && !matches!(current.value, RecordValue::Integer(_) | RecordValue::Double(_)) {
            return SetResult::TypeRejected;
        }
        let next = if current.value.is_double() || amount.fract() != 0.0 {
            RecordValue::from(current.value.as_double() + amount)
        } else {
            RecordValue::from(current.value.as_integer() + amount as i64)
        };
        self.set(key, next, settings)
    }

    pub fn dec(&self, key: &str, amount: f64, settings: &UpdateSettings) -> SetResult {
        self.inc(key, -amount, settings)
    }

    /// `erase` (spec "Lifecycles"): dangerous, invalidates any
    /// outstanding `VariableReference` for this key.
    pub fn erase(&self, key: &str) {
        let mut state = self.0.state.lock();
        if let Some(slot) = state.map.remove(key) {
            *slot.lock() = None;
        }
        state.global_modified.remove(key);
        state.local_modified.remove(key);
        warn!(target: "madara::context", key, "erased record; outstanding references invalidated");
    }

    /// Tears down every record. Used at Context teardown and for test
    /// resets; does not touch registered functions or the interpreter
    /// cache.
    pub fn clear(&self) {
        let mut state = self.0.state.lock();
        for slot in state.map.values() {
            *slot.lock() = None;
        }
        state.map.clear();
        state.global_modified.clear();
        state.local_modified.clear();
    }

    pub fn get_modifieds(&self) -> Vec<(String, Record)> {
        let state = self.0.state.lock();
        state
            .global_modified
            .iter()
            .filter_map(|k| {
                state
                    .map
                    .get(k)
                    .and_then(|slot| slot.lock().clone())
                    .map(|r| (k.clone(), r))
            })
            .collect()
    }

    pub fn reset_modified_all(&self) {
        self.0.state.lock().global_modified.clear();
    }

    pub fn reset_modified(&self, key: &str) {
        self.0.state.lock().global_modified.remove(key);
    }

    pub fn local_modifieds(&self) -> Vec<String> {
        self.0.state.lock().local_modified.iter().cloned().collect()
    }

    pub fn reset_local_modified(&self) {
        self.0.state.lock().local_modified.clear();
    }

    /// All existing (non-UNCREATED) keys, sorted for deterministic
    /// iteration (spec "Context... iteration for debug must be
    /// deterministic given a sort").
    pub fn to_vector(&self) -> Vec<(String, Record)> {
        let state = self.0.state.lock();
        let mut out: Vec<(String, Record)> = state
            .map
            .iter()
            .filter_map(|(k, slot)| {
                slot.lock()
                    .as_ref()
                    .filter(|r| r.exists())
                    .map(|r| (k.clone(), r.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn to_map(&self) -> HashMap<String, Record> {
        self.to_vector().into_iter().collect()
    }

    /// Keys matching a simple glob-free prefix/suffix pattern, e.g.
    /// `"agent1.*"` or `"*.state"`. A `*` may appear at most once.
    pub fn get_matches(&self, pattern: &str) -> Vec<(String, Record)> {
        let (prefix, suffix) = match pattern.split_once('*') {
            Some((p, s)) => (p, s),
            None => (pattern, ""),
        };
        self.to_vector()
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix) && k.ends_with(suffix) && k.len() >= prefix.len() + suffix.len())
            .collect()
    }

    /// Blocks until the predicate over `self` is true or `timeout` elapses.
    /// Spurious wakeups are permitted; the Condvar is re-checked in a loop
    /// (spec §4.1 "Signalling").
    pub fn wait_for_change(&self, timeout: Option<Duration>) {
        let mut state = self.0.state.lock();
        match timeout {
            Some(d) => {
                self.0.changed.wait_for(&mut state, d);
            }
            None => {
                self.0.changed.wait(&mut state);
            }
        }
    }

    pub fn register_native(
        &self,
        name: impl Into<String>,
        f: impl Fn(&Context, &[Record]) -> Result<Record> + Send + Sync + 'static,
    ) {
        self.0
            .state
            .lock()
            .functions
            .insert(name.into(), RegisteredFunction::Native(Arc::new(f)));
    }

    pub fn register_karl(&self, name: impl Into<String>, compiled: Arc<dyn Any + Send + Sync>) {
        self.0
            .state
            .lock()
            .functions
            .insert(name.into(), RegisteredFunction::Karl(compiled));
    }

    pub fn lookup_function(&self, name: &str) -> Option<RegisteredFunction> {
        self.0.state.lock().functions.get(name).cloned()
    }

    pub fn cache_get(&self, source: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.0.state.lock().karl_cache.get(source).cloned()
    }

    pub fn cache_put(&self, source: impl Into<String>, compiled: Arc<dyn Any + Send + Sync>) {
        self.0.state.lock().karl_cache.insert(source.into(), compiled);
    }

    pub fn cache_flush(&self) {
        self.0.state.lock().karl_cache.clear();
    }

    pub fn cache_evict(&self, source: &str) {
        self.0.state.lock().karl_cache.remove(source);
    }

    /// Serializes every existing record as `key=value;` lines, per spec §6
    /// "Checkpoint/KaRL file". Lossy for opaque binary records (size-only).
    pub fn to_karl_text(&self) -> String {
        let mut out = String::new();
        for (key, record) in self.to_vector() {
            out.push_str(&key);
            out.push('=');
            match &record.value {
                RecordValue::Text(s) => {
                    out.push('\'');
                    out.push_str(s);
                    out.push('\'');
                }
                RecordValue::IntegerArray(a) => {
                    out.push('[');
                    out.push_str(
                        &a.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","),
                    );
                    out.push(']');
                }
                RecordValue::DoubleArray(a) => {
                    out.push('[');
                    out.push_str(
                        &a.iter().map(|d| d.0.to_string()).collect::<Vec<_>>().join(","),
                    );
                    out.push(']');
                }
                RecordValue::Blob(b) | RecordValue::File(_, b) | RecordValue::Any(_, b) => {
                    out.push_str(&format!("<{} bytes>", b.len()));
                }
                other => out.push_str(&other.to_display_string(",")),
            }
            out.push_str(";\n");
        }
        out
    }

    /// Parses the format produced by `to_karl_text` back into this
    /// Context's records, using `always_overwrite` settings (checkpoints
    /// are trusted input, not conflict-resolved writes).
    pub fn from_karl_text(&self, text: &str) -> Result<()> {
        let settings = UpdateSettings::always_overwriting();
        for line in text.lines() {
            let line = line.trim().trim_end_matches(';');
            if line.is_empty() {
                continue;
            }
            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| err(format!("malformed checkpoint line: {line}")))?;
            let value = parse_karl_literal(raw)?;
            self.set(key, value, &settings);
        }
        Ok(())
    }
}

fn parse_karl_literal(raw: &str) -> Result<RecordValue> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(RecordValue::from(inner.to_string()));
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if inner.is_empty() {
            return Ok(RecordValue::from(Vec::<i64>::new()));
        }
        let parts: Vec<&str> = inner.split(',').collect();
        if parts.iter().any(|p| p.contains('.')) {
            let vals: Result<Vec<f64>> = parts
                .iter()
                .map(|p| p.trim().parse::<f64>().map_err(|e| err(e.to_string())))
                .collect();
            return Ok(RecordValue::from(vals?));
        }
        let vals: Result<Vec<i64>> = parts
            .iter()
            .map(|p| p.trim().parse::<i64>().map_err(|e| err(e.to_string())))
            .collect();
        return Ok(RecordValue::from(vals?));
    }
    if raw.contains('.') {
        if let Ok(d) = raw.parse::<f64>() {
            return Ok(RecordValue::from(d));
        }
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(RecordValue::from(i));
    }
    Ok(RecordValue::from(raw.to_string()))
}

impl VariableReference {
    pub fn get(&self) -> Record {
        match &*self.slot.lock() {
            Some(r) if r.exists() => r.clone(),
            _ => Record::zero(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Handle-based set: skips key lookup and brace-expansion (spec
    /// §4.1). Still runs the conflict rule; callers wanting an
    /// unconditional local write pass `always_overwrite = true`.
    pub fn set(
        &self,
        value: RecordValue,
        writer: &WriterId,
        write_quality: u32,
        clock_increment: u64,
        always_overwrite: bool,
        signal: Option<&Condvar>,
    ) -> SetResult {
        let mut guard = self.slot.lock();
        let (current_clock, current_quality, current_writer) = match &*guard {
            Some(r) => (r.clock, r.quality, r.writer.clone()),
            None => (0, 0, WriterId::default()),
        };
        let incoming_clock = current_clock + clock_increment;
        let outcome = resolve_write(
            current_clock,
            current_quality,
            &current_writer,
            incoming_clock,
            write_quality,
            writer,
            always_overwrite,
        );
        let (new_clock, new_quality) = match outcome {
            Outcome::Accept { clock, quality } => (clock, quality),
            Outcome::Reject => return SetResult::QualityRejected,
        };
        let mut record = guard.take().unwrap_or_else(|| Record::new(RecordValue::zero_integer()));
        record.value = value;
        record.clock = new_clock;
        record.quality = new_quality;
        record.write_quality = write_quality;
        record.writer = writer.clone();
        record.status = Status::Modified;
        record.push_history();
        *guard = Some(record);
        drop(guard);
        if let Some(cv) = signal {
            cv.notify_all();
        }
        SetResult::Accepted
    }
}

fn ordered_float(v: f64) -> ordered_float::OrderedFloat<f64> {
    ordered_float::OrderedFloat(v)
}

fn ordered_float_zero() -> ordered_float::OrderedFloat<f64> {
    ordered_float::OrderedFloat(0.0)
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
