//! Per-connection message dispatch.
//!
//! One dispatcher runs per profiler connection, on its own thread. It
//! reads newline-delimited JSON messages until the `<STOP>` sentinel,
//! validates the `{type, data}` envelope, and routes by type: samples to
//! the aggregator, syscall traffic to the shared lineage accumulator,
//! source offsets into its local accumulator, diagnostics to the log.
//! Malformed records are logged and skipped, never fatal.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::aggregator::{CallFrame, SampleAggregator, OFFCPU_EVENT, ONCPU_EVENT};
use crate::connection::{Connection, STOP_SENTINEL};
use crate::lineage::{LineageAccum, SyscallMeta};
use crate::store::{Group, Store};

/// The profile-start timestamp, armed once after the warmup. Samples are
/// dropped until it is set.
#[derive(Default)]
pub struct ProfileClock {
    start_ns: AtomicU64,
    armed: AtomicBool,
}

impl ProfileClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, start_ns: u64) {
        self.start_ns.store(start_ns, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    pub fn get(&self) -> Option<u64> {
        if self.armed.load(Ordering::Acquire) {
            Some(self.start_ns.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

/// CLOCK_MONOTONIC in nanoseconds (0 if the clock cannot be read).
pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// A `sample` message payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    pub event_type: String,
    pub pid: String,
    pub tid: String,
    pub time: u64,
    pub period: u64,
    pub callchain: Vec<CallFrame>,
}

/// A `syscall` message payload: the callchain that spawned `ret_value`.
#[derive(Debug, Clone, Deserialize)]
struct SpawnCallchain {
    ret_value: String,
    callchain: Vec<CallFrame>,
}

/// What a dispatcher hands back to the controller when its stream ends.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// DSO path -> set of offset strings, for the source resolver.
    pub dso_offsets: HashMap<String, BTreeSet<String>>,
    /// Whether any expected-but-missing symbol map was reported.
    pub symbol_maps_missing: bool,
}

/// First-event discipline: the first accepted sample fixes what the
/// connection is allowed to carry afterwards.
enum ExpectedEvent {
    /// `task-clock` or `offcpu-time`, interchangeably.
    Walltime,
    /// Exactly this custom event name.
    Named(String),
}

pub struct Dispatcher {
    conn: Connection,
    dest: Group,
    store: Store,
    clock: Arc<ProfileClock>,
    lineage: Arc<Mutex<LineageAccum>>,
    profiler_name: String,
    aggregator: SampleAggregator,
    expected_event: Option<ExpectedEvent>,
    outcome: DispatchOutcome,
}

impl Dispatcher {
    pub fn new(
        conn: Connection,
        dest: Group,
        store: Store,
        clock: Arc<ProfileClock>,
        lineage: Arc<Mutex<LineageAccum>>,
        profiler_name: impl Into<String>,
    ) -> Self {
        Dispatcher {
            conn,
            dest,
            store,
            clock,
            lineage,
            profiler_name: profiler_name.into(),
            aggregator: SampleAggregator::new(),
            expected_event: None,
            outcome: DispatchOutcome::default(),
        }
    }

    /// Consume the connection until `<STOP>` (or stream end) and return
    /// the accumulated per-connection results.
    pub fn run(mut self) -> DispatchOutcome {
        loop {
            match self.conn.read_message() {
                Ok(Some(line)) => {
                    if line == STOP_SENTINEL {
                        break;
                    }
                    if line.is_empty() {
                        continue;
                    }
                    self.handle_line(&line);
                }
                Ok(None) => {
                    warn!(
                        "Connection from profiler \"{}\" closed without <STOP>.",
                        self.profiler_name
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "Reading from profiler \"{}\" failed: {}",
                        self.profiler_name, e
                    );
                    break;
                }
            }
        }

        self.outcome
    }

    fn handle_line(&mut self, line: &str) {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    "Message received from profiler \"{}\" is not valid JSON, ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        let obj = match parsed.as_object() {
            Some(o) => o,
            None => {
                warn!(
                    "Message received from profiler \"{}\" is not a JSON object, ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        if obj.len() != 2 || !obj.contains_key("type") || !obj.contains_key("data") {
            warn!(
                "Message received from profiler \"{}\" is not a JSON object with exactly \
                 2 elements (\"type\" and \"data\"), ignoring.",
                self.profiler_name
            );
            return;
        }

        let msg_type = match obj["type"].as_str() {
            Some(t) => t,
            None => {
                warn!(
                    "Message received from profiler \"{}\" has a non-string \"type\", \
                     ignoring.",
                    self.profiler_name
                );
                return;
            }
        };
        let data = &obj["data"];

        match msg_type {
            "missing_symbol_maps" => self.on_missing_symbol_maps(data),
            "callchains" => self.on_callchains(data),
            "sources" => self.on_sources(data),
            "sample" => self.on_sample(data),
            "syscall" => self.on_syscall(data),
            "syscall_meta" => self.on_syscall_meta(data),
            other => {
                debug!(
                    "Ignoring message of unknown type {:?} from profiler \"{}\".",
                    other, self.profiler_name
                );
            }
        }
    }

    fn on_missing_symbol_maps(&mut self, data: &Value) {
        let items = match data.as_array() {
            Some(a) => a,
            None => {
                warn!(
                    "\"missing_symbol_maps\" message from profiler \"{}\" does not carry a \
                     JSON array, ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        for (index, item) in items.iter().enumerate() {
            let path = match item.as_str() {
                Some(p) => p,
                None => {
                    warn!(
                        "Element {} in the \"missing_symbol_maps\" array from profiler \
                         \"{}\" is not a string, ignoring this element.",
                        index, self.profiler_name
                    );
                    continue;
                }
            };
            let absolute = std::fs::canonicalize(path)
                .unwrap_or_else(|_| std::path::PathBuf::from(path));
            warn!(
                "A symbol map is expected in {}, but it hasn't been found!",
                absolute.display()
            );
            self.outcome.symbol_maps_missing = true;
        }
    }

    fn on_callchains(&mut self, data: &Value) {
        if !data.is_object() {
            warn!(
                "\"callchains\" message from profiler \"{}\" does not carry a JSON \
                 object, ignoring.",
                self.profiler_name
            );
            return;
        }

        let result = self.store.append_file("callchains.json").and_then(|mut f| {
            use std::io::Write;
            writeln!(f, "{}", data).map_err(Into::into)
        });
        if let Err(e) = result {
            warn!("Could not append the callchain dictionary: {}", e);
        }
    }

    fn on_sources(&mut self, data: &Value) {
        let entries = match data.as_object() {
            Some(o) => o,
            None => {
                warn!(
                    "\"sources\" message from profiler \"{}\" does not carry a JSON \
                     object, ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        for (dso, offsets) in entries {
            let offsets = match offsets.as_array() {
                Some(a) => a,
                None => {
                    warn!(
                        "Element \"{}\" in the \"sources\" object from profiler \"{}\" \
                         is not a JSON array, ignoring this element.",
                        dso, self.profiler_name
                    );
                    continue;
                }
            };

            if !Path::new(dso).exists() {
                continue;
            }

            let set = self.outcome.dso_offsets.entry(dso.clone()).or_default();
            for offset in offsets {
                if let Some(offset) = offset.as_str() {
                    set.insert(offset.to_string());
                }
            }
        }
    }

    fn on_sample(&mut self, data: &Value) {
        // Samples are only meaningful once the profile start is armed;
        // anything earlier is warmup noise and is dropped silently.
        let profile_start = match self.clock.get() {
            Some(start) => start,
            None => return,
        };

        let mut sample: Sample = match serde_json::from_value(data.clone()) {
            Ok(s) => s,
            Err(_) => {
                warn!(
                    "The recently received sample JSON from profiler \"{}\" is invalid, \
                     ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        match &self.expected_event {
            None => {
                let expected = if sample.event_type == ONCPU_EVENT
                    || sample.event_type == OFFCPU_EVENT
                {
                    ExpectedEvent::Walltime
                } else {
                    ExpectedEvent::Named(sample.event_type.clone())
                };
                self.expected_event = Some(expected);

                // Boundary clamp: the first sample must not attribute time
                // from before the profile start.
                if sample.time.saturating_sub(sample.period) < profile_start {
                    sample.period = sample.time.saturating_sub(profile_start);
                }
            }
            Some(ExpectedEvent::Walltime) => {
                if sample.event_type != ONCPU_EVENT && sample.event_type != OFFCPU_EVENT {
                    warn!(
                        "Sample of unexpected event type from profiler \"{}\" (received: \
                         {}, expected: task-clock or offcpu-time), ignoring.",
                        self.profiler_name, sample.event_type
                    );
                    return;
                }
            }
            Some(ExpectedEvent::Named(name)) => {
                if sample.event_type != *name {
                    warn!(
                        "Sample of unexpected event type from profiler \"{}\" (received: \
                         {}, expected: {}), ignoring.",
                        self.profiler_name, sample.event_type, name
                    );
                    return;
                }
            }
        }

        let offcpu = sample.event_type == OFFCPU_EVENT;
        self.aggregator.record(
            &self.dest,
            &sample.pid,
            &sample.tid,
            offcpu,
            sample.time,
            sample.period,
            &sample.callchain,
            profile_start,
        );
    }

    fn on_syscall(&mut self, data: &Value) {
        let spawn: SpawnCallchain = match serde_json::from_value(data.clone()) {
            Ok(s) => s,
            Err(_) => {
                warn!(
                    "The recently-received syscall JSON from profiler \"{}\" is invalid, \
                     ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        self.lineage
            .lock()
            .unwrap()
            .record_spawn_callchain(spawn.ret_value, spawn.callchain);
    }

    fn on_syscall_meta(&mut self, data: &Value) {
        let meta: SyscallMeta = match serde_json::from_value(data.clone()) {
            Ok(m) => m,
            Err(_) => {
                warn!(
                    "The recently-received syscall tree JSON from profiler \"{}\" is \
                     invalid, ignoring.",
                    self.profiler_name
                );
                return;
            }
        };

        self.lineage.lock().unwrap().record_meta(&meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entry;
    use serde_json::json;
    use std::os::unix::net::UnixStream;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Store,
        clock: Arc<ProfileClock>,
        lineage: Arc<Mutex<LineageAccum>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let clock = Arc::new(ProfileClock::new());
        let lineage = Arc::new(Mutex::new(LineageAccum::new()));
        let (local, _peer) = UnixStream::pair().unwrap();
        let conn = Connection::from_stream(local, 1024).unwrap();
        let dispatcher = Dispatcher::new(
            conn,
            store.root().child("walltime"),
            store.clone(),
            clock.clone(),
            lineage.clone(),
            "test profiler",
        );
        Fixture {
            dispatcher,
            store,
            clock,
            lineage,
            _dir: dir,
        }
    }

    fn sample_line(event_type: &str, time: u64, period: u64, chain: &[(&str, &str)]) -> String {
        json!({
            "type": "sample",
            "data": {
                "event_type": event_type,
                "pid": "100",
                "tid": "100",
                "time": time,
                "period": period,
                "callchain": chain.iter().map(|(n, o)| json!([n, o])).collect::<Vec<_>>(),
            }
        })
        .to_string()
    }

    #[test]
    fn test_samples_dropped_until_clock_armed() {
        let mut fx = fixture();
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 1000, 10, &[("A", "0x1")]));

        let all = fx
            .store
            .root()
            .child("walltime")
            .child("100")
            .child("100")
            .child("untimed")
            .child("all");
        assert_eq!(all.get_u64("hot_value", 0), 0);

        fx.clock.arm(500);
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 1000, 10, &[("A", "0x1")]));
        assert_eq!(all.get_u64("hot_value", 0), 10);
    }

    #[test]
    fn test_first_sample_boundary_clamp() {
        let fx = &mut fixture();
        fx.clock.arm(1000);
        // time - period = 985 < 1000: recorded period becomes time - start = 5.
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 1005, 20, &[]));

        let thread_dir = fx
            .store
            .root()
            .child("walltime")
            .child("100")
            .child("100");
        assert_eq!(thread_dir.get_u64("sampled_period", 0), 5);
        assert_eq!(
            thread_dir.child("untimed").child("all").get_u64("hot_value", 0),
            5
        );

        // The clamp only applies to the first accepted sample.
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 1010, 20, &[]));
        assert_eq!(thread_dir.get_u64("sampled_period", 0), 25);
    }

    #[test]
    fn test_first_event_discipline_walltime() {
        let fx = &mut fixture();
        fx.clock.arm(0);
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 1000, 10, &[("A", "0x1")]));
        // offcpu-time is interchangeable with task-clock.
        fx.dispatcher
            .handle_line(&sample_line("offcpu-time", 2000, 7, &[("A", "0x1")]));
        // Anything else is rejected.
        fx.dispatcher
            .handle_line(&sample_line("cache-misses", 3000, 99, &[("A", "0x1")]));

        let thread_dir = fx
            .store
            .root()
            .child("walltime")
            .child("100")
            .child("100");
        assert_eq!(thread_dir.get_u64("sampled_period", 0), 17);
    }

    #[test]
    fn test_first_event_discipline_custom() {
        let fx = &mut fixture();
        fx.clock.arm(0);
        fx.dispatcher
            .handle_line(&sample_line("cache-misses", 1000, 1000, &[("A", "0x1")]));
        fx.dispatcher
            .handle_line(&sample_line("task-clock", 2000, 5, &[("A", "0x1")]));

        let thread_dir = fx
            .store
            .root()
            .child("walltime")
            .child("100")
            .child("100");
        assert_eq!(thread_dir.get_u64("sampled_period", 0), 1000);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let fx = &mut fixture();
        fx.clock.arm(0);
        fx.dispatcher.handle_line("not json at all");
        fx.dispatcher.handle_line("[1, 2, 3]");
        fx.dispatcher.handle_line("{\"type\": \"sample\"}");
        fx.dispatcher
            .handle_line("{\"type\": \"sample\", \"data\": {}, \"extra\": 1}");
        fx.dispatcher
            .handle_line("{\"type\": \"sample\", \"data\": {\"pid\": \"1\"}}");

        // Nothing landed in the store and nothing panicked.
        assert!(fx.store.snapshot()["walltime"].get("100").is_none());
    }

    #[test]
    fn test_sources_accumulation_unions_offsets() {
        let fx = &mut fixture();
        // Use a DSO path guaranteed to exist.
        let dso = "/proc/self/exe";
        fx.dispatcher
            .handle_line(&json!({"type": "sources", "data": {dso: ["0x1", "0x2"]}}).to_string());
        fx.dispatcher
            .handle_line(&json!({"type": "sources", "data": {dso: ["0x2", "0x3"]}}).to_string());
        fx.dispatcher.handle_line(
            &json!({"type": "sources", "data": {"/definitely/not/here": ["0x1"]}}).to_string(),
        );

        assert_eq!(fx.dispatcher.outcome.dso_offsets.len(), 1);
        let offsets = &fx.dispatcher.outcome.dso_offsets[dso];
        assert_eq!(
            offsets.iter().cloned().collect::<Vec<_>>(),
            vec!["0x1", "0x2", "0x3"]
        );
    }

    #[test]
    fn test_missing_symbol_maps_sets_flag() {
        let fx = &mut fixture();
        fx.dispatcher.handle_line(
            &json!({"type": "missing_symbol_maps", "data": ["/tmp/perf-1.map", 42]}).to_string(),
        );
        assert!(fx.dispatcher.outcome.symbol_maps_missing);
    }

    #[test]
    fn test_callchains_appended_to_file() {
        let fx = &mut fixture();
        fx.dispatcher
            .handle_line(&json!({"type": "callchains", "data": {"a": ["main", "/bin/app"]}}).to_string());

        let contents =
            std::fs::read_to_string(fx.store.root_dir().join("callchains.json")).unwrap();
        let parsed: Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(parsed["a"][0], "main");
    }

    #[test]
    fn test_syscall_routes_to_lineage() {
        let fx = &mut fixture();
        fx.dispatcher.handle_line(
            &json!({
                "type": "syscall",
                "data": {"ret_value": "7", "callchain": [["spawner", "0x1"]]}
            })
            .to_string(),
        );
        fx.dispatcher.handle_line(
            &json!({
                "type": "syscall_meta",
                "data": {
                    "subtype": "new_proc", "comm": "sh", "pid": "1",
                    "tid": "1", "time": 100, "ret_value": "7"
                }
            })
            .to_string(),
        );

        let lineage = fx.lineage.lock().unwrap();
        assert!(lineage.touched());
        let tree = lineage.finalize(0);
        assert_eq!(tree.spawning_callchains["7"][0].0, "spawner");
        assert_eq!(tree.tree.len(), 2);
    }

    #[test]
    fn test_run_stops_at_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let clock = Arc::new(ProfileClock::new());
        clock.arm(0);
        let lineage = Arc::new(Mutex::new(LineageAccum::new()));
        let (local, peer) = UnixStream::pair().unwrap();

        let dispatcher = Dispatcher::new(
            Connection::from_stream(local, 1024).unwrap(),
            store.root().child("walltime"),
            store.clone(),
            clock,
            lineage,
            "test profiler",
        );

        let writer = std::thread::spawn(move || {
            let mut conn = Connection::from_stream(peer, 1024).unwrap();
            conn.write_message(&sample_line("task-clock", 100, 10, &[("A", "0x1")]), false)
                .unwrap();
            conn.write_message("", false).unwrap();
            conn.write_message(STOP_SENTINEL, true).unwrap();
        });

        let outcome = dispatcher.run();
        writer.join().unwrap();
        assert!(!outcome.symbol_maps_missing);
        assert_eq!(
            store
                .root()
                .child("walltime")
                .child("100")
                .child("100")
                .get_u64("sampled_period", 0),
            10
        );
    }
}
