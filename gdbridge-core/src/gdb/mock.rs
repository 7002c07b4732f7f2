//! Simulated GDB target.
//!
//! Answers the MI commands the engine issues with the tabular responses the
//! real transport produces, and raises stop notifications when scripted
//! breakpoint crossings happen. Used by the integration tests and by the
//! `gdbridge-sim` CLI.

use super::response::{FrameRecord, FIELD_SEPARATOR, RECORD_SEPARATOR};
use super::{GdbClient, GdbConnection, GdbEvent, GdbLauncher, LaunchParams, StopEvent, StopReason};
use crate::sync::lock;
use anyhow::{anyhow, bail, Context as _, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBreakpoint {
    pub id: u32,
    pub file: String,
    pub line: u32,
    pub address: u64,
    pub enabled: bool,
    pub ignore: u32,
    pub condition: Option<String>,
    pub times: u32,
}

#[derive(Debug, Clone)]
struct MockThread {
    id: u32,
    target_id: String,
    name: String,
    priority: i32,
    file: String,
    line: u32,
    frames: Vec<FrameRecord>,
}

impl MockThread {
    fn frames(&self) -> Vec<FrameRecord> {
        if self.frames.is_empty() {
            vec![FrameRecord {
                level: 0,
                address: 0x40_0000 + u64::from(self.line) * 4,
                function: "main".to_string(),
                file: Some(self.file.clone()),
                line: Some(self.line),
            }]
        } else {
            self.frames.clone()
        }
    }
}

struct MockState {
    next_id: u32,
    breakpoints: BTreeMap<u32, MockBreakpoint>,
    functions: HashMap<String, (String, u32)>,
    threads: Vec<MockThread>,
    selected: u32,
    running: bool,
    honor_ignore_counts: bool,
    dropped_interrupts: u32,
    values: HashMap<String, VecDeque<String>>,
    last_values: HashMap<String, String>,
    condition_truth: HashMap<u32, VecDeque<bool>>,
    failing: Vec<String>,
    stack_queries: usize,
    log: Vec<String>,
}

pub struct MockGdb {
    state: Mutex<MockState>,
    events: Sender<GdbEvent>,
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    let inner = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')).unwrap_or(text);
    inner.replace("\\\"", "\"").replace("\\\\", "\\")
}

fn parse_id(text: Option<&str>) -> Result<u32> {
    let text = text.context("Missing breakpoint number")?;
    text.parse().with_context(|| format!("Bad breakpoint number '{text}'"))
}

fn thread_arg(args: &[&str]) -> Option<u32> {
    args.iter()
        .position(|a| *a == "--thread")
        .and_then(|i| args.get(i + 1))
        .and_then(|t| t.parse().ok())
}

impl MockGdb {
    /// A stopped target with a single `main` thread at `main.c:1`.
    pub fn new() -> (Arc<Self>, Receiver<GdbEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let gdb = Arc::new(Self {
            state: Mutex::new(MockState {
                next_id: 1,
                breakpoints: BTreeMap::new(),
                functions: HashMap::new(),
                threads: vec![MockThread {
                    id: 1,
                    target_id: "Thread 0x1".to_string(),
                    name: "main".to_string(),
                    priority: 10,
                    file: "main.c".to_string(),
                    line: 1,
                    frames: Vec::new(),
                }],
                selected: 1,
                running: false,
                honor_ignore_counts: true,
                dropped_interrupts: 0,
                values: HashMap::new(),
                last_values: HashMap::new(),
                condition_truth: HashMap::new(),
                failing: Vec::new(),
                stack_queries: 0,
                log: Vec::new(),
            }),
            events,
        });
        (gdb, rx)
    }

    pub fn add_thread(&self, id: u32, name: &str, file: &str, line: u32) {
        let mut state = lock(&self.state);
        state.threads.retain(|t| t.id != id);
        state.threads.push(MockThread {
            id,
            target_id: format!("Thread 0x{id:x}"),
            name: name.to_string(),
            priority: 10,
            file: file.to_string(),
            line,
            frames: Vec::new(),
        });
    }

    pub fn remove_thread(&self, id: u32) {
        lock(&self.state).threads.retain(|t| t.id != id);
    }

    pub fn rename_thread(&self, id: u32, name: &str) {
        if let Some(thread) = lock(&self.state).threads.iter_mut().find(|t| t.id == id) {
            thread.name = name.to_string();
        }
    }

    pub fn set_frames(&self, thread_id: u32, frames: Vec<FrameRecord>) {
        if let Some(thread) = lock(&self.state).threads.iter_mut().find(|t| t.id == thread_id) {
            thread.frames = frames;
        }
    }

    pub fn define_function(&self, name: &str, file: &str, line: u32) {
        lock(&self.state).functions.insert(name.to_string(), (file.to_string(), line));
    }

    /// Successive results for `-data-evaluate-expression`; the last one repeats.
    pub fn script_values(&self, expression: &str, values: &[&str]) {
        lock(&self.state)
            .values
            .insert(expression.to_string(), values.iter().map(|v| (*v).to_string()).collect());
    }

    /// Successive truth values of a breakpoint's GDB-side condition.
    pub fn script_condition(&self, gdb_id: u32, truth: &[bool]) {
        lock(&self.state).condition_truth.insert(gdb_id, truth.iter().copied().collect());
    }

    /// When false, every crossing is reported and ignore counts are only recorded.
    pub fn set_honor_ignore_counts(&self, honor: bool) {
        lock(&self.state).honor_ignore_counts = honor;
    }

    /// Swallow the next `count` interrupts without stopping.
    pub fn drop_interrupts(&self, count: u32) {
        lock(&self.state).dropped_interrupts = count;
    }

    /// Make every command starting with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        lock(&self.state).failing.push(prefix.to_string());
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn set_running(&self, running: bool) {
        lock(&self.state).running = running;
    }

    pub fn selected_thread(&self) -> u32 {
        lock(&self.state).selected
    }

    pub fn breakpoint(&self, gdb_id: u32) -> Option<MockBreakpoint> {
        lock(&self.state).breakpoints.get(&gdb_id).cloned()
    }

    pub fn breakpoint_count(&self) -> usize {
        lock(&self.state).breakpoints.len()
    }

    pub fn stack_queries(&self) -> usize {
        lock(&self.state).stack_queries
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        lock(&self.state).log.iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Poll until the target reports the wanted run state.
    pub fn wait_for_running(&self, running: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_running() == running {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.is_running() == running
    }

    /// Simulate the target crossing a breakpoint on `thread_id`.
    ///
    /// Returns whether GDB stopped and reported the crossing.
    pub fn hit_breakpoint(&self, gdb_id: u32, thread_id: u32) -> bool {
        let mut state = lock(&self.state);
        let honor = state.honor_ignore_counts;
        let Some(bp) = state.breakpoints.get(&gdb_id) else {
            return false;
        };
        if !bp.enabled {
            return false;
        }
        // A false condition is not a hit: neither counted nor ignored.
        if bp.condition.is_some() {
            let truth = state.condition_truth.get_mut(&gdb_id).and_then(VecDeque::pop_front).unwrap_or(true);
            if !truth {
                return false;
            }
        }
        let Some(bp) = state.breakpoints.get_mut(&gdb_id) else {
            return false;
        };
        bp.times += 1;
        if honor && bp.ignore > 0 {
            bp.ignore -= 1;
            return false;
        }
        let (times, file, line) = (bp.times, bp.file.clone(), bp.line);
        state.running = false;
        state.selected = thread_id;
        if let Some(thread) = state.threads.iter_mut().find(|t| t.id == thread_id) {
            thread.file.clone_from(&file);
            thread.line = line;
        }
        let stop = StopEvent::new(StopReason::BreakpointHit { gdb_id, times: Some(times) }, Some(thread_id))
            .at(file, line);
        let _ = self.events.send(GdbEvent::Stopped(stop));
        true
    }

    pub fn raise_signal(&self, signal: &str, thread_id: u32) {
        let mut state = lock(&self.state);
        state.running = false;
        let stop = StopEvent::new(StopReason::SignalReceived(signal.to_string()), Some(thread_id));
        let _ = self.events.send(GdbEvent::Stopped(stop));
    }

    pub fn exit(&self, code: i32) {
        lock(&self.state).running = false;
        let _ = self.events.send(GdbEvent::Exited { code: Some(code) });
    }

    fn handle(&self, command: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.log.push(command.to_string());
        if state.failing.iter().any(|p| command.starts_with(p.as_str())) {
            bail!("simulated failure for '{command}'");
        }
        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        match verb {
            "-break-insert" => Self::break_insert(&mut state, rest),
            "-break-delete" => {
                let id = parse_id(args.first().copied())?;
                state.breakpoints.remove(&id).map(|_| String::new()).ok_or_else(|| anyhow!("No breakpoint number {id}"))
            }
            "-break-enable" | "-break-disable" => {
                let id = parse_id(args.first().copied())?;
                let bp = state.breakpoints.get_mut(&id).ok_or_else(|| anyhow!("No breakpoint number {id}"))?;
                bp.enabled = verb == "-break-enable";
                Ok(String::new())
            }
            "-break-after" => {
                let id = parse_id(args.first().copied())?;
                let count: u32 = args.get(1).context("Missing count")?.parse().context("Bad count")?;
                let bp = state.breakpoints.get_mut(&id).ok_or_else(|| anyhow!("No breakpoint number {id}"))?;
                bp.ignore = count;
                Ok(String::new())
            }
            "-break-condition" => {
                let id = parse_id(args.first().copied())?;
                let expression = rest.trim().split_once(' ').map(|(_, e)| e.trim().to_string());
                let bp = state.breakpoints.get_mut(&id).ok_or_else(|| anyhow!("No breakpoint number {id}"))?;
                bp.condition = expression.filter(|e| !e.is_empty());
                Ok(String::new())
            }
            "-exec-interrupt" => {
                if state.dropped_interrupts > 0 {
                    state.dropped_interrupts -= 1;
                } else if state.running {
                    state.running = false;
                    let stop = StopEvent::new(StopReason::SignalReceived("SIGINT".to_string()), Some(state.selected));
                    let _ = self.events.send(GdbEvent::Stopped(stop));
                }
                Ok(String::new())
            }
            "-exec-continue" => {
                state.running = true;
                let _ = self.events.send(GdbEvent::Running { thread_id: thread_arg(&args) });
                Ok(String::new())
            }
            "-exec-step" | "-exec-next" | "-exec-finish" => {
                let thread_id = thread_arg(&args).unwrap_or(state.selected);
                state.selected = thread_id;
                let reason = if verb == "-exec-finish" {
                    StopReason::FunctionFinished
                } else {
                    StopReason::EndSteppingRange
                };
                let location = state.threads.iter_mut().find(|t| t.id == thread_id).map(|t| {
                    t.line += 1;
                    (t.file.clone(), t.line)
                });
                state.running = false;
                let _ = self.events.send(GdbEvent::Running { thread_id: Some(thread_id) });
                let mut stop = StopEvent::new(reason, Some(thread_id));
                if let Some((file, line)) = location {
                    stop = stop.at(file, line);
                }
                let _ = self.events.send(GdbEvent::Stopped(stop));
                Ok(String::new())
            }
            "-thread-info" => Ok(Self::thread_info(&state)),
            "-thread-select" => {
                let id: u32 = args.first().context("Missing thread id")?.parse().context("Bad thread id")?;
                if !state.threads.iter().any(|t| t.id == id) {
                    bail!("Invalid thread id: {id}");
                }
                state.selected = id;
                Ok(id.to_string())
            }
            "-stack-list-frames" => {
                state.stack_queries += 1;
                let high: usize = args.get(1).and_then(|h| h.parse().ok()).unwrap_or(usize::MAX - 1);
                let selected = state.selected;
                let thread = state.threads.iter().find(|t| t.id == selected).context("No thread selected")?;
                let records: Vec<String> = thread
                    .frames()
                    .iter()
                    .take(high.saturating_add(1))
                    .map(|f| {
                        format!(
                            "{}{sep}0x{:x}{sep}{}{sep}{}{sep}{}",
                            f.level,
                            f.address,
                            f.function,
                            f.file.clone().unwrap_or_default(),
                            f.line.map(|l| l.to_string()).unwrap_or_default(),
                            sep = FIELD_SEPARATOR
                        )
                    })
                    .collect();
                Ok(records.join(&RECORD_SEPARATOR.to_string()))
            }
            "-stack-info-depth" => {
                let wanted = thread_arg(&args).unwrap_or(state.selected);
                let thread = state.threads.iter().find(|t| t.id == wanted).context("No such thread")?;
                Ok(thread.frames().len().to_string())
            }
            "-data-evaluate-expression" => {
                let expression = unquote(rest);
                let next = state.values.get_mut(&expression).and_then(VecDeque::pop_front);
                match next {
                    Some(value) => {
                        state.last_values.insert(expression, value.clone());
                        Ok(value)
                    }
                    None => state
                        .last_values
                        .get(&expression)
                        .cloned()
                        .ok_or_else(|| anyhow!("No symbol \"{expression}\" in current context.")),
                }
            }
            "-file-exec-and-symbols" | "-target-attach" | "-target-detach" => Ok(String::new()),
            "-gdb-exit" => {
                state.running = false;
                let _ = self.events.send(GdbEvent::Exited { code: None });
                Ok(String::new())
            }
            other => bail!("Undefined MI command: {other}"),
        }
    }

    fn break_insert(state: &mut MockState, rest: &str) -> Result<String> {
        let spec = rest.trim().trim_start_matches("-f").trim();
        let (file, line) = if let Some(function_spec) = spec.strip_prefix("--function") {
            let mut parts = function_spec.split_whitespace();
            let function = parts.next().context("Missing function name")?;
            let offset: u32 = match (parts.next(), parts.next()) {
                (Some("--line"), Some(offset)) => offset.trim_start_matches('+').parse().context("Bad line offset")?,
                _ => 0,
            };
            let (file, start) = state
                .functions
                .get(function)
                .cloned()
                .ok_or_else(|| anyhow!("Function \"{function}\" not defined."))?;
            (file, start + offset)
        } else {
            let location = unquote(spec);
            let (file, line) = location.rsplit_once(':').context("Bad location")?;
            (file.to_string(), line.parse().context("Bad line")?)
        };
        let id = state.next_id;
        state.next_id += 1;
        let address = 0x40_0000 + u64::from(line) * 4;
        state.breakpoints.insert(
            id,
            MockBreakpoint { id, file: file.clone(), line, address, enabled: true, ignore: 0, condition: None, times: 0 },
        );
        Ok(format!("{id}{sep}{file}{sep}{line}{sep}0x{address:x}", sep = FIELD_SEPARATOR))
    }

    fn thread_info(state: &MockState) -> String {
        let run_state = if state.running { "running" } else { "stopped" };
        let mut records = vec![state.selected.to_string()];
        records.extend(state.threads.iter().map(|t| {
            [
                t.id.to_string(),
                t.target_id.clone(),
                run_state.to_string(),
                t.priority.to_string(),
                t.name.clone(),
                t.file.clone(),
                t.line.to_string(),
            ]
            .join(&FIELD_SEPARATOR.to_string())
        }));
        if state.threads.is_empty() {
            return String::new();
        }
        records.join(&RECORD_SEPARATOR.to_string())
    }
}

impl GdbClient for MockGdb {
    fn send_command(&self, command: &str) -> Result<String> {
        self.handle(command)
    }

    fn add_async_command(&self, command: &str) -> Result<()> {
        self.handle(command).map(|_| ())
    }
}

/// Hands out a pre-built `MockGdb` connection exactly once.
pub struct MockLauncher {
    gdb: Arc<MockGdb>,
    events: Mutex<Option<Receiver<GdbEvent>>>,
    failure: Option<String>,
}

impl MockLauncher {
    pub fn new() -> (Self, Arc<MockGdb>) {
        let (gdb, events) = MockGdb::new();
        (Self { gdb: Arc::clone(&gdb), events: Mutex::new(Some(events)), failure: None }, gdb)
    }

    /// A launcher whose GDB never starts.
    pub fn failing(message: &str) -> Self {
        let (gdb, _) = MockGdb::new();
        Self { gdb, events: Mutex::new(None), failure: Some(message.to_string()) }
    }
}

impl GdbLauncher for MockLauncher {
    fn launch(&self, params: &LaunchParams) -> Result<GdbConnection> {
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        let events = lock(&self.events).take().context("Simulated GDB already launched")?;
        log::info!("Simulated GDB launched for {}", params.executable.display());
        let client: Arc<dyn GdbClient> = self.gdb.clone();
        Ok(GdbConnection { client, events })
    }
}
