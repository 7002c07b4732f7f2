#![allow(dead_code)]

use gdbridge_core::gdb::mock::{MockGdb, MockLauncher};
use gdbridge_core::{
    BreakpointLocation, BreakpointRequest, Engine, EngineConfig, EngineEvent, GdbClient, GdbConnection, GdbEvent,
    GdbLauncher, LaunchParams,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn fast_config() -> EngineConfig {
    EngineConfig { interrupt_timeout_ms: 50, lock_poll_ms: 5, ..EngineConfig::default() }
}

pub fn engine_with(config: EngineConfig) -> (Engine, Arc<MockGdb>) {
    let (launcher, gdb) = MockLauncher::new();
    (Engine::new(config, Arc::new(launcher)), gdb)
}

pub fn engine() -> (Engine, Arc<MockGdb>) {
    engine_with(fast_config())
}

/// Answers a command instead of GDB when it returns `Some`. Gets the
/// simulated GDB so it can forward the command and act around it.
pub type CommandHook = dyn Fn(&str, &MockGdb) -> Option<anyhow::Result<String>> + Send + Sync;

pub type EventMap = dyn Fn(GdbEvent) -> GdbEvent + Send + Sync;

pub fn pass_through(_command: &str, _gdb: &MockGdb) -> Option<anyhow::Result<String>> {
    None
}

struct HookedGdb {
    inner: Arc<MockGdb>,
    hook: Arc<CommandHook>,
}

impl HookedGdb {
    fn run(&self, command: &str) -> anyhow::Result<String> {
        match (self.hook)(command, &self.inner) {
            Some(answer) => answer,
            None => self.inner.send_command(command),
        }
    }
}

impl GdbClient for HookedGdb {
    fn send_command(&self, command: &str) -> anyhow::Result<String> {
        self.run(command)
    }

    fn add_async_command(&self, command: &str) -> anyhow::Result<()> {
        self.run(command).map(|_| ())
    }
}

/// Launches the simulated GDB behind a command hook and an optional
/// rewrite of its notifications.
pub struct HookedLauncher {
    inner: MockLauncher,
    gdb: Arc<MockGdb>,
    hook: Arc<CommandHook>,
    map_events: Option<Arc<EventMap>>,
}

impl GdbLauncher for HookedLauncher {
    fn launch(&self, params: &LaunchParams) -> anyhow::Result<GdbConnection> {
        let connection = self.inner.launch(params)?;
        let client: Arc<dyn GdbClient> = Arc::new(HookedGdb { inner: Arc::clone(&self.gdb), hook: Arc::clone(&self.hook) });
        let events = match &self.map_events {
            None => connection.events,
            Some(map) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let map = Arc::clone(map);
                let source = connection.events;
                std::thread::spawn(move || {
                    for event in source.iter() {
                        if tx.send(map(event)).is_err() {
                            break;
                        }
                    }
                });
                rx
            }
        };
        Ok(GdbConnection { client, events })
    }
}

fn hooked(hook: Arc<CommandHook>, map_events: Option<Arc<EventMap>>) -> (Engine, Arc<MockGdb>) {
    let (inner, gdb) = MockLauncher::new();
    let launcher = HookedLauncher { inner, gdb: Arc::clone(&gdb), hook, map_events };
    (Engine::new(fast_config(), Arc::new(launcher)), gdb)
}

pub fn hooked_engine(
    hook: impl Fn(&str, &MockGdb) -> Option<anyhow::Result<String>> + Send + Sync + 'static,
) -> (Engine, Arc<MockGdb>) {
    hooked(Arc::new(hook), None)
}

pub fn engine_with_event_map(map: impl Fn(GdbEvent) -> GdbEvent + Send + Sync + 'static) -> (Engine, Arc<MockGdb>) {
    hooked(Arc::new(pass_through), Some(Arc::new(map)))
}

pub fn at_line(line: u32) -> BreakpointRequest {
    BreakpointRequest::new(BreakpointLocation::file_line("file.c", line))
}

/// Next event that presents a stop, skipping lifecycle and breakpoint notifications.
pub async fn next_stop(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    loop {
        let event = rx.recv().await.expect("Failed to receive event");
        if event.is_stop() {
            return event;
        }
    }
}

pub async fn expect_stop(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    timeout(WAIT, next_stop(rx)).await.expect("Timeout waiting for stop event")
}

/// Asserts no stop is presented within a short window.
pub async fn expect_no_stop(rx: &mut broadcast::Receiver<EngineEvent>) {
    let result = timeout(Duration::from_millis(150), next_stop(rx)).await;
    assert!(result.is_err(), "unexpected stop: {:?}", result.ok());
}

/// Drain whatever is queued without waiting.
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `check` until it holds or `WAIT` passes.
pub fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}
