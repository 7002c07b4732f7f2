//! Thread and stack-frame cache.
//!
//! `ThreadAndFrameCache` polls GDB for the thread list and reconciles it with
//! the snapshots already handed to the IDE. Snapshots are replaced only when
//! the set of threads changed; otherwise their fields are patched in place.
//! Frames are memoized per thread until the next stop.

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::gdb::response::{self, FrameRecord, ThreadRecord, ThreadRunState};
use crate::gdb::{commands, GdbClient};
use crate::session::Session;
use crate::sync::lock;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

/// Which `FrameInfo` fields the caller wants populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameInfoFlags(u32);

impl FrameInfoFlags {
    pub const NONE: Self = Self(0);
    pub const FUNCTION_NAME: Self = Self(1);
    /// Append the line number to the function name.
    pub const FUNCTION_LINE: Self = Self(1 << 1);
    pub const MODULE: Self = Self(1 << 2);
    pub const LANGUAGE: Self = Self(1 << 3);
    pub const ADDRESS: Self = Self(1 << 4);
    pub const SOURCE: Self = Self(1 << 5);
    pub const DEBUG_INFO: Self = Self(1 << 6);
    pub const ALL: Self = Self((1 << 7) - 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for FrameInfoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub level: u32,
    pub function_name: Option<String>,
    pub module: Option<String>,
    pub language: Option<&'static str>,
    pub address: Option<u64>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub has_debug_info: Option<bool>,
}

impl FrameInfo {
    fn build(record: &FrameRecord, flags: FrameInfoFlags, module: Option<&str>) -> Self {
        let mut info = Self { level: record.level, ..Self::default() };
        if flags.contains(FrameInfoFlags::FUNCTION_NAME) {
            info.function_name = Some(match record.line {
                Some(line) if flags.contains(FrameInfoFlags::FUNCTION_LINE) => {
                    format!("{} Line {line}", record.function)
                }
                _ => record.function.clone(),
            });
        }
        if flags.contains(FrameInfoFlags::MODULE) {
            info.module = module.map(str::to_string);
        }
        if flags.contains(FrameInfoFlags::LANGUAGE) {
            info.language = record.file.as_deref().and_then(source_language);
        }
        if flags.contains(FrameInfoFlags::ADDRESS) {
            info.address = Some(record.address);
        }
        if flags.contains(FrameInfoFlags::SOURCE) {
            info.file.clone_from(&record.file);
            info.line = record.line;
        }
        if flags.contains(FrameInfoFlags::DEBUG_INFO) {
            info.has_debug_info = Some(record.file.is_some());
        }
        info
    }
}

fn source_language(file: &str) -> Option<&'static str> {
    let extension = file.rsplit_once('.')?.1;
    match extension {
        "c" => Some("C"),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => Some("C++"),
        "h" => Some("C/C++"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThreadFields {
    name: String,
    state: ThreadRunState,
    priority: i32,
    file: Option<String>,
    line: Option<u32>,
    current: bool,
}

impl ThreadFields {
    fn from_record(record: &ThreadRecord, current: bool) -> Self {
        Self {
            name: record.name.clone(),
            state: record.state,
            priority: record.priority,
            file: record.file.clone(),
            line: record.line,
            current,
        }
    }
}

/// GDB's frame records for one stop, and the info last built from them.
#[derive(Default)]
struct FrameMemo {
    generation: u64,
    records: Option<Arc<[FrameRecord]>>,
    flags: FrameInfoFlags,
    frames: Option<Arc<[FrameInfo]>>,
}

/// One GDB thread as presented to the IDE.
pub struct ThreadSnapshot {
    id: u32,
    target_id: String,
    fields: Mutex<ThreadFields>,
    frames: Mutex<FrameMemo>,
}

/// The property bag for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadProperties {
    pub id: u32,
    pub target_id: String,
    pub name: String,
    pub state: &'static str,
    pub priority: i32,
    pub location: Option<String>,
    pub current: bool,
}

impl ThreadSnapshot {
    fn new(record: &ThreadRecord, current: bool) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            target_id: record.target_id.clone(),
            fields: Mutex::new(ThreadFields::from_record(record, current)),
            frames: Mutex::new(FrameMemo::default()),
        })
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn name(&self) -> String {
        lock(&self.fields).name.clone()
    }

    pub fn state(&self) -> ThreadRunState {
        lock(&self.fields).state
    }

    pub fn priority(&self) -> i32 {
        lock(&self.fields).priority
    }

    pub fn location(&self) -> (Option<String>, Option<u32>) {
        let fields = lock(&self.fields);
        (fields.file.clone(), fields.line)
    }

    pub fn is_current(&self) -> bool {
        lock(&self.fields).current
    }

    pub fn properties(&self) -> ThreadProperties {
        let fields = lock(&self.fields);
        ThreadProperties {
            id: self.id,
            target_id: self.target_id.clone(),
            name: fields.name.clone(),
            state: fields.state.as_str(),
            priority: fields.priority,
            location: fields.file.as_ref().map(|file| match fields.line {
                Some(line) => format!("{file}:{line}"),
                None => file.clone(),
            }),
            current: fields.current,
        }
    }

    /// Patch mutable fields, leaving the current flag alone.
    fn patch(&self, record: &ThreadRecord) {
        let mut fields = lock(&self.fields);
        let current = fields.current;
        *fields = ThreadFields::from_record(record, current);
    }

    /// Returns whether the flag changed.
    fn set_current(&self, current: bool) -> bool {
        let mut fields = lock(&self.fields);
        let changed = fields.current != current;
        fields.current = current;
        changed
    }
}

impl std::fmt::Debug for ThreadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSnapshot")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("fields", &*lock(&self.fields))
            .finish_non_exhaustive()
    }
}

/// Switches GDB's selected thread and switches back on drop.
struct ThreadSelection<'a> {
    gdb: &'a dyn GdbClient,
    restore: Option<u32>,
}

impl<'a> ThreadSelection<'a> {
    fn switch(gdb: &'a dyn GdbClient, target: u32, original: Option<u32>) -> anyhow::Result<Self> {
        if original == Some(target) {
            return Ok(Self { gdb, restore: None });
        }
        gdb.send_command(&commands::thread_select(target))?;
        Ok(Self { gdb, restore: original })
    }
}

impl Drop for ThreadSelection<'_> {
    fn drop(&mut self) {
        if let Some(original) = self.restore {
            if let Err(e) = self.gdb.send_command(&commands::thread_select(original)) {
                log::warn!("Failed to restore selected thread {original}: {e:#}");
            }
        }
    }
}

pub struct ThreadAndFrameCache {
    session: Arc<Session>,
    cached: Mutex<Vec<Arc<ThreadSnapshot>>>,
}

impl ThreadAndFrameCache {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session, cached: Mutex::new(Vec::new()) }
    }

    /// Query GDB once for the thread list.
    ///
    /// `current_index` is -1 when no thread could be parsed.
    pub fn list_threads(&self) -> EngineResult<(Vec<ThreadRecord>, i32)> {
        let gdb = self.session.gdb()?;
        let info = response::parse_thread_info(&gdb.send_command(commands::THREAD_INFO)?);
        if info.threads.is_empty() {
            return Ok((Vec::new(), -1));
        }
        self.session.set_selected_thread(info.current_id);
        let current = info
            .current_id
            .and_then(|id| info.threads.iter().position(|t| t.id == id))
            .unwrap_or(0);
        Ok((info.threads, i32::try_from(current).unwrap_or(0)))
    }

    /// Reconcile the cached snapshots with GDB's current thread list.
    ///
    /// An empty poll keeps the previous snapshots.
    pub fn enum_threads(&self) -> EngineResult<Vec<Arc<ThreadSnapshot>>> {
        let (records, current_index) = self.list_threads()?;
        let mut cached = lock(&self.cached);
        let Ok(current_index) = usize::try_from(current_index) else {
            log::warn!("No threads in this poll, keeping {} cached", cached.len());
            return Ok(cached.clone());
        };

        let same_set = cached.len() == records.len()
            && cached.iter().zip(&records).all(|(t, r)| t.id == r.id);
        if same_set {
            for (thread, record) in cached.iter().zip(&records) {
                thread.patch(record);
            }
            // Compare against each thread's own flag; a remembered index may be stale.
            for (index, thread) in cached.iter().enumerate() {
                if thread.set_current(index == current_index) {
                    log::debug!("Thread {} current: {}", thread.id, index == current_index);
                }
            }
        } else {
            for thread in cached.iter() {
                self.session.emit(EngineEvent::ThreadDestroyed { thread_id: thread.id });
            }
            *cached = records
                .iter()
                .enumerate()
                .map(|(index, record)| ThreadSnapshot::new(record, index == current_index))
                .collect();
            for thread in cached.iter() {
                self.session.emit(EngineEvent::ThreadCreated { thread_id: thread.id });
            }
        }
        Ok(cached.clone())
    }

    pub fn thread(&self, thread_id: u32) -> Option<Arc<ThreadSnapshot>> {
        lock(&self.cached).iter().find(|t| t.id == thread_id).cloned()
    }

    pub fn thread_properties(&self, thread_id: u32) -> EngineResult<ThreadProperties> {
        let thread = match self.thread(thread_id) {
            Some(thread) => thread,
            None => self
                .enum_threads()?
                .into_iter()
                .find(|t| t.id == thread_id)
                .ok_or_else(|| EngineError::InvalidArgument(format!("unknown thread {thread_id}")))?,
        };
        Ok(thread.properties())
    }

    /// Frames of `thread`, at most `max_frames` of them.
    ///
    /// GDB is queried once per thread and stop. Asking again with the same
    /// flags returns the same array; other flags rebuild it from the records.
    pub fn enum_frame_info(&self, thread: &ThreadSnapshot, flags: FrameInfoFlags) -> EngineResult<Arc<[FrameInfo]>> {
        let generation = self.session.stop_generation();
        let mut memo = lock(&thread.frames);
        if memo.generation != generation {
            *memo = FrameMemo { generation, ..FrameMemo::default() };
        }
        if let Some(frames) = memo.frames.as_ref().filter(|_| memo.flags == flags) {
            return Ok(Arc::clone(frames));
        }

        let records = match &memo.records {
            Some(records) => Arc::clone(records),
            None => {
                let records = self.query_frames(thread.id)?;
                memo.records = Some(Arc::clone(&records));
                records
            }
        };
        let module = self.session.module_name();
        let frames: Arc<[FrameInfo]> =
            records.iter().map(|record| FrameInfo::build(record, flags, module.as_deref())).collect();
        memo.flags = flags;
        memo.frames = Some(Arc::clone(&frames));
        Ok(frames)
    }

    /// One `-stack-list-frames` for `thread_id`, with GDB's selection
    /// switched to it and back.
    fn query_frames(&self, thread_id: u32) -> EngineResult<Arc<[FrameRecord]>> {
        let gdb = self.session.gdb()?;
        let _selection_lock = self.session.lock_thread_selection();
        let selected = self.session.selected_thread();
        if selected.is_none() {
            self.session.set_selected_thread(Some(thread_id));
        }
        let _selection = ThreadSelection::switch(gdb.as_ref(), thread_id, selected)?;
        let max_frames = self.session.config().max_frames;
        let text = gdb.send_command(&commands::stack_list_frames(max_frames))?;
        Ok(response::parse_frames(&text).into_iter().take(max_frames).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, name: &str) -> ThreadRecord {
        ThreadRecord {
            id,
            target_id: format!("Thread 0x{id:x}"),
            state: ThreadRunState::Stopped,
            priority: 10,
            name: name.to_string(),
            file: Some("main.c".to_string()),
            line: Some(3),
        }
    }

    #[test]
    fn test_flags_contain() {
        let flags = FrameInfoFlags::FUNCTION_NAME | FrameInfoFlags::SOURCE;
        assert!(flags.contains(FrameInfoFlags::SOURCE));
        assert!(!flags.contains(FrameInfoFlags::MODULE));
        assert!(FrameInfoFlags::ALL.contains(flags));
        assert_eq!(FrameInfoFlags::from_bits(u32::MAX), FrameInfoFlags::ALL);
    }

    #[test]
    fn test_frame_info_respects_flags() {
        let frame = FrameRecord {
            level: 0,
            address: 0x1000,
            function: "main".to_string(),
            file: Some("main.cpp".to_string()),
            line: Some(12),
        };
        let info = FrameInfo::build(&frame, FrameInfoFlags::FUNCTION_NAME | FrameInfoFlags::FUNCTION_LINE, None);
        assert_eq!(info.function_name.as_deref(), Some("main Line 12"));
        assert_eq!(info.file, None);

        let info = FrameInfo::build(&frame, FrameInfoFlags::ALL, Some("app"));
        assert_eq!(info.language, Some("C++"));
        assert_eq!(info.module.as_deref(), Some("app"));
        assert_eq!(info.address, Some(0x1000));
        assert_eq!(info.has_debug_info, Some(true));
    }

    #[test]
    fn test_patch_keeps_current_flag() {
        let thread = ThreadSnapshot::new(&record(1, "main"), true);
        thread.patch(&record(1, "renamed"));
        assert_eq!(thread.name(), "renamed");
        assert!(thread.is_current());
        assert!(thread.set_current(false));
        assert!(!thread.set_current(false));
    }

    #[test]
    fn test_properties_location() {
        let props = ThreadSnapshot::new(&record(2, "worker"), false).properties();
        assert_eq!(props.location.as_deref(), Some("main.c:3"));
        assert_eq!(props.state, "stopped");
        assert!(!props.current);
    }
}
