//! Parsers for the tabular responses produced by the GDB transport.
//!
//! Records are separated by `#`, fields within a record by `;`.

use anyhow::{anyhow, Context as _, Result};

pub const RECORD_SEPARATOR: char = '#';
pub const FIELD_SEPARATOR: char = ';';

const THREAD_FIELDS: usize = 7;
const FRAME_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedBreakpoint {
    pub gdb_id: u32,
    pub file: String,
    pub line: u32,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRunState {
    Stopped,
    Running,
    Unknown,
}

impl ThreadRunState {
    fn parse(text: &str) -> Self {
        match text {
            "stopped" => Self::Stopped,
            "running" => Self::Running,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: u32,
    pub target_id: String,
    pub state: ThreadRunState,
    pub priority: i32,
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub current_id: Option<u32>,
    pub threads: Vec<ThreadRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub level: u32,
    pub address: u64,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

fn parse_address(text: &str) -> Result<u64> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid address '{text}'"))
}

fn optional_text(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn optional_line(text: &str) -> Option<u32> {
    text.trim().parse().ok().filter(|&line| line > 0)
}

/// `gdb_id;file;line;address`
pub fn parse_break_insert(response: &str) -> Result<InsertedBreakpoint> {
    let fields: Vec<&str> = response.trim().split(FIELD_SEPARATOR).collect();
    let [id, file, line, address] = fields.as_slice() else {
        return Err(anyhow!("Malformed breakpoint response '{response}'"));
    };
    Ok(InsertedBreakpoint {
        gdb_id: id.trim().parse().with_context(|| format!("Invalid breakpoint id '{id}'"))?,
        file: file.trim().to_string(),
        line: line.trim().parse().with_context(|| format!("Invalid line '{line}'"))?,
        address: parse_address(address.trim())?,
    })
}

fn parse_thread_record(record: &str) -> Option<ThreadRecord> {
    let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
    if fields.len() != THREAD_FIELDS {
        log::warn!("Skipping thread record with {} fields: '{}'", fields.len(), record);
        return None;
    }
    let id = fields[0].trim().parse().ok()?;
    Some(ThreadRecord {
        id,
        target_id: fields[1].trim().to_string(),
        state: ThreadRunState::parse(fields[2].trim()),
        priority: fields[3].trim().parse().unwrap_or(0),
        name: fields[4].trim().to_string(),
        file: optional_text(fields[5]),
        line: optional_line(fields[6]),
    })
}

/// `current_id#id;target_id;state;priority;name;file;line#...`
///
/// Malformed thread records are skipped rather than failing the whole poll.
pub fn parse_thread_info(response: &str) -> ThreadInfo {
    let mut records = response.trim().split(RECORD_SEPARATOR);
    let current_id = records.next().and_then(|c| c.trim().parse().ok());
    let threads = records.filter(|r| !r.trim().is_empty()).filter_map(parse_thread_record).collect();
    ThreadInfo { current_id, threads }
}

/// `level;address;function;file;line#...`
pub fn parse_frames(response: &str) -> Vec<FrameRecord> {
    response
        .trim()
        .split(RECORD_SEPARATOR)
        .filter(|r| !r.trim().is_empty())
        .filter_map(|record| {
            let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
            if fields.len() != FRAME_FIELDS {
                log::warn!("Skipping frame record '{}'", record);
                return None;
            }
            Some(FrameRecord {
                level: fields[0].trim().parse().ok()?,
                address: parse_address(fields[1].trim()).ok()?,
                function: fields[2].trim().to_string(),
                file: optional_text(fields[3]),
                line: optional_line(fields[4]),
            })
        })
        .collect()
}

pub fn parse_depth(response: &str) -> Result<usize> {
    response.trim().parse().with_context(|| format!("Invalid stack depth '{response}'"))
}
