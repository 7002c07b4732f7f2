//! GDB/MI command text.

pub const EXEC_INTERRUPT: &str = "-exec-interrupt";
pub const EXEC_CONTINUE: &str = "-exec-continue";
pub const THREAD_INFO: &str = "-thread-info";
pub const TARGET_DETACH: &str = "-target-detach";
pub const GDB_EXIT: &str = "-gdb-exit";

/// Quote an argument as an MI c-string.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn break_insert_line(file: &str, line: u32) -> String {
    format!("-break-insert -f {}", quote(&format!("{file}:{line}")))
}

pub fn break_insert_function(function: &str, line_offset: u32) -> String {
    if line_offset == 0 {
        format!("-break-insert -f --function {function}")
    } else {
        format!("-break-insert -f --function {function} --line +{line_offset}")
    }
}

pub fn break_delete(gdb_id: u32) -> String {
    format!("-break-delete {gdb_id}")
}

pub fn break_enable(gdb_id: u32) -> String {
    format!("-break-enable {gdb_id}")
}

pub fn break_disable(gdb_id: u32) -> String {
    format!("-break-disable {gdb_id}")
}

pub fn break_after(gdb_id: u32, count: u32) -> String {
    format!("-break-after {gdb_id} {count}")
}

/// An empty expression clears the condition.
pub fn break_condition(gdb_id: u32, expression: &str) -> String {
    if expression.is_empty() {
        format!("-break-condition {gdb_id}")
    } else {
        format!("-break-condition {gdb_id} {expression}")
    }
}

pub fn exec_step(thread_id: u32) -> String {
    format!("-exec-step --thread {thread_id}")
}

pub fn exec_next(thread_id: u32) -> String {
    format!("-exec-next --thread {thread_id}")
}

pub fn exec_finish(thread_id: u32) -> String {
    format!("-exec-finish --thread {thread_id}")
}

pub fn thread_select(thread_id: u32) -> String {
    format!("-thread-select {thread_id}")
}

/// Frames `0..max_frames`, i.e. a closed range ending at `max_frames - 1`.
pub fn stack_list_frames(max_frames: usize) -> String {
    format!("-stack-list-frames 0 {}", max_frames.saturating_sub(1))
}

pub fn stack_info_depth(thread_id: u32) -> String {
    format!("-stack-info-depth --thread {thread_id}")
}

pub fn evaluate_expression(expression: &str) -> String {
    format!("-data-evaluate-expression {}", quote(expression))
}

pub fn file_exec_and_symbols(path: &str) -> String {
    format!("-file-exec-and-symbols {}", quote(path))
}

pub fn target_attach(pid: u32) -> String {
    format!("-target-attach {pid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_break_insert_forms() {
        assert_eq!(break_insert_line("file.c", 10), "-break-insert -f \"file.c:10\"");
        assert_eq!(break_insert_function("main", 0), "-break-insert -f --function main");
        assert_eq!(break_insert_function("main", 3), "-break-insert -f --function main --line +3");
    }

    #[test]
    fn test_condition_clear() {
        assert_eq!(break_condition(4, ""), "-break-condition 4");
        assert_eq!(break_condition(4, "x > 3"), "-break-condition 4 x > 3");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a "b" \c"#), r#""a \"b\" \\c""#);
        assert_eq!(evaluate_expression("s"), "-data-evaluate-expression \"s\"");
    }

    #[test]
    fn test_stack_frame_range() {
        assert_eq!(stack_list_frames(30), "-stack-list-frames 0 29");
        assert_eq!(stack_list_frames(1), "-stack-list-frames 0 0");
    }
}
