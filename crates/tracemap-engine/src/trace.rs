//! Trace line parser.
//!
//! The trace format is fixed: whitespace-separated sample index, cycle count,
//! a tagged hex program counter, and a trailing instruction annotation.
//! Matching is purely syntactic; nothing validates the address range.

use compact_str::CompactString;
use regex::Regex;
use std::sync::LazyLock;
use tracemap_types::TraceSample;

/// Fixed tag every program counter in the trace carries as its hex prefix.
pub const PC_TAG: &str = "1c";

static TRACE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^ +[0-9]+ +([0-9]+) +({PC_TAG}[0-9a-f]+) +.+"))
        .expect("trace line pattern")
});

/// Parses one trace line. `None` for anything that does not match the fixed
/// format — including the blank final line a trailing newline produces.
pub fn parse_trace_line(line_number: u32, text: &str) -> Option<TraceSample> {
    let captures = TRACE_LINE.captures(text)?;
    let cycle_count = captures.get(1)?.as_str().parse().ok()?;
    let program_counter = CompactString::from(captures.get(2)?.as_str());
    Some(TraceSample {
        line_number,
        program_counter,
        cycle_count,
        raw_length: text.chars().count() as u32,
    })
}

/// Parses an entire trace text, keeping matching lines in file order.
/// Line numbers are zero-based indices into `text.lines()`.
pub fn parse_trace(text: &str) -> Vec<TraceSample> {
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| parse_trace_line(index as u32, line))
        .collect()
}
