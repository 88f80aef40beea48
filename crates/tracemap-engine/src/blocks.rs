//! Resolution output parser.
//!
//! With address annotation enabled the resolver echoes each input address on
//! its own `0x`-prefixed line, then emits one location line per inline frame,
//! innermost first, until the next echo. This module only segments the flat
//! output into per-address blocks; classifying frames (unresolved
//! placeholders, out-of-workspace paths) is the session's job.

/// Prefix of the resolver's own echo of an input address, opening a block.
pub const ADDRESS_MARKER: &str = "0x";

/// Prefix of the placeholder the resolver emits when it has no symbol for an
/// address. A placeholder is a present frame, not a missing block.
pub const UNRESOLVED_PREFIX: &str = "??";

/// Segments raw resolver output into exactly `address_count` blocks of frame
/// lines, in input-address order. Any mismatch between the segmentation and
/// the submitted addresses means the tool's output format has drifted, and is
/// reported as a reason string for a format error.
pub fn parse_blocks(output: &str, address_count: usize) -> Result<Vec<Vec<&str>>, String> {
    let mut blocks: Vec<Vec<&str>> = Vec::with_capacity(address_count);
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(ADDRESS_MARKER) {
            if let Some(previous) = blocks.last()
                && previous.is_empty()
            {
                return Err(format!("address block {} has no frame lines", blocks.len() - 1));
            }
            blocks.push(Vec::new());
        } else {
            let Some(current) = blocks.last_mut() else {
                return Err(format!("output before first address marker: {line:?}"));
            };
            current.push(line);
        }
    }
    if let Some(last) = blocks.last()
        && last.is_empty()
    {
        return Err(format!("address block {} has no frame lines", blocks.len() - 1));
    }
    if blocks.len() != address_count {
        return Err(format!(
            "expected {address_count} address blocks, found {}",
            blocks.len()
        ));
    }
    Ok(blocks)
}
