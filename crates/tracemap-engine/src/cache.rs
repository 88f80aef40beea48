//! Source location cache.
//!
//! Repeated addresses make the resolver emit the same frame text over and
//! over; interning on the exact raw text means each distinct frame is parsed
//! and allocated once per session. The key is deliberately the raw resolver
//! text, not the parsed fields: two different raw strings stay distinct even
//! when they would parse identically.

use compact_str::CompactString;
use std::collections::HashMap;
use std::sync::Arc;
use tracemap_types::{SourceLocation, WorkspaceContext};

/// Extracts the line number from a `<path>:<line>` frame, tolerating a
/// trailing ` (discriminator N)` annotation. `None` when the line portion is
/// not a number — the resolver emits `path:?` when it knows the file but not
/// the line, and such frames are treated like unresolved placeholders.
pub fn frame_line_number(raw: &str) -> Option<u32> {
    let (_, line_part) = raw.rsplit_once(':')?;
    line_part.split_whitespace().next()?.parse().ok()
}

/// Sole owner of `SourceLocation` records for one translation session; the
/// indices hold `Arc`s handed out here. Discarded wholesale when a new trace
/// or binary is loaded, since resolutions are binary-specific.
#[derive(Debug, Default)]
pub struct LocationCache {
    entries: HashMap<CompactString, Arc<SourceLocation>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the shared location for `raw`, parsing and storing it on first
    /// encounter. Identical raw text always yields the same `Arc`.
    pub fn intern(&mut self, raw: &str, workspace: &WorkspaceContext) -> Arc<SourceLocation> {
        if let Some(hit) = self.entries.get(raw) {
            return Arc::clone(hit);
        }
        let location = Arc::new(parse_frame(raw, workspace));
        self.entries
            .insert(CompactString::from(raw), Arc::clone(&location));
        location
    }
}

fn parse_frame(raw: &str, workspace: &WorkspaceContext) -> SourceLocation {
    let (path, _) = raw.rsplit_once(':').unwrap_or((raw, ""));
    let line_number = frame_line_number(raw).unwrap_or(0);
    let workspace_relative_path = workspace.relativize(path).map(CompactString::from);
    let canonical_uri = workspace_relative_path
        .as_deref()
        .map(|relative| workspace.canonical_uri(relative));
    SourceLocation {
        absolute_path: path.to_owned(),
        workspace_relative_path,
        line_number,
        canonical_uri,
    }
}
