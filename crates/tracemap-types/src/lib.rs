use compact_str::CompactString;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    EmptyField(&'static str),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

/// The workspace a translation session resolves against: the directory name
/// used to classify resolver paths as in- or out-of-workspace, and the
/// filesystem root used to build canonical URIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceContext {
    name: String,
    fs_root: PathBuf,
}

impl WorkspaceContext {
    pub fn new(
        name: impl Into<String>,
        fs_root: impl Into<PathBuf>,
    ) -> Result<Self, InvariantError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvariantError::EmptyField("workspace name"));
        }
        Ok(Self {
            name,
            fs_root: fs_root.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_root(&self) -> &Path {
        &self.fs_root
    }

    /// Strips everything up to and including the workspace-name token (plus
    /// one separator) from an absolute resolver path.
    ///
    /// This is a substring search, not a path-prefix check: a workspace name
    /// that recurs earlier in the absolute path matches at that first
    /// occurrence.
    pub fn relativize<'a>(&self, absolute: &'a str) -> Option<&'a str> {
        let token_start = absolute.find(self.name.as_str())?;
        let rest_start = token_start + self.name.len() + 1;
        absolute.get(rest_start..).filter(|rest| !rest.is_empty())
    }

    /// Addressable form of a workspace-relative path.
    pub fn canonical_uri(&self, relative: &str) -> String {
        format!("file://{}/{relative}", self.fs_root.display())
    }
}

/// One matching line of the trace file. Built once during parsing, immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSample {
    /// Zero-based index of the originating line in the trace text.
    pub line_number: u32,
    /// Fixed-width hex address as it appeared in the trace, resolution key.
    pub program_counter: CompactString,
    pub cycle_count: u64,
    /// Character length of the originating line, for display ranges.
    pub raw_length: u32,
}

/// One resolved (file, line) pair, parsed from a single raw resolver frame
/// line. Owned by the session's location cache; everything else holds `Arc`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Path exactly as emitted by the resolver.
    pub absolute_path: String,
    /// Suffix after the workspace-name token; `None` when the token is absent
    /// from the path portion or nothing follows it.
    pub workspace_relative_path: Option<CompactString>,
    /// Line number as emitted by the resolver, numbering preserved unchanged.
    pub line_number: u32,
    /// `file://<fs root>/<relative>`; present iff the relative path is.
    pub canonical_uri: Option<String>,
}

/// A trace sample together with its inline frame chain, innermost frame
/// first. Never constructed with an empty chain.
#[derive(Debug, Clone)]
pub struct ResolvedTrace {
    pub sample: TraceSample,
    pub source_locations: Vec<Arc<SourceLocation>>,
}

/// One file-index entry: a trace line that resolved into the keyed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOccurrence {
    pub line_number: u32,
    pub raw_length: u32,
}

/// The external resolver process failed for one batch: spawn error, non-zero
/// exit, or missing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionProcessError {
    /// First and last trace line numbers of the failed batch.
    pub batch_lines: (u32, u32),
    /// Tool diagnostic: io error text, or exit status plus stderr.
    pub detail: String,
}

impl fmt::Display for ResolutionProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resolver failed for trace lines {}..={}: {}",
            self.batch_lines.0, self.batch_lines.1, self.detail
        )
    }
}

impl Error for ResolutionProcessError {}

/// The resolver ran but its output could not be segmented into one block per
/// submitted address. Indicates tool format drift, not a missing symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFormatError {
    pub batch_lines: (u32, u32),
    pub reason: String,
}

impl fmt::Display for ResolutionFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected resolver output for trace lines {}..={}: {}",
            self.batch_lines.0, self.batch_lines.1, self.reason
        )
    }
}

impl Error for ResolutionFormatError {}

/// Fatal translation failure. Malformed trace lines, unresolved addresses and
/// out-of-workspace frames are filtering policy, not errors, and never appear
/// here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    Process(ResolutionProcessError),
    Format(ResolutionFormatError),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(err) => write!(f, "{err}"),
            Self::Format(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TranslateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Process(err) => Some(err),
            Self::Format(err) => Some(err),
        }
    }
}

impl From<ResolutionProcessError> for TranslateError {
    fn from(value: ResolutionProcessError) -> Self {
        Self::Process(value)
    }
}

impl From<ResolutionFormatError> for TranslateError {
    fn from(value: ResolutionFormatError) -> Self {
        Self::Format(value)
    }
}
