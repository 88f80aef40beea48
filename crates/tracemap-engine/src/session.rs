//! Translation session: owns the location cache and both indices for one
//! trace load, and drives the batch pipeline.
//!
//! Batches run strictly in trace order, one resolver process per batch, and
//! batch i+1 only starts after batch i's output has been parsed and committed
//! — block attribution is positional, so ordering is only meaningful within a
//! single invocation. A fatal error or a cooperative cancellation leaves the
//! indices populated up to the last committed batch; those entries stay
//! individually valid and queryable.

use compact_str::CompactString;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::blocks::{self, UNRESOLVED_PREFIX};
use crate::cache::{frame_line_number, LocationCache};
use crate::resolver::Resolver;
use crate::trace;
use tracemap_types::{
    FileOccurrence, ResolutionFormatError, ResolutionProcessError, ResolvedTrace, SourceLocation,
    TraceSample, TranslateError, WorkspaceContext,
};

/// Addresses resolved per external-tool invocation. Tunable; correctness does
/// not depend on it.
pub const RESOLVE_BATCH_SIZE: usize = 256;

/// Cooperative cancellation handle, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No translation has run since the session was created or cleared.
    Idle,
    Complete,
    /// Translation stopped at a batch boundary; committed batches remain.
    Cancelled,
    /// A batch failed; committed batches remain queryable but the indices are
    /// incomplete and the caller should warn its user.
    Failed,
}

/// Summary of one `translate` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateReport {
    /// Lines in the trace text, matching or not.
    pub total_lines: u32,
    /// Lines that matched the trace format.
    pub matched_samples: usize,
    /// Samples committed with at least one in-workspace location.
    pub committed_samples: usize,
    /// Batches fully committed.
    pub batches: usize,
    pub cancelled: bool,
}

pub struct TranslationSession {
    workspace: WorkspaceContext,
    batch_size: usize,
    cache: LocationCache,
    translation_index: BTreeMap<u32, ResolvedTrace>,
    file_index: BTreeMap<CompactString, Vec<FileOccurrence>>,
    status: SessionStatus,
}

impl TranslationSession {
    pub fn new(workspace: WorkspaceContext) -> Self {
        Self {
            workspace,
            batch_size: RESOLVE_BATCH_SIZE,
            cache: LocationCache::new(),
            translation_index: BTreeMap::new(),
            file_index: BTreeMap::new(),
            status: SessionStatus::Idle,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn workspace(&self) -> &WorkspaceContext {
        &self.workspace
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Discards cache and indices. Resolutions are binary-specific, so a new
    /// trace or binary always starts from an empty session.
    pub fn clear(&mut self) {
        self.cache = LocationCache::new();
        self.translation_index.clear();
        self.file_index.clear();
        self.status = SessionStatus::Idle;
    }

    /// Parses `trace_text`, resolves every matching sample against `binary`
    /// in fixed-size batches, and rebuilds both indices.
    ///
    /// Fatal errors mark the session failed but keep everything committed so
    /// far; samples whose frames are all unresolved or out-of-workspace are
    /// silently dropped, which is filtering policy rather than an error.
    pub async fn translate(
        &mut self,
        trace_text: &str,
        binary: &Path,
        resolver: &dyn Resolver,
        cancel: &CancelFlag,
    ) -> Result<TranslateReport, TranslateError> {
        self.clear();
        let started = Instant::now();
        let samples = trace::parse_trace(trace_text);
        let total_lines = trace_text.lines().count() as u32;
        let matched_samples = samples.len();

        let mut committed_samples = 0usize;
        let mut batches = 0usize;
        let mut cancelled = false;
        for batch in samples.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                warn!(
                    batches_committed = batches,
                    "translation cancelled at batch boundary"
                );
                cancelled = true;
                break;
            }
            let batch_started = Instant::now();
            let committed = self
                .resolve_batch(batch, binary, resolver)
                .await
                .inspect_err(|_| self.status = SessionStatus::Failed)?;
            committed_samples += committed;
            batches += 1;
            debug!(
                batch = batches,
                batch_samples = batch.len(),
                committed,
                elapsed_ms = batch_started.elapsed().as_millis() as u64,
                "batch committed"
            );
        }

        self.status = if cancelled {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Complete
        };
        info!(
            total_lines,
            matched_samples,
            committed_samples,
            batches,
            cancelled,
            cached_locations = self.cache.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "translation finished"
        );
        Ok(TranslateReport {
            total_lines,
            matched_samples,
            committed_samples,
            batches,
            cancelled,
        })
    }

    /// Resolves one batch and commits it into both indices. Returns the
    /// number of samples committed.
    async fn resolve_batch(
        &mut self,
        batch: &[TraceSample],
        binary: &Path,
        resolver: &dyn Resolver,
    ) -> Result<usize, TranslateError> {
        // chunks() never yields an empty slice
        let batch_lines = (
            batch[0].line_number,
            batch[batch.len() - 1].line_number,
        );

        // Distinct program counters, first-appearance order. One block of
        // resolver output comes back per distinct address, so samples sharing
        // an address share its block.
        let mut addresses: Vec<CompactString> = Vec::new();
        let mut address_order: HashMap<CompactString, usize> = HashMap::new();
        for sample in batch {
            if !address_order.contains_key(&sample.program_counter) {
                address_order.insert(sample.program_counter.clone(), addresses.len());
                addresses.push(sample.program_counter.clone());
            }
        }

        let output = resolver
            .resolve_batch(binary, &addresses)
            .await
            .map_err(|detail| ResolutionProcessError {
                batch_lines,
                detail,
            })?;
        let raw_blocks = blocks::parse_blocks(&output, addresses.len()).map_err(|reason| {
            ResolutionFormatError {
                batch_lines,
                reason,
            }
        })?;

        // Filter and intern each block's frames, innermost first as emitted.
        let mut chains: Vec<Vec<Arc<SourceLocation>>> = Vec::with_capacity(raw_blocks.len());
        for block in &raw_blocks {
            let mut chain = Vec::new();
            for frame in block {
                if frame.starts_with(UNRESOLVED_PREFIX) {
                    continue;
                }
                if !frame.contains(self.workspace.name()) {
                    continue;
                }
                if frame_line_number(frame).is_none() {
                    continue;
                }
                chain.push(self.cache.intern(frame, &self.workspace));
            }
            chains.push(chain);
        }

        // Commit in batch (= trace line) order so file-index occurrence lists
        // stay in trace order.
        let mut committed = 0usize;
        for sample in batch {
            let chain = &chains[address_order[&sample.program_counter]];
            if chain.is_empty() {
                continue;
            }
            let mut seen_paths: Vec<&CompactString> = Vec::new();
            for location in chain {
                let Some(relative) = &location.workspace_relative_path else {
                    continue;
                };
                if seen_paths.contains(&relative) {
                    continue;
                }
                seen_paths.push(relative);
                self.file_index
                    .entry(relative.clone())
                    .or_default()
                    .push(FileOccurrence {
                        line_number: sample.line_number,
                        raw_length: sample.raw_length,
                    });
            }
            self.translation_index.insert(
                sample.line_number,
                ResolvedTrace {
                    sample: sample.clone(),
                    source_locations: chain.clone(),
                },
            );
            committed += 1;
        }
        Ok(committed)
    }

    pub fn lookup_by_trace_line(&self, line_number: u32) -> Option<&ResolvedTrace> {
        self.translation_index.get(&line_number)
    }

    /// Every trace occurrence that resolved into `path`, in trace order.
    /// Empty when the path was never observed.
    pub fn lookup_by_source_path(&self, path: &str) -> &[FileOccurrence] {
        self.file_index
            .get(path)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Committed samples in trace line order.
    pub fn resolved_lines(&self) -> impl Iterator<Item = &ResolvedTrace> {
        self.translation_index.values()
    }

    /// Workspace-relative paths with at least one occurrence, sorted.
    pub fn indexed_paths(&self) -> impl Iterator<Item = &str> {
        self.file_index.keys().map(CompactString::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use std::sync::Mutex;

    /// Scripted stand-in for the external tool: maps each address to its
    /// frame lines and renders address-annotated output, failing from a given
    /// invocation onwards when asked to.
    struct ScriptedResolver {
        frames: HashMap<&'static str, Vec<&'static str>>,
        fail_from_call: Option<usize>,
        calls: Mutex<usize>,
    }

    impl ScriptedResolver {
        fn new(frames: &[(&'static str, &[&'static str])]) -> Self {
            Self {
                frames: frames
                    .iter()
                    .map(|(address, lines)| (*address, lines.to_vec()))
                    .collect(),
                fail_from_call: None,
                calls: Mutex::new(0),
            }
        }

        fn failing_from_call(mut self, call: usize) -> Self {
            self.fail_from_call = Some(call);
            self
        }
    }

    #[async_trait::async_trait]
    impl Resolver for ScriptedResolver {
        async fn resolve_batch(
            &self,
            _binary: &Path,
            addresses: &[CompactString],
        ) -> Result<String, String> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if let Some(fail_from) = self.fail_from_call
                && call >= fail_from
            {
                return Err("addr2line exited with status 1: boom".to_owned());
            }
            let mut output = String::new();
            for address in addresses {
                writeln!(output, "0x0000{address}").unwrap();
                for line in self
                    .frames
                    .get(address.as_str())
                    .unwrap_or(&vec!["??:0"])
                {
                    writeln!(output, "{line}").unwrap();
                }
            }
            Ok(output)
        }
    }

    fn session() -> TranslationSession {
        TranslationSession::new(WorkspaceContext::new("proj", "/home/ws/proj").unwrap())
    }

    fn trace_line(index: u64, cycles: u64, pc: &str) -> String {
        format!("     {index}      {cycles}       {pc}   add r0, r1")
    }

    const BINARY: &str = "/home/ws/proj/out/firmware.elf";

    #[tokio::test]
    async fn inline_chain_lands_in_both_indices() {
        let resolver = ScriptedResolver::new(&[(
            "1c001000",
            &["/home/ws/proj/src/foo.c:42", "/home/ws/proj/src/main.c:10"],
        )]);
        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        let report = session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.committed_samples, 1);
        assert_eq!(session.status(), SessionStatus::Complete);

        let resolved = session.lookup_by_trace_line(0).unwrap();
        assert_eq!(resolved.sample.cycle_count, 100);
        assert_eq!(resolved.source_locations.len(), 2);
        // Innermost frame first, exactly as emitted.
        assert_eq!(
            resolved.source_locations[0].workspace_relative_path.as_deref(),
            Some("src/foo.c")
        );
        assert_eq!(resolved.source_locations[0].line_number, 42);
        assert_eq!(
            resolved.source_locations[1].workspace_relative_path.as_deref(),
            Some("src/main.c")
        );

        let raw_length = trace_line(1, 100, "1c001000").chars().count() as u32;
        let expected = [FileOccurrence {
            line_number: 0,
            raw_length,
        }];
        assert_eq!(session.lookup_by_source_path("src/foo.c"), &expected);
        assert_eq!(session.lookup_by_source_path("src/main.c"), &expected);
    }

    #[tokio::test]
    async fn fully_unresolved_samples_stay_out_of_the_indices() {
        let resolver = ScriptedResolver::new(&[("1c001000", &["??:0"])]);
        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        let report = session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.matched_samples, 1);
        assert_eq!(report.committed_samples, 0);
        assert!(session.lookup_by_trace_line(0).is_none());
        assert!(session.indexed_paths().next().is_none());
    }

    #[tokio::test]
    async fn out_of_workspace_frames_are_dropped_but_others_kept() {
        let resolver = ScriptedResolver::new(&[(
            "1c001000",
            &["/usr/include/string.h:88", "/home/ws/proj/src/foo.c:42"],
        )]);
        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        let resolved = session.lookup_by_trace_line(0).unwrap();
        assert_eq!(resolved.source_locations.len(), 1);
        assert_eq!(
            resolved.source_locations[0].workspace_relative_path.as_deref(),
            Some("src/foo.c")
        );
        assert!(session.lookup_by_source_path("usr/include/string.h").is_empty());
    }

    #[tokio::test]
    async fn non_matching_lines_never_enter_the_indices() {
        let resolver =
            ScriptedResolver::new(&[("1c001000", &["/home/ws/proj/src/foo.c:42"])]);
        let text = format!("header\n{}\n\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        let report = session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.total_lines, 3);
        assert_eq!(report.matched_samples, 1);
        assert!(session.lookup_by_trace_line(0).is_none());
        assert!(session.lookup_by_trace_line(1).is_some());
        assert!(session.lookup_by_trace_line(2).is_none());
    }

    #[tokio::test]
    async fn repeated_addresses_share_one_cached_location() {
        let resolver =
            ScriptedResolver::new(&[("1c001000", &["/home/ws/proj/src/foo.c:42"])]);
        let text = format!(
            "{}\n{}\n",
            trace_line(1, 100, "1c001000"),
            trace_line(2, 250, "1c001000")
        );
        let mut session = session();
        session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        let first = &session.lookup_by_trace_line(0).unwrap().source_locations[0];
        let second = &session.lookup_by_trace_line(1).unwrap().source_locations[0];
        assert!(Arc::ptr_eq(first, second));
        assert_eq!(session.lookup_by_source_path("src/foo.c").len(), 2);
    }

    #[tokio::test]
    async fn same_file_inline_frames_yield_one_occurrence_per_sample() {
        let resolver = ScriptedResolver::new(&[(
            "1c001000",
            &["/home/ws/proj/src/foo.c:42", "/home/ws/proj/src/foo.c:7"],
        )]);
        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(
            session.lookup_by_trace_line(0).unwrap().source_locations.len(),
            2
        );
        assert_eq!(session.lookup_by_source_path("src/foo.c").len(), 1);
    }

    #[tokio::test]
    async fn file_index_entries_round_trip_into_the_translation_index() {
        let resolver = ScriptedResolver::new(&[
            ("1c001000", &["/home/ws/proj/src/foo.c:42"][..]),
            (
                "1c001004",
                &["/home/ws/proj/src/bar.c:7", "/home/ws/proj/src/foo.c:43"][..],
            ),
        ]);
        let text = format!(
            "{}\n{}\n",
            trace_line(1, 100, "1c001000"),
            trace_line(2, 250, "1c001004")
        );
        let mut session = session();
        session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        for path in session.indexed_paths().map(str::to_owned).collect::<Vec<_>>() {
            for occurrence in session.lookup_by_source_path(&path) {
                let resolved = session
                    .lookup_by_trace_line(occurrence.line_number)
                    .expect("file index entry without translation entry");
                assert!(resolved
                    .source_locations
                    .iter()
                    .any(|location| location.workspace_relative_path.as_deref() == Some(&*path)));
            }
        }
    }

    #[tokio::test]
    async fn batch_size_does_not_change_the_indices() {
        let frames: &[(&str, &[&str])] = &[
            ("1c001000", &["/home/ws/proj/src/foo.c:42"]),
            ("1c001004", &["/home/ws/proj/src/bar.c:7"]),
            ("1c001008", &["??:0"]),
            ("1c00100c", &["/home/ws/proj/src/foo.c:50"]),
        ];
        let text = format!(
            "{}\n{}\n{}\n{}\n{}\n",
            trace_line(1, 10, "1c001000"),
            trace_line(2, 20, "1c001004"),
            trace_line(3, 30, "1c001008"),
            trace_line(4, 40, "1c00100c"),
            trace_line(5, 50, "1c001000"),
        );

        let mut indices = Vec::new();
        for batch_size in [4, 2] {
            let resolver = ScriptedResolver::new(frames);
            let mut session = session().with_batch_size(batch_size);
            session
                .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
                .await
                .unwrap();
            let translation: Vec<(u32, Vec<(Option<String>, u32)>)> = session
                .resolved_lines()
                .map(|resolved| {
                    (
                        resolved.sample.line_number,
                        resolved
                            .source_locations
                            .iter()
                            .map(|location| {
                                (
                                    location
                                        .workspace_relative_path
                                        .as_deref()
                                        .map(str::to_owned),
                                    location.line_number,
                                )
                            })
                            .collect(),
                    )
                })
                .collect();
            let files: Vec<(String, Vec<FileOccurrence>)> = session
                .indexed_paths()
                .map(|path| (path.to_owned(), session.lookup_by_source_path(path).to_vec()))
                .collect();
            indices.push((translation, files));
        }
        assert_eq!(indices[0], indices[1]);
    }

    #[tokio::test]
    async fn process_failure_keeps_earlier_batches_queryable() {
        let resolver = ScriptedResolver::new(&[
            ("1c001000", &["/home/ws/proj/src/foo.c:42"][..]),
            ("1c001004", &["/home/ws/proj/src/bar.c:7"][..]),
        ])
        .failing_from_call(2);
        let text = format!(
            "{}\n{}\n",
            trace_line(1, 100, "1c001000"),
            trace_line(2, 250, "1c001004")
        );
        let mut session = session().with_batch_size(1);
        let err = session
            .translate(&text, Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap_err();
        let TranslateError::Process(process) = err else {
            panic!("expected a process error");
        };
        assert_eq!(process.batch_lines, (1, 1));
        assert_eq!(session.status(), SessionStatus::Failed);
        // Batch one was committed before the failure and stays queryable.
        assert!(session.lookup_by_trace_line(0).is_some());
        assert!(session.lookup_by_trace_line(1).is_none());
    }

    #[tokio::test]
    async fn malformed_output_is_a_format_error() {
        struct DriftingResolver;

        #[async_trait::async_trait]
        impl Resolver for DriftingResolver {
            async fn resolve_batch(
                &self,
                _binary: &Path,
                _addresses: &[CompactString],
            ) -> Result<String, String> {
                Ok("not an address block\n".to_owned())
            }
        }

        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let mut session = session();
        let err = session
            .translate(&text, Path::new(BINARY), &DriftingResolver, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Format(_)));
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn pre_set_cancel_flag_stops_before_the_first_batch() {
        let resolver =
            ScriptedResolver::new(&[("1c001000", &["/home/ws/proj/src/foo.c:42"])]);
        let text = format!("{}\n", trace_line(1, 100, "1c001000"));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut session = session();
        let report = session
            .translate(&text, Path::new(BINARY), &resolver, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.batches, 0);
        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert!(session.lookup_by_trace_line(0).is_none());
    }

    #[tokio::test]
    async fn empty_trace_translates_to_empty_indices() {
        let resolver = ScriptedResolver::new(&[]);
        let mut session = session();
        let report = session
            .translate("", Path::new(BINARY), &resolver, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.total_lines, 0);
        assert_eq!(report.batches, 0);
        assert_eq!(session.status(), SessionStatus::Complete);
    }
}
