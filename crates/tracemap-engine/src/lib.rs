//! Trace-to-source correlation engine.
//!
//! Takes a cycle-accurate instruction trace (one program-counter sample per
//! line) and a binary with debug info, resolves program counters to source
//! locations through an external addr2line-style tool in fixed-size batches,
//! and builds the bidirectional indices behind "which source does this trace
//! line map to?" and "which trace lines land in this file?".

pub mod blocks;
pub mod cache;
pub mod resolver;
pub mod session;
pub mod trace;

pub use cache::LocationCache;
pub use resolver::{Addr2Line, Resolver, DEFAULT_RESOLVER_PROGRAM};
pub use session::{
    CancelFlag, SessionStatus, TranslateReport, TranslationSession, RESOLVE_BATCH_SIZE,
};
pub use trace::{parse_trace, parse_trace_line};
