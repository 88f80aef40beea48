//! Resolver invoker.
//!
//! One external process per batch: spawn, wait, buffer the whole output. The
//! tool is never kept open across batches and never retried — it is assumed
//! deterministic, so a failure means the inputs are wrong, not transient.

use async_trait::async_trait;
use compact_str::CompactString;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

/// Address-to-source resolver for one batch of program counters. The failure
/// string is the tool diagnostic; the session wraps it with the batch's trace
/// line range.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_batch(
        &self,
        binary: &Path,
        addresses: &[CompactString],
    ) -> Result<String, String>;
}

pub const DEFAULT_RESOLVER_PROGRAM: &str = "addr2line";

/// The stock binutils/LLVM `addr2line` tool, invoked with address echoes
/// (`-a`) and inline frame chains (`-i`) so its output segments into one
/// block per input address, innermost frame first.
#[derive(Debug, Clone)]
pub struct Addr2Line {
    program: CompactString,
}

impl Addr2Line {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_RESOLVER_PROGRAM)
    }

    pub fn with_program(program: impl Into<CompactString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for Addr2Line {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for Addr2Line {
    async fn resolve_batch(
        &self,
        binary: &Path,
        addresses: &[CompactString],
    ) -> Result<String, String> {
        let mut command = tokio::process::Command::new(self.program.as_str());
        command
            .arg("-e")
            .arg(binary)
            .arg("-a")
            .arg("-i")
            .stdin(Stdio::null());
        for address in addresses {
            command.arg(address.as_str());
        }

        debug!(
            program = %self.program,
            binary = %binary.display(),
            addresses = addresses.len(),
            "invoking resolver"
        );
        let output = command
            .output()
            .await
            .map_err(|error| format!("failed to spawn {}: {error}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
