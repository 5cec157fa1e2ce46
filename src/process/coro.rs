//! Coroutine contexts.
//!
//! User-space coroutine runtimes keep execution contexts the kernel knows
//! nothing about; their saved instruction pointers still count for stack
//! safety. Discovery is runtime-specific, so it hangs off the `CoroFinder`
//! seam: a finder recognizes a runtime inside the victim (by the objects it
//! has loaded) and extracts one saved register set per live coroutine.
//!
//! No finder is built in; registering one is enough to get its coroutines
//! verified, with no way to advance them past a patch site.

use crate::error::Result;
use crate::process::ptrace::VictimPort;
use crate::process::ObjectFile;

/// Saved execution context of one coroutine.
#[derive(Debug, Clone, Copy)]
pub struct CoroContext {
    pub id: usize,
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
}

pub trait CoroFinder {
    fn name(&self) -> &str;

    /// Inspect the victim and return any coroutine contexts it hosts.
    /// Returning an empty list means "runtime not present here".
    fn find(
        &mut self,
        port: &mut dyn VictimPort,
        objects: &[ObjectFile],
    ) -> Result<Vec<CoroContext>>;
}

/// Finders known to this build.
pub fn builtin_finders() -> Vec<Box<dyn CoroFinder>> {
    Vec::new()
}
