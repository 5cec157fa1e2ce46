//! Error types shared across the crate.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("cannot open storage '{path}': {source}")]
    StorageUnavailable { path: String, source: io::Error },

    #[error("invalid patch: {reason}")]
    InvalidPatch { reason: String },

    #[error("cannot attach to process {pid}: {reason}")]
    AttachFailed { pid: i32, reason: String },

    #[error("remote i/o in process {pid}: {reason}")]
    RemoteIo { pid: i32, reason: String },

    #[error("{}", unsafe_stack_msg(.failed, .coroutine))]
    UnsafeStack { failed: usize, coroutine: bool },

    #[error("cannot place patch within jump range: {reason}")]
    LayoutUnreachable { reason: String },

    #[error("relocation failed: {reason}")]
    RelocationFailed { reason: String },

    #[error("patching '{object}' failed after earlier objects were patched")]
    PartialApply { object: String },

    #[error("cannot parse /proc entry: {reason}")]
    Proc { reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn unsafe_stack_msg(failed: &usize, coroutine: &bool) -> String {
    if *coroutine {
        format!("{} stack(s) unsafe for patching, including coroutine stacks", failed)
    } else {
        format!("{} stack(s) unsafe for patching", failed)
    }
}
