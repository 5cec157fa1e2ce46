//! Patch cancellation.
//!
//! The mapped patch region is self-contained: its hunk table and undo
//! table carry everything needed to restore the original code, so a patch
//! installed by an earlier run of the tool cancels just as well as one
//! applied moments ago.

use crate::error::{PatchError, Result};
use crate::patch::safety::{ensure_safety, Direction};
use crate::process::ProcessCtx;
use crate::storage::blob::{PatchHunk, HUNK_RECORD_SIZE, HUNK_SIZE, MAX_HUNKS};

/// Read the hunk table back out of the victim, one record at a time until
/// the end sentinel.
fn recover_hunks(proc: &mut ProcessCtx, idx: usize) -> Result<()> {
    if !proc.objects[idx].hunks.is_empty() {
        return Ok(());
    }
    let (kpta, user_info) = {
        let obj = &proc.objects[idx];
        let kpfile = obj.kpfile.as_ref().ok_or_else(|| PatchError::RemoteIo {
            pid: proc.pid,
            reason: format!("no patch header for '{}'", obj.name),
        })?;
        (obj.kpta, kpfile.user_info() as u64)
    };

    let mut hunks = Vec::new();
    let mut addr = kpta + user_info;
    loop {
        let mut raw = [0u8; HUNK_RECORD_SIZE];
        proc.port.read_mem(addr, &mut raw)?;
        let hunk = PatchHunk::from_bytes(&raw)?;
        if hunk.is_end() {
            break;
        }
        if hunks.len() >= MAX_HUNKS {
            return Err(PatchError::RemoteIo {
                pid: proc.pid,
                reason: format!("hunk table at 0x{:x} has no end sentinel", kpta + user_info),
            });
        }
        hunks.push(hunk);
        addr += HUNK_RECORD_SIZE as u64;
    }

    log::debug!("recovered {} hunk(s) from 0x{:x}", hunks.len(), kpta + user_info);
    proc.objects[idx].hunks = hunks;
    Ok(())
}

/// Remove the patch installed on object `idx`: restore the displaced bytes
/// and unmap the patch region. With `check_flag` set, only hunks marked
/// applied in this run are restored (the partial-apply rollback path);
/// otherwise every hunk is.
///
/// Returns the number of hunks restored.
pub fn unapply_one(proc: &mut ProcessCtx, idx: usize, check_flag: bool) -> Result<usize> {
    recover_hunks(proc, idx)?;

    let hunks = proc.objects[idx].hunks.clone();
    ensure_safety(
        proc.port.as_mut(),
        &mut proc.threads,
        &proc.coros,
        &hunks,
        Direction::Unapply,
    )?;

    let (name, kpta, kpta_size, user_undo) = {
        let obj = &proc.objects[idx];
        let kpfile = obj.kpfile.as_ref().ok_or_else(|| PatchError::RemoteIo {
            pid: proc.pid,
            reason: format!("no patch header for '{}'", obj.name),
        })?;
        (obj.name.clone(), obj.kpta, obj.kpta_size, kpfile.user_undo() as u64)
    };

    let mut restored = 0;
    for (i, hunk) in hunks.iter().enumerate() {
        if hunk.is_new_func() {
            continue;
        }
        if check_flag && !hunk.applied() {
            continue;
        }
        let undo_slot = kpta + user_undo + (i * HUNK_SIZE) as u64;
        let mut orig = [0u8; HUNK_SIZE];
        proc.port.read_mem(undo_slot, &mut orig)?;
        log::info!(
            "{} restoring 0x{:x}+0x{:x} from 0x{:x}",
            name,
            hunk.daddr,
            HUNK_SIZE,
            undo_slot
        );
        proc.port.write_mem(hunk.daddr, &orig)?;
        restored += 1;
    }

    // The victim's code is whole again; failing to give the region back is
    // worth a warning, not a failed cancel.
    if let Err(e) = proc.port.munmap_remote(kpta, kpta_size) {
        log::warn!("cannot unmap patch region at 0x{:x}: {}", kpta, e);
    }

    let p_idx = proc.objects[idx].applied_patch.take();
    let obj = &mut proc.objects[idx];
    obj.hunks.clear();
    obj.kpfile = None;
    obj.kpta = 0;
    obj.kpta_size = 0;
    obj.jmp_table = None;
    if let Some(p_idx) = p_idx {
        let patch = &mut proc.objects[p_idx];
        patch.is_patch = false;
        patch.patch_owner = None;
    }

    Ok(restored)
}

/// Does this object match the user's selection? An empty selection means
/// every patched object.
fn should_unapply(obj: &crate::process::ObjectFile, ids: &[String]) -> bool {
    if ids.is_empty() {
        return true;
    }
    ids.iter().any(|id| {
        obj.name == *id || obj.buildid.as_deref() == Some(id.as_str())
    })
}

/// Cancel the installed patches selected by `ids` (Build-IDs or object
/// names). Returns the number of hunks restored across all objects.
pub fn unapply_patches(proc: &mut ProcessCtx, ids: &[String]) -> Result<usize> {
    proc.associate_patches()?;

    let mut restored = 0;
    for idx in 0..proc.objects.len() {
        if proc.objects[idx].applied_patch.is_none() {
            continue;
        }
        if !should_unapply(&proc.objects[idx], ids) {
            continue;
        }
        restored += unapply_one(proc, idx, false)?;
    }

    Ok(restored)
}
