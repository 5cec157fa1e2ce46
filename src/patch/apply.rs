//! Patch installation.
//!
//! Per object: duplicate the storage blob, lay out the remote image (blob,
//! jump table, undo table), map it near the victim code, relocate, write it
//! over, prove the stacks safe, then redirect each patched entry point with
//! a 5-byte jump. Version replacement cancels an older installed patch
//! first; a mid-install failure rolls back the failing object.

use crate::error::{PatchError, Result};
use crate::patch::cancel;
use crate::patch::relocate::{self, JMP_SLOT_SIZE};
use crate::patch::safety::{ensure_safety, Direction};
use crate::process::maps::find_gap_near;
use crate::process::{ObjectFile, ProcessCtx};
use crate::storage::blob::{PatchHunk, FLAG_APPLIED, HUNK_SIZE, MAX_HUNKS};

const PAGE_SIZE: u64 = 4096;

fn round_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// The jump planted at each patched entry: `e9 disp32`.
fn jump_code(daddr: u64, saddr: u64) -> Result<[u8; HUNK_SIZE]> {
    let disp = (saddr as i64)
        .wrapping_sub(daddr as i64)
        .wrapping_sub(HUNK_SIZE as i64);
    if disp > i32::MAX as i64 || disp < i32::MIN as i64 {
        return Err(PatchError::LayoutUnreachable {
            reason: format!(
                "jump from 0x{:x} to 0x{:x} needs displacement 0x{:x}",
                daddr, saddr, disp
            ),
        });
    }
    let disp = (disp as i32).to_le_bytes();
    Ok([0xe9, disp[0], disp[1], disp[2], disp[3]])
}

/// Add the object's load bias to every destination address in the blob's
/// hunk table, so the copy installed in the victim is self-contained.
fn bias_hunk_table(blob: &mut crate::storage::blob::PatchBlob, info_off: usize, bias: u64) {
    if bias == 0 {
        return;
    }
    let hunks = blob.hunks_at(info_off, MAX_HUNKS).unwrap_or_default();
    let bytes = blob.bytes_mut();
    for (i, hunk) in hunks.iter().enumerate() {
        if hunk.is_new_func() {
            continue;
        }
        let off = info_off + i * crate::storage::blob::HUNK_RECORD_SIZE;
        let daddr = hunk.daddr.wrapping_add(bias);
        bytes[off..off + 8].copy_from_slice(&daddr.to_le_bytes());
    }
}

/// Cancel an installed older patch when storage carries a strictly newer
/// level. Leaves `applied_patch` set when the installed level is already
/// current, which makes the subsequent apply a no-op.
fn unapply_old_patch(proc: &mut ProcessCtx, idx: usize) -> Result<()> {
    let obj = &proc.objects[idx];
    if obj.skpfile.is_none() || obj.is_patch || obj.applied_patch.is_none() {
        return Ok(());
    }
    let Some(installed) = obj.kpfile.as_ref() else {
        return Ok(());
    };

    let installed_level = installed.user_level();
    let storage_level = obj.skpfile.as_ref().unwrap().user_level();
    if installed_level >= storage_level {
        log::info!(
            "'{}' applied patch level is {} (storage has {})",
            obj.name,
            installed_level,
            storage_level
        );
        return Ok(());
    }

    println!(
        "{}: replacing patch level {} with level {}",
        obj.name, installed_level, storage_level
    );
    cancel::unapply_one(proc, idx, false)?;
    Ok(())
}

/// Install the patch attached to object `idx`. Returns the number of hunks
/// written; 0 when there is nothing to do.
fn apply_one(proc: &mut ProcessCtx, idx: usize) -> Result<usize> {
    let (name, text_start, load_bias) = {
        let obj = &proc.objects[idx];
        if obj.skpfile.is_none() || obj.is_patch {
            return Ok(0);
        }
        if obj.applied_patch.is_some() {
            log::info!("object '{}' already have a patch, not patching", obj.name);
            return Ok(0);
        }
        (obj.name.clone(), obj.text_start, obj.load_bias)
    };

    // The installer stamps header fields, so it works on its own copy.
    let mut kpfile = (**proc.objects[idx].skpfile.as_ref().unwrap()).clone();
    let rel = relocate::load_rel_info(&kpfile)?;
    let ninfo = rel.hunks.len();

    let mut sz = round_up(kpfile.total_size() as u64, 8);
    let jmp_table = if rel.undefined.is_empty() {
        None
    } else {
        let table = relocate::build_jmp_table(&rel.undefined, &proc.objects[idx].symbols)?;
        kpfile.set_jmp_offset(sz as u32);
        log::info!(
            "jump table {} bytes for {} sym(s) at offset 0x{:x}",
            table.len(),
            rel.undefined.len(),
            sz
        );
        sz = round_up(sz + (rel.undefined.len() * JMP_SLOT_SIZE) as u64, 128);
        Some(table)
    };
    kpfile.set_user_info(rel.info_offset);
    kpfile.set_user_undo(sz as u32);
    sz = round_up(sz + (HUNK_SIZE * ninfo) as u64, 16);
    sz = round_up(sz, PAGE_SIZE);

    // Map the patch as close to the original code as the address space
    // allows; 32-bit jumps cannot reach a careless placement.
    let regions = proc.port.maps()?;
    let hint = find_gap_near(&regions, text_start, sz)?;
    let kpta = proc.port.mmap_remote(hint, sz)?;

    let body = (|| -> Result<Vec<PatchHunk>> {
        relocate::relocate(&mut kpfile, kpta, &rel.undefined)?;
        bias_hunk_table(&mut kpfile, rel.info_offset as usize, load_bias);

        let hunks = kpfile.hunks_at(rel.info_offset as usize, MAX_HUNKS)?;

        // Every displacement must fit before any byte is written.
        for hunk in hunks.iter().filter(|h| !h.is_new_func()) {
            jump_code(hunk.daddr, hunk.saddr)?;
        }

        let total = kpfile.total_size() as usize;
        proc.port.write_mem(kpta, &kpfile.bytes()[..total])?;
        if let Some(table) = &jmp_table {
            proc.port
                .write_mem(kpta + kpfile.jmp_offset() as u64, table)?;
        }

        ensure_safety(
            proc.port.as_mut(),
            &mut proc.threads,
            &proc.coros,
            &hunks,
            Direction::Apply,
        )?;
        Ok(hunks)
    })();

    let mut hunks = match body {
        Ok(hunks) => hunks,
        Err(e) => {
            // Nothing reached the victim's code yet; just give the region back.
            if let Err(e2) = proc.port.munmap_remote(kpta, sz) {
                log::warn!("cannot release patch region at 0x{:x}: {}", kpta, e2);
            }
            return Err(e);
        }
    };

    let user_undo = kpfile.user_undo() as u64;
    let mut installed = 0;
    let mut install_err = None;
    for (i, hunk) in hunks.iter_mut().enumerate() {
        if hunk.is_new_func() {
            continue;
        }
        let result = (|| -> Result<()> {
            let mut orig = [0u8; HUNK_SIZE];
            proc.port.read_mem(hunk.daddr, &mut orig)?;
            let undo_slot = kpta + user_undo + (i * HUNK_SIZE) as u64;
            log::info!(
                "{} origcode from 0x{:x}+0x{:x} to 0x{:x}",
                name,
                hunk.daddr,
                HUNK_SIZE,
                undo_slot
            );
            proc.port.write_mem(undo_slot, &orig)?;

            log::info!(
                "{} hunk 0x{:x}+0x{:x} -> 0x{:x}+0x{:x}",
                name,
                hunk.daddr,
                hunk.dlen,
                hunk.saddr,
                hunk.slen
            );
            let code = jump_code(hunk.daddr, hunk.saddr)?;
            proc.port.write_mem(hunk.daddr, &code)
        })();
        match result {
            Ok(()) => {
                // Marked only after the victim write went through, so a
                // rollback restores exactly what was changed.
                hunk.flags |= FLAG_APPLIED;
                installed += 1;
            }
            Err(e) => {
                install_err = Some(e);
                break;
            }
        }
    }

    // Record the installed state even on a partial failure: the rollback
    // path needs the hunk table and flags to undo precisely.
    let p_idx = proc.objects.len();
    proc.objects.push(ObjectFile {
        name: "[kpatch]".to_string(),
        is_patch: true,
        base: kpta,
        kpta,
        kpta_size: sz,
        patch_owner: Some(idx),
        ..Default::default()
    });
    let obj = &mut proc.objects[idx];
    obj.applied_patch = Some(p_idx);
    obj.kpfile = Some(kpfile);
    obj.kpta = kpta;
    obj.kpta_size = sz;
    obj.hunks = hunks;
    obj.jmp_table = jmp_table;

    match install_err {
        Some(e) => Err(e),
        None => Ok(installed),
    }
}

/// Apply patches across all of the process's objects, in discovery order.
/// On a mid-run failure the failing object is rolled back; objects patched
/// earlier in the run stay patched.
pub fn apply_patches(proc: &mut ProcessCtx) -> Result<usize> {
    let mut applied = 0;

    for idx in 0..proc.objects.len() {
        unapply_old_patch(proc, idx)?;

        match apply_one(proc, idx) {
            Ok(n) => applied += n,
            Err(e) => {
                let name = proc.objects[idx].name.clone();
                log::error!(
                    "patching '{}' failed, unapplying partially applied patch: {}",
                    name,
                    e
                );
                // TODO: also unpatch the objects already patched in this
                // run, so a failed multi-object apply leaves no holes.
                if proc.objects[idx].applied_patch.is_some() {
                    if let Err(e2) = cancel::unapply_one(proc, idx, true) {
                        log::error!("can't unapply patch for '{}': {}", name, e2);
                    }
                }
                if applied > 0 {
                    return Err(PatchError::PartialApply { object: name });
                }
                return Err(e);
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::patch::cancel::unapply_patches;
    use crate::process::ptrace::Regs;
    use crate::storage::blob::{BLOB_MAGIC, HEADER_SIZE};
    use crate::testutil::{build_blob, MockVictim, TEST_TEXT_OFFSET};

    const TEXT_BASE: u64 = 0x400000;
    const DADDR: u64 = 0x400100;

    /// Original function prologue at the patch site.
    const ORIG: [u8; 5] = [0x55, 0x48, 0x89, 0xe5, 0x90];

    fn make_victim() -> MockVictim {
        let victim = MockVictim::new(100);
        let mut text = vec![0x90u8; 0x1000];
        text[(DADDR - TEXT_BASE) as usize..(DADDR - TEXT_BASE) as usize + 5]
            .copy_from_slice(&ORIG);
        victim.map_region(TEXT_BASE, text);
        // One thread parked outside any patch range.
        victim.add_thread(100, Regs { ip: 0x9000, sp: 0, bp: 0 });
        victim
    }

    fn make_object(name: &str, buildid: &str, blob: crate::storage::blob::PatchBlob) -> ObjectFile {
        ObjectFile {
            name: name.into(),
            buildid: Some(buildid.into()),
            is_elf: true,
            base: TEXT_BASE,
            text_start: TEXT_BASE,
            text_end: TEXT_BASE + 0x1000,
            skpfile: Some(Rc::new(blob)),
            ..Default::default()
        }
    }

    fn make_proc(victim: &MockVictim) -> ProcessCtx {
        let mut proc = ProcessCtx::with_port(100, "sleeper", Box::new(victim.clone()));
        proc.attach().unwrap();
        proc
    }

    fn expected_jump(daddr: u64, saddr: u64) -> [u8; 5] {
        let disp = (saddr as i64 - daddr as i64 - 5) as i32;
        let d = disp.to_le_bytes();
        [0xe9, d[0], d[1], d[2], d[3]]
    }

    #[test]
    fn jump_code_encodes_disp32() {
        let code = jump_code(0x400100, 0x500100).unwrap();
        assert_eq!(code, [0xe9, 0xfb, 0xff, 0x0f, 0x00]);
    }

    #[test]
    fn jump_code_rejects_far_targets() {
        let err = jump_code(0x400100, 0x7f00_0000_0100).unwrap_err();
        assert!(matches!(err, PatchError::LayoutUnreachable { .. }));
    }

    #[test]
    fn applies_single_hunk() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        let applied = apply_patches(&mut proc).unwrap();
        assert_eq!(applied, 1);

        let obj = &proc.objects[0];
        let kpta = obj.kpta;
        assert_ne!(kpta, 0);

        // The patch region holds the blob, starting with its magic.
        assert_eq!(victim.peek(kpta, 8), BLOB_MAGIC);

        // The hunk's replacement address points into the mapped image.
        let hunk = obj.hunks[0];
        assert_eq!(hunk.saddr, kpta + HEADER_SIZE as u64 + TEST_TEXT_OFFSET + 0x10);
        assert!(hunk.applied());

        // The entry point carries the 5-byte jump, and the displaced bytes
        // sit in the undo table.
        assert_eq!(victim.peek(DADDR, 5), expected_jump(DADDR, hunk.saddr));
        let undo = kpta + obj.kpfile.as_ref().unwrap().user_undo() as u64;
        assert_eq!(victim.peek(undo, 5), ORIG);

        // Jump displacement fits a signed 32-bit value by construction.
        let disp = hunk.saddr as i64 - hunk.daddr as i64 - 5;
        assert!(disp.abs() < (1i64 << 31));
    }

    #[test]
    fn apply_then_cancel_restores_bytes() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        apply_patches(&mut proc).unwrap();
        let kpta = proc.objects[0].kpta;
        let kpta_size = proc.objects[0].kpta_size;

        let cancelled = unapply_patches(&mut proc, &[]).unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(victim.peek(DADDR, 5), ORIG);
        assert!(victim.unmapped().contains(&(kpta, kpta_size)));
        assert!(!victim.is_mapped(kpta));
        assert!(proc.objects[0].applied_patch.is_none());
    }

    #[test]
    fn reapply_after_cancel_matches_fresh_apply() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        apply_patches(&mut proc).unwrap();
        let first = victim.peek(DADDR, 5);
        unapply_patches(&mut proc, &[]).unwrap();
        // The patch object entry left behind is inert; apply again.
        let applied = apply_patches(&mut proc).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(victim.peek(DADDR, 5), first);
    }

    #[test]
    fn double_apply_is_a_no_op() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        assert_eq!(apply_patches(&mut proc).unwrap(), 1);
        let bytes = victim.peek(DADDR, 5);
        // Same storage blob, same level: nothing to do.
        assert_eq!(apply_patches(&mut proc).unwrap(), 0);
        assert_eq!(victim.peek(DADDR, 5), bytes);
    }

    #[test]
    fn newer_level_replaces_installed_patch() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob_v1 = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob_v1));

        apply_patches(&mut proc).unwrap();
        let old_kpta = proc.objects[0].kpta;

        let blob_v2 = build_blob("B0", 2, &[(DADDR, 16, 0x20, 32)], &[]);
        proc.objects[0].skpfile = Some(Rc::new(blob_v2));

        let applied = apply_patches(&mut proc).unwrap();
        assert_eq!(applied, 1);

        let obj = &proc.objects[0];
        assert_eq!(obj.kpfile.as_ref().unwrap().user_level(), 2);
        assert!(victim.unmapped().iter().any(|(addr, _)| *addr == old_kpta));
        // The site now jumps into the new image.
        assert_eq!(victim.peek(DADDR, 5), expected_jump(DADDR, obj.hunks[0].saddr));
    }

    #[test]
    fn same_level_is_not_replaced() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob_v1 = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob_v1.clone()));

        apply_patches(&mut proc).unwrap();
        let kpta = proc.objects[0].kpta;

        proc.objects[0].skpfile = Some(Rc::new(blob_v1));
        assert_eq!(apply_patches(&mut proc).unwrap(), 0);
        assert_eq!(proc.objects[0].kpta, kpta);
        assert!(victim.unmapped().is_empty());
    }

    #[test]
    fn new_function_hunks_are_not_installed() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        // Second record is a pure addition: daddr == 0, dlen == 0.
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32), (0, 0, 0x40, 64)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        let applied = apply_patches(&mut proc).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(proc.objects[0].hunks.len(), 2);
        assert!(proc.objects[0].hunks[1].is_new_func());
        assert!(!proc.objects[0].hunks[1].applied());

        assert_eq!(unapply_patches(&mut proc, &[]).unwrap(), 1);
        assert_eq!(victim.peek(DADDR, 5), ORIG);
    }

    #[test]
    fn jump_table_is_written_for_undefined_symbols() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &["helper"]);
        let mut obj = make_object("libx", "B0", blob);
        obj.symbols.insert("helper".into(), 0x400800);
        proc.objects.push(obj);

        apply_patches(&mut proc).unwrap();

        let obj = &proc.objects[0];
        let kpta = obj.kpta;
        let jmp_off = obj.kpfile.as_ref().unwrap().jmp_offset() as u64;
        assert_ne!(jmp_off, 0);
        let slot = victim.peek(kpta + jmp_off, 16);
        assert_eq!(&slot[0..6], &[0xff, 0x25, 0, 0, 0, 0]);
        assert_eq!(&slot[6..14], &0x400800u64.to_le_bytes());
    }

    #[test]
    fn missing_undefined_symbol_fails_and_rolls_back() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &["helper"]);
        // No symbols registered on the object: resolution must fail.
        proc.objects.push(make_object("libx", "B0", blob));

        let err = apply_patches(&mut proc).unwrap_err();
        assert!(matches!(err, PatchError::RelocationFailed { .. }));
        assert_eq!(victim.peek(DADDR, 5), ORIG);
        assert!(proc.objects[0].applied_patch.is_none());
    }

    #[test]
    fn blocked_thread_is_advanced_before_install() {
        let victim = make_victim();
        // The thread sits inside the function about to be patched, with a
        // frame whose return address is in its caller.
        victim.map_region(0x7000, vec![0; 0x20]);
        victim.poke(0x7008, &0x9000u64.to_le_bytes());
        victim.set_thread_regs(100, Regs { ip: DADDR + 3, sp: 0x6ff0, bp: 0x7000 });
        let mut proc = make_proc(&victim);

        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        let applied = apply_patches(&mut proc).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(victim.execute_until_calls(), 1);
        assert_eq!(victim.thread_regs(100).ip, 0x9000);
    }

    #[test]
    fn unsafe_coroutine_aborts_with_no_writes() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));
        proc.coros.push(crate::process::coro::CoroContext {
            id: 0,
            ip: DADDR + 4,
            sp: 0,
            bp: 0,
        });

        let err = apply_patches(&mut proc).unwrap_err();
        assert!(matches!(err, PatchError::UnsafeStack { coroutine: true, .. }));
        assert_eq!(victim.peek(DADDR, 5), ORIG);
        // The staged patch region was handed back.
        assert_eq!(victim.execute_until_calls(), 0);
        assert_eq!(victim.unmapped().len(), 1);
    }

    #[test]
    fn selective_unpatch_by_name() {
        let victim = make_victim();
        // A second object with its own entry point.
        let daddr_y = 0x600100u64;
        let mut text_y = vec![0x90u8; 0x1000];
        text_y[0x100..0x105].copy_from_slice(&ORIG);
        victim.map_region(0x600000, text_y);

        let mut proc = make_proc(&victim);
        proc.objects.push(make_object("libx", "B0", build_blob(
            "B0", 1, &[(DADDR, 16, 0x10, 32)], &[],
        )));
        let mut liby = make_object("liby", "B1", build_blob(
            "B1", 1, &[(daddr_y, 16, 0x10, 32)], &[],
        ));
        liby.base = 0x600000;
        liby.text_start = 0x600000;
        liby.text_end = 0x601000;
        proc.objects.push(liby);

        assert_eq!(apply_patches(&mut proc).unwrap(), 2);
        let libx_patched = victim.peek(DADDR, 5);

        let cancelled = unapply_patches(&mut proc, &["liby".to_string()]).unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(victim.peek(daddr_y, 5), ORIG);
        // libx stays patched.
        assert_eq!(victim.peek(DADDR, 5), libx_patched);
        assert!(proc.objects[0].applied_patch.is_some());
        assert!(proc.objects[1].applied_patch.is_none());
    }

    #[test]
    fn cancel_recovers_hunks_from_remote_table() {
        let victim = make_victim();
        let mut proc = make_proc(&victim);
        let blob = build_blob("B0", 1, &[(DADDR, 16, 0x10, 32)], &[]);
        proc.objects.push(make_object("libx", "B0", blob));

        apply_patches(&mut proc).unwrap();

        // Forget the local hunk table, as a fresh run of the tool would
        // have to; cancellation must rebuild it from the victim.
        proc.objects[0].hunks.clear();

        let cancelled = unapply_patches(&mut proc, &[]).unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(victim.peek(DADDR, 5), ORIG);
    }
}
