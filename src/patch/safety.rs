//! Stack-safety verification.
//!
//! Before any 5-byte entry rewrite, every thread and coroutine stack is
//! walked to prove no in-flight frame sits inside a region about to change:
//! the original function bodies when applying, the patch bodies when
//! removing. Threads that fail can be run forward to a safe return address
//! and re-checked; coroutines cannot be advanced, so a coroutine failure is
//! final.

use crate::error::{PatchError, Result};
use crate::process::coro::CoroContext;
use crate::process::ptrace::{Regs, VictimPort, EXECUTE_TIMEOUT};
use crate::process::ThreadCtx;
use crate::storage::blob::PatchHunk;
use crate::unwind::{FrameCursor, StackCursor};

/// OR-ed into the failed-stack count when a coroutine stack is unsafe.
pub const CORO_STACK_UNSAFE: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Unapply,
}

impl Direction {
    /// Is `ip` inside the range this operation is about to overwrite?
    pub fn in_hunk(self, ip: u64, hunk: &PatchHunk) -> bool {
        let (start, len) = match self {
            Direction::Apply => (hunk.daddr, hunk.dlen as u64),
            Direction::Unapply => (hunk.saddr, hunk.slen as u64),
        };
        ip >= start && ip < start + len
    }

    fn unsafe_addr(self, hunk: &PatchHunk) -> u64 {
        match self {
            Direction::Apply => hunk.daddr,
            Direction::Unapply => hunk.saddr,
        }
    }
}

/// Walk one stack and decide whether it blocks the operation.
///
/// Returns `(unsafe_addr, retip)`. `unsafe_addr` is 0 for a safe stack;
/// otherwise it names a hunk an in-flight frame was found in. `retip` is
/// the instruction pointer of the first frame past the blocking ones, i.e.
/// the address the thread can be run to; 0 when no such frame was seen.
///
/// For a call chain `foo -> bar+ -> baz -> qux+` (patched functions marked
/// `+`), non-paranoid mode reports `qux`'s hunk with `retip` in `baz`.
/// Paranoid mode keeps walking and reports the outermost patched frame
/// (`bar`) with `retip` in `foo`; that is only used for diagnostics.
pub fn verify_one(
    cursor: &mut dyn StackCursor,
    hunks: &[PatchHunk],
    dir: Direction,
    paranoid: bool,
) -> Result<(u64, u64)> {
    let mut last = 0u64;
    let mut retip = 0u64;
    let mut prev_in_hunk = false;

    loop {
        let ip = cursor.ip();

        let hit = hunks
            .iter()
            .filter(|h| !h.is_new_func())
            .find(|h| dir.in_hunk(ip, h));

        match hit {
            Some(hunk) => {
                last = dir.unsafe_addr(hunk);
                prev_in_hunk = true;
            }
            None if prev_in_hunk => {
                prev_in_hunk = false;
                retip = ip;
                if !paranoid {
                    break;
                }
            }
            None => {}
        }

        if !cursor.step()? {
            break;
        }
    }

    Ok((last, retip))
}

/// Check every coroutine and thread stack of the process.
///
/// Returns the number of unsafe stacks, with `CORO_STACK_UNSAFE` OR-ed in
/// if any coroutine was among them. When `retips` is given, slot `i`
/// receives the safe return address for thread `i`.
pub fn verify(
    port: &mut dyn VictimPort,
    threads: &[ThreadCtx],
    coros: &[CoroContext],
    hunks: &[PatchHunk],
    dir: Direction,
    mut retips: Option<&mut [u64]>,
) -> Result<u64> {
    let mut failed = 0u64;

    for coro in coros {
        log::debug!("verifying safety for coroutine {}...", coro.id);
        let regs = Regs { ip: coro.ip, sp: coro.sp, bp: coro.bp };
        let mut cursor = FrameCursor::new(&mut *port, regs);
        let (unsafe_addr, _) = verify_one(&mut cursor, hunks, dir, false)?;
        if unsafe_addr != 0 {
            log::error!("coroutine {} stack blocked by 0x{:x}", coro.id, unsafe_addr);
            failed += 1;
        }
    }
    if failed != 0 {
        return Ok(failed | CORO_STACK_UNSAFE);
    }

    for (i, thread) in threads.iter().enumerate() {
        log::debug!("verifying safety for thread {}...", thread.tid);
        let regs = port.getregs(thread.tid)?;
        let mut cursor = FrameCursor::new(&mut *port, regs);
        let (unsafe_addr, retip) = verify_one(&mut cursor, hunks, dir, false)?;
        if unsafe_addr != 0 {
            match retips.as_deref_mut() {
                Some(slots) => {
                    log::error!(
                        "thread {} blocked by 0x{:x}, will continue until 0x{:x}",
                        thread.tid,
                        unsafe_addr,
                        retip
                    );
                    slots[i] = retip;
                }
                None => {
                    log::error!("thread {} blocked by 0x{:x}", thread.tid, unsafe_addr);
                }
            }
            failed += 1;
        }
    }

    Ok(failed)
}

/// Prove the operation safe, advancing blocked threads once if needed.
///
/// The check-advance-recheck sequence: verify all stacks; on a thread-only
/// failure, run each blocked thread to its recorded safe return address
/// (3000-second budget), re-attach to pick up any threads spawned while the
/// process ran, and verify once more. A second failure, or any coroutine
/// failure, ends the operation.
pub fn ensure_safety(
    port: &mut dyn VictimPort,
    threads: &mut Vec<ThreadCtx>,
    coros: &[CoroContext],
    hunks: &[PatchHunk],
    dir: Direction,
) -> Result<()> {
    let mut retips = vec![0u64; threads.len()];
    let failed = verify(&mut *port, threads, coros, hunks, dir, Some(&mut retips))?;
    if failed == 0 {
        return Ok(());
    }
    if failed & CORO_STACK_UNSAFE != 0 {
        return Err(PatchError::UnsafeStack {
            failed: (failed & !CORO_STACK_UNSAFE) as usize,
            coroutine: true,
        });
    }

    for (thread, retip) in threads.iter_mut().zip(&retips) {
        thread.execute_until = *retip;
    }
    let targets: Vec<(i32, u64)> = threads.iter().map(|t| (t.tid, t.execute_until)).collect();
    port.execute_until(&targets, EXECUTE_TIMEOUT)?;

    // The process ran; it may have spawned threads we have not seen.
    let tids = port.attach()?;
    *threads = tids
        .into_iter()
        .map(|tid| ThreadCtx { tid, execute_until: 0 })
        .collect();

    let failed = verify(&mut *port, threads, coros, hunks, dir, None)?;
    if failed != 0 {
        return Err(PatchError::UnsafeStack {
            failed: (failed & !CORO_STACK_UNSAFE) as usize,
            coroutine: failed & CORO_STACK_UNSAFE != 0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockVictim, VecCursor};

    fn hunk(daddr: u64, dlen: u32, saddr: u64, slen: u32) -> PatchHunk {
        PatchHunk { daddr, saddr, dlen, slen, flags: 0 }
    }

    #[test]
    fn direction_selects_range() {
        let h = hunk(0x1000, 16, 0x2000, 32);
        assert!(Direction::Apply.in_hunk(0x1000, &h));
        assert!(Direction::Apply.in_hunk(0x100f, &h));
        assert!(!Direction::Apply.in_hunk(0x1010, &h));
        assert!(!Direction::Apply.in_hunk(0x2000, &h));
        assert!(Direction::Unapply.in_hunk(0x2000, &h));
        assert!(Direction::Unapply.in_hunk(0x201f, &h));
        assert!(!Direction::Unapply.in_hunk(0x1000, &h));
    }

    #[test]
    fn clean_stack_is_safe() {
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];
        let mut cursor = VecCursor::new(vec![0x5000, 0x5100, 0x5200]);
        let (unsafe_addr, retip) =
            verify_one(&mut cursor, &hunks, Direction::Apply, false).unwrap();
        assert_eq!(unsafe_addr, 0);
        assert_eq!(retip, 0);
    }

    #[test]
    fn innermost_hit_reports_first_safe_frame() {
        // qux+ -> baz -> bar+ -> foo, innermost first.
        let hunks = [hunk(0x1000, 16, 0, 0), hunk(0x3000, 16, 0, 0)];
        let mut cursor = VecCursor::new(vec![0x1004, 0x9000, 0x3008, 0x9100]);
        let (unsafe_addr, retip) =
            verify_one(&mut cursor, &hunks, Direction::Apply, false).unwrap();
        assert_eq!(unsafe_addr, 0x1000);
        assert_eq!(retip, 0x9000);
    }

    #[test]
    fn paranoid_walks_to_outermost_hit() {
        let hunks = [hunk(0x1000, 16, 0, 0), hunk(0x3000, 16, 0, 0)];
        let mut cursor = VecCursor::new(vec![0x1004, 0x9000, 0x3008, 0x9100]);
        let (unsafe_addr, retip) =
            verify_one(&mut cursor, &hunks, Direction::Apply, true).unwrap();
        assert_eq!(unsafe_addr, 0x3000);
        assert_eq!(retip, 0x9100);
    }

    #[test]
    fn hit_with_no_outer_frame_has_no_retip() {
        let hunks = [hunk(0x1000, 16, 0, 0)];
        let mut cursor = VecCursor::new(vec![0x1004]);
        let (unsafe_addr, retip) =
            verify_one(&mut cursor, &hunks, Direction::Apply, false).unwrap();
        assert_eq!(unsafe_addr, 0x1000);
        assert_eq!(retip, 0);
    }

    #[test]
    fn new_function_entries_are_ignored() {
        let hunks = [PatchHunk { saddr: 0x1000, slen: 64, ..Default::default() }];
        // ip inside the new function's replacement range.
        let mut cursor = VecCursor::new(vec![0x1004]);
        let (unsafe_addr, _) =
            verify_one(&mut cursor, &hunks, Direction::Unapply, false).unwrap();
        assert_eq!(unsafe_addr, 0);
    }

    #[test]
    fn unsafe_coroutine_sets_coro_bit() {
        let mut victim = MockVictim::new(100);
        victim.add_thread(100, Regs { ip: 0x9000, sp: 0, bp: 0 });
        let threads = vec![ThreadCtx { tid: 100, execute_until: 0 }];
        let coros = vec![CoroContext { id: 0, ip: 0x1004, sp: 0, bp: 0 }];
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];

        let failed =
            verify(&mut victim, &threads, &coros, &hunks, Direction::Apply, None).unwrap();
        assert_eq!(failed, 1 | CORO_STACK_UNSAFE);
    }

    #[test]
    fn blocked_thread_reports_retip() {
        let mut victim = MockVictim::new(100);
        // Thread inside the hunk, one stack frame whose return address is
        // in the caller.
        victim.map_region(0x7000, vec![0; 0x20]);
        victim.poke(0x7000, &0u64.to_le_bytes());
        victim.poke(0x7008, &0x9000u64.to_le_bytes());
        victim.add_thread(100, Regs { ip: 0x1003, sp: 0x6ff0, bp: 0x7000 });

        let threads = vec![ThreadCtx { tid: 100, execute_until: 0 }];
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];
        let mut retips = vec![0u64; 1];

        let failed = verify(
            &mut victim,
            &threads,
            &[],
            &hunks,
            Direction::Apply,
            Some(&mut retips),
        )
        .unwrap();
        assert_eq!(failed, 1);
        assert_eq!(retips[0], 0x9000);
    }

    #[test]
    fn ensure_safety_advances_and_passes() {
        let mut victim = MockVictim::new(100);
        victim.map_region(0x7000, vec![0; 0x20]);
        victim.poke(0x7008, &0x9000u64.to_le_bytes());
        victim.add_thread(100, Regs { ip: 0x1003, sp: 0x6ff0, bp: 0x7000 });

        let mut threads = vec![ThreadCtx { tid: 100, execute_until: 0 }];
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];

        ensure_safety(&mut victim, &mut threads, &[], &hunks, Direction::Apply).unwrap();
        // The mock advance moved the thread to its retip.
        assert_eq!(victim.thread_regs(100).ip, 0x9000);
    }

    #[test]
    fn ensure_safety_gives_up_after_failed_advance() {
        let mut victim = MockVictim::new(100);
        victim.map_region(0x7000, vec![0; 0x20]);
        victim.poke(0x7008, &0x9000u64.to_le_bytes());
        victim.add_thread(100, Regs { ip: 0x1003, sp: 0x6ff0, bp: 0x7000 });
        victim.set_stubborn(true); // advance leaves the thread where it is

        let mut threads = vec![ThreadCtx { tid: 100, execute_until: 0 }];
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];

        let err =
            ensure_safety(&mut victim, &mut threads, &[], &hunks, Direction::Apply).unwrap_err();
        assert!(matches!(err, PatchError::UnsafeStack { coroutine: false, .. }));
    }

    #[test]
    fn coroutine_failure_skips_advance() {
        let mut victim = MockVictim::new(100);
        victim.add_thread(100, Regs { ip: 0x9000, sp: 0, bp: 0 });
        let mut threads = vec![ThreadCtx { tid: 100, execute_until: 0 }];
        let coros = vec![CoroContext { id: 0, ip: 0x1004, sp: 0, bp: 0 }];
        let hunks = [hunk(0x1000, 16, 0x2000, 32)];

        let err = ensure_safety(&mut victim, &mut threads, &coros, &hunks, Direction::Apply)
            .unwrap_err();
        assert!(matches!(err, PatchError::UnsafeStack { coroutine: true, .. }));
        assert_eq!(victim.execute_until_calls(), 0);
    }
}
