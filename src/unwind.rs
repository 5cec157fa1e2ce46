//! Stack walking over a stopped victim.
//!
//! The safety verifier only needs a stream of instruction pointers, one per
//! frame, from innermost to outermost. `StackCursor` is that stream; the
//! production cursor follows the frame-pointer chain through the victim's
//! memory, starting from a thread's live registers or a coroutine's saved
//! ones.

use crate::error::Result;
use crate::process::ptrace::{Regs, VictimPort};

/// Give up past this many frames; a longer chain is a corrupt or cyclic
/// frame-pointer list, not a real stack.
const MAX_FRAMES: usize = 256;

pub trait StackCursor {
    /// Instruction pointer of the current frame.
    fn ip(&self) -> u64;

    /// Move one frame outward. `Ok(false)` at the end of the stack.
    fn step(&mut self) -> Result<bool>;
}

/// Frame-pointer chain cursor. Each frame reads `[bp]` (caller's bp) and
/// `[bp + 8]` (return address); the walk stops at a null or non-ascending
/// bp, which terminates well-formed chains and cuts corrupt ones short.
pub struct FrameCursor<'a> {
    port: &'a mut dyn VictimPort,
    ip: u64,
    bp: u64,
    depth: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(port: &'a mut dyn VictimPort, regs: Regs) -> Self {
        FrameCursor { port, ip: regs.ip, bp: regs.bp, depth: 0 }
    }
}

impl StackCursor for FrameCursor<'_> {
    fn ip(&self) -> u64 {
        self.ip
    }

    fn step(&mut self) -> Result<bool> {
        if self.bp == 0 || self.depth >= MAX_FRAMES {
            return Ok(false);
        }

        let mut frame = [0u8; 16];
        if self.port.read_mem(self.bp, &mut frame).is_err() {
            // The chain left mapped memory; treat it as the outermost frame
            // rather than failing the whole verification.
            log::debug!("frame chain ends at unreadable bp 0x{:x}", self.bp);
            return Ok(false);
        }

        let next_bp = u64::from_le_bytes(frame[0..8].try_into().unwrap());
        let ret_ip = u64::from_le_bytes(frame[8..16].try_into().unwrap());

        if ret_ip == 0 {
            return Ok(false);
        }
        if next_bp != 0 && next_bp <= self.bp {
            // Stacks grow down; a caller frame below us is a loop or junk.
            return Ok(false);
        }

        self.ip = ret_ip;
        self.bp = next_bp;
        self.depth += 1;
        Ok(true)
    }
}
