//! Remote-process control.
//!
//! `VictimPort` is the narrow interface the patch engine drives a victim
//! through: freeze/thaw, register and memory access, remote mapping, and
//! controlled execution. `PtracePort` is the production implementation on
//! top of ptrace; the engine itself never calls ptrace directly, so it can
//! run against an in-memory stand-in under test.

use std::fs;
use std::io::IoSliceMut;
use std::time::{Duration, Instant};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{PatchError, Result};
use crate::process::maps::{self, MapRegion};

/// Budget for running threads forward to their safe return addresses.
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(3000);

/// The subset of register state the engine cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
}

pub trait VictimPort {
    fn pid(&self) -> i32;

    /// Stop and seize every task of the process. Safe to call again to pick
    /// up threads spawned since the last attach; returns the full task list.
    fn attach(&mut self) -> Result<Vec<i32>>;

    /// Resume all tasks and drop the trace.
    fn detach(&mut self) -> Result<()>;

    fn getregs(&mut self, tid: i32) -> Result<Regs>;

    /// Current memory layout of the victim.
    fn maps(&mut self) -> Result<Vec<MapRegion>>;

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Map `size` bytes of anonymous rwx memory in the victim, preferring
    /// `hint`. Returns the address actually chosen by the kernel.
    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64>;

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Run each listed thread until it reaches its target address, leaving
    /// all threads stopped again. Entries with target 0 are left alone.
    fn execute_until(&mut self, targets: &[(i32, u64)], timeout: Duration) -> Result<()>;

    /// Run a freshly-execve'd process up to its entry point so the dynamic
    /// loader has mapped the shared libraries.
    fn run_to_entry(&mut self) -> Result<()>;
}

pub struct PtracePort {
    pid: i32,
    tids: Vec<Pid>,
}

impl PtracePort {
    pub fn new(pid: i32) -> Self {
        PtracePort { pid, tids: Vec::new() }
    }

    fn list_tasks(&self) -> Result<Vec<i32>> {
        let mut tids = Vec::new();
        let dir = fs::read_dir(format!("/proc/{}/task", self.pid))?;
        for entry in dir {
            let entry = entry?;
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    fn remote_err(&self, reason: String) -> PatchError {
        PatchError::RemoteIo { pid: self.pid, reason }
    }

    fn main_tid(&self) -> Result<Pid> {
        self.tids
            .first()
            .copied()
            .ok_or_else(|| self.remote_err("not attached".into()))
    }

    /// Execute one syscall inside the victim: hijack the main thread's
    /// current instruction slot with `syscall`, single-step it, and put
    /// everything back.
    fn remote_syscall(&mut self, nr: u64, args: [u64; 6]) -> Result<u64> {
        let tid = self.main_tid()?;
        let saved_regs = ptrace::getregs(tid)
            .map_err(|e| self.remote_err(format!("getregs: {}", e)))?;

        let ip = saved_regs.rip;
        let saved_word = ptrace::read(tid, ip as ptrace::AddressType)
            .map_err(|e| self.remote_err(format!("peek at 0x{:x}: {}", ip, e)))?;

        // syscall = 0f 05, rest of the word preserved.
        let patched = (saved_word as u64 & !0xffff) | 0x050f;
        ptrace::write(tid, ip as ptrace::AddressType, patched as i64)
            .map_err(|e| self.remote_err(format!("poke at 0x{:x}: {}", ip, e)))?;

        let mut regs = saved_regs;
        regs.rax = nr;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        ptrace::setregs(tid, regs).map_err(|e| self.remote_err(format!("setregs: {}", e)))?;

        let step_result = (|| {
            ptrace::step(tid, None).map_err(|e| self.remote_err(format!("step: {}", e)))?;
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, _)) => Ok(()),
                Ok(status) => Err(self.remote_err(format!("unexpected wait status {:?}", status))),
                Err(e) => Err(self.remote_err(format!("waitpid: {}", e))),
            }
        })();

        let result = step_result.and_then(|()| {
            ptrace::getregs(tid)
                .map(|r| r.rax)
                .map_err(|e| self.remote_err(format!("getregs after syscall: {}", e)))
        });

        // Restore the clobbered instruction slot and registers even if the
        // syscall itself went wrong.
        let _ = ptrace::write(tid, ip as ptrace::AddressType, saved_word);
        let _ = ptrace::setregs(tid, saved_regs);

        result
    }

    /// Plant a breakpoint, run `tid` until it traps there, then remove it.
    fn run_until(&mut self, tid: Pid, target: u64, deadline: Instant) -> Result<()> {
        let mut saved = [0u8; 1];
        self.read_mem(target, &mut saved)?;
        self.write_mem(target, &[0xcc])?;

        let finish = |port: &mut Self, hit: bool| -> Result<()> {
            port.write_mem(target, &saved)?;
            if hit {
                let mut regs = ptrace::getregs(tid)
                    .map_err(|e| port.remote_err(format!("getregs: {}", e)))?;
                regs.rip = target;
                ptrace::setregs(tid, regs)
                    .map_err(|e| port.remote_err(format!("setregs: {}", e)))?;
            }
            Ok(())
        };

        ptrace::cont(tid, None).map_err(|e| self.remote_err(format!("cont: {}", e)))?;

        loop {
            if Instant::now() > deadline {
                // Freeze the runaway thread again before reporting.
                let _ = nix::sys::signal::kill(tid, Signal::SIGSTOP);
                let _ = waitpid(tid, Some(WaitPidFlag::__WALL));
                finish(self, false)?;
                return Err(self.remote_err(format!(
                    "thread {} did not reach 0x{:x} in time",
                    tid, target
                )));
            }

            match waitpid(tid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                    let regs = ptrace::getregs(tid)
                        .map_err(|e| self.remote_err(format!("getregs: {}", e)))?;
                    if regs.rip.wrapping_sub(1) == target {
                        return finish(self, true);
                    }
                    // Some other trap; keep going.
                    ptrace::cont(tid, None)
                        .map_err(|e| self.remote_err(format!("cont: {}", e)))?;
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    // Forward the signal and keep waiting for our trap.
                    ptrace::cont(tid, Some(sig))
                        .map_err(|e| self.remote_err(format!("cont: {}", e)))?;
                }
                Ok(status) => {
                    finish(self, false)?;
                    return Err(self.remote_err(format!(
                        "thread {} vanished while advancing: {:?}",
                        tid, status
                    )));
                }
                Err(e) => {
                    finish(self, false)?;
                    return Err(self.remote_err(format!("waitpid: {}", e)));
                }
            }
        }
    }

    fn auxv_entry(&self, wanted: u64) -> Result<Option<u64>> {
        let raw = fs::read(format!("/proc/{}/auxv", self.pid))?;
        for pair in raw.chunks_exact(16) {
            let key = u64::from_le_bytes(pair[0..8].try_into().unwrap());
            let val = u64::from_le_bytes(pair[8..16].try_into().unwrap());
            if key == wanted {
                return Ok(Some(val));
            }
        }
        Ok(None)
    }
}

const AT_ENTRY: u64 = 9;

impl VictimPort for PtracePort {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(&mut self) -> Result<Vec<i32>> {
        // Threads may spawn while we are attaching; rescan until the task
        // list is stable.
        loop {
            let tasks = self.list_tasks().map_err(|e| PatchError::AttachFailed {
                pid: self.pid,
                reason: e.to_string(),
            })?;

            let mut new = 0;
            for &tid in &tasks {
                let pid = Pid::from_raw(tid);
                if self.tids.contains(&pid) {
                    continue;
                }
                ptrace::attach(pid).map_err(|e| PatchError::AttachFailed {
                    pid: self.pid,
                    reason: format!("task {}: {}", tid, e),
                })?;
                match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, _)) => {}
                    Ok(status) => {
                        return Err(PatchError::AttachFailed {
                            pid: self.pid,
                            reason: format!("task {} stopped oddly: {:?}", tid, status),
                        })
                    }
                    Err(e) => {
                        return Err(PatchError::AttachFailed {
                            pid: self.pid,
                            reason: format!("wait for task {}: {}", tid, e),
                        })
                    }
                }
                self.tids.push(pid);
                new += 1;
            }

            if new == 0 {
                log::debug!("attached to {} task(s) of pid {}", self.tids.len(), self.pid);
                return Ok(self.tids.iter().map(|p| p.as_raw()).collect());
            }
        }
    }

    fn detach(&mut self) -> Result<()> {
        for &tid in &self.tids {
            if let Err(e) = ptrace::detach(tid, None) {
                log::warn!("detach from task {}: {}", tid, e);
            }
        }
        self.tids.clear();
        Ok(())
    }

    fn getregs(&mut self, tid: i32) -> Result<Regs> {
        let regs = ptrace::getregs(Pid::from_raw(tid))
            .map_err(|e| self.remote_err(format!("getregs tid {}: {}", tid, e)))?;
        Ok(Regs { ip: regs.rip, sp: regs.rsp, bp: regs.rbp })
    }

    fn maps(&mut self) -> Result<Vec<MapRegion>> {
        maps::parse(self.pid)
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len();
        let local = &mut [IoSliceMut::new(buf)];
        let remote = &[RemoteIoVec { base: addr as usize, len }];
        match process_vm_readv(Pid::from_raw(self.pid), local, remote) {
            Ok(n) if n == len => Ok(()),
            Ok(n) => Err(self.remote_err(format!("short read at 0x{:x}: {}/{}", addr, n, len))),
            Err(e) => Err(self.remote_err(format!("read {} bytes at 0x{:x}: {}", len, addr, e))),
        }
    }

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let tid = self.main_tid()?;

        // Word-aligned read-modify-write through ptrace.
        let start = addr & !7;
        let end = (addr + data.len() as u64 + 7) & !7;
        let mut words = Vec::with_capacity(((end - start) / 8) as usize);
        for word_addr in (start..end).step_by(8) {
            let word = ptrace::read(tid, word_addr as ptrace::AddressType)
                .map_err(|e| self.remote_err(format!("peek at 0x{:x}: {}", word_addr, e)))?;
            words.push(word as u64);
        }

        let buf: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8)
        };
        let off = (addr - start) as usize;
        buf[off..off + data.len()].copy_from_slice(data);

        for (i, word) in words.iter().enumerate() {
            let word_addr = start + (i as u64) * 8;
            ptrace::write(tid, word_addr as ptrace::AddressType, *word as i64)
                .map_err(|e| self.remote_err(format!("poke at 0x{:x}: {}", word_addr, e)))?;
        }
        Ok(())
    }

    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64> {
        let prot = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let ret = self.remote_syscall(
            libc::SYS_mmap as u64,
            [hint, size, prot, flags, u64::MAX, 0],
        )?;
        if ret > u64::MAX - 4095 {
            return Err(self.remote_err(format!(
                "remote mmap of {} bytes at 0x{:x} failed: errno {}",
                size,
                hint,
                (ret as i64).unsigned_abs()
            )));
        }
        if hint != 0 && ret != hint {
            // The kernel moved the region off the placement the gap search
            // chose; a 32-bit jump may no longer reach it. Give the stray
            // mapping back and fail placement.
            let _ = self.remote_syscall(libc::SYS_munmap as u64, [ret, size, 0, 0, 0, 0]);
            return Err(PatchError::LayoutUnreachable {
                reason: format!(
                    "wanted patch region at 0x{:x}, kernel placed it at 0x{:x}",
                    hint, ret
                ),
            });
        }
        log::debug!("remote mmap: {} bytes at 0x{:x} (hint 0x{:x})", size, ret, hint);
        Ok(ret)
    }

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()> {
        let ret = self.remote_syscall(libc::SYS_munmap as u64, [addr, size, 0, 0, 0, 0])?;
        if ret != 0 {
            return Err(self.remote_err(format!(
                "remote munmap of [0x{:x}, 0x{:x}) failed: errno {}",
                addr,
                addr + size,
                (ret as i64).unsigned_abs()
            )));
        }
        Ok(())
    }

    fn execute_until(&mut self, targets: &[(i32, u64)], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for &(tid, target) in targets {
            if target == 0 {
                continue;
            }
            log::debug!("advancing thread {} to 0x{:x}", tid, target);
            self.run_until(Pid::from_raw(tid), target, deadline)?;
        }
        Ok(())
    }

    fn run_to_entry(&mut self) -> Result<()> {
        let entry = self
            .auxv_entry(AT_ENTRY)?
            .ok_or_else(|| self.remote_err("no AT_ENTRY in auxv".into()))?;
        let tid = self.main_tid()?;
        log::debug!("running pid {} up to entry point 0x{:x}", self.pid, entry);
        self.run_until(tid, entry, Instant::now() + EXECUTE_TIMEOUT)
    }
}

impl Drop for PtracePort {
    fn drop(&mut self) {
        // A dropped port must never leave the victim frozen.
        if !self.tids.is_empty() {
            let _ = self.detach();
        }
    }
}
