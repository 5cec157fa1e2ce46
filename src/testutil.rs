//! Shared test fixtures: an in-memory victim process, a scripted stack
//! cursor, and byte-level builders for patch blobs with a real embedded
//! relocatable image.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{PatchError, Result};
use crate::process::maps::MapRegion;
use crate::process::ptrace::{Regs, VictimPort};
use crate::storage::blob::{compose_header, PatchBlob, PatchHunk, HEADER_SIZE};
use crate::unwind::StackCursor;

/// Offset of the .text section data within the embedded image.
pub const TEST_TEXT_OFFSET: u64 = 0x40;

// ---------------------------------------------------------------------------
// Mock victim
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    regions: BTreeMap<u64, Vec<u8>>,
    threads: Vec<(i32, Regs)>,
    stubborn: bool,
    attach_calls: usize,
    execute_until_calls: usize,
    unmapped: Vec<(u64, u64)>,
}

/// An address-space-in-a-map stand-in for a live process. Regions behave
/// like the real thing for reads, writes, maps and unmaps; "executing" a
/// thread to an address just teleports its registers there. Clones share
/// state, so a test can keep a handle while a `ProcessCtx` owns the port.
#[derive(Clone)]
pub struct MockVictim {
    pid: i32,
    state: std::rc::Rc<std::cell::RefCell<MockState>>,
}

impl MockVictim {
    pub fn new(pid: i32) -> Self {
        MockVictim { pid, state: Default::default() }
    }

    pub fn map_region(&self, start: u64, bytes: Vec<u8>) {
        self.state.borrow_mut().regions.insert(start, bytes);
    }

    pub fn add_thread(&self, tid: i32, regs: Regs) {
        self.state.borrow_mut().threads.push((tid, regs));
    }

    pub fn set_thread_regs(&self, tid: i32, new: Regs) {
        for (t, regs) in self.state.borrow_mut().threads.iter_mut() {
            if *t == tid {
                *regs = new;
            }
        }
    }

    /// When set, execute_until pretends to run but moves nothing.
    pub fn set_stubborn(&self, stubborn: bool) {
        self.state.borrow_mut().stubborn = stubborn;
    }

    pub fn thread_regs(&self, tid: i32) -> Regs {
        self.state
            .borrow()
            .threads
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, r)| *r)
            .expect("unknown tid")
    }

    pub fn execute_until_calls(&self) -> usize {
        self.state.borrow().execute_until_calls
    }

    pub fn unmapped(&self) -> Vec<(u64, u64)> {
        self.state.borrow().unmapped.clone()
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.state
            .borrow()
            .regions
            .iter()
            .any(|(start, bytes)| addr >= *start && addr < *start + bytes.len() as u64)
    }

    fn access<T>(
        &self,
        addr: u64,
        len: usize,
        op: impl FnOnce(&mut Vec<u8>, usize) -> T,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let found = state
            .regions
            .range_mut(..=addr)
            .next_back()
            .filter(|(start, bytes)| addr + len as u64 <= **start + bytes.len() as u64);
        match found {
            Some((start, bytes)) => {
                let off = (addr - *start) as usize;
                Ok(op(bytes, off))
            }
            None => Err(PatchError::RemoteIo {
                pid: self.pid,
                reason: format!("unmapped access at 0x{:x}+{}", addr, len),
            }),
        }
    }

    /// Direct write, panicking on unmapped addresses (test setup).
    pub fn poke(&self, addr: u64, data: &[u8]) {
        self.access(addr, data.len(), |bytes, off| {
            bytes[off..off + data.len()].copy_from_slice(data)
        })
        .expect("poke to unmapped address");
    }

    /// Direct read, panicking on unmapped addresses (test assertions).
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        self.access(addr, len, |bytes, off| bytes[off..off + len].to_vec())
            .expect("peek from unmapped address")
    }
}

impl VictimPort for MockVictim {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(&mut self) -> Result<Vec<i32>> {
        let mut state = self.state.borrow_mut();
        state.attach_calls += 1;
        Ok(state.threads.iter().map(|(tid, _)| *tid).collect())
    }

    fn detach(&mut self) -> Result<()> {
        Ok(())
    }

    fn getregs(&mut self, tid: i32) -> Result<Regs> {
        self.state
            .borrow()
            .threads
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, r)| *r)
            .ok_or_else(|| PatchError::RemoteIo {
                pid: self.pid,
                reason: format!("no thread {}", tid),
            })
    }

    fn maps(&mut self) -> Result<Vec<MapRegion>> {
        Ok(self
            .state
            .borrow()
            .regions
            .iter()
            .map(|(start, bytes)| MapRegion {
                start: *start,
                end: *start + bytes.len() as u64,
                read: true,
                write: true,
                exec: true,
                shared: false,
                offset: 0,
                inode: 0,
                path: None,
            })
            .collect())
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.access(addr, len, |bytes, off| {
            buf.copy_from_slice(&bytes[off..off + len])
        })
    }

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.access(addr, data.len(), |bytes, off| {
            bytes[off..off + data.len()].copy_from_slice(data)
        })
    }

    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        let free = |regions: &BTreeMap<u64, Vec<u8>>, at: u64| {
            regions
                .iter()
                .all(|(start, bytes)| at + size <= *start || at >= *start + bytes.len() as u64)
        };
        // Same contract as the production port: a requested placement that
        // cannot be honored is a placement failure, not a silent move.
        let addr = if hint != 0 {
            if !free(&state.regions, hint) {
                return Err(PatchError::LayoutUnreachable {
                    reason: format!("region at 0x{:x} is already mapped", hint),
                });
            }
            hint
        } else {
            let mut at = 0x7f00_0000_0000u64;
            while !free(&state.regions, at) {
                at += 0x10000;
            }
            at
        };
        state.regions.insert(addr, vec![0u8; size as usize]);
        Ok(addr)
    }

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.unmapped.push((addr, size));
        state.regions.remove(&addr).ok_or_else(|| PatchError::RemoteIo {
            pid: self.pid,
            reason: format!("munmap of unmapped 0x{:x}", addr),
        })?;
        Ok(())
    }

    fn execute_until(&mut self, targets: &[(i32, u64)], _timeout: Duration) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.execute_until_calls += 1;
        if state.stubborn {
            return Ok(());
        }
        for (tid, target) in targets {
            if *target == 0 {
                continue;
            }
            for (t, regs) in state.threads.iter_mut() {
                if t == tid {
                    regs.ip = *target;
                    regs.bp = 0;
                }
            }
        }
        Ok(())
    }

    fn run_to_entry(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted stack cursor
// ---------------------------------------------------------------------------

/// A cursor over a fixed list of frame ips, innermost first.
pub struct VecCursor {
    ips: Vec<u64>,
    pos: usize,
}

impl VecCursor {
    pub fn new(ips: Vec<u64>) -> Self {
        assert!(!ips.is_empty());
        VecCursor { ips, pos: 0 }
    }
}

impl StackCursor for VecCursor {
    fn ip(&self) -> u64 {
        self.ips[self.pos]
    }

    fn step(&mut self) -> Result<bool> {
        if self.pos + 1 < self.ips.len() {
            self.pos += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// Blob / embedded image builders
// ---------------------------------------------------------------------------

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;
const R_X86_64_64: u64 = 1;
const R_X86_64_PLT32: u64 = 4;

fn shdr(
    name: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&sh_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&link.to_le_bytes());
    out.extend_from_slice(&info.to_le_bytes());
    out.extend_from_slice(&align.to_le_bytes());
    out.extend_from_slice(&entsize.to_le_bytes());
    out
}

fn sym(name: u32, info: u8, shndx: u16, value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&name.to_le_bytes());
    out.push(info);
    out.push(0); // st_other
    out.extend_from_slice(&shndx.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // st_size
    out
}

fn rela(offset: u64, sym_index: u64, r_type: u64, addend: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&((sym_index << 32) | r_type).to_le_bytes());
    out.extend_from_slice(&addend.to_le_bytes());
    out
}

/// Build a minimal relocatable image the way the patch builder lays one
/// out: a .text with replacement code, a .kpatch.info table relocated
/// against .text, and optional undefined symbols called from .text through
/// PLT32 relocations.
///
/// Hunks are `(daddr, dlen, text_off, slen)`: the replacement for `daddr`
/// lives at offset `text_off` inside .text.
fn build_rel_image(hunks: &[(u64, u32, u64, u32)], undef: &[&str]) -> Vec<u8> {
    let text_size = 0x100u64;
    let mut text = vec![0x90u8; text_size as usize];
    // One call site per undefined symbol: e8 <disp32> at offset j*8.
    for j in 0..undef.len() {
        text[j * 8] = 0xe8;
    }

    let info_off = TEST_TEXT_OFFSET + text_size;
    let mut info = Vec::new();
    for &(daddr, dlen, _text_off, slen) in hunks {
        let record = PatchHunk { daddr, saddr: 0, dlen, slen, flags: 0 };
        info.extend_from_slice(&record.to_bytes());
    }
    info.extend_from_slice(&PatchHunk::default().to_bytes()); // end sentinel
    let info_size = info.len() as u64;

    // Relocations filling in each record's saddr from .text (symbol 1).
    let rela_info_off = info_off + info_size;
    let mut rela_info = Vec::new();
    for (i, &(_daddr, _dlen, text_off, _slen)) in hunks.iter().enumerate() {
        rela_info.extend_from_slice(&rela(
            (i * 32 + 8) as u64,
            1,
            R_X86_64_64,
            text_off as i64,
        ));
    }
    let rela_info_size = rela_info.len() as u64;

    // Call-site relocations against the undefined symbols (2, 3, ...).
    let rela_text_off = rela_info_off + rela_info_size;
    let mut rela_text = Vec::new();
    for (j, _) in undef.iter().enumerate() {
        rela_text.extend_from_slice(&rela(
            (j * 8 + 1) as u64,
            (2 + j) as u64,
            R_X86_64_PLT32,
            -4,
        ));
    }
    let rela_text_size = rela_text.len() as u64;

    let mut strtab = vec![0u8];
    let mut name_offs = Vec::new();
    for name in undef {
        name_offs.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let symtab_off = rela_text_off + rela_text_size;
    let mut symtab = Vec::new();
    symtab.extend_from_slice(&sym(0, 0, 0, 0)); // null
    symtab.extend_from_slice(&sym(0, 0x03, 1, 0)); // STT_SECTION for .text
    for &off in &name_offs {
        symtab.extend_from_slice(&sym(off, 0x10, 0, 0)); // STB_GLOBAL undefined
    }
    let symtab_size = symtab.len() as u64;

    let strtab_off = symtab_off + symtab_size;
    let strtab_size = strtab.len() as u64;

    let mut shstrtab = vec![0u8];
    let sh_name = |s: &str, tab: &mut Vec<u8>| {
        let off = tab.len() as u32;
        tab.extend_from_slice(s.as_bytes());
        tab.push(0);
        off
    };
    let n_text = sh_name(".text", &mut shstrtab);
    let n_info = sh_name(".kpatch.info", &mut shstrtab);
    let n_rela_info = sh_name(".rela.kpatch.info", &mut shstrtab);
    let n_rela_text = sh_name(".rela.text", &mut shstrtab);
    let n_symtab = sh_name(".symtab", &mut shstrtab);
    let n_strtab = sh_name(".strtab", &mut shstrtab);
    let n_shstrtab = sh_name(".shstrtab", &mut shstrtab);

    let shstrtab_off = strtab_off + strtab_size;
    let shstrtab_size = shstrtab.len() as u64;
    let shoff = (shstrtab_off + shstrtab_size + 7) & !7;

    let mut image = Vec::new();
    // ---- ELF64 header ----
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0u8; 8]);
    image.extend_from_slice(&1u16.to_le_bytes()); // e_type = ET_REL
    image.extend_from_slice(&62u16.to_le_bytes()); // e_machine = EM_X86_64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    image.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    image.extend_from_slice(&shoff.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&8u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&7u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len() as u64, TEST_TEXT_OFFSET);

    image.extend_from_slice(&text);
    image.extend_from_slice(&info);
    image.extend_from_slice(&rela_info);
    image.extend_from_slice(&rela_text);
    image.extend_from_slice(&symtab);
    image.extend_from_slice(&strtab);
    image.extend_from_slice(&shstrtab);
    while (image.len() as u64) < shoff {
        image.push(0);
    }

    image.extend_from_slice(&shdr(0, 0, 0, 0, 0, 0, 0, 0, 0));
    image.extend_from_slice(&shdr(
        n_text,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        TEST_TEXT_OFFSET,
        text_size,
        0,
        0,
        16,
        0,
    ));
    image.extend_from_slice(&shdr(
        n_info, SHT_PROGBITS, SHF_ALLOC, info_off, info_size, 0, 0, 8, 32,
    ));
    image.extend_from_slice(&shdr(
        n_rela_info, SHT_RELA, 0, rela_info_off, rela_info_size, 5, 2, 8, 24,
    ));
    image.extend_from_slice(&shdr(
        n_rela_text, SHT_RELA, 0, rela_text_off, rela_text_size, 5, 1, 8, 24,
    ));
    image.extend_from_slice(&shdr(
        n_symtab, SHT_SYMTAB, 0, symtab_off, symtab_size, 6, 2, 8, 24,
    ));
    image.extend_from_slice(&shdr(n_strtab, SHT_STRTAB, 0, strtab_off, strtab_size, 0, 0, 1, 0));
    image.extend_from_slice(&shdr(
        n_shstrtab, SHT_STRTAB, 0, shstrtab_off, shstrtab_size, 0, 0, 1, 0,
    ));

    image
}

/// Build a complete, verifiable patch blob for `uname` at `user_level`.
/// Hunks are `(daddr, dlen, text_off, slen)`.
pub fn build_blob(
    uname: &str,
    user_level: i32,
    hunks: &[(u64, u32, u64, u32)],
    undef: &[&str],
) -> PatchBlob {
    let image = build_rel_image(hunks, undef);
    let total = HEADER_SIZE + image.len();
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&compose_header(
        "test",
        uname,
        HEADER_SIZE as u32,
        total as u32,
        user_level,
    ));
    bytes.extend_from_slice(&image);
    let blob = PatchBlob::from_bytes(bytes);
    blob.verify().expect("test blob must verify");
    blob
}

// ---------------------------------------------------------------------------
// Scratch directories
// ---------------------------------------------------------------------------

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A uniquely-named directory under the system temp dir, removed on drop.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = env::temp_dir().join(format!(
            "repatch-test-{}-{}-{}",
            tag,
            std::process::id(),
            n
        ));
        fs::create_dir_all(&path).expect("create temp dir");
        TempDir(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}
