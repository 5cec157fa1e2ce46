//! Per-process view of a patch target.
//!
//! A `ProcessCtx` owns everything the engine knows about one victim: the
//! loaded ELF objects (executable, shared libraries, and any patch regions
//! mapped by earlier runs), the stopped threads, discovered coroutines, and
//! the port used to reach into the process.

pub mod coro;
pub mod maps;
pub mod ptrace;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use goblin::elf::Elf;

use crate::error::{PatchError, Result};
use crate::storage::blob::{PatchBlob, PatchHunk, BLOB_MAGIC, HEADER_SIZE};
use coro::{builtin_finders, CoroContext};
use maps::MapRegion;
use ptrace::{PtracePort, VictimPort};

/// One stopped thread of the victim.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCtx {
    pub tid: i32,
    /// Address this thread must run past before the next safety check;
    /// 0 means no pending advance.
    pub execute_until: u64,
}

/// One loaded object: a file-backed ELF mapping group, or an anonymous
/// region carrying an installed patch.
#[derive(Debug, Default)]
pub struct ObjectFile {
    pub name: String,
    pub path: Option<PathBuf>,
    pub buildid: Option<String>,
    pub base: u64,
    pub text_start: u64,
    pub text_end: u64,
    pub is_elf: bool,
    pub is_patch: bool,
    /// Index of the Object representing this object's installed patch.
    pub applied_patch: Option<usize>,
    /// For patch objects: index of the object the patch applies to.
    pub patch_owner: Option<usize>,
    /// Matching storage blob, if lookup found one.
    pub skpfile: Option<Rc<PatchBlob>>,
    /// Owned duplicate written into the victim (or its recovered header).
    pub kpfile: Option<PatchBlob>,
    /// Remote base address of the mapped patch region.
    pub kpta: u64,
    /// Size of the mapped patch region.
    pub kpta_size: u64,
    pub hunks: Vec<PatchHunk>,
    pub jmp_table: Option<Vec<u8>>,
    /// Exported dynamic symbols at their live addresses.
    pub symbols: HashMap<String, u64>,
    /// Difference between link-time and load-time addresses (ET_DYN).
    pub load_bias: u64,
}

impl ObjectFile {
    /// Pseudo-objects like [vdso] and [vsyscall] belong to the kernel and
    /// are never patch targets.
    pub fn is_kernel_object(&self) -> bool {
        self.name.starts_with('[')
    }

    pub fn dump(&self) {
        log::debug!(
            "object '{}' buildid={} elf={} patch={} applied={:?} base=0x{:x}",
            self.name,
            self.buildid.as_deref().unwrap_or("-"),
            self.is_elf,
            self.is_patch,
            self.applied_patch,
            self.base,
        );
    }
}

/// Facts pulled out of an on-disk ELF image.
#[derive(Debug, Default)]
pub struct ElfInfo {
    pub is_elf: bool,
    pub buildid: Option<String>,
    pub is_dyn: bool,
    pub min_load_vaddr: u64,
    /// name -> link-time address of exported dynamic symbols.
    pub symbols: HashMap<String, u64>,
}

/// Parse the pieces we need from an object file's bytes: Build-ID note,
/// object type, lowest PT_LOAD address, and the dynamic symbol table.
pub fn inspect_elf(data: &[u8]) -> ElfInfo {
    let mut info = ElfInfo::default();
    let Ok(elf) = Elf::parse(data) else {
        return info;
    };
    info.is_elf = true;
    info.is_dyn = elf.header.e_type == goblin::elf::header::ET_DYN;

    info.min_load_vaddr = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
        .map(|ph| ph.p_vaddr)
        .min()
        .unwrap_or(0);

    let notes = elf
        .iter_note_headers(data)
        .into_iter()
        .flatten()
        .chain(elf.iter_note_sections(data, None).into_iter().flatten());
    for note in notes.flatten() {
        if note.n_type == goblin::elf::note::NT_GNU_BUILD_ID && note.name == "GNU" {
            let hex: String = note.desc.iter().map(|b| format!("{:02x}", b)).collect();
            info.buildid = Some(hex);
            break;
        }
    }

    for sym in elf.dynsyms.iter() {
        if sym.st_shndx == 0 || sym.st_value == 0 {
            continue;
        }
        if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
            if !name.is_empty() {
                info.symbols.insert(name.to_string(), sym.st_value);
            }
        }
    }

    info
}

/// File-backed mapping groups in discovery order: path, lowest start, and
/// the executable range.
pub fn group_file_regions(regions: &[MapRegion]) -> Vec<(String, u64, u64, u64)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (u64, u64, u64)> = HashMap::new();

    for region in regions {
        let Some(path) = &region.path else { continue };
        let entry = groups.entry(path.clone()).or_insert_with(|| {
            order.push(path.clone());
            (region.start, 0, 0)
        });
        entry.0 = entry.0.min(region.start);
        if region.exec {
            if entry.1 == 0 {
                entry.1 = region.start;
            }
            entry.2 = entry.2.max(region.end);
        }
    }

    order
        .into_iter()
        .map(|path| {
            let (base, ts, te) = groups[&path];
            (path, base, ts, te)
        })
        .collect()
}

pub struct ProcessCtx {
    pub pid: i32,
    pub comm: String,
    pub objects: Vec<ObjectFile>,
    pub threads: Vec<ThreadCtx>,
    pub coros: Vec<CoroContext>,
    pub port: Box<dyn VictimPort>,
}

impl ProcessCtx {
    pub fn new(pid: i32) -> Result<Self> {
        let comm = fs::read_to_string(format!("/proc/{}/comm", pid))
            .map_err(|e| PatchError::Proc {
                reason: format!("pid {}: {}", pid, e),
            })?
            .trim()
            .to_string();
        Ok(ProcessCtx {
            pid,
            comm,
            objects: Vec::new(),
            threads: Vec::new(),
            coros: Vec::new(),
            port: Box::new(PtracePort::new(pid)),
        })
    }

    /// Construct around an arbitrary port (testing, alternative backends).
    pub fn with_port(pid: i32, comm: &str, port: Box<dyn VictimPort>) -> Self {
        ProcessCtx {
            pid,
            comm: comm.to_string(),
            objects: Vec::new(),
            threads: Vec::new(),
            coros: Vec::new(),
            port,
        }
    }

    pub fn print_short(&self) {
        log::info!("patch target: {} (pid {})", self.comm, self.pid);
    }

    /// Freeze the process; refreshes the thread list, keeping any pending
    /// execute_until marks on threads we already knew.
    pub fn attach(&mut self) -> Result<()> {
        let tids = self.port.attach()?;
        let old: HashMap<i32, u64> = self
            .threads
            .iter()
            .map(|t| (t.tid, t.execute_until))
            .collect();
        self.threads = tids
            .into_iter()
            .map(|tid| ThreadCtx {
                tid,
                execute_until: old.get(&tid).copied().unwrap_or(0),
            })
            .collect();
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        self.threads.clear();
        self.port.detach()
    }

    pub fn run_to_entry(&mut self) -> Result<()> {
        self.port.run_to_entry()
    }

    /// Build the object list: parse the maps, inspect each file-backed
    /// object on disk, and recognize already-installed patch regions by
    /// their leading magic.
    pub fn map_object_files(&mut self) -> Result<()> {
        let regions = self.port.maps()?;

        for (path, base, text_start, text_end) in group_file_regions(&regions) {
            let name = path.rsplit('/').next().unwrap_or(&path).to_string();
            let mut obj = ObjectFile {
                name,
                path: Some(PathBuf::from(&path)),
                base,
                text_start,
                text_end,
                ..Default::default()
            };

            if !obj.is_kernel_object() {
                match fs::read(&path) {
                    Ok(data) => {
                        let info = inspect_elf(&data);
                        obj.is_elf = info.is_elf;
                        obj.buildid = info.buildid;
                        let bias = if info.is_dyn {
                            base.wrapping_sub(info.min_load_vaddr)
                        } else {
                            0
                        };
                        obj.load_bias = bias;
                        obj.symbols = info
                            .symbols
                            .into_iter()
                            .map(|(name, vaddr)| (name, vaddr.wrapping_add(bias)))
                            .collect();
                    }
                    Err(e) => {
                        log::debug!("cannot read '{}': {}", path, e);
                    }
                }
            }

            self.objects.push(obj);
        }

        // Anonymous executable regions holding an installed patch start
        // with the blob magic.
        for region in regions.iter().filter(|r| r.is_anon() && r.exec && r.read) {
            let mut magic = [0u8; 8];
            if self.port.read_mem(region.start, &mut magic).is_err() || magic != BLOB_MAGIC {
                continue;
            }
            let mut header = vec![0u8; HEADER_SIZE];
            self.port.read_mem(region.start, &mut header)?;
            let header = PatchBlob::from_bytes(header);
            log::debug!(
                "found installed patch for build id '{}' at 0x{:x}",
                header.uname(),
                region.start
            );
            self.objects.push(ObjectFile {
                name: "[kpatch]".to_string(),
                is_patch: true,
                kpta: region.start,
                kpta_size: region.len(),
                base: region.start,
                kpfile: Some(header),
                ..Default::default()
            });
        }

        Ok(())
    }

    /// Pair every discovered patch region with the object it targets, so
    /// version replacement and unpatch can find installed state.
    pub fn associate_patches(&mut self) -> Result<usize> {
        let mut pairs = Vec::new();
        for (p_idx, patch) in self.objects.iter().enumerate() {
            if !patch.is_patch {
                continue;
            }
            let Some(header) = &patch.kpfile else { continue };
            let uname = header.uname().to_string();
            if let Some(o_idx) = self
                .objects
                .iter()
                .position(|o| o.is_elf && o.buildid.as_deref() == Some(&uname))
            {
                pairs.push((o_idx, p_idx));
            }
        }

        let count = pairs.len();
        for (o_idx, p_idx) in pairs {
            let (kpta, kpta_size, header) = {
                let p = &self.objects[p_idx];
                (p.kpta, p.kpta_size, p.kpfile.clone())
            };
            let obj = &mut self.objects[o_idx];
            obj.applied_patch = Some(p_idx);
            if obj.kpfile.is_none() {
                obj.kpta = kpta;
                obj.kpta_size = kpta_size;
                obj.kpfile = header;
            }
            self.objects[p_idx].patch_owner = Some(o_idx);
        }
        Ok(count)
    }

    /// Ask every known coroutine runtime finder for saved contexts.
    pub fn find_coroutines(&mut self) -> Result<()> {
        for mut finder in builtin_finders() {
            let found = finder.find(self.port.as_mut(), &self.objects)?;
            if !found.is_empty() {
                log::info!("{} coroutine(s) found by {}", found.len(), finder.name());
                self.coros.extend(found);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_regions_by_path_in_discovery_order() {
        let content = "\
00400000-00401000 r-xp 00000000 08:01 11 /usr/bin/app
00600000-00601000 rw-p 00000000 08:01 11 /usr/bin/app
7f0000000000-7f0000002000 r-xp 00000000 08:01 22 /usr/lib/libx.so
7f0000002000-7f0000003000 rw-p 00002000 08:01 22 /usr/lib/libx.so
7ffe00000000-7ffe00001000 rw-p 00000000 00:00 0 [stack]
";
        let regions = maps::parse_str(content).unwrap();
        let groups = group_file_regions(&regions);
        assert_eq!(groups.len(), 3);

        let (path, base, ts, te) = &groups[0];
        assert_eq!(path, "/usr/bin/app");
        assert_eq!(*base, 0x400000);
        assert_eq!((*ts, *te), (0x400000, 0x401000));

        let (path, base, ts, te) = &groups[1];
        assert_eq!(path, "/usr/lib/libx.so");
        assert_eq!(*base, 0x7f0000000000);
        assert_eq!((*ts, *te), (0x7f0000000000, 0x7f0000002000));

        assert_eq!(groups[2].0, "[stack]");
    }

    #[test]
    fn kernel_objects_are_recognized() {
        let vdso = ObjectFile { name: "[vdso]".into(), ..Default::default() };
        assert!(vdso.is_kernel_object());
        let lib = ObjectFile { name: "libx.so".into(), ..Default::default() };
        assert!(!lib.is_kernel_object());
    }

    #[test]
    fn inspect_rejects_non_elf() {
        let info = inspect_elf(b"definitely not an elf image");
        assert!(!info.is_elf);
        assert!(info.buildid.is_none());
    }
}
