//! Embedded ET_REL handling.
//!
//! The patch blob carries a relocatable ELF image whose sections are laid
//! out at their file offsets; once the blob lands at `kpta`, a byte at
//! image offset `x` lives at `kpta + kpatch_offset + x`. Relocation
//! therefore resolves symbols against that placement and rewrites the blob
//! in place before it is copied into the victim. Undefined symbols route
//! through a jump table whose slots point at the victim object's own
//! exports.

use std::collections::HashMap;

use goblin::elf::reloc::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_PC32, R_X86_64_PLT32,
};
use goblin::elf::section_header::SHT_RELA;
use goblin::elf::Elf;

use crate::error::{PatchError, Result};
use crate::storage::blob::{PatchBlob, PatchHunk, MAX_HUNKS};

/// One jump-table slot: `jmp *0(%rip)` followed by the inline target.
pub const JMP_SLOT_SIZE: usize = 16;

const SHN_UNDEF: usize = 0;
const SHN_ABS: usize = 0xfff1;

const INFO_SECTION: &str = ".kpatch.info";

/// An undefined symbol of the embedded image, to be satisfied by the
/// victim object through the jump table.
#[derive(Debug, Clone)]
pub struct UndefSym {
    pub sym_index: usize,
    pub name: String,
}

/// Facts extracted from the embedded image before layout.
#[derive(Debug)]
pub struct RelInfo {
    /// Offset of the hunk table within the blob.
    pub info_offset: u32,
    /// Hunk records as stored on disk (pre-relocation).
    pub hunks: Vec<PatchHunk>,
    pub undefined: Vec<UndefSym>,
}

fn parse_err(what: &str, e: impl std::fmt::Display) -> PatchError {
    PatchError::RelocationFailed { reason: format!("{}: {}", what, e) }
}

/// Locate the hunk table and the undefined symbols of the embedded image.
pub fn load_rel_info(blob: &PatchBlob) -> Result<RelInfo> {
    let image = blob.embedded_elf()?;
    let elf = Elf::parse(image).map_err(|e| parse_err("embedded image", e))?;

    let info_sh = elf
        .section_headers
        .iter()
        .find(|sh| elf.shdr_strtab.get_at(sh.sh_name) == Some(INFO_SECTION))
        .ok_or_else(|| PatchError::InvalidPatch {
            reason: format!("embedded image has no {} section", INFO_SECTION),
        })?;

    let info_offset = blob.kpatch_offset() as u64 + info_sh.sh_offset;
    let hunks = blob.hunks_at(info_offset as usize, MAX_HUNKS)?;

    let mut undefined = Vec::new();
    for (sym_index, sym) in elf.syms.iter().enumerate() {
        if sym.st_shndx != SHN_UNDEF {
            continue;
        }
        let Some(name) = elf.strtab.get_at(sym.st_name) else { continue };
        if name.is_empty() {
            continue;
        }
        undefined.push(UndefSym { sym_index, name: name.to_string() });
    }

    log::debug!(
        "embedded image: {} hunk(s), {} undefined symbol(s)",
        hunks.len(),
        undefined.len()
    );

    Ok(RelInfo { info_offset: info_offset as u32, hunks, undefined })
}

/// Build the jump table: one slot per undefined symbol, in order, each
/// targeting the symbol's live address in the victim.
pub fn build_jmp_table(
    undefined: &[UndefSym],
    symbols: &HashMap<String, u64>,
) -> Result<Vec<u8>> {
    let mut table = vec![0u8; undefined.len() * JMP_SLOT_SIZE];
    for (slot, und) in undefined.iter().enumerate() {
        let target = symbols.get(&und.name).ok_or_else(|| PatchError::RelocationFailed {
            reason: format!("undefined symbol '{}' not found in target object", und.name),
        })?;
        let off = slot * JMP_SLOT_SIZE;
        table[off..off + 6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        table[off + 6..off + 14].copy_from_slice(&target.to_le_bytes());
    }
    Ok(table)
}

struct PendingWrite {
    blob_off: usize,
    size: usize,
    value: u64,
}

/// Resolve symbols against the chosen `kpta` and apply every RELA entry to
/// the blob image in place. `undefined` must be the list `load_rel_info`
/// returned; slot `i` of the jump table serves `undefined[i]`.
pub fn relocate(blob: &mut PatchBlob, kpta: u64, undefined: &[UndefSym]) -> Result<()> {
    let kpatch_off = blob.kpatch_offset() as u64;
    let jmp_off = blob.jmp_offset() as u64;

    let slot_of: HashMap<usize, usize> = undefined
        .iter()
        .enumerate()
        .map(|(slot, und)| (und.sym_index, slot))
        .collect();

    let mut writes: Vec<PendingWrite> = Vec::new();
    {
        let image = blob.embedded_elf()?;
        let elf = Elf::parse(image).map_err(|e| parse_err("embedded image", e))?;
        let shdrs = &elf.section_headers;

        for (rela_idx, relocs) in &elf.shdr_relocs {
            let rela_sh = &shdrs[*rela_idx];
            if rela_sh.sh_type != SHT_RELA {
                continue;
            }
            let target_idx = rela_sh.sh_info as usize;
            let target = shdrs.get(target_idx).ok_or_else(|| PatchError::RelocationFailed {
                reason: format!("relocation section targets bad section {}", target_idx),
            })?;

            for reloc in relocs.iter() {
                let sym = elf.syms.get(reloc.r_sym).ok_or_else(|| {
                    PatchError::RelocationFailed {
                        reason: format!("relocation references bad symbol {}", reloc.r_sym),
                    }
                })?;

                let s = if sym.st_shndx == SHN_UNDEF {
                    let slot = slot_of.get(&reloc.r_sym).ok_or_else(|| {
                        PatchError::RelocationFailed {
                            reason: format!("no jump slot for symbol {}", reloc.r_sym),
                        }
                    })?;
                    kpta + jmp_off + (slot * JMP_SLOT_SIZE) as u64
                } else if sym.st_shndx == SHN_ABS {
                    sym.st_value
                } else {
                    let def = shdrs.get(sym.st_shndx).ok_or_else(|| {
                        PatchError::RelocationFailed {
                            reason: format!("symbol in bad section {}", sym.st_shndx),
                        }
                    })?;
                    kpta + kpatch_off + def.sh_offset + sym.st_value
                };

                let a = reloc.r_addend.unwrap_or(0);
                let p = kpta + kpatch_off + target.sh_offset + reloc.r_offset;
                let blob_off = (kpatch_off + target.sh_offset + reloc.r_offset) as usize;

                let (size, value) = match reloc.r_type {
                    R_X86_64_64 => (8, (s as i64).wrapping_add(a) as u64),
                    R_X86_64_PC32 | R_X86_64_PLT32 => {
                        let v = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
                        if v > i32::MAX as i64 || v < i32::MIN as i64 {
                            return Err(PatchError::RelocationFailed {
                                reason: format!(
                                    "pc-relative displacement 0x{:x} out of range at 0x{:x}",
                                    v, p
                                ),
                            });
                        }
                        (4, (v as i32) as u32 as u64)
                    }
                    R_X86_64_32 => {
                        let v = (s as i64).wrapping_add(a);
                        if v < 0 || v > u32::MAX as i64 {
                            return Err(PatchError::RelocationFailed {
                                reason: format!("value 0x{:x} does not fit R_X86_64_32", v),
                            });
                        }
                        (4, v as u64)
                    }
                    R_X86_64_32S => {
                        let v = (s as i64).wrapping_add(a);
                        if v > i32::MAX as i64 || v < i32::MIN as i64 {
                            return Err(PatchError::RelocationFailed {
                                reason: format!("value 0x{:x} does not fit R_X86_64_32S", v),
                            });
                        }
                        (4, (v as i32) as u32 as u64)
                    }
                    other => {
                        return Err(PatchError::RelocationFailed {
                            reason: format!("unsupported relocation type {}", other),
                        })
                    }
                };

                writes.push(PendingWrite { blob_off, size, value });
            }
        }
    }

    let bytes = blob.bytes_mut();
    for w in writes {
        if w.blob_off + w.size > bytes.len() {
            return Err(PatchError::RelocationFailed {
                reason: format!("relocation writes past blob end at 0x{:x}", w.blob_off),
            });
        }
        bytes[w.blob_off..w.blob_off + w.size]
            .copy_from_slice(&w.value.to_le_bytes()[..w.size]);
    }

    Ok(())
}
