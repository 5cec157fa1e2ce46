//! Patch storage.
//!
//! Storage is either a single blob file or a directory tree indexed by
//! Build-ID. Directory lookups go through an in-memory cache so repeated
//! queries for the same Build-ID (common when patching "all" processes)
//! hit the filesystem once, including the negative case.

pub mod blob;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{PatchError, Result};
use crate::process::ProcessCtx;
use blob::PatchBlob;

/// Probe order for directory storage. The first template indirects through
/// a `latest` symlink whose target name is the decimal patch level.
const PATCHLEVEL_TEMPLATE: usize = 0;

fn template_paths(buildid: &str) -> [PathBuf; 2] {
    [
        Path::new(buildid).join("latest").join("kpatch.bin"),
        PathBuf::from(format!("{}.kpatch", buildid)),
    ]
}

/// Cached per-Build-ID lookup outcome. `size == 0` records "known absent";
/// a stat-only probe records the size without loading the blob, and a later
/// data lookup upgrades the entry in place.
#[derive(Debug)]
struct CachedPatch {
    size: i64,
    level: i32,
    blob: Option<Rc<PatchBlob>>,
}

#[derive(Debug)]
enum StorageKind {
    File { blob: Rc<PatchBlob> },
    Dir { root: PathBuf, cache: HashMap<String, CachedPatch> },
}

#[derive(Debug)]
pub struct Storage {
    path: String,
    kind: StorageKind,
}

impl Storage {
    /// Open a storage path: a directory becomes an indexed tree with an
    /// empty cache, a file is loaded and verified up front.
    pub fn open(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| PatchError::StorageUnavailable {
            path: path.display().to_string(),
            source: e,
        })?;

        let kind = if meta.is_dir() {
            StorageKind::Dir {
                root: path.to_path_buf(),
                cache: HashMap::new(),
            }
        } else {
            let blob = PatchBlob::open(path).map_err(|e| match e {
                PatchError::Io(io) => PatchError::StorageUnavailable {
                    path: path.display().to_string(),
                    source: io,
                },
                other => other,
            })?;
            blob.verify()?;
            log::debug!("storage blob for build id '{}' verified", blob.uname());
            StorageKind::File { blob: Rc::new(blob) }
        };

        Ok(Storage {
            path: path.display().to_string(),
            kind,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read the patch level for a template-0 entry: the `latest` symlink's
    /// target name is the decimal level.
    fn read_patchlevel(root: &Path, buildid: &str) -> Result<i32> {
        let link = root.join(buildid).join("latest");
        let target = fs::read_link(&link)?;
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        name.parse::<i32>().map_err(|_| PatchError::InvalidPatch {
            reason: format!("'{}' links to non-numeric level '{}'", link.display(), name),
        })
    }

    /// Probe the path templates and load the first match. `Ok(None)` means
    /// every probe was ENOENT; anything else fails hard.
    fn open_patch(root: &Path, buildid: &str) -> Result<Option<(Rc<PatchBlob>, i32)>> {
        for (i, rel) in template_paths(buildid).iter().enumerate() {
            let full = root.join(rel);
            let mut blob = match PatchBlob::open(&full) {
                Ok(blob) => blob,
                Err(PatchError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            blob.verify()?;

            if i == PATCHLEVEL_TEMPLATE {
                let level = Self::read_patchlevel(root, buildid)?;
                blob.set_user_level(level);
            }
            let level = blob.user_level();
            return Ok(Some((Rc::new(blob), level)));
        }
        Ok(None)
    }

    /// Existence-only probe: stat the templates, never map the data.
    fn stat_patch(root: &Path, buildid: &str) -> Result<Option<(i64, i32)>> {
        for (i, rel) in template_paths(buildid).iter().enumerate() {
            let full = root.join(rel);
            let meta = match fs::metadata(&full) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let level = if i == PATCHLEVEL_TEMPLATE {
                Self::read_patchlevel(root, buildid)?
            } else {
                0
            };
            return Ok(Some((meta.len() as i64, level)));
        }
        Ok(None)
    }

    /// Find a patch blob for `buildid`, loading and caching data.
    pub fn find(&mut self, buildid: &str) -> Result<Option<Rc<PatchBlob>>> {
        match &mut self.kind {
            StorageKind::File { blob } => {
                if blob.uname() == buildid {
                    Ok(Some(Rc::clone(blob)))
                } else {
                    Ok(None)
                }
            }
            StorageKind::Dir { root, cache } => {
                if let Some(entry) = cache.get_mut(buildid) {
                    if entry.size == 0 {
                        return Ok(None);
                    }
                    if let Some(blob) = &entry.blob {
                        return Ok(Some(Rc::clone(blob)));
                    }
                    // Stat-only entry from an earlier existence check;
                    // load the data now and keep it.
                    let opened = Self::open_patch(root, buildid)?;
                    return match opened {
                        Some((blob, level)) => {
                            entry.level = level;
                            entry.blob = Some(Rc::clone(&blob));
                            Ok(Some(blob))
                        }
                        None => {
                            entry.size = 0;
                            Ok(None)
                        }
                    };
                }

                let found = Self::open_patch(root, buildid)?;
                let entry = match &found {
                    Some((blob, level)) => CachedPatch {
                        size: blob.len() as i64,
                        level: *level,
                        blob: Some(Rc::clone(blob)),
                    },
                    None => CachedPatch { size: 0, level: 0, blob: None },
                };
                cache.insert(buildid.to_string(), entry);
                Ok(found.map(|(blob, _)| blob))
            }
        }
    }

    /// Existence check without loading data; caches the outcome.
    pub fn has_patch(&mut self, buildid: &str) -> Result<bool> {
        match &mut self.kind {
            StorageKind::File { blob } => Ok(blob.uname() == buildid),
            StorageKind::Dir { root, cache } => {
                if let Some(entry) = cache.get(buildid) {
                    return Ok(entry.size > 0);
                }
                let stat = Self::stat_patch(root, buildid)?;
                let entry = match stat {
                    Some((size, level)) => CachedPatch { size, level, blob: None },
                    None => CachedPatch { size: 0, level: 0, blob: None },
                };
                let found = entry.size > 0;
                cache.insert(buildid.to_string(), entry);
                Ok(found)
            }
        }
    }

    /// Attach a storage blob to every ELF object in the process whose
    /// Build-ID has a patch. Returns how many objects matched.
    pub fn lookup_patches(&mut self, proc: &mut ProcessCtx) -> usize {
        let mut found = 0;
        for obj in proc.objects.iter_mut() {
            if !obj.is_elf || obj.is_kernel_object() {
                continue;
            }
            let Some(bid) = obj.buildid.clone() else { continue };
            match self.find(&bid) {
                Ok(Some(blob)) => {
                    obj.skpfile = Some(blob);
                    found += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("error finding patch for {} ({}): {}", obj.name, bid, e);
                }
            }
        }
        log::info!("{} object(s) have valid patch(es)", found);

        log::debug!("object files dump:");
        for obj in proc.objects.iter() {
            obj.dump();
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_blob, TempDir};
    use std::os::unix::fs::symlink;

    fn write_blob(dir: &Path, rel: &str, blob: &PatchBlob) {
        let full = dir.join(rel);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, blob.bytes()).unwrap();
    }

    #[test]
    fn single_file_storage_matches_by_uname() {
        let tmp = TempDir::new("single-file");
        let blob = build_blob("B0", 1, &[(0x400100, 16, 0, 32)], &[]);
        let path = tmp.path().join("one.kpatch");
        fs::write(&path, blob.bytes()).unwrap();

        let mut storage = Storage::open(&path).unwrap();
        assert!(storage.find("B0").unwrap().is_some());
        assert!(storage.find("C0").unwrap().is_none());
        assert!(storage.has_patch("B0").unwrap());
        assert!(!storage.has_patch("C0").unwrap());
    }

    #[test]
    fn open_rejects_missing_path() {
        let tmp = TempDir::new("missing");
        let err = Storage::open(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, PatchError::StorageUnavailable { .. }));
    }

    #[test]
    fn open_rejects_invalid_single_file() {
        let tmp = TempDir::new("bad-file");
        let path = tmp.path().join("junk.kpatch");
        fs::write(&path, b"not a patch").unwrap();
        let err = Storage::open(&path).unwrap_err();
        assert!(matches!(err, PatchError::InvalidPatch { .. }));
    }

    #[test]
    fn directory_storage_probes_direct_template() {
        let tmp = TempDir::new("dir-direct");
        let blob = build_blob("C0", 3, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "C0.kpatch", &blob);

        let mut storage = Storage::open(tmp.path()).unwrap();
        let found = storage.find("C0").unwrap().unwrap();
        assert_eq!(found.uname(), "C0");
        assert_eq!(found.user_level(), 3);
        assert!(storage.find("B0").unwrap().is_none());
    }

    #[test]
    fn directory_storage_stamps_level_from_latest_symlink() {
        let tmp = TempDir::new("dir-latest");
        let blob = build_blob("B0", 0, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0/7/kpatch.bin", &blob);
        symlink("7", tmp.path().join("B0").join("latest")).unwrap();

        let mut storage = Storage::open(tmp.path()).unwrap();
        let found = storage.find("B0").unwrap().unwrap();
        // The on-disk header said level 0; the symlink target wins.
        assert_eq!(found.user_level(), 7);
    }

    #[test]
    fn latest_template_precedes_direct_entry() {
        let tmp = TempDir::new("dir-order");
        let latest = build_blob("B0", 0, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0/2/kpatch.bin", &latest);
        symlink("2", tmp.path().join("B0").join("latest")).unwrap();
        let direct = build_blob("B0", 9, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0.kpatch", &direct);

        let mut storage = Storage::open(tmp.path()).unwrap();
        let found = storage.find("B0").unwrap().unwrap();
        assert_eq!(found.user_level(), 2);
    }

    #[test]
    fn absent_entries_are_cached() {
        let tmp = TempDir::new("dir-absent");
        let mut storage = Storage::open(tmp.path()).unwrap();
        assert!(storage.find("B0").unwrap().is_none());

        // Even if the patch appears later, the negative entry sticks for
        // the lifetime of the storage handle.
        let blob = build_blob("B0", 1, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0.kpatch", &blob);
        assert!(storage.find("B0").unwrap().is_none());
        assert!(!storage.has_patch("B0").unwrap());
    }

    #[test]
    fn repeated_find_returns_same_blob() {
        let tmp = TempDir::new("dir-cache");
        let blob = build_blob("B0", 1, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0.kpatch", &blob);

        let mut storage = Storage::open(tmp.path()).unwrap();
        let first = storage.find("B0").unwrap().unwrap();
        let second = storage.find("B0").unwrap().unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn stat_only_entry_upgrades_to_data() {
        let tmp = TempDir::new("dir-upgrade");
        let blob = build_blob("B0", 1, &[(0x400100, 16, 0, 32)], &[]);
        write_blob(tmp.path(), "B0.kpatch", &blob);

        let mut storage = Storage::open(tmp.path()).unwrap();
        assert!(storage.has_patch("B0").unwrap());
        let found = storage.find("B0").unwrap().unwrap();
        assert_eq!(found.uname(), "B0");
    }

    #[test]
    fn corrupt_blob_in_directory_is_a_hard_error() {
        let tmp = TempDir::new("dir-corrupt");
        fs::write(tmp.path().join("B0.kpatch"), b"garbage").unwrap();
        let mut storage = Storage::open(tmp.path()).unwrap();
        assert!(storage.find("B0").is_err());
    }
}
