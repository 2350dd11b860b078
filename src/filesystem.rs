//! Locating btrfs filesystems and opening their subvolumes.
//!
//! Mountpoints come from `/proc/self/mountinfo`, devices from blkid.
//! To reach every subvolume of a filesystem under one path prefix, a
//! private mount namespace is unshared and the root subvolume mounted
//! at a scratch directory; the mount disappears with the process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::BufRead;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

use uuid::Uuid;

use crate::api::Notice;
use crate::btrfs::{self, RootInfo};
use crate::error::DedupError;
use crate::platform::openat::{open_dir, openat_dir};
use crate::platform::unshare_mount_ns;
use crate::store::Store;

/// Tracking files below this size is not worth the store churn.
pub const DEFAULT_SIZE_CUTOFF: u64 = 8 * 1024 * 1024;

/// One kernel-visible btrfs mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Path of the mounted tree inside the filesystem ("/" or a
    /// subvolume path).
    pub internal_path: PathBuf,
    pub mountpoint: PathBuf,
    pub readonly: bool,
    /// Created by us inside the private namespace.
    pub private: bool,
}

/// Block devices backing one filesystem UUID (several for raid).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub label: Option<String>,
    pub devices: Vec<PathBuf>,
}

/// An open, writable subvolume bound to its store row.
pub struct Volume {
    pub id: i64,
    pub fs_id: i64,
    pub fs_uuid: Uuid,
    pub root_id: u64,
    /// Human-readable description, a path when one is known.
    pub desc: String,
    pub st_dev: u64,
    pub last_tracked_generation: u64,
    pub last_tracked_size_cutoff: Option<u64>,
    pub size_cutoff: u64,
    fd: File,
}

impl Volume {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// True when `path` is `prefix` or lies under it. Both must be
/// absolute and normalised.
fn path_isprefix(prefix: &Path, path: &Path) -> bool {
    path.starts_with(prefix)
}

/// Parse `/proc/self/mountinfo`, keeping btrfs mounts keyed by device.
pub fn parse_mountinfo<R: BufRead>(
    reader: R,
) -> std::io::Result<HashMap<PathBuf, Vec<MountInfo>>> {
    let mut by_dev: HashMap<PathBuf, Vec<MountInfo>> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let items: Vec<&str> = line.split_whitespace().collect();
        let sep = match items.iter().position(|&i| i == "-") {
            Some(idx) => idx,
            None => continue,
        };
        if items.len() < sep + 4 || items.len() < 6 {
            continue;
        }
        if items[sep + 1] != "btrfs" {
            continue;
        }
        let readonly = items[5].split(',').any(|o| o == "ro")
            || items[sep + 3].split(',').any(|o| o == "ro");
        let dev = PathBuf::from(items[sep + 2]);
        let dev = std::fs::canonicalize(&dev).unwrap_or(dev);
        by_dev.entry(dev).or_default().push(MountInfo {
            internal_path: PathBuf::from(items[3]),
            mountpoint: PathBuf::from(items[4]),
            readonly,
            private: false,
        });
    }
    Ok(by_dev)
}

/// Parse one line of `blkid -s LABEL -s UUID -t TYPE=btrfs` output.
pub fn parse_blkid_line(line: &str) -> Option<(PathBuf, Option<String>, Uuid)> {
    let (dev, rest) = line.split_once(':')?;
    let mut label = None;
    let mut uuid = None;
    for field in rest.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        let value = value.strip_prefix('"')?.strip_suffix('"')?;
        match key {
            "LABEL" => label = Some(value.to_string()),
            "UUID" => uuid = Uuid::parse_str(value).ok(),
            _ => {}
        }
    }
    Some((PathBuf::from(dev), label, uuid?))
}

fn blkid_device_info() -> Result<HashMap<Uuid, DeviceInfo>, DedupError> {
    let output = match Command::new("blkid")
        .args(["-s", "LABEL", "-s", "UUID", "-t", "TYPE=btrfs"])
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("blkid not found; no filesystems will be auto-discovered");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(DedupError::Io(e)),
    };
    // blkid exits 2 when nothing matches.
    match output.status.code() {
        Some(0) | Some(2) => {}
        _ => {
            return Err(DedupError::Io(std::io::Error::other(format!(
                "blkid failed: {}",
                output.status
            ))));
        }
    }
    let mut di: HashMap<Uuid, DeviceInfo> = HashMap::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Some((dev, label, uuid)) = parse_blkid_line(line) {
            di.entry(uuid)
                .or_insert_with(|| DeviceInfo {
                    label,
                    devices: Vec::new(),
                })
                .devices
                .push(dev);
        }
    }
    Ok(di)
}

/// The local machine's btrfs filesystems, as far as blkid and
/// mountinfo can see them.
pub struct WholeFs<'a> {
    store: &'a Store,
    size_cutoff_override: Option<u64>,
    mounts_by_dev: HashMap<PathBuf, Vec<MountInfo>>,
    device_info: HashMap<Uuid, DeviceInfo>,
    root_info_cache: HashMap<Uuid, BTreeMap<u64, RootInfo>>,
    priv_mounts: HashMap<Uuid, PathBuf>,
    priv_dirs: Vec<tempfile::TempDir>,
    unshared: bool,
    seen: HashSet<(Uuid, u64)>,
}

impl<'a> WholeFs<'a> {
    pub fn new(store: &'a Store, size_cutoff: Option<u64>) -> Result<Self, DedupError> {
        // Mountpoints must be read before any private mount exists so
        // ours never shows up in the list.
        let mountinfo = File::open("/proc/self/mountinfo").map_err(DedupError::Io)?;
        let mounts_by_dev = parse_mountinfo(std::io::BufReader::new(mountinfo))?;
        let device_info = blkid_device_info()?;
        Ok(WholeFs {
            store,
            size_cutoff_override: size_cutoff,
            mounts_by_dev,
            device_info,
            root_info_cache: HashMap::new(),
            priv_mounts: HashMap::new(),
            priv_dirs: Vec::new(),
            unshared: false,
            seen: HashSet::new(),
        })
    }

    pub fn device_info(&self) -> &HashMap<Uuid, DeviceInfo> {
        &self.device_info
    }

    /// Public (non-private) mountpoints of a filesystem.
    fn minfos(&self, uuid: &Uuid) -> Vec<MountInfo> {
        let mut out = Vec::new();
        if let Some(di) = self.device_info.get(uuid) {
            for dev in &di.devices {
                let dev = std::fs::canonicalize(dev).unwrap_or_else(|_| dev.clone());
                if let Some(mis) = self.mounts_by_dev.get(&dev) {
                    out.extend(mis.iter().cloned());
                }
            }
        }
        out
    }

    fn ensure_unshared(&mut self) -> Result<(), DedupError> {
        if !self.unshared {
            unshare_mount_ns()?;
            self.unshared = true;
        }
        Ok(())
    }

    /// Mount the filesystem's root subvolume at a scratch directory in
    /// our private namespace, making every subvolume reachable.
    fn ensure_private_mount(&mut self, uuid: &Uuid) -> Result<PathBuf, DedupError> {
        if let Some(path) = self.priv_mounts.get(uuid) {
            return Ok(path.clone());
        }
        if !self.device_info.contains_key(uuid) {
            return Err(DedupError::NotPlugged(*uuid));
        }
        self.ensure_unshared()?;
        let dir = tempfile::Builder::new()
            .suffix(".privmnt")
            .tempdir()
            .map_err(DedupError::Io)?;
        let mountpoint = dir.path().to_path_buf();
        let status = Command::new("mount")
            .args(["-t", "btrfs", "-o", "subvol=/,noatime,noexec,nodev", "-n", "-U"])
            .arg(uuid.to_string())
            .arg(&mountpoint)
            .status()
            .map_err(DedupError::Io)?;
        if !status.success() {
            return Err(DedupError::Io(std::io::Error::other(format!(
                "mount of {uuid} failed: {status}"
            ))));
        }
        self.priv_dirs.push(dir);
        self.priv_mounts.insert(*uuid, mountpoint.clone());
        Ok(mountpoint)
    }

    /// Subvolume map of a filesystem, read once per run.
    pub fn root_info(&mut self, uuid: &Uuid) -> Result<&BTreeMap<u64, RootInfo>, DedupError> {
        if !self.root_info_cache.contains_key(uuid) {
            let mountpoint = match self.priv_mounts.get(uuid) {
                Some(p) => p.clone(),
                None => {
                    let minfos = self.minfos(uuid);
                    match minfos.first() {
                        Some(mi) => mi.mountpoint.clone(),
                        None => return Err(DedupError::NotMounted(*uuid)),
                    }
                }
            };
            let fd = open_dir(&mountpoint)?;
            let info = btrfs::read_root_tree(fd.as_raw_fd())?;
            self.root_info_cache.insert(*uuid, info);
        }
        Ok(&self.root_info_cache[uuid])
    }

    /// Best human description for a subvolume: a public mountpoint path
    /// when one covers it, otherwise the internal path behind the UUID.
    fn best_desc(&self, uuid: &Uuid, internal_path: &Path) -> String {
        let mut candidates: Vec<MountInfo> = self
            .minfos(uuid)
            .into_iter()
            .filter(|mi| path_isprefix(&mi.internal_path, internal_path))
            .collect();
        candidates.sort_by_key(|mi| mi.internal_path.as_os_str().len());
        match candidates.last() {
            Some(mi) => {
                let rel = internal_path
                    .strip_prefix(&mi.internal_path)
                    .unwrap_or(internal_path);
                mi.mountpoint.join(rel).display().to_string()
            }
            None => format!("{{{uuid}}}{}", internal_path.display()),
        }
    }

    /// Wrap an open subvolume directory into a tracked `Volume`.
    fn get_vol(
        &mut self,
        fd: File,
        desc: String,
        is_fs_path: bool,
    ) -> Result<Option<Volume>, DedupError> {
        if !btrfs::is_subvolume(fd.as_raw_fd())? {
            return Err(DedupError::NotAVolume(PathBuf::from(desc)));
        }
        let fs_uuid = match btrfs::get_fs_uuid(fd.as_raw_fd()) {
            Ok(uuid) => uuid,
            Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => {
                return Err(DedupError::NotAVolume(PathBuf::from(desc)));
            }
            Err(e) => return Err(DedupError::Io(e)),
        };
        let root_id = btrfs::get_root_id(fd.as_raw_fd())?;

        // A volume listed twice keeps its first fd and description.
        if !self.seen.insert((fs_uuid, root_id)) {
            return Ok(None);
        }

        let fs_id = self.store.get_or_create_fs(&fs_uuid)?;
        let (mut rec, _created) = self.store.get_or_create_volume(
            fs_id,
            root_id,
            self.size_cutoff_override.unwrap_or(DEFAULT_SIZE_CUTOFF),
        )?;
        if let Some(cutoff) = self.size_cutoff_override {
            if cutoff != rec.size_cutoff {
                self.store.set_size_cutoff(rec.id, cutoff)?;
                rec.size_cutoff = cutoff;
            }
        }
        if is_fs_path {
            self.store.record_path_history(rec.id, &desc)?;
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            return Err(DedupError::Io(std::io::Error::last_os_error()));
        }

        Ok(Some(Volume {
            id: rec.id,
            fs_id,
            fs_uuid,
            root_id,
            desc,
            st_dev: st.st_dev,
            last_tracked_generation: rec.last_tracked_generation,
            last_tracked_size_cutoff: rec.last_tracked_size_cutoff,
            size_cutoff: rec.size_cutoff,
            fd,
        }))
    }

    /// Open every non-frozen subvolume of one filesystem through its
    /// private mount.
    pub fn load_vols_for_fs<F>(
        &mut self,
        uuid: &Uuid,
        notify: &mut F,
    ) -> Result<Vec<Volume>, DedupError>
    where
        F: FnMut(&Notice),
    {
        let priv_mount = self.ensure_private_mount(uuid)?;
        let root_info = self.root_info(uuid)?.clone();
        let mut loaded = Vec::new();
        let mut frozen_skipped = 0usize;
        for (_root_id, ri) in &root_info {
            if ri.is_frozen {
                frozen_skipped += 1;
                continue;
            }
            let rel = ri.path.strip_prefix("/").unwrap_or(&ri.path);
            let full = priv_mount.join(rel);
            let fd = open_dir(&full)?;
            let desc = self.best_desc(uuid, &ri.path);
            if let Some(vol) = self.get_vol(fd, desc, false)? {
                loaded.push(vol);
            }
        }
        if frozen_skipped > 0 {
            notify(&Notice::FrozenSkipped {
                fs: uuid.to_string(),
                count: frozen_skipped,
            });
        }
        Ok(loaded)
    }

    /// Every non-frozen subvolume of every filesystem that has a
    /// writable mountpoint.
    pub fn load_all_writable_vols<F>(&mut self, notify: &mut F) -> Result<Vec<Volume>, DedupError>
    where
        F: FnMut(&Notice),
    {
        let uuids: Vec<Uuid> = self.device_info.keys().copied().collect();
        let mut loaded = Vec::new();
        for uuid in uuids {
            let minfos = self.minfos(&uuid);
            if minfos.is_empty() {
                notify(&Notice::FsSkipped {
                    fs: uuid.to_string(),
                    reason: "not mounted",
                });
                continue;
            }
            if minfos.iter().all(|mi| mi.readonly) {
                notify(&Notice::FsSkipped {
                    fs: uuid.to_string(),
                    reason: "not mounted rw",
                });
                continue;
            }
            loaded.extend(self.load_vols_for_fs(&uuid, notify)?);
        }
        Ok(loaded)
    }

    /// The volumes at the given paths, optionally with all their
    /// visible non-frozen descendants.
    pub fn load_vols<F>(
        &mut self,
        paths: &[PathBuf],
        recurse: bool,
        notify: &mut F,
    ) -> Result<Vec<Volume>, DedupError>
    where
        F: FnMut(&Notice),
    {
        let mut loaded = Vec::new();
        for path in paths {
            let fd = open_dir(path)?;
            let fs_uuid = btrfs::get_fs_uuid(fd.as_raw_fd())
                .map_err(|_| DedupError::NotAVolume(path.clone()))?;
            let start_root = btrfs::get_root_id(fd.as_raw_fd())?;
            let start_fd = fd.as_raw_fd();
            let vol = match self.get_vol(fd, path.display().to_string(), true)? {
                Some(vol) => vol,
                None => continue,
            };
            if !recurse {
                loaded.push(vol);
                continue;
            }

            let root_info = match self.root_info_for_fd(&fs_uuid, start_fd) {
                Ok(info) => info,
                Err(e) => return Err(e),
            };
            let start_path = root_info
                .get(&start_root)
                .map(|ri| ri.path.clone())
                .unwrap_or_else(|| PathBuf::from("/"));
            let mut frozen_skipped = 0usize;
            let descendants: Vec<(u64, RootInfo)> = root_info
                .iter()
                .filter(|&(&id, ref ri)| id != start_root && path_isprefix(&start_path, &ri.path))
                .map(|(&id, ri)| (id, ri.clone()))
                .collect();
            let start_raw = vol.raw_fd();
            loaded.push(vol);
            for (_id, ri) in descendants {
                if ri.is_frozen {
                    frozen_skipped += 1;
                    continue;
                }
                let rel = ri.path.strip_prefix(&start_path).unwrap_or(&ri.path);
                let child_fd = openat_dir(start_raw, rel)?;
                let desc = path.join(rel).display().to_string();
                if let Some(child) = self.get_vol(child_fd, desc, true)? {
                    loaded.push(child);
                }
            }
            if frozen_skipped > 0 {
                notify(&Notice::FrozenSkipped {
                    fs: fs_uuid.to_string(),
                    count: frozen_skipped,
                });
            }
        }
        Ok(loaded)
    }

    /// Root info read through an already-open fd, bypassing mountpoint
    /// discovery (used when a volume was named by path).
    fn root_info_for_fd(
        &mut self,
        uuid: &Uuid,
        fd: RawFd,
    ) -> Result<BTreeMap<u64, RootInfo>, DedupError> {
        if let Some(info) = self.root_info_cache.get(uuid) {
            return Ok(info.clone());
        }
        let info = btrfs::read_root_tree(fd)?;
        self.root_info_cache.insert(*uuid, info.clone());
        Ok(info)
    }

    /// Unmount the private mounts. Runs from `Drop` too; explicit calls
    /// get error reporting.
    pub fn clean_up(&mut self) {
        for (_uuid, mountpoint) in self.priv_mounts.drain() {
            let status = Command::new("umount").arg("-n").arg("--").arg(&mountpoint).status();
            if let Ok(status) = status {
                if !status.success() {
                    tracing::warn!("umount of {} failed: {status}", mountpoint.display());
                }
            }
        }
        self.priv_dirs.clear();
    }
}

impl Drop for WholeFs<'_> {
    fn drop(&mut self) {
        self.clean_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountinfo_keeps_only_btrfs() {
        let data = "\
36 35 98:0 / /mnt1 rw,noatime master:1 - ext4 /dev/fake-root rw,errors=continue
37 35 0:41 /subv /mnt2 rw,noatime - btrfs /dev/fake-sdb1 rw,space_cache
38 35 0:41 / /mnt3 ro,noatime - btrfs /dev/fake-sdb1 ro,space_cache
";
        let parsed = parse_mountinfo(data.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 1);
        let mis = &parsed[&PathBuf::from("/dev/fake-sdb1")];
        assert_eq!(mis.len(), 2);
        assert_eq!(mis[0].internal_path, PathBuf::from("/subv"));
        assert_eq!(mis[0].mountpoint, PathBuf::from("/mnt2"));
        assert!(!mis[0].readonly);
        assert!(mis[1].readonly);
    }

    #[test]
    fn mountinfo_reads_super_opts_for_ro() {
        let data =
            "38 35 0:41 / /mnt rw,noatime - btrfs /dev/fake-sdb1 ro,space_cache\n";
        let parsed = parse_mountinfo(data.as_bytes()).unwrap();
        assert!(parsed[&PathBuf::from("/dev/fake-sdb1")][0].readonly);
    }

    #[test]
    fn blkid_line_roundtrip() {
        let (dev, label, uuid) = parse_blkid_line(
            "/dev/sdb1: LABEL=\"backup\" UUID=\"3b7e44e4-a01d-441f-a1b7-b6ecd9d5ad9a\"",
        )
        .unwrap();
        assert_eq!(dev, PathBuf::from("/dev/sdb1"));
        assert_eq!(label.as_deref(), Some("backup"));
        assert_eq!(
            uuid,
            Uuid::parse_str("3b7e44e4-a01d-441f-a1b7-b6ecd9d5ad9a").unwrap()
        );
    }

    #[test]
    fn blkid_line_without_label() {
        let (_, label, _) = parse_blkid_line(
            "/dev/sdc: UUID=\"11111111-2222-3333-4444-555555555555\"",
        )
        .unwrap();
        assert_eq!(label, None);
    }

    #[test]
    fn blkid_garbage_is_rejected() {
        assert!(parse_blkid_line("not a blkid line").is_none());
        assert!(parse_blkid_line("/dev/sdd: TYPE=\"ext4\"").is_none());
    }
}
