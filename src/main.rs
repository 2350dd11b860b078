use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use btrdedup::api::Notice;
use btrdedup::btrfs;
use btrdedup::dedup::{DedupOptions, dedup_files, dedup_filesystem};
use btrdedup::error::DedupError;
use btrdedup::filesystem::{Volume, WholeFs};
use btrdedup::platform::ioprio::set_idle_priority;
use btrdedup::platform::openat::open_dir;
use btrdedup::platform::syncfs;
use btrdedup::scan::scan_volume;
use btrdedup::store::Store;

#[derive(Parser)]
#[command(
    name = "btrdedup",
    about = "Deduplicates file data of a btrfs filesystem using shared-extent clones"
)]
struct Cli {
    /// Location of the tracking database.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// More logging; repeat for debug output.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track changed files on the given volumes (all writable volumes
    /// when none are named).
    Scan {
        volumes: Vec<PathBuf>,
        /// Only track files at least this large.
        #[arg(long)]
        size_cutoff: Option<u64>,
        /// Sync the filesystem before reading the generation watermark.
        #[arg(long)]
        flush: bool,
    },
    /// Scan, then deduplicate tracked files.
    Dedup {
        volumes: Vec<PathBuf>,
        #[arg(long)]
        size_cutoff: Option<u64>,
        #[arg(long)]
        flush: bool,
        /// Defragment clone sources first (may unshare extents).
        #[arg(long)]
        defrag: bool,
        /// Process each subvolume separately instead of batching by
        /// filesystem.
        #[arg(long)]
        no_crossvol: bool,
    },
    /// Drop tracking data for a volume and rewind its scan watermark.
    Reset { volume: PathBuf },
    /// Show tracked filesystems and volumes.
    Show {
        /// Restrict to one filesystem UUID.
        uuid: Option<String>,
    },
    /// List changes to a volume since a generation.
    FindNew {
        volume: PathBuf,
        generation: Option<u64>,
        /// Print file names only.
        #[arg(long)]
        terse: bool,
    },
    /// Forget a filesystem and all its tracking data and history.
    ForgetFs { uuid: String },
    /// Freeze the given files, check they are identical, and clone the
    /// first one's extents onto the rest.
    DedupFiles {
        source: PathBuf,
        dests: Vec<PathBuf>,
        #[arg(long)]
        defrag: bool,
    },
    /// Print the current generation of a volume.
    Generation {
        volume: PathBuf,
        #[arg(long)]
        flush: bool,
    },
    /// List tracked inodes of one exact size.
    SizeLookup { size: u64 },
}

fn default_db_path() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
            home.join(".local/share")
        });
    base.join("btrdedup/db.sqlite")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);
    match run(cli, &db_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let DedupError::Io(io_err) = &e {
                if io_err.raw_os_error() == Some(libc::EPERM) {
                    eprintln!("Insufficient privileges, run as root: {e}");
                    return ExitCode::from(1);
                }
            }
            eprintln!("{e}");
            if e.is_user_recoverable() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(cli: Cli, db_path: &PathBuf) -> Result<(), DedupError> {
    match cli.command {
        Command::Scan {
            volumes,
            size_cutoff,
            flush,
        } => {
            let store = Store::open(db_path)?;
            scan_and_dedup(&store, &volumes, size_cutoff, flush, None)
        }
        Command::Dedup {
            volumes,
            size_cutoff,
            flush,
            defrag,
            no_crossvol,
        } => {
            let store = Store::open(db_path)?;
            let opts = DedupRun {
                defrag,
                no_crossvol,
            };
            scan_and_dedup(&store, &volumes, size_cutoff, flush, Some(opts))
        }
        Command::Reset { volume } => {
            let store = Store::open(db_path)?;
            cmd_reset(&store, &volume)
        }
        Command::Show { uuid } => {
            let store = Store::open(db_path)?;
            cmd_show(&store, uuid.as_deref())
        }
        Command::FindNew {
            volume,
            generation,
            terse,
        } => {
            let fd = open_dir(&volume)?;
            use std::os::fd::AsRawFd;
            let mut stdout = std::io::stdout().lock();
            btrfs::find_new(fd.as_raw_fd(), generation.unwrap_or(0), &mut stdout, terse)
        }
        Command::ForgetFs { uuid } => {
            let store = Store::open(db_path)?;
            let uuid = Uuid::parse_str(&uuid)
                .map_err(|_| DedupError::Parse("not a valid filesystem uuid"))?;
            if store.forget_fs(&uuid)? {
                println!("Forgot filesystem {uuid}");
            } else {
                println!("Filesystem {uuid} was not tracked");
            }
            Ok(())
        }
        Command::DedupFiles {
            source,
            dests,
            defrag,
        } => dedup_files(&source, &dests, defrag),
        Command::Generation { volume, flush } => {
            let fd = open_dir(&volume)?;
            use std::os::fd::AsRawFd;
            if flush {
                syncfs(fd.as_raw_fd())?;
            }
            println!("{}", btrfs::get_root_generation(fd.as_raw_fd())?);
            Ok(())
        }
        Command::SizeLookup { size } => {
            let store = Store::open(db_path)?;
            for (uuid, root_id, ino) in store.inodes_by_size(size)? {
                println!("fs {uuid} volume {root_id} inode {ino}");
            }
            Ok(())
        }
    }
}

struct DedupRun {
    defrag: bool,
    no_crossvol: bool,
}

fn scan_and_dedup(
    store: &Store,
    volume_paths: &[PathBuf],
    size_cutoff: Option<u64>,
    flush: bool,
    dedup: Option<DedupRun>,
) -> Result<(), DedupError> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        let _ = ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed));
    }

    if let Err(e) = set_idle_priority() {
        tracing::debug!("could not enter idle I/O class: {e}");
    }

    let mut whole = WholeFs::new(store, size_cutoff)?;
    let mut notify = |n: &Notice| {
        println!("{n}");
        let _ = std::io::stdout().flush();
    };

    let mut vols = if volume_paths.is_empty() {
        whole.load_all_writable_vols(&mut notify)?
    } else {
        whole.load_vols(volume_paths, true, &mut notify)?
    };

    for vol in vols.iter_mut() {
        scan_volume(store, vol, flush, &mut notify)?;
    }

    if let Some(run) = dedup {
        let opts = DedupOptions { defrag: run.defrag };
        // Volumes batch by filesystem; dedup never crosses one.
        let mut by_fs: Vec<(i64, Vec<Volume>)> = Vec::new();
        for vol in vols {
            match by_fs.iter_mut().find(|(fs_id, _)| *fs_id == vol.fs_id) {
                Some((_, batch)) => batch.push(vol),
                None => by_fs.push((vol.fs_id, vec![vol])),
            }
        }
        for (fs_id, batch) in by_fs {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if run.no_crossvol {
                for vol in batch {
                    let single = [vol];
                    dedup_filesystem(store, fs_id, &single, &cancel, &opts, &mut notify)?;
                }
            } else {
                dedup_filesystem(store, fs_id, &batch, &cancel, &opts, &mut notify)?;
            }
        }
    }

    whole.clean_up();
    Ok(())
}

fn cmd_reset(store: &Store, volume: &PathBuf) -> Result<(), DedupError> {
    use std::os::fd::AsRawFd;
    let fd = open_dir(volume)?;
    let uuid = btrfs::get_fs_uuid(fd.as_raw_fd())
        .map_err(|_| DedupError::NotAVolume(volume.clone()))?;
    let root_id = btrfs::get_root_id(fd.as_raw_fd())?;
    let fs = store
        .list_filesystems()?
        .into_iter()
        .find(|(_, u)| *u == uuid);
    let Some((fs_id, _)) = fs else {
        println!("Volume {} was not tracked", volume.display());
        return Ok(());
    };
    match store.volume_by_root(fs_id, root_id)? {
        Some(rec) => {
            store.reset_volume(rec.id)?;
            println!("Reset tracking for volume {}", volume.display());
        }
        None => println!("Volume {} was not tracked", volume.display()),
    }
    Ok(())
}

fn cmd_show(store: &Store, uuid_filter: Option<&str>) -> Result<(), DedupError> {
    let filter = match uuid_filter {
        Some(s) => {
            Some(Uuid::parse_str(s).map_err(|_| DedupError::Parse("not a valid filesystem uuid"))?)
        }
        None => None,
    };
    // Live subvolume info needs root and a mounted filesystem; without
    // either, the stored state still prints.
    let mut whole = WholeFs::new(store, None).ok();
    let mut found = filter.is_none();
    for (fs_id, uuid) in store.list_filesystems()? {
        if let Some(wanted) = filter {
            if uuid != wanted {
                continue;
            }
            found = true;
        }
        println!("Filesystem {uuid}");
        let root_info = whole
            .as_mut()
            .and_then(|w| w.root_info(&uuid).ok().cloned());
        for vol in store.volumes_of_fs(fs_id)? {
            let flags = match &root_info {
                Some(info) => match info.get(&vol.root_id) {
                    None => " (deleted)",
                    Some(ri) if ri.is_frozen => " (frozen)",
                    Some(_) => "",
                },
                None => "",
            };
            println!("  Volume {}{flags}", vol.root_id);
            let count = store.inode_count(vol.id)?;
            if count > 0 {
                println!(
                    "    As of generation {}, tracking {count} inodes of size at least {}",
                    vol.last_tracked_generation, vol.size_cutoff
                );
            }
            if let Some(ri) = root_info.as_ref().and_then(|info| info.get(&vol.root_id)) {
                println!("    Internal path {}", ri.path.display());
            } else if let Some(mountpoint) = store.last_known_mountpoint(vol.id)? {
                println!("    Last seen at {mountpoint}");
            }
        }
    }
    if !found {
        eprintln!("Filesystem {} was not found", uuid_filter.unwrap_or(""));
    }
    Ok(())
}
