use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use regex::Regex;

use repatch::patch::{apply_patches, unapply_patches};
use repatch::process::ProcessCtx;
use repatch::storage::Storage;

#[derive(Parser)]
#[command(name = "repatch", version, about = "Apply and revert binary live patches on running processes")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply patches from storage to a process
    Patch {
        /// Target PID, or 'all'
        #[arg(short = 'p')]
        pid: String,

        /// The process was just executed; run it to its entry point first
        /// so the dynamic loader has mapped the shared libraries
        #[arg(short = 's')]
        just_started: bool,

        /// Report the result over this inherited file descriptor
        /// (execve-preload channel)
        #[arg(short = 'r')]
        send_fd: Option<i32>,

        /// Patch file or storage directory
        storage: PathBuf,
    },

    /// Cancel patches applied to a process
    Unpatch {
        /// Target PID, or 'all'
        #[arg(short = 'p')]
        pid: String,

        /// Build-IDs or object names to cancel; empty cancels everything
        ids: Vec<String>,
    },

    /// Show patchable objects of processes
    Info {
        /// Only show processes having an object with this Build-ID loaded
        #[arg(short = 'b', conflicts_with_all = ["storage", "name_re"])]
        buildid: Option<String>,

        /// Target PID, 'all' or omitted for every process
        #[arg(short = 'p')]
        pid: Option<String>,

        /// Only show objects having a patch in this storage
        #[arg(short = 's')]
        storage: Option<PathBuf>,

        /// Only show objects whose name matches this regular expression
        #[arg(short = 'r')]
        name_re: Option<String>,
    },
}

fn parse_pid(arg: &str) -> Option<i32> {
    if arg == "all" {
        Some(-1)
    } else {
        arg.parse().ok().filter(|pid| *pid > 0)
    }
}

/// Run `callback` for one PID, or for every process in the system when
/// `pid` is -1 (skipping init and ourselves). A callback returning -2
/// stops the walk; -1 marks the whole run failed but keeps going.
fn processes_do(pid: i32, mut callback: impl FnMut(i32) -> i32) -> i32 {
    if pid != -1 {
        return callback(pid);
    }

    let dir = match std::fs::read_dir("/proc") {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("can't open '/proc' directory: {}", e);
            return -1;
        }
    };

    let own_pid = std::process::id() as i32;
    let mut ret = 0;
    for entry in dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == 1 || pid == own_pid {
            continue;
        }
        let rv = callback(pid);
        if rv < 0 {
            ret = -1;
        }
        if rv == -2 {
            break;
        }
    }
    ret
}

fn patch_pipeline(
    proc: &mut ProcessCtx,
    storage: &mut Storage,
    just_started: bool,
) -> repatch::Result<usize> {
    proc.attach()?;
    if just_started {
        proc.run_to_entry()?;
    }
    proc.map_object_files()?;
    proc.associate_patches()?;
    if storage.lookup_patches(proc) == 0 {
        return Ok(0);
    }
    proc.find_coroutines()?;
    apply_patches(proc)
}

fn process_patch(pid: i32, storage: &mut Storage, just_started: bool, send_fd: Option<i32>) -> i32 {
    let ret = (|| {
        let mut proc = ProcessCtx::new(pid).map_err(|e| {
            log::error!("cannot init process {}: {}", pid, e);
            e
        })?;
        proc.print_short();
        let result = patch_pipeline(&mut proc, storage, just_started);
        let _ = proc.detach();
        result
    })();

    let code: i32 = match ret {
        Err(e) => {
            println!("Failed to apply patch '{}'", storage.path());
            log::error!("failed to apply patch '{}': {}", storage.path(), e);
            -1
        }
        Ok(0) => {
            println!("No patch(es) applicable to PID '{}' have been found", pid);
            0
        }
        Ok(n) => {
            println!(
                "{} patch hunk(s) have been successfully applied to PID '{}'",
                n, pid
            );
            0
        }
    };

    // Release a process held by the execve preload shim, reporting how the
    // patching went.
    if let Some(fd) = send_fd {
        let msg = code.to_le_bytes();
        let rc = unsafe { libc::write(fd, msg.as_ptr() as *const libc::c_void, msg.len()) };
        if rc != msg.len() as isize {
            log::warn!("cannot report result over fd {}", fd);
        }
    }

    code
}

fn process_unpatch(pid: i32, ids: &[String]) -> i32 {
    let ret = (|| {
        let mut proc = ProcessCtx::new(pid)?;
        proc.print_short();
        let result = (|| {
            proc.attach()?;
            proc.map_object_files()?;
            proc.find_coroutines()?;
            unapply_patches(&mut proc, ids)
        })();
        let _ = proc.detach();
        result
    })();

    match ret {
        Err(e) => {
            println!("Failed to cancel patches for {}", pid);
            log::error!("failed to cancel patches for {}: {}", pid, e);
            -1
        }
        Ok(0) => {
            println!("No patch(es) cancellable from PID '{}' were found", pid);
            0
        }
        Ok(n) => {
            println!(
                "{} patch hunk(s) were successfully cancelled from PID '{}'",
                n, pid
            );
            0
        }
    }
}

fn process_info(
    pid: i32,
    buildid: Option<&str>,
    storage: Option<&mut Storage>,
    name_re: Option<&Regex>,
) -> i32 {
    let mut proc = match ProcessCtx::new(pid) {
        Ok(proc) => proc,
        Err(_) => return -1, // the process may have exited mid-walk
    };

    let ret = (|| -> repatch::Result<()> {
        proc.attach()?;
        proc.map_object_files()?;
        Ok(())
    })();
    if let Err(e) = ret {
        let _ = proc.detach();
        log::error!("cannot inspect process {}: {}", pid, e);
        return -1;
    }

    let mut storage = storage;
    let mut pid_printed = false;
    for obj in proc.objects.iter() {
        if !obj.is_elf || obj.is_kernel_object() {
            continue;
        }
        if let Some(re) = name_re {
            if !re.is_match(&obj.name) {
                continue;
            }
        }
        let Some(bid) = obj.buildid.as_deref() else { continue };

        if let Some(wanted) = buildid {
            if wanted == bid {
                println!("pid={} comm={}", pid, proc.comm);
                println!("{} {}", obj.name, bid);
                break;
            }
            continue;
        }

        if let Some(storage) = storage.as_mut() {
            match storage.has_patch(bid) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::error!("error checking patch for {} ({}): {}", obj.name, bid, e);
                    continue;
                }
            }
        }

        if !pid_printed {
            println!("pid={} comm={}", pid, proc.comm);
            pid_printed = true;
        }
        println!("{} {}", obj.name, bid);
    }

    let _ = proc.detach();
    0
}

fn cmd_patch(pid: &str, just_started: bool, send_fd: Option<i32>, storage_path: &PathBuf) -> i32 {
    let Some(pid) = parse_pid(pid) else {
        log::error!("bad PID argument '{}'", pid);
        return -1;
    };
    let mut storage = match Storage::open(storage_path) {
        Ok(storage) => storage,
        Err(e) => {
            log::error!("{}", e);
            return -1;
        }
    };
    processes_do(pid, |pid| process_patch(pid, &mut storage, just_started, send_fd))
}

fn cmd_unpatch(pid: &str, ids: &[String]) -> i32 {
    let Some(pid) = parse_pid(pid) else {
        log::error!("bad PID argument '{}'", pid);
        return -1;
    };
    processes_do(pid, |pid| process_unpatch(pid, ids))
}

fn cmd_info(
    pid: Option<&str>,
    buildid: Option<&str>,
    storage_path: Option<&PathBuf>,
    name_re: Option<&str>,
) -> i32 {
    let Some(pid) = parse_pid(pid.unwrap_or("all")) else {
        log::error!("bad PID argument");
        return -1;
    };

    let name_re = match name_re.map(Regex::new) {
        None => None,
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => {
            log::error!("bad regular expression: {}", e);
            return -1;
        }
    };

    let mut storage = match storage_path.map(|p| Storage::open(p)) {
        None => None,
        Some(Ok(storage)) => Some(storage),
        Some(Err(e)) => {
            log::error!("{}", e);
            return -1;
        }
    };

    processes_do(pid, |pid| {
        process_info(pid, buildid, storage.as_mut(), name_re.as_ref())
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        // Plain listing output unless asked for more.
        Command::Info { .. } => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            default_level
        })
        .format_timestamp(None)
        .init();

    let ret = match &cli.command {
        Command::Patch { pid, just_started, send_fd, storage } => {
            cmd_patch(pid, *just_started, *send_fd, storage)
        }
        Command::Unpatch { pid, ids } => cmd_unpatch(pid, ids),
        Command::Info { buildid, pid, storage, name_re } => cmd_info(
            pid.as_deref(),
            buildid.as_deref(),
            storage.as_ref(),
            name_re.as_deref(),
        ),
    };

    if ret < 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
