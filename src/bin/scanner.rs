//! Fleet control loop. Enumerates `active/`, starts one monitor per
//! active service it hasn't seen before (or whose monitor has died),
//! and reaps monitor children. Identity is tracked by (device, inode)
//! of the resolved service directory so renaming the active-link name
//! doesn't spawn a duplicate monitor.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use srvkit::layout;

const MAX_SERVICES: usize = 128;
const PAUSE_SCANNER: Duration = Duration::from_secs(5);
const PAUSE_MONITOR: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(about = "Starts and restarts one monitor per active service")]
struct Args {
    /// Base directory (default: $SRVCTL_BASE or /services).
    #[arg(long)]
    base: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ServiceKey {
    dev: u64,
    ino: u64,
}

struct ServiceEntry {
    pid: u32, // 0 = no monitor currently running
    active: bool,
    name: String,
}

static STOP: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

fn main() -> Result<()> {
    srvkit::logging::init("scanner");
    let args = Args::parse();
    let base = layout::resolve_base(args.base.as_deref());

    install_signal_handlers()?;

    let active_dir = layout::active_dir(&base);
    std::env::set_current_dir(&active_dir)
        .with_context(|| format!("chdir into {active_dir:?}"))?;
    if let Err(e) = srvkit::priv_drop::drop_privileges(None, None) {
        tracing::warn!(error = %e, "failed to drop privileges");
    }

    let mut services: HashMap<ServiceKey, ServiceEntry> = HashMap::new();

    tracing::info!(base = %base.display(), "scanner starting");
    while !STOP.load(std::sync::atomic::Ordering::Relaxed) {
        reap_monitors(&mut services);
        scan_once(&mut services)?;
        sweep_gone(&mut services);
        std::thread::sleep(PAUSE_SCANNER);
    }
    tracing::info!("scanner exiting");
    Ok(())
}

fn install_signal_handlers() -> Result<()> {
    extern "C" fn on_stop(_: i32) {
        STOP.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    unsafe {
        let action = nix::sys::signal::SigHandler::Handler(on_stop);
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
            nix::sys::signal::signal(sig, action)?;
        }
        // SIGHUP is ignored; the scanner has no per-signal reload behavior.
        nix::sys::signal::signal(Signal::SIGHUP, nix::sys::signal::SigHandler::SigIgn)?;
    }
    let _ = SigSet::empty(); // no signals are blocked; handlers run normally
    Ok(())
}

fn reap_monitors(services: &mut HashMap<ServiceKey, ServiceEntry>) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(status) => {
                let pid = status_pid(&status);
                if let Some(entry) = services.values_mut().find(|e| e.pid == pid.as_raw() as u32) {
                    tracing::warn!(service = entry.name, pid = pid.as_raw(), status = ?status, "monitor exited");
                    entry.pid = 0;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
}

fn scan_once(services: &mut HashMap<ServiceKey, ServiceEntry>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(".")
        .context("reading active/")?
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            !name.starts_with('.')
        })
        .collect();

    if entries.len() > MAX_SERVICES {
        tracing::warn!(
            found = entries.len(),
            cap = MAX_SERVICES,
            "too many active services, dropping the overflow"
        );
        entries.truncate(MAX_SERVICES);
    }

    entries.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    for entry in entries {
        let link_name = entry.file_name().to_string_lossy().into_owned();
        let path: PathBuf = entry.path();

        let meta = match std::fs::metadata(&path) {
            Ok(m) if m.is_dir() => m,
            _ => continue, // dangling symlink or not a directory target
        };
        let key = ServiceKey {
            dev: meta.dev(),
            ino: meta.ino(),
        };

        let needs_spawn = match services.get_mut(&key) {
            Some(existing) => {
                existing.active = true;
                existing.name = link_name.clone();
                existing.pid == 0
            }
            None => {
                if services.len() >= MAX_SERVICES {
                    tracing::warn!(service = link_name, "service table full, ignoring");
                    continue;
                }
                services.insert(
                    key,
                    ServiceEntry {
                        pid: 0,
                        active: true,
                        name: layout::truncate_name(&link_name),
                    },
                );
                true
            }
        };

        if needs_spawn {
            spawn_monitor(services, key, &link_name)?;
        }
    }
    Ok(())
}

fn spawn_monitor(
    services: &mut HashMap<ServiceKey, ServiceEntry>,
    key: ServiceKey,
    link_name: &str,
) -> Result<()> {
    let resolved_name = std::fs::canonicalize(link_name)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| link_name.to_string());

    let child = Command::new("monitor")
        .arg(link_name)
        .arg(&resolved_name)
        .spawn()
        .with_context(|| format!("spawning monitor for {link_name}"))?;

    tracing::info!(service = link_name, pid = child.id(), "started monitor");
    if let Some(entry) = services.get_mut(&key) {
        entry.pid = child.id();
    }
    // Command::spawn() leaves the child unwaited; we intentionally never
    // hold the std::process::Child, relying on reap_monitors()'s waitpid
    // sweep to reclaim it, just like the rest of this process's reaping.
    std::mem::forget(child);

    std::thread::sleep(PAUSE_MONITOR);
    Ok(())
}

fn sweep_gone(services: &mut HashMap<ServiceKey, ServiceEntry>) {
    services.retain(|_, entry| entry.active || entry.pid != 0);
    for entry in services.values_mut() {
        entry.active = false;
    }
}

fn status_pid(status: &WaitStatus) -> Pid {
    match *status {
        WaitStatus::Exited(pid, _) => pid,
        WaitStatus::Signaled(pid, _, _) => pid,
        WaitStatus::Stopped(pid, _) => pid,
        WaitStatus::Continued(pid) => pid,
        WaitStatus::PtraceEvent(pid, _, _) => pid,
        WaitStatus::PtraceSyscall(pid) => pid,
        WaitStatus::StillAlive => Pid::from_raw(0),
    }
}
