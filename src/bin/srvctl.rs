//! Command-line front end: lists and inspects services, flips a
//! service's up/down want-state, and talks to a running monitor over
//! its control FIFO.

use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;

use srvkit::control::Command as ControlCommand;
use srvkit::layout;
use srvkit::tai64::{Tai64N, TzPolicy};

#[derive(Parser)]
#[command(about = "Inspects and controls services under a service directory")]
struct Args {
    /// Base directory (default: $SRVCTL_BASE or /services).
    #[arg(long)]
    base: Option<String>,

    /// Prints information about every configured service.
    #[arg(long)]
    list: bool,

    /// Prints status information about every active service.
    #[arg(long)]
    status: bool,

    /// With --status, renders timestamps in UTC instead of local time.
    #[arg(long)]
    utc: bool,

    /// Restarts every active service and its monitor.
    #[arg(long = "kill-all")]
    kill_all: bool,

    /// Name of the targeted service (also accepted positionally).
    #[arg(long = "name")]
    name_flag: Option<String>,

    /// Sets the service's scanning priority (active-link name).
    #[arg(long)]
    priority: Option<String>,

    /// Restarts the service if it dies (the default).
    #[arg(long)]
    up: bool,

    /// Leaves the service down if it dies.
    #[arg(long)]
    down: bool,

    /// Activates and starts the service.
    #[arg(long)]
    start: bool,

    /// Re-reads `up` and wakes the monitor.
    #[arg(long)]
    restart: bool,

    /// Deactivates and stops the service.
    #[arg(long)]
    stop: bool,

    /// Restarts the service's monitor along with the service.
    #[arg(long)]
    kill: bool,

    /// Sends a named signal to the service's `run` process.
    #[arg(long)]
    signal: Option<String>,

    /// Sets the service down, then sends the named signal.
    #[arg(long)]
    sigterm: Option<String>,

    /// Sets the service down, then sends SIGTERM.
    #[arg(long)]
    term: bool,

    /// Name of the targeted service.
    name: Option<String>,
}

enum ActionKind {
    Priority(String),
    Up,
    Down,
    Start,
    Restart,
    Stop,
    Kill,
    Signal(Signal),
    SigTerm(Signal),
    Term,
}

enum Mode {
    List,
    Status { utc: bool },
    KillAll,
    Action { name: String, kind: ActionKind },
}

fn signal_by_name(name: &str) -> Option<Signal> {
    Some(match name {
        "ALRM" => Signal::SIGALRM,
        "CONT" => Signal::SIGCONT,
        "HUP" => Signal::SIGHUP,
        "STOP" => Signal::SIGSTOP,
        "TERM" => Signal::SIGTERM,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "WINCH" => Signal::SIGWINCH,
        _ => return None,
    })
}

fn resolve_mode(args: &Args) -> Result<Mode> {
    let name = args.name.clone().or_else(|| args.name_flag.clone());

    if args.utc && !args.status {
        bail!("--utc only makes sense with --status");
    }

    let top_level = [args.list, args.status, args.kill_all];
    if top_level.iter().filter(|b| **b).count() > 1 {
        bail!("--list, --status and --kill-all are mutually exclusive");
    }
    if (args.list || args.status || args.kill_all) && name.is_some() {
        bail!("--list, --status and --kill-all take no service name");
    }

    if args.status {
        return Ok(Mode::Status { utc: args.utc });
    }
    if args.list {
        return Ok(Mode::List);
    }
    if args.kill_all {
        return Ok(Mode::KillAll);
    }

    let name = name.context("a service name is required")?;

    let mut kinds = Vec::new();
    if let Some(p) = &args.priority {
        if p.len() > 512 || !p.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid value for --priority");
        }
        kinds.push(ActionKind::Priority(p.clone()));
    }
    if args.up {
        kinds.push(ActionKind::Up);
    }
    if args.down {
        kinds.push(ActionKind::Down);
    }
    if args.start {
        kinds.push(ActionKind::Start);
    }
    if args.restart {
        kinds.push(ActionKind::Restart);
    }
    if args.stop {
        kinds.push(ActionKind::Stop);
    }
    if args.kill {
        kinds.push(ActionKind::Kill);
    }
    if let Some(s) = &args.signal {
        let sig = signal_by_name(s).with_context(|| format!("unknown signal {s:?}"))?;
        kinds.push(ActionKind::Signal(sig));
    }
    if let Some(s) = &args.sigterm {
        let sig = signal_by_name(s).with_context(|| format!("unknown signal {s:?}"))?;
        kinds.push(ActionKind::SigTerm(sig));
    }
    if args.term {
        kinds.push(ActionKind::Term);
    }

    match kinds.len() {
        0 => bail!("missing command"),
        1 => Ok(Mode::Action {
            name,
            kind: kinds.pop().unwrap(),
        }),
        _ => bail!("too many commands"),
    }
}

fn main() -> Result<()> {
    srvkit::logging::init("srvctl");
    let args = Args::parse();
    let base = layout::resolve_base(args.base.as_deref());
    let mode = resolve_mode(&args)?;

    match mode {
        Mode::List => command_list(&base),
        Mode::Status { utc } => command_status(&base, utc),
        Mode::KillAll => command_killall(&base),
        Mode::Action { name, kind } => command_action(&base, &name, kind),
    }
}

/// Resolves `base/active/<link>` to the `all/` directory basename it
/// points at.
fn service_realname(base: &Path, link: &str) -> Result<String> {
    let target = std::fs::read_link(layout::active_link(base, link))
        .with_context(|| format!("resolving active link {link:?}"))?;
    Ok(target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| link.to_string()))
}

/// The active-link name a service should be published under: its
/// `priority` file content if set to a plain digit string, else its
/// own name.
fn service_linkname(base: &Path, name: &str) -> String {
    layout::read_priority(&layout::service_dir(base, name)).unwrap_or_else(|| name.to_string())
}

fn service_exists(base: &Path, name: &str) -> bool {
    layout::service_dir(base, name).is_dir()
}

fn service_active(base: &Path, name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(layout::active_dir(base)) else {
        return false;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let link = entry.file_name().to_string_lossy().into_owned();
        if link.starts_with('.') {
            continue;
        }
        if entry.path().symlink_metadata().map(|m| m.is_symlink()) != Ok(true) {
            continue;
        }
        if service_realname(base, &link).ok().as_deref() == Some(name) {
            return true;
        }
    }
    false
}

fn service_create_up(base: &Path, name: &str) -> Result<()> {
    let monitor_dir = layout::service_dir(base, name).join(layout::DIR_MONITOR);
    std::fs::create_dir_all(&monitor_dir).with_context(|| format!("creating {monitor_dir:?}"))?;
    let up = layout::service_dir(base, name).join(layout::FILE_UP);
    std::fs::File::create(&up).with_context(|| format!("creating {up:?}"))?;
    Ok(())
}

fn service_remove_up(base: &Path, name: &str) -> Result<()> {
    let up = layout::service_dir(base, name).join(layout::FILE_UP);
    match std::fs::remove_file(&up) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {up:?}")),
    }
}

fn service_add(base: &Path, name: &str) -> Result<()> {
    std::fs::create_dir_all(layout::active_dir(base)).context("creating active/")?;
    let link = layout::active_link(base, &service_linkname(base, name));
    let target = layout::active_link_target(name);
    match std::os::unix::fs::symlink(&target, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("activating {name:?}")),
    }
}

fn service_remove(base: &Path, name: &str) -> Result<()> {
    let link = layout::active_link(base, &service_linkname(base, name));
    match std::fs::remove_file(&link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {link:?}")),
    }
}

fn service_wantup(base: &Path, name: &str) -> bool {
    layout::service_dir(base, name).join(layout::FILE_UP).exists()
}

/// Writes `cmd` to the service's control FIFO. If `nonblocking`, opens
/// non-blocking first (so a dead monitor doesn't hang the caller) then
/// clears `O_NONBLOCK` before writing, matching the original's probe.
fn monitor_command(base: &Path, name: &str, cmd: ControlCommand, nonblocking: bool) -> Result<()> {
    let path = layout::service_dir(base, name).join(layout::PIPE_CONTROL);

    let mut file = if nonblocking {
        let fd = match nix::fcntl::open(
            &path,
            nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_NONBLOCK,
            nix::sys::stat::Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::ENXIO) => {
                tracing::info!(service = name, "monitor not running");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("opening {path:?}")),
        };
        let flags = nix::fcntl::fcntl(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, nix::fcntl::FcntlArg::F_GETFL)?;
        let flags = nix::fcntl::OFlag::from_bits_truncate(flags) & !nix::fcntl::OFlag::O_NONBLOCK;
        nix::fcntl::fcntl(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            nix::fcntl::FcntlArg::F_SETFL(flags),
        )?;
        unsafe { std::fs::File::from_raw_fd(fd) }
    } else {
        match std::fs::OpenOptions::new().write(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("opening {path:?}")),
        }
    };

    file.write_all(&[cmd.to_byte()])
        .with_context(|| format!("writing command to {path:?}"))
}

fn format_flag(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn format_exists(v: bool) -> &'static str {
    if v {
        "exists"
    } else {
        "does not exist"
    }
}

fn format_wantup(base: &Path, name: &str) -> &'static str {
    if service_wantup(base, name) {
        "up"
    } else {
        "down"
    }
}

fn format_priority(base: &Path, name: &str) -> String {
    let link = service_linkname(base, name);
    if link == name {
        "not set".to_string()
    } else {
        link
    }
}

/// Renders a changed-timestamp and PID pair the way the original's
/// `format_proc` reports elapsed uptime, in days/hours/minutes/seconds.
fn format_proc(changed: Tai64N, pid: u32) -> String {
    if pid == 0 {
        return "not running".to_string();
    }
    let now = Tai64N::now();
    let uptime = (now.tai().unix_secs() - changed.tai().unix_secs()).max(0) as u64;
    let seconds = uptime % 60;
    let minutes = uptime / 60 % 60;
    let hours = uptime / 3600 % 24;
    let days = uptime / 86400;

    if days > 0 {
        format!("pid {pid} up {days} d {hours} h {minutes} min {seconds} s")
    } else if hours > 0 {
        format!("pid {pid} up {hours} h {minutes} min {seconds} s")
    } else {
        format!("pid {pid} up {minutes} min {seconds} s")
    }
}

fn command_list(base: &Path) -> Result<()> {
    let dir = layout::all_dir(base);
    let mut counter = 0;
    for entry in std::fs::read_dir(&dir).with_context(|| format!("opening {dir:?}"))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        counter += 1;
        println!("\t{counter}. service {name}");
        println!("\t\tactive {}", format_flag(service_active(base, &name)));
        println!(
            "\t\trun {}",
            format_exists(layout::service_dir(base, &name).join(layout::FILE_RUN).exists())
        );
        println!(
            "\t\tlog {}",
            format_exists(layout::service_dir(base, &name).join(layout::FILE_LOG).exists())
        );
        println!("\t\tpriority {}", format_priority(base, &name));
    }
    Ok(())
}

fn command_status(base: &Path, utc: bool) -> Result<()> {
    let dir = layout::active_dir(base);
    let mut counter = 0;
    let policy = if utc { TzPolicy::Utc } else { TzPolicy::Local };

    for entry in std::fs::read_dir(&dir).with_context(|| format!("opening {dir:?}"))? {
        let entry = entry?;
        let link = entry.file_name().to_string_lossy().into_owned();
        if link.starts_with('.') {
            continue;
        }
        if entry.path().symlink_metadata().map(|m| m.is_symlink()) != Ok(true) {
            continue;
        }

        let status_path = dir.join(&link).join(layout::FILE_STATUS);
        let status = match srvkit::status::MonitorStatus::read(&status_path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, path = ?status_path, "failed to open status file");
                continue;
            }
        };

        counter += 1;
        let realname = service_realname(base, &link).unwrap_or_else(|_| link.clone());
        println!("\t{counter}. service {realname}");
        println!("\t\tupdated {}", status.updated.to_iso8601(policy));
        println!("\t\trun {}", format_proc(status.run_changed, status.run_pid));
        println!("\t\tlog {}", format_proc(status.log_changed, status.log_pid));
        println!("\t\tlogging {}", format_flag(status.forwarding));
        println!("\t\twants {}", format_wantup(base, &realname));
    }
    Ok(())
}

fn command_killall(base: &Path) -> Result<()> {
    tracing::info!("restarting active services and monitors");
    let dir = layout::active_dir(base);
    for entry in std::fs::read_dir(&dir).with_context(|| format!("opening {dir:?}"))? {
        let entry = entry?;
        let link = entry.file_name().to_string_lossy().into_owned();
        if link.starts_with('.') {
            continue;
        }
        if entry.path().symlink_metadata().map(|m| m.is_symlink()) != Ok(true) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }
        let name = service_realname(base, &link).unwrap_or_else(|_| link.clone());
        tracing::info!(service = name, "restarting");
        monitor_command(base, &name, ControlCommand::Terminate, true)?;
    }
    Ok(())
}

fn command_action(base: &Path, name: &str, kind: ActionKind) -> Result<()> {
    if !service_exists(base, name) {
        bail!("unknown service {name:?}");
    }

    if let ActionKind::Priority(p) = &kind {
        let active = service_active(base, name);
        if active {
            service_remove(base, name)?;
        }
        let path = layout::service_dir(base, name).join(layout::FILE_PRIORITY);
        std::fs::write(&path, p).with_context(|| format!("writing {path:?}"))?;
        if active {
            service_add(base, name)?;
        }
        return Ok(());
    }

    if matches!(kind, ActionKind::Start) {
        if service_active(base, name) {
            tracing::warn!(service = name, "already active");
            return Ok(());
        }
        tracing::info!(service = name, "starting");
        service_create_up(base, name)?;
        service_add(base, name)?;
        return monitor_command(base, name, ControlCommand::Wakeup, false);
    }

    if !service_active(base, name) {
        bail!("{name} is not active");
    }

    match kind {
        ActionKind::Priority(_) | ActionKind::Start => unreachable!(),
        ActionKind::Up => {
            tracing::info!(service = name, "setting up");
            service_create_up(base, name)
        }
        ActionKind::Down => {
            tracing::info!(service = name, "setting down");
            service_remove_up(base, name)
        }
        ActionKind::Restart => {
            tracing::info!(service = name, "restarting");
            service_create_up(base, name)?;
            monitor_command(base, name, ControlCommand::Kill, false)
        }
        ActionKind::Stop => {
            tracing::info!(service = name, "stopping");
            service_remove_up(base, name)?;
            service_remove(base, name)?;
            monitor_command(base, name, ControlCommand::Terminate, true)
        }
        ActionKind::Kill => {
            tracing::info!(service = name, "restarting service and its monitor");
            service_create_up(base, name)?;
            monitor_command(base, name, ControlCommand::Terminate, true)
        }
        ActionKind::Signal(sig) => {
            tracing::info!(service = name, "signaling");
            monitor_command(base, name, ControlCommand::Forward(sig), false)
        }
        ActionKind::SigTerm(sig) => {
            tracing::info!(service = name, "setting down and signaling");
            service_remove_up(base, name)?;
            monitor_command(base, name, ControlCommand::Forward(sig), false)
        }
        ActionKind::Term => {
            tracing::info!(service = name, "setting down and terminating");
            service_remove_up(base, name)?;
            monitor_command(base, name, ControlCommand::Forward(Signal::SIGTERM), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_proc_reports_not_running_at_zero_pid() {
        assert_eq!(format_proc(Tai64N::now(), 0), "not running");
    }

    #[test]
    fn format_flag_and_exists_render_yes_no() {
        assert_eq!(format_flag(true), "yes");
        assert_eq!(format_flag(false), "no");
        assert_eq!(format_exists(true), "exists");
        assert_eq!(format_exists(false), "does not exist");
    }

    #[test]
    fn signal_by_name_rejects_unknown() {
        assert!(signal_by_name("BOGUS").is_none());
        assert_eq!(signal_by_name("TERM"), Some(Signal::SIGTERM));
    }
}
