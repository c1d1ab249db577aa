//! Per-service supervisor. Keeps `run` and `log` alive, pipes `run`'s
//! stdout/stderr into `log`'s stdin while both are up, answers the
//! control FIFO, publishes a status snapshot on every change, and
//! suspends a child that respawns too fast.

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use srvkit::control::Command as CtlCommand;
use srvkit::layout;
use srvkit::status::MonitorStatus;
use srvkit::tai64::Tai64N;

const PAUSE_FAILURE_SECS: u64 = 5;
const PAUSE_RESPAWN_SECS: u64 = 1;
const PAUSE_TERMWAIT_SECS: u64 = 10;
const TIMEOUT_POLL_SECS: u64 = 3600;
const TIMER_CHILD_SECS: u64 = 10;
const CHILD_MAXSTARTS: u32 = 2;
const CHILD_SUSPENSION: u32 = 3;

const TERMINATE_SEQUENCE: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGKILL,
];

#[derive(Parser)]
#[command(about = "Supervises one service's run and log children")]
struct Args {
    /// Service directory (as laid out under `all/`).
    directory: PathBuf,
    /// Display name used only in log messages; defaults to the
    /// directory's basename (or symlink target basename).
    name: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Which {
    Run,
    Log,
}

impl Which {
    fn progname(self) -> &'static str {
        match self {
            Which::Run => layout::FILE_RUN,
            Which::Log => layout::FILE_LOG,
        }
    }
}

struct ChildState {
    child: Option<Child>,
    last_change: Tai64N,
    starts_in_window: u32,
    suspended: bool,
    suspended_periods_left: u32,
}

impl ChildState {
    fn new(_which: Which) -> Self {
        ChildState {
            child: None,
            last_change: Tai64N::now(),
            starts_in_window: 0,
            suspended: false,
            suspended_periods_left: 0,
        }
    }

    fn pid(&self) -> u32 {
        self.child.as_ref().map(|c| c.id()).unwrap_or(0)
    }

    fn running(&self) -> bool {
        self.child.is_some()
    }
}

/// The `run`→`log` pipe, alive only while both children need it.
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn create() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().context("pipe()")?;
        Ok(Pipe { read, write })
    }
}

struct Monitor {
    run: ChildState,
    log: ChildState,
    pipe: Option<Pipe>,
    forwarding: bool,
    stop: bool,
    interrupted: bool,
    timer_active: bool,
    control_fifo: std::fs::File,
    // Held open for the process lifetime so a writer never sees ENXIO
    // and so `run`'s stdin FIFO always has at least one reader's worth
    // of presence; never read or written directly.
    _stdin_fifo_holder: std::fs::File,
    _lock_file: std::fs::File,
    signalfd: SignalFd,
    display_name: String,
}

fn main() -> Result<()> {
    srvkit::logging::init("monitor");
    let args = Args::parse();

    let display_name = args
        .name
        .clone()
        .unwrap_or_else(|| display_name_for(&args.directory));

    std::env::set_current_dir(&args.directory)
        .with_context(|| format!("chdir into {:?}", args.directory))?;
    if let Err(e) = srvkit::priv_drop::drop_privileges(None, None) {
        tracing::warn!(error = %e, "failed to drop privileges");
    }

    let mut mon = Monitor::setup(&display_name)?;
    tracing::info!(service = display_name, pid = std::process::id(), "monitor starting");
    mon.run_loop()?;
    tracing::info!(service = display_name, "monitor exiting");
    Ok(())
}

fn display_name_for(root: &Path) -> String {
    match std::fs::symlink_metadata(root) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::read_link(root)
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| root.display().to_string()),
        _ => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string()),
    }
}

impl Monitor {
    fn setup(display_name: &str) -> Result<Self> {
        std::fs::create_dir_all(layout::DIR_MONITOR).context("mkdir monitor/")?;
        set_mode(layout::DIR_MONITOR, layout::mode_dir_private())?;

        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode_private()
            .open(layout::FILE_LOCK)
            .context("open monitor/lock")?;
        nix::fcntl::flock(&lock_file, nix::fcntl::FlockArg::LockExclusiveNonblock)
            .context("another monitor already holds monitor/lock")?;

        let control_fifo = open_or_create_fifo(layout::PIPE_CONTROL)?;
        let stdin_fifo = open_or_create_fifo(layout::PIPE_STDIN)?;

        let mut mask = SigSet::empty();
        for sig in [
            Signal::SIGALRM,
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGQUIT,
        ] {
            mask.add(sig);
        }
        mask.thread_block().context("blocking monitor signal set")?;
        let signalfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK)
            .context("signalfd()")?;

        let mut mon = Monitor {
            run: ChildState::new(Which::Run),
            log: ChildState::new(Which::Log),
            pipe: None,
            forwarding: false,
            stop: false,
            interrupted: false,
            timer_active: false,
            control_fifo,
            _stdin_fifo_holder: stdin_fifo,
            _lock_file: lock_file,
            signalfd,
            display_name: display_name.to_string(),
        };
        mon.write_status()?;
        Ok(mon)
    }

    fn run_loop(&mut self) -> Result<()> {
        while !self.stop {
            self.reap_children()?;
            self.start_children()?;
            self.drop_pipe_if_idle();
            self.wait_for_event()?;
        }
        Ok(())
    }

    fn reap_children(&mut self) -> Result<()> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(status) => {
                    let pid = status_pid(&status);
                    self.on_child_exit(pid, &status)?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn on_child_exit(&mut self, pid: Pid, status: &WaitStatus) -> Result<()> {
        for which in [Which::Run, Which::Log] {
            let matches = self
                .child_mut(which)
                .child
                .as_ref()
                .map(|c| c.id() as i32 == pid.as_raw())
                .unwrap_or(false);
            if !matches {
                continue;
            }
            self.child_mut(which).child = None;
            self.child_mut(which).last_change = Tai64N::now();
            if which == Which::Run {
                self.forwarding = false;
            }
            tracing::info!(
                service = self.display_name,
                child = which.progname(),
                pid = pid.as_raw(),
                status = ?status,
                "child exited"
            );
            self.write_status()?;
        }
        Ok(())
    }

    fn child_mut(&mut self, which: Which) -> &mut ChildState {
        match which {
            Which::Run => &mut self.run,
            Which::Log => &mut self.log,
        }
    }

    fn wanted_up(&self) -> bool {
        Path::new(layout::FILE_UP).exists()
    }

    fn start_children(&mut self) -> Result<()> {
        if self.interrupted || !self.wanted_up() {
            return Ok(());
        }

        if !self.log.running() && !self.log.suspended && (!self.run.running() || !self.forwarding)
        {
            if self.pipe.is_none() {
                self.pipe = Some(Pipe::create()?);
            }
            self.spawn(Which::Log)?;
        }

        if !self.run.running() && !self.run.suspended {
            self.spawn(Which::Run)?;
        }

        Ok(())
    }

    fn spawn(&mut self, which: Which) -> Result<()> {
        let progname = which.progname();
        match std::fs::metadata(progname) {
            Ok(m) if m.is_file() => {}
            Ok(_) => {
                tracing::warn!(service = self.display_name, file = progname, "not a regular file, skipping");
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(service = self.display_name, file = progname, "missing, skipping");
                return Ok(());
            }
        }

        let mut cmd = Command::new(format!("./{progname}"));
        match which {
            Which::Run => {
                let stdin_fd = open(
                    layout::PIPE_STDIN,
                    OFlag::O_RDONLY | OFlag::O_NONBLOCK,
                    Mode::empty(),
                )
                .context("reopen monitor/stdin for run")?;
                cmd.stdin(Stdio::from(stdin_fd));
                if self.log.running() {
                    if let Some(pipe) = &self.pipe {
                        let w1 = pipe.write.try_clone().context("dup pipe write end")?;
                        let w2 = pipe.write.try_clone().context("dup pipe write end")?;
                        cmd.stdout(Stdio::from(w1));
                        cmd.stderr(Stdio::from(w2));
                        self.forwarding = true;
                    }
                } else {
                    self.forwarding = false;
                }
            }
            Which::Log => {
                if let Some(pipe) = &self.pipe {
                    let r = pipe.read.try_clone().context("dup pipe read end")?;
                    cmd.stdin(Stdio::from(r));
                }
            }
        }

        let child = cmd.spawn().with_context(|| format!("spawn {progname}"))?;
        let pid = child.id();
        let state = self.child_mut(which);
        state.child = Some(child);
        state.last_change = Tai64N::now();
        state.starts_in_window += 1;
        if !self.timer_active {
            arm_alarm(TIMER_CHILD_SECS);
            self.timer_active = true;
        }
        tracing::info!(service = self.display_name, child = progname, pid, "started child");
        self.write_status()?;
        std::thread::sleep(std::time::Duration::from_secs(PAUSE_RESPAWN_SECS));
        Ok(())
    }

    fn drop_pipe_if_idle(&mut self) {
        if !self.run.running() && !self.log.running() {
            self.pipe = None;
        }
    }

    fn wait_for_event(&mut self) -> Result<()> {
        let control_fd = self.control_fifo.as_fd();
        let sig_fd = self.signalfd.as_fd();
        let mut fds = [
            PollFd::new(control_fd, PollFlags::POLLIN),
            PollFd::new(sig_fd, PollFlags::POLLIN),
        ];
        let timeout = PollTimeout::try_from(TIMEOUT_POLL_SECS as i32 * 1000)
            .unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(()), // timeout
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "poll failed");
                std::thread::sleep(std::time::Duration::from_secs(PAUSE_FAILURE_SECS));
                return Ok(());
            }
        }

        if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            self.handle_signal()?;
        }
        if fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            self.handle_control_byte()?;
        }
        Ok(())
    }

    fn handle_signal(&mut self) -> Result<()> {
        let Ok(siginfo) = self.signalfd.read_signal() else {
            return Ok(());
        };
        let Some(info) = siginfo else { return Ok(()) };
        let Ok(sig) = Signal::try_from(info.ssi_signo as i32) else {
            return Ok(());
        };
        match sig {
            Signal::SIGALRM => self.handle_alarm(),
            Signal::SIGCHLD => {
                // Reaping happens every loop iteration regardless; this
                // just wakes us up promptly instead of waiting out the
                // poll timeout.
            }
            Signal::SIGHUP => {}
            Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT => {
                tracing::warn!(service = self.display_name, signal = ?sig, "received a signal");
                self.interrupted = true;
                self.terminate()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_alarm(&mut self) {
        let log_needs_timer = self.check_suspension(Which::Log);
        let run_needs_timer = self.check_suspension(Which::Run);
        if log_needs_timer || run_needs_timer {
            arm_alarm(TIMER_CHILD_SECS);
        } else {
            self.timer_active = false;
        }
    }

    /// Returns true if this child still needs the suspension timer armed.
    fn check_suspension(&mut self, which: Which) -> bool {
        let state = self.child_mut(which);
        if state.suspended {
            state.suspended_periods_left += 1;
            if state.suspended_periods_left >= CHILD_SUSPENSION {
                state.suspended = false;
                state.suspended_periods_left = 0;
                return false;
            }
            true
        } else if state.starts_in_window > 0 {
            let over_limit = state.starts_in_window > CHILD_MAXSTARTS;
            if over_limit {
                state.suspended = true;
                state.suspended_periods_left = 0;
                tracing::warn!(
                    service = self.display_name,
                    child = which.progname(),
                    "suspended, respawning too fast"
                );
            }
            state.starts_in_window = 0;
            true
        } else {
            false
        }
    }

    fn handle_control_byte(&mut self) -> Result<()> {
        use std::io::Read;
        let mut byte = [0u8; 1];
        match self.control_fifo.read(&mut byte) {
            Ok(0) => return Ok(()), // no writer currently; ignore
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "control read failed");
                std::thread::sleep(std::time::Duration::from_secs(PAUSE_FAILURE_SECS));
                return Ok(());
            }
        }

        match CtlCommand::from_byte(byte[0]) {
            Ok(CtlCommand::Terminate) => {
                self.stop = true;
                self.terminate()?;
            }
            Ok(CtlCommand::Kill) => {
                self.restart_children()?;
            }
            Ok(CtlCommand::Wakeup) => {}
            Ok(CtlCommand::Forward(sig)) => {
                if let Some(child) = &self.run.child {
                    let pid = Pid::from_raw(child.id() as i32);
                    let _ = nix::sys::signal::kill(pid, sig);
                    tracing::info!(service = self.display_name, signal = ?sig, pid = pid.as_raw(), "forwarded signal to run");
                }
            }
            Err(_) => {
                tracing::warn!(byte = byte[0], "unknown control command, ignoring");
            }
        }
        Ok(())
    }

    /// Shared by TERMINATE and KILL: close the pipe so a blocked child
    /// sees EOF, then terminate both children.
    fn restart_children(&mut self) -> Result<()> {
        self.pipe = None;
        self.terminate_child(Which::Run)?;
        self.terminate_child(Which::Log)?;
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.pipe = None;
        self.terminate_child(Which::Run)?;
        self.terminate_child(Which::Log)?;
        Ok(())
    }

    fn terminate_child(&mut self, which: Which) -> Result<()> {
        if !self.child_mut(which).running() {
            return Ok(());
        }
        for sig in TERMINATE_SEQUENCE {
            let Some(child) = &self.child_mut(which).child else {
                break;
            };
            let pid = Pid::from_raw(child.id() as i32);
            let _ = nix::sys::signal::kill(pid, sig);
            std::thread::sleep(std::time::Duration::from_secs(PAUSE_TERMWAIT_SECS));
            self.reap_children()?;
            if !self.child_mut(which).running() {
                break;
            }
            if sig == Signal::SIGKILL {
                break;
            }
        }
        let state = self.child_mut(which);
        state.starts_in_window = 0;
        state.suspended = false;
        state.suspended_periods_left = 0;
        Ok(())
    }

    fn write_status(&self) -> Result<()> {
        let status = MonitorStatus {
            updated: Tai64N::now(),
            run_changed: self.run.last_change,
            log_changed: self.log.last_change,
            run_pid: self.run.pid(),
            log_pid: self.log.pid(),
            forwarding: self.forwarding,
        };
        status
            .write_atomic(Path::new(layout::FILE_STATUS))
            .context("writing monitor/status")
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

fn arm_alarm(secs: u64) {
    unsafe {
        libc::alarm(secs as libc::c_uint);
    }
}

fn open_or_create_fifo(path: &str) -> Result<std::fs::File> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {}
        Ok(_) => bail!("{path} exists and is not a FIFO"),
        Err(_) => {
            nix::unistd::mkfifo(path, layout::mode_file_private())
                .with_context(|| format!("mkfifo {path}"))?;
        }
    }
    let fd = open(
        path,
        OFlag::O_RDWR | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .with_context(|| format!("open {path}"))?;
    Ok(std::fs::File::from(fd))
}

fn set_mode(path: &str, mode: Mode) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode.bits()))
        .with_context(|| format!("chmod {path}"))
}

trait OpenOptionsExt {
    fn mode_private(&mut self) -> &mut Self;
}

impl OpenOptionsExt for std::fs::OpenOptions {
    fn mode_private(&mut self) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(layout::mode_file_private().bits())
    }
}
