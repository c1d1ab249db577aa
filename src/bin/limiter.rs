//! Sets process priority, resource limits, an optional chroot, and
//! drops privileges, then `execvp`s the given program. Meant to sit in
//! front of a service's `run` script, the way `nice`/`chrt`/`setuidgid`
//! are chained in front of daemontools services.

use std::ffi::CString;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::resource::{setrlimit, Resource};

#[derive(Parser)]
#[command(
    about = "Applies resource limits and privileges, then execs a program",
    trailing_var_arg = true
)]
struct Args {
    /// Directory to chroot into before dropping privileges.
    #[arg(long)]
    chroot: Option<String>,

    /// Process scheduling priority (nice value), -20..19.
    #[arg(long = "priority", short = 'n')]
    priority: Option<i32>,

    /// Drop to this group before exec.
    #[arg(long = "group", short = 'g')]
    group: Option<String>,

    /// Drop to this user before exec.
    #[arg(long = "user", short = 'u')]
    user: Option<String>,

    /// Sets RLIMIT_AS/DATA/MEMLOCK/STACK/RSS all to this many bytes.
    #[arg(long = "limit-mem", short = 'm')]
    limit_mem: Option<String>,

    #[arg(long = "rlimit-as")]
    rlimit_as: Option<String>,
    #[arg(long = "rlimit-core", short = 'c')]
    rlimit_core: Option<String>,
    #[arg(long = "rlimit-cpu")]
    rlimit_cpu: Option<String>,
    #[arg(long = "rlimit-data")]
    rlimit_data: Option<String>,
    #[arg(long = "rlimit-fsize")]
    rlimit_fsize: Option<String>,
    #[arg(long = "rlimit-locks")]
    rlimit_locks: Option<String>,
    #[arg(long = "rlimit-memlock")]
    rlimit_memlock: Option<String>,
    #[arg(long = "rlimit-msgqueue")]
    rlimit_msgqueue: Option<String>,
    #[arg(long = "rlimit-nofile")]
    rlimit_nofile: Option<String>,
    #[arg(long = "rlimit-nproc", short = 'p')]
    rlimit_nproc: Option<String>,
    #[arg(long = "rlimit-rss")]
    rlimit_rss: Option<String>,
    #[arg(long = "rlimit-sigpending")]
    rlimit_sigpending: Option<String>,
    #[arg(long = "rlimit-stack")]
    rlimit_stack: Option<String>,

    /// Program to exec, followed by its own arguments.
    #[arg(required = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    srvkit::logging::init("limiter");
    let args = Args::parse();

    if let Some(n) = args.priority {
        set_priority(n)?;
    }

    if let Some(bytes) = &args.limit_mem {
        for res in [
            Resource::RLIMIT_AS,
            Resource::RLIMIT_DATA,
            Resource::RLIMIT_MEMLOCK,
            Resource::RLIMIT_STACK,
            Resource::RLIMIT_RSS,
        ] {
            apply_limit(res, bytes)?;
        }
    }

    for (res, value) in [
        (Resource::RLIMIT_AS, &args.rlimit_as),
        (Resource::RLIMIT_CORE, &args.rlimit_core),
        (Resource::RLIMIT_CPU, &args.rlimit_cpu),
        (Resource::RLIMIT_DATA, &args.rlimit_data),
        (Resource::RLIMIT_FSIZE, &args.rlimit_fsize),
        (Resource::RLIMIT_LOCKS, &args.rlimit_locks),
        (Resource::RLIMIT_MEMLOCK, &args.rlimit_memlock),
        (Resource::RLIMIT_MSGQUEUE, &args.rlimit_msgqueue),
        (Resource::RLIMIT_NOFILE, &args.rlimit_nofile),
        (Resource::RLIMIT_NPROC, &args.rlimit_nproc),
        (Resource::RLIMIT_RSS, &args.rlimit_rss),
        (Resource::RLIMIT_SIGPENDING, &args.rlimit_sigpending),
        (Resource::RLIMIT_STACK, &args.rlimit_stack),
    ] {
        if let Some(value) = value {
            apply_limit(res, value)?;
        }
    }

    if let Some(dir) = &args.chroot {
        nix::unistd::chroot(dir.as_str()).with_context(|| format!("chroot to {dir:?}"))?;
        nix::unistd::chdir("/").context("chdir to / after chroot")?;
    }

    if args.group.is_some() || args.user.is_some() {
        srvkit::priv_drop::drop_privileges(args.user.as_deref(), args.group.as_deref())
            .context("dropping privileges")?;
    }

    exec(&args.command)
}

fn set_priority(value: i32) -> Result<()> {
    let clamped = value.clamp(-20, 19);
    if clamped != value {
        tracing::warn!(requested = value, using = clamped, "priority out of range");
    }
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, clamped) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("setpriority failed");
    }
    Ok(())
}

/// Parses a limit value: a bare number sets the soft limit (capped to
/// the current hard limit), `=number` sets both hard and soft limits.
fn apply_limit(res: Resource, arg: &str) -> Result<()> {
    let (set_hard, digits) = match arg.strip_prefix('=') {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid resource limit value {arg:?}"))?;

    let (_soft, hard) = nix::sys::resource::getrlimit(res).context("getrlimit failed")?;
    let (new_soft, new_hard) = if set_hard {
        (value, value)
    } else if value > hard {
        tracing::warn!(requested = value, hard, "soft limit too big, using hard limit");
        (hard, hard)
    } else {
        (value, hard)
    };
    setrlimit(res, new_soft, new_hard).context("setrlimit failed")
}

fn exec(command: &[String]) -> Result<()> {
    let Some(program) = command.first() else {
        bail!("no program given");
    };
    let c_program = CString::new(program.as_str())?;
    let c_args: Vec<CString> = command
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()?;

    // execvp replaces this process image; on success, main never returns.
    let err = nix::unistd::execvp(&c_program, &c_args).unwrap_err();
    Err(err).with_context(|| format!("failed to execute {program:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_value_clamps_to_nice_range() {
        assert_eq!(30i32.clamp(-20, 19), 19);
        assert_eq!((-30i32).clamp(-20, 19), -20);
    }
}
