//! Line-oriented logger: reads lines from stdin, prepends each with a
//! TAI64N timestamp, and appends them to `tainlog/current`, rotating
//! and pruning archived files as `current` grows past a size limit.
//! Meant to sit at the write end of a `run` script's stdout pipe.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use srvkit::layout;
use srvkit::tai64::Tai64N;

const DEFAULT_BUFSIZE: usize = 148;
const MIN_BUFSIZE: usize = 60;
const MAX_BUFSIZE: usize = 4096;

const DEFAULT_FILESIZE: u64 = 100_000;
const MIN_FILESIZE: u64 = 1_000;
const MAX_FILESIZE: u64 = 100_000_000;

const DEFAULT_KEEPNUM: i64 = 10;
const MAX_KEEPNUM: i64 = 100_000;

const PAUSE_READLINE: Duration = Duration::from_secs(2);

/// Timestamp label length (`@` + 24 hex digits), matching `Tai64N::format`.
const STAMP_LEN: usize = 25;
const BUFFER_SEPARATOR: usize = STAMP_LEN;
const BUFFER_START: usize = STAMP_LEN + 1;

#[derive(Parser)]
#[command(about = "Timestamps and archives lines read from stdin")]
struct Args {
    /// Number of archived log files to keep (mutually exclusive with --keep-all).
    #[arg(long, short = 'k')]
    keep: Option<i64>,

    /// Keep every archived log file, never prune.
    #[arg(long, short = 'a')]
    keep_all: bool,

    /// Archive subdirectory name, relative to `directory`.
    #[arg(long, short = 'l', default_value = layout::DIR_TAINLOG)]
    logdir: String,

    /// Drop to this user after opening stdin.
    #[arg(long, short = 'u')]
    user: Option<String>,

    /// Drop to this group after opening stdin.
    #[arg(long, short = 'g')]
    group: Option<String>,

    /// Maximum size of `current` before it is rotated, in bytes.
    #[arg(long = "logsize", short = 's')]
    filesize: Option<u64>,

    /// Line buffer size, including the timestamp, in bytes.
    #[arg(long = "line-buffer", short = 'b')]
    buffer: Option<usize>,

    /// Directory to log under (its `tainlog/` subdirectory holds the files).
    directory: String,
}

struct Logger {
    filesize: u64,
    keepnum: i64,
    current: Option<File>,
    current_size: u64,
}

fn main() -> Result<()> {
    srvkit::logging::init("tainlog");
    ignore_termination_signals()?;

    let args = Args::parse();
    if args.keep.is_some() && args.keep_all {
        anyhow::bail!("--keep and --keep-all are mutually exclusive");
    }

    let bufsize = clamp_arg(
        args.buffer.map(|v| v as i64),
        DEFAULT_BUFSIZE as i64,
        MIN_BUFSIZE as i64,
        MAX_BUFSIZE as i64,
        "--line-buffer",
    ) as usize;
    let filesize = clamp_arg(
        args.filesize.map(|v| v as i64),
        DEFAULT_FILESIZE as i64,
        MIN_FILESIZE as i64,
        MAX_FILESIZE as i64,
        "--logsize",
    ) as u64;
    let keepnum = if args.keep_all {
        -1
    } else if let Some(n) = args.keep {
        if n > MAX_KEEPNUM {
            tracing::warn!(max = MAX_KEEPNUM, "--keep too large, using maximum");
            MAX_KEEPNUM
        } else if n < 0 {
            -1
        } else {
            n
        }
    } else {
        DEFAULT_KEEPNUM
    };

    srvkit::priv_drop::drop_privileges(args.user.as_deref(), args.group.as_deref())
        .context("dropping privileges")?;

    std::env::set_current_dir(&args.directory)
        .with_context(|| format!("chdir to {:?}", args.directory))?;

    std::fs::create_dir_all(&args.logdir)
        .with_context(|| format!("creating {:?}", args.logdir))?;
    set_mode(Path::new(&args.logdir), layout::mode_dir_private())?;
    std::env::set_current_dir(&args.logdir)
        .with_context(|| format!("chdir to {:?}", args.logdir))?;

    let mut logger = Logger {
        filesize,
        keepnum,
        current: None,
        current_size: 0,
    };
    logger.open_current();

    let mut buffer = vec![0u8; bufsize];
    let mut wrapped = false;
    let mut stdin = std::io::stdin();

    loop {
        let (len, stamp, eof) = readline(&mut stdin, &mut buffer);
        if len > 0 {
            format_tainlog(&mut buffer, len, &stamp, &mut wrapped);
            let written = if wrapped { len + 1 } else { len };
            logger.append(&buffer[..written], &stamp);
        }
        if eof {
            break;
        }
    }
    Ok(())
}

fn clamp_arg(value: Option<i64>, default: i64, min: i64, max: i64, flag: &str) -> i64 {
    match value {
        None => default,
        Some(n) if n > max => {
            tracing::warn!(flag, max, "argument too big, using maximum");
            max
        }
        Some(n) if n < min => {
            tracing::warn!(flag, min, "argument too small, using minimum");
            min
        }
        Some(n) => n,
    }
}

fn ignore_termination_signals() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // The logger only stops on stdin EOF; these never interrupt a write.
    unsafe {
        for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
            signal(sig, SigHandler::SigIgn)?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: nix::sys::stat::Mode) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode.bits()))
        .with_context(|| format!("chmod {path:?}"))
}

/// Reads one line into `buffer` starting at `BUFFER_START`, stamping the
/// time the first byte was read. Returns `(total length used, stamp,
/// hit-eof)`. `len` is 0 if nothing was read before EOF.
fn readline(stdin: &mut std::io::Stdin, buffer: &mut [u8]) -> (usize, Tai64N, bool) {
    let mut pos = BUFFER_START;
    let mut stamp = Tai64N::now();
    let mut byte = [0u8; 1];
    loop {
        match stdin.read(&mut byte) {
            Ok(0) => return (pos, stamp, true),
            Ok(_) => {
                if pos == BUFFER_START {
                    stamp = Tai64N::now();
                }
                buffer[pos] = byte[0];
                pos += 1;
                if byte[0] == b'\n' {
                    return (pos, stamp, false);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from stdin");
                std::thread::sleep(PAUSE_READLINE);
            }
        }
        if pos >= buffer.len() {
            return (pos, stamp, false);
        }
    }
}

/// Prepends the line already sitting at `buffer[BUFFER_START..len]` with
/// `stamp`'s textual form, using a tab separator if the previous line was
/// wrapped (didn't end in `\n`) or a space otherwise. Ensures the result
/// ends with `\n`, growing `len` by one if a newline had to be added.
fn format_tainlog(buffer: &mut [u8], len: usize, stamp: &Tai64N, wrapped: &mut bool) {
    let label = stamp.format();
    buffer[..STAMP_LEN].copy_from_slice(label.as_bytes());
    buffer[BUFFER_SEPARATOR] = if *wrapped { b'\t' } else { b' ' };
    *wrapped = buffer[len - 1] != b'\n';
}

impl Logger {
    fn open_current(&mut self) {
        if self.current.is_some() {
            return;
        }
        self.current_size = 0;
        match std::fs::metadata(layout::FILE_CURRENT) {
            Ok(meta) if meta.is_file() => {
                self.current_size = meta.len();
                self.open_append();
            }
            Ok(_) => tracing::warn!("current exists and is not a regular file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.open_create(),
            Err(e) => tracing::warn!(error = %e, "stat failed for current"),
        }
    }

    fn open_create(&mut self) {
        match OpenOptions::new()
            .write(true)
            .create(true)
            .mode(layout::mode_file_shared_read().bits())
            .open(layout::FILE_CURRENT)
        {
            Ok(f) => self.lock_and_store(f),
            Err(e) => tracing::warn!(error = %e, "failed to create current"),
        }
    }

    fn open_append(&mut self) {
        match OpenOptions::new().append(true).open(layout::FILE_CURRENT) {
            Ok(f) => self.lock_and_store(f),
            Err(e) => tracing::warn!(error = %e, "failed to open current"),
        }
    }

    fn lock_and_store(&mut self, file: File) {
        match nix::fcntl::flock(&file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
            Ok(()) => self.current = Some(file),
            Err(e) => tracing::warn!(error = %e, "failed to lock current"),
        }
    }

    fn close_and_archive(&mut self, stamp: &Tai64N) {
        if let Some(f) = self.current.take() {
            let _ = nix::fcntl::flock(&f, nix::fcntl::FlockArg::UnlockNonblock);
            drop(f);
        }
        let name = stamp.format();
        if let Err(e) = std::fs::rename(layout::FILE_CURRENT, &name) {
            tracing::warn!(error = %e, name, "failed to archive current");
        }
    }

    fn flush_archive(&self) {
        if self.keepnum < 0 {
            return;
        }
        loop {
            let entries = match std::fs::read_dir(".") {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open log directory for pruning");
                    return;
                }
            };
            let mut archived: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    (name.starts_with('@') && name.len() == STAMP_LEN && e.path().is_file())
                        .then_some(name)
                })
                .collect();
            if (archived.len() as i64) <= self.keepnum {
                return;
            }
            archived.sort();
            let oldest = &archived[0];
            if let Err(e) = std::fs::remove_file(oldest) {
                tracing::warn!(error = %e, file = oldest, "failed to remove archived log file");
                return;
            }
        }
    }

    fn append(&mut self, bytes: &[u8], stamp: &Tai64N) {
        let len = bytes.len() as u64;
        if self.current_size + len > self.filesize {
            self.close_and_archive(stamp);
            self.flush_archive();
        }
        self.open_current();
        match &mut self.current {
            Some(f) => match f.write_all(bytes) {
                Ok(()) => self.current_size += len,
                Err(e) => tracing::warn!(error = %e, "failed to write to current"),
            },
            None => tracing::warn!("discarding buffer, current is unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tainlog_marks_wrap_state() {
        let mut buffer = vec![0u8; DEFAULT_BUFSIZE];
        let text = b"hello\n";
        buffer[BUFFER_START..BUFFER_START + text.len()].copy_from_slice(text);
        let len = BUFFER_START + text.len();
        let mut wrapped = false;
        format_tainlog(&mut buffer, len, &Tai64N::now(), &mut wrapped);
        assert!(!wrapped);
        assert_eq!(buffer[BUFFER_SEPARATOR], b' ');
        assert_eq!(&buffer[0..1], b"@");
    }

    #[test]
    fn format_tainlog_uses_tab_after_wrap() {
        let mut buffer = vec![0u8; DEFAULT_BUFSIZE];
        let text = b"no newline yet";
        buffer[BUFFER_START..BUFFER_START + text.len()].copy_from_slice(text);
        let len = BUFFER_START + text.len();
        let mut wrapped = true;
        format_tainlog(&mut buffer, len, &Tai64N::now(), &mut wrapped);
        assert_eq!(buffer[BUFFER_SEPARATOR], b'\t');
        assert!(wrapped);
    }

    #[test]
    fn flush_archive_keeps_at_most_keepnum_files() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        for sec in 0..5i64 {
            let tai = srvkit::tai64::Tai64::from_unix_secs(1_700_000_000 + sec).unwrap();
            let stamp = Tai64N::new(tai, 0).unwrap();
            std::fs::write(stamp.format(), b"x").unwrap();
        }
        let logger = Logger {
            filesize: DEFAULT_FILESIZE,
            keepnum: 2,
            current: None,
            current_size: 0,
        };
        logger.flush_archive();
        let remaining: Vec<_> = std::fs::read_dir(".")
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('@'))
            .collect();
        assert_eq!(remaining.len(), 2);
    }
}
