//! The monitor's fixed 37-byte status record and its atomic
//! create-temp + rename writer, matching `MONITOR_STATUS_*` in the
//! original `srvctl.h`.

use std::io::Write;
use std::path::Path;

use crate::error::StatusError;
use crate::tai64::Tai64N;

pub const SIZE: usize = 3 * Tai64N::PACK_LEN + 2 * 4 + 1;

const OFF_UPDATED: usize = 0;
const OFF_CHG_RUN: usize = Tai64N::PACK_LEN;
const OFF_CHG_LOG: usize = OFF_CHG_RUN + Tai64N::PACK_LEN;
const OFF_PID_RUN: usize = OFF_CHG_LOG + Tai64N::PACK_LEN;
const OFF_PID_LOG: usize = OFF_PID_RUN + 4;
const OFF_FORWARD: usize = SIZE - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorStatus {
    pub updated: Tai64N,
    pub run_changed: Tai64N,
    pub log_changed: Tai64N,
    /// 0 means "not running".
    pub run_pid: u32,
    pub log_pid: u32,
    pub forwarding: bool,
}

impl MonitorStatus {
    pub fn to_bytes(self) -> [u8; SIZE] {
        let mut buf = [0u8; SIZE];
        buf[OFF_UPDATED..OFF_UPDATED + 12].copy_from_slice(&self.updated.pack());
        buf[OFF_CHG_RUN..OFF_CHG_RUN + 12].copy_from_slice(&self.run_changed.pack());
        buf[OFF_CHG_LOG..OFF_CHG_LOG + 12].copy_from_slice(&self.log_changed.pack());
        buf[OFF_PID_RUN..OFF_PID_RUN + 4].copy_from_slice(&self.run_pid.to_ne_bytes());
        buf[OFF_PID_LOG..OFF_PID_LOG + 4].copy_from_slice(&self.log_pid.to_ne_bytes());
        buf[OFF_FORWARD] = self.forwarding as u8;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StatusError> {
        if buf.len() != SIZE {
            return Err(StatusError::WrongSize {
                expected: SIZE,
                actual: buf.len(),
            });
        }
        let tain = |off: usize| -> Tai64N {
            let mut a = [0u8; 12];
            a.copy_from_slice(&buf[off..off + 12]);
            Tai64N::unpack(&a)
        };
        let u32_at = |off: usize| -> u32 {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(a)
        };
        Ok(MonitorStatus {
            updated: tain(OFF_UPDATED),
            run_changed: tain(OFF_CHG_RUN),
            log_changed: tain(OFF_CHG_LOG),
            run_pid: u32_at(OFF_PID_RUN),
            log_pid: u32_at(OFF_PID_LOG),
            forwarding: buf[OFF_FORWARD] != 0,
        })
    }

    /// Writes the status atomically: a temp file in the same directory,
    /// fully written and `chmod`'d, then renamed over the target.
    pub fn write_atomic(self, target: &Path) -> Result<(), StatusError> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(".status.{}", std::process::id()));
        let write_result = (|| -> std::io::Result<()> {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&self.to_bytes())?;
            f.sync_all()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                f.set_permissions(std::fs::Permissions::from_mode(0o640))?;
            }
            Ok(())
        })();

        match write_result {
            Ok(()) => std::fs::rename(&tmp_path, target).map_err(|e| StatusError::Io {
                path: target.to_path_buf(),
                source: e,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(StatusError::Io {
                    path: tmp_path,
                    source: e,
                })
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self, StatusError> {
        let bytes = std::fs::read(path).map_err(|e| StatusError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tai64::Tai64;

    fn sample() -> MonitorStatus {
        let t = Tai64N::new(Tai64::from_unix_secs(1_700_000_000).unwrap(), 42).unwrap();
        MonitorStatus {
            updated: t,
            run_changed: t,
            log_changed: t,
            run_pid: 1234,
            log_pid: 0,
            forwarding: false,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let s = sample();
        let bytes = s.to_bytes();
        assert_eq!(bytes.len(), SIZE);
        assert_eq!(SIZE, 37);
        assert_eq!(MonitorStatus::from_bytes(&bytes).unwrap(), s);
    }

    #[test]
    fn rejects_wrong_size_buffers() {
        assert!(MonitorStatus::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let s = sample();
        s.write_atomic(&path).unwrap();
        assert_eq!(MonitorStatus::read(&path).unwrap(), s);
        // no leftover temp file
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".status."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
