//! The control-FIFO wire protocol: a single command byte per write.
//! `TERMINATE`/`KILL`/`WAKEUP` are ASCII letters chosen (as in the
//! original) so they can never collide with a real signal number.

use crate::error::ControlError;
use nix::sys::signal::Signal;

pub const TERMINATE: u8 = b'x';
pub const KILL: u8 = b'k';
pub const WAKEUP: u8 = b'w';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Shut the monitor down entirely.
    Terminate,
    /// Restart both children; keep the monitor alive.
    Kill,
    /// No-op; just wakes the poll loop.
    Wakeup,
    /// Forward this signal to `run` only.
    Forward(Signal),
}

impl Command {
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Terminate => TERMINATE,
            Command::Kill => KILL,
            Command::Wakeup => WAKEUP,
            Command::Forward(sig) => sig as i32 as u8,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ControlError> {
        match byte {
            TERMINATE => Ok(Command::Terminate),
            KILL => Ok(Command::Kill),
            WAKEUP => Ok(Command::Wakeup),
            n => Signal::try_from(n as i32)
                .map(Command::Forward)
                .map_err(|_| ControlError::UnknownCommand(byte)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_bytes_round_trip() {
        assert_eq!(Command::from_byte(TERMINATE).unwrap(), Command::Terminate);
        assert_eq!(Command::from_byte(KILL).unwrap(), Command::Kill);
        assert_eq!(Command::from_byte(WAKEUP).unwrap(), Command::Wakeup);
    }

    #[test]
    fn signal_numbers_forward() {
        let sigterm = Signal::SIGTERM as i32 as u8;
        assert_eq!(
            Command::from_byte(sigterm).unwrap(),
            Command::Forward(Signal::SIGTERM)
        );
    }

    #[test]
    fn out_of_range_byte_is_rejected() {
        assert!(Command::from_byte(0).is_err());
    }
}
