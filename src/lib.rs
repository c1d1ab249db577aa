//! Shared primitives for the service-supervision toolkit: on-disk layout
//! conventions, the TAI64/TAI64N time format, the monitor status-file
//! layout, the control-FIFO wire protocol, privilege dropping and
//! logging setup. The binaries in `src/bin/` are thin drivers over these
//! modules.

pub mod control;
pub mod error;
pub mod layout;
pub mod logging;
pub mod priv_drop;
pub mod status;
pub mod tai64;
