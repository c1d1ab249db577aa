//! TAI64 and TAI64N absolute timestamps: fixed-width packed binary
//! representation, `@`-prefixed lowercase-hex textual representation, and
//! conversion to ISO 8601:2004 text in UTC or local time.
//!
//! A TAI64 label is an 8-byte big-endian integer `x` such that
//! `x = 2^62 + 10 + (seconds since 1970-01-01 00:00:00 TAI)`. The `+10`
//! accounts for the leap-second difference between TAI and UTC at the
//! reference epoch. TAI64N appends 4 big-endian bytes of nanoseconds.

use crate::error::TaiError;
use std::time::{SystemTime, UNIX_EPOCH};

/// `2^62 + 10`, the packed-label value of 1970-01-01 00:00:00 TAI.
const TAI_EPOCH_OFFSET: u64 = 4_611_686_018_427_387_914;
const TAI_MAX_SEC: u64 = i64::MAX as u64;
const TAI_MAX_NANOS: u32 = 999_999_999;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Tai64 {
    x: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Tai64N {
    tai: Tai64,
    nanos: u32,
}

/// Which zone a caller wants a TAI64 label rendered in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TzPolicy {
    Utc,
    Local,
}

impl Tai64 {
    pub const PACK_LEN: usize = 8;
    pub const TEXT_LEN: usize = 1 + 16;

    pub fn from_unix_secs(unix_secs: i64) -> Result<Self, TaiError> {
        let x = TAI_EPOCH_OFFSET
            .checked_add_signed(unix_secs)
            .ok_or(TaiError::OutOfRange)?;
        if x > TAI_MAX_SEC {
            return Err(TaiError::OutOfRange);
        }
        Ok(Tai64 { x })
    }

    pub fn unix_secs(self) -> i64 {
        self.x as i64 - TAI_EPOCH_OFFSET as i64
    }

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Tai64::from_unix_secs(d.as_secs() as i64).expect("current time fits in a TAI64 label")
    }

    pub fn pack(self) -> [u8; 8] {
        self.x.to_be_bytes()
    }

    pub fn unpack(bytes: &[u8; 8]) -> Self {
        Tai64 {
            x: u64::from_be_bytes(*bytes),
        }
    }

    pub fn format(self) -> String {
        format_hex(&self.pack())
    }

    pub fn parse(s: &str) -> Result<Self, TaiError> {
        let bytes = unformat_hex::<8>(s)?;
        Ok(Tai64::unpack(&bytes))
    }

    /// ISO 8601:2004 text, second precision (a bare TAI64 label carries
    /// no sub-second component).
    pub fn to_iso8601(self, tz: TzPolicy) -> String {
        let unix = self.unix_secs();
        let tm = match tz {
            TzPolicy::Utc => civil_from_unix_utc(unix),
            TzPolicy::Local => civil_from_unix_local(unix),
        };
        format_iso8601(&tm, 0)
    }
}

impl Tai64N {
    pub const PACK_LEN: usize = 12;
    pub const TEXT_LEN: usize = 1 + 24;

    pub fn new(tai: Tai64, nanos: u32) -> Result<Self, TaiError> {
        if nanos > TAI_MAX_NANOS {
            return Err(TaiError::OutOfRange);
        }
        Ok(Tai64N { tai, nanos })
    }

    pub fn tai(self) -> Tai64 {
        self.tai
    }

    pub fn nanos(self) -> u32 {
        self.nanos
    }

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let tai = Tai64::from_unix_secs(d.as_secs() as i64)
            .expect("current time fits in a TAI64 label");
        Tai64N::new(tai, d.subsec_nanos()).expect("subsec_nanos is always < 1e9")
    }

    pub fn pack(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&self.tai.pack());
        out[8..12].copy_from_slice(&self.nanos.to_be_bytes());
        out
    }

    pub fn unpack(bytes: &[u8; 12]) -> Self {
        let mut tai_bytes = [0u8; 8];
        tai_bytes.copy_from_slice(&bytes[0..8]);
        let mut nanos_bytes = [0u8; 4];
        nanos_bytes.copy_from_slice(&bytes[8..12]);
        Tai64N {
            tai: Tai64::unpack(&tai_bytes),
            nanos: u32::from_be_bytes(nanos_bytes),
        }
    }

    pub fn format(self) -> String {
        format_hex(&self.pack())
    }

    pub fn parse(s: &str) -> Result<Self, TaiError> {
        let bytes = unformat_hex::<12>(s)?;
        Ok(Tai64N::unpack(&bytes))
    }

    /// ISO 8601:2004 text with microsecond precision, matching the
    /// original's digit-by-digit formatter: a numeric `+HHMM`/`-HHMM`
    /// zone offset (minutes omitted when zero) or a trailing `Z` for UTC.
    pub fn to_iso8601(self, tz: TzPolicy) -> String {
        let unix = self.tai.unix_secs();
        let micros = self.nanos / 1000;
        let tm = match tz {
            TzPolicy::Utc => civil_from_unix_utc(unix),
            TzPolicy::Local => civil_from_unix_local(unix),
        };
        format_iso8601(&tm, micros)
    }
}

fn format_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(1 + bytes.len() * 2);
    s.push('@');
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn unformat_hex<const N: usize>(s: &str) -> Result<[u8; N], TaiError> {
    let rest = s.strip_prefix('@').ok_or_else(|| TaiError::BadLabel(s.to_string()))?;
    if rest.len() != N * 2 || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TaiError::BadLabel(s.to_string()));
    }
    let mut out = [0u8; N];
    for i in 0..N {
        let hi = hex_val(rest.as_bytes()[2 * i]).ok_or_else(|| TaiError::BadLabel(s.to_string()))?;
        let lo = hex_val(rest.as_bytes()[2 * i + 1]).ok_or_else(|| TaiError::BadLabel(s.to_string()))?;
        out[i] = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Broken-down calendar fields plus a signed UTC offset in seconds,
/// mirroring `apr_time_exp_t`'s fields relevant to formatting.
struct CivilTime {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    gmtoff_secs: i64,
}

fn civil_from_unix_utc(unix_secs: i64) -> CivilTime {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = unix_secs as libc::time_t;
    unsafe {
        libc::gmtime_r(&t, &mut tm);
    }
    tm_to_civil(&tm, 0)
}

fn civil_from_unix_local(unix_secs: i64) -> CivilTime {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = unix_secs as libc::time_t;
    unsafe {
        libc::localtime_r(&t, &mut tm);
    }
    tm_to_civil(&tm, tm.tm_gmtoff as i64)
}

fn tm_to_civil(tm: &libc::tm, gmtoff_secs: i64) -> CivilTime {
    CivilTime {
        year: tm.tm_year as i64 + 1900,
        month: tm.tm_mon as u32 + 1,
        day: tm.tm_mday as u32,
        hour: tm.tm_hour as u32,
        minute: tm.tm_min as u32,
        second: tm.tm_sec as u32,
        gmtoff_secs,
    }
}

fn format_iso8601(tm: &CivilTime, micros: u32) -> String {
    let mut s = String::with_capacity(32);
    if tm.year > 9999 {
        s.push_str(&format!("{:05}", tm.year));
    } else {
        s.push_str(&format!("{:04}", tm.year));
    }
    s.push('-');
    s.push_str(&format!("{:02}-{:02} {:02}:{:02}:{:02}", tm.month, tm.day, tm.hour, tm.minute, tm.second));
    if micros > 0 {
        s.push('.');
        s.push_str(&format!("{:06}", micros));
    }
    if tm.gmtoff_secs != 0 {
        let sign = if tm.gmtoff_secs > 0 { '+' } else { '-' };
        let mag = tm.gmtoff_secs.unsigned_abs();
        let hours = mag / 3600;
        let minutes = (mag % 3600) / 60;
        s.push(sign);
        s.push_str(&format!("{:02}", hours));
        if minutes > 0 {
            s.push_str(&format!("{:02}", minutes));
        }
    } else {
        s.push('Z');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tai64_round_trip() {
        for secs in [-1_000_000_i64, 0, 1, 1_700_000_000, 4_000_000_000] {
            let t = Tai64::from_unix_secs(secs).unwrap();
            assert_eq!(Tai64::unpack(&t.pack()), t);
            assert_eq!(Tai64::parse(&t.format()).unwrap(), t);
            assert_eq!(t.unix_secs(), secs);
        }
    }

    #[test]
    fn tai64n_round_trip() {
        let tai = Tai64::from_unix_secs(1_700_000_000).unwrap();
        let t = Tai64N::new(tai, 123_456_789).unwrap();
        assert_eq!(Tai64N::unpack(&t.pack()), t);
        assert_eq!(Tai64N::parse(&t.format()).unwrap(), t);
    }

    #[test]
    fn textual_format_shape() {
        let tai = Tai64::from_unix_secs(0).unwrap();
        let text = tai.format();
        assert_eq!(text.len(), Tai64::TEXT_LEN);
        assert!(text.starts_with('@'));

        let tain = Tai64N::new(tai, 0).unwrap();
        let text = tain.format();
        assert_eq!(text.len(), Tai64N::TEXT_LEN);
    }

    #[test]
    fn rejects_malformed_labels() {
        assert!(Tai64::parse("not-a-label").is_err());
        assert!(Tai64::parse("@too_short").is_err());
        assert!(Tai64N::parse("@0000000000000000").is_err()); // 16 hex digits, needs 24
    }

    #[test]
    fn iso8601_epoch_is_utc_zulu() {
        let tai = Tai64::from_unix_secs(0).unwrap();
        let tain = Tai64N::new(tai, 0).unwrap();
        let text = tain.to_iso8601(TzPolicy::Utc);
        assert_eq!(text, "1970-01-01 00:00:00Z");
    }

    #[test]
    fn iso8601_includes_microseconds_when_nonzero() {
        let tai = Tai64::from_unix_secs(0).unwrap();
        let tain = Tai64N::new(tai, 500_000_000).unwrap();
        let text = tain.to_iso8601(TzPolicy::Utc);
        assert_eq!(text, "1970-01-01 00:00:00.500000Z");
    }
}
