//! Rewrites TAI64/TAI64N textual labels found in a stream (or file) as
//! ISO 8601 text. By default only labels at the start of a line are
//! converted, matching how `tainlog` prefixes each line; `--all`
//! converts every label found anywhere in the input.

use std::io::{BufWriter, Read, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;

use srvkit::tai64::{Tai64, Tai64N, TzPolicy};

#[derive(Parser)]
#[command(about = "Converts TAI64/TAI64N labels in a stream to ISO 8601 text")]
struct Args {
    /// Render times in local time (the default).
    #[arg(long = "local-time", short = 'l')]
    local: bool,

    /// Render times in UTC.
    #[arg(long, short = 'u')]
    utc: bool,

    /// Convert every label anywhere in the input, not just at line starts.
    #[arg(long, short = 'a')]
    all: bool,

    /// File to read; defaults to stdin.
    file: Option<String>,
}

fn is_hex_nibble(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Tries the longer TAI64N label first, then the shorter TAI64 label.
/// Returns the formatted text and how many bytes of `candidate` (which
/// always starts with `@`) were actually consumed.
fn convert_stamp(candidate: &[u8], tz: TzPolicy) -> Option<(String, usize)> {
    if candidate.len() >= Tai64N::TEXT_LEN {
        if let Ok(s) = std::str::from_utf8(&candidate[..Tai64N::TEXT_LEN]) {
            if let Ok(t) = Tai64N::parse(s) {
                return Some((t.to_iso8601(tz), Tai64N::TEXT_LEN));
            }
        }
    }
    if candidate.len() >= Tai64::TEXT_LEN {
        if let Ok(s) = std::str::from_utf8(&candidate[..Tai64::TEXT_LEN]) {
            if let Ok(t) = Tai64::parse(s) {
                return Some((t.to_iso8601(tz), Tai64::TEXT_LEN));
            }
        }
    }
    None
}

struct Converter<W: Write> {
    out: W,
    tz: TzPolicy,
    only_line_start: bool,
    stamp: Vec<u8>,
    at_line_start: bool,
}

impl<W: Write> Converter<W> {
    fn new(out: W, tz: TzPolicy, only_line_start: bool) -> Self {
        Converter {
            out,
            tz,
            only_line_start,
            stamp: Vec::with_capacity(Tai64N::TEXT_LEN),
            at_line_start: true,
        }
    }

    fn feed(&mut self, byte: u8) -> std::io::Result<()> {
        if !self.stamp.is_empty() {
            if self.stamp.len() < Tai64N::TEXT_LEN && is_hex_nibble(byte) {
                self.stamp.push(byte);
                if self.stamp.len() == Tai64N::TEXT_LEN {
                    self.flush_stamp()?;
                }
                return Ok(());
            }
            self.flush_stamp()?;
            // `byte` terminated the run; reprocess it as ordinary input.
            return self.feed(byte);
        }

        if byte == b'@' && (!self.only_line_start || self.at_line_start) {
            self.stamp.push(byte);
            self.at_line_start = false;
            return Ok(());
        }

        self.at_line_start = byte == b'\n';
        self.out.write_all(&[byte])
    }

    /// Converts whatever is pending in `self.stamp`, emitting either the
    /// formatted label (plus any unconverted trailing hex digits) or the
    /// raw bytes if they never formed a valid label.
    fn flush_stamp(&mut self) -> std::io::Result<()> {
        let stamp = std::mem::take(&mut self.stamp);
        match convert_stamp(&stamp, self.tz) {
            Some((text, consumed)) => {
                self.out.write_all(text.as_bytes())?;
                self.out.write_all(&stamp[consumed..])?;
            }
            None => self.out.write_all(&stamp)?,
        }
        Ok(())
    }

    fn finish(mut self) -> std::io::Result<()> {
        if !self.stamp.is_empty() {
            self.flush_stamp()?;
        }
        self.out.flush()
    }
}

fn main() -> Result<()> {
    srvkit::logging::init("taiconv");
    let args = Args::parse();
    if args.local && args.utc {
        bail!("--local-time and --utc are mutually exclusive");
    }
    let tz = if args.utc { TzPolicy::Utc } else { TzPolicy::Local };

    let mut input: Box<dyn Read> = match &args.file {
        Some(path) => Box::new(
            std::fs::File::open(path).with_context(|| format!("opening {path:?}"))?,
        ),
        None => Box::new(std::io::stdin()),
    };

    let stdout = std::io::stdout();
    let mut converter = Converter::new(BufWriter::new(stdout.lock()), tz, !args.all);

    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte)? {
            0 => break,
            _ => converter.feed(byte[0]).context("writing to stdout")?,
        }
    }
    converter.finish().context("flushing stdout")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8], all: bool) -> String {
        let mut out = Vec::new();
        {
            let mut converter = Converter::new(&mut out, TzPolicy::Utc, !all);
            for &b in input {
                converter.feed(b).unwrap();
            }
            converter.finish().unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(run(b"hello world\n", false), "hello world\n");
    }

    #[test]
    fn converts_label_at_line_start() {
        let stamp = Tai64N::now().format();
        let line = format!("{stamp} hello\n");
        let out = run(line.as_bytes(), false);
        assert!(!out.contains('@'));
        assert!(out.ends_with(" hello\n"));
    }

    #[test]
    fn ignores_label_mid_line_unless_all() {
        let stamp = Tai64N::now().format();
        let line = format!("prefix {stamp} suffix\n");
        let out = run(line.as_bytes(), false);
        assert!(out.contains('@'), "mid-line stamp should pass through unconverted");

        let out_all = run(line.as_bytes(), true);
        assert!(!out_all.contains('@'));
    }

    #[test]
    fn invalid_label_passes_through_unchanged() {
        let bogus = "@zzzzzzzzzzzzzzzzzzzzzzzz not-a-stamp\n";
        assert_eq!(run(bogus.as_bytes(), true), bogus);
    }
}
