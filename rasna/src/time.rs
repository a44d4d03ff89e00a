//! ISO-like timestamps (`YYYYMMDDThhmmss`) converted from the DER time types.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed time value")]
pub struct TimeError;

/// A 15-character `YYYYMMDDThhmmss` timestamp.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsoTime(String);

impl IsoTime {
    /// UTCTime content (`YYMMDDhhmm[ss]Z`); two-digit years pivot at 2049.
    pub fn from_utc_time(content: &[u8]) -> Result<IsoTime, TimeError> {
        let text = std::str::from_utf8(content).map_err(|_| TimeError)?;
        if !text.is_ascii() {
            return Err(TimeError);
        }
        let text = text.strip_suffix('Z').ok_or(TimeError)?;
        let (digits, seconds) = match text.len() {
            10 => (text, "00"),
            12 => (&text[..10], &text[10..]),
            _ => return Err(TimeError),
        };
        if !digits.bytes().all(|b| b.is_ascii_digit()) || !seconds.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError);
        }

        let yy: u16 = digits[..2].parse().map_err(|_| TimeError)?;
        let year = if yy <= 49 { 2000 + yy } else { 1900 + yy };
        Self::build(year, &digits[2..], seconds)
    }

    /// GeneralizedTime content (`YYYYMMDDhhmmss[.f...]Z`); fractions are dropped.
    pub fn from_generalized_time(content: &[u8]) -> Result<IsoTime, TimeError> {
        let text = std::str::from_utf8(content).map_err(|_| TimeError)?;
        if !text.is_ascii() {
            return Err(TimeError);
        }
        let text = text.strip_suffix('Z').ok_or(TimeError)?;
        let text = match text.find('.') {
            Some(dot) => &text[..dot],
            None => text,
        };
        if text.len() != 14 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError);
        }

        let year: u16 = text[..4].parse().map_err(|_| TimeError)?;
        Self::build(year, &text[4..12], &text[12..])
    }

    fn build(year: u16, mmddhhmm: &str, seconds: &str) -> Result<IsoTime, TimeError> {
        let month: u8 = mmddhhmm[..2].parse().map_err(|_| TimeError)?;
        let day: u8 = mmddhhmm[2..4].parse().map_err(|_| TimeError)?;
        let hour: u8 = mmddhhmm[4..6].parse().map_err(|_| TimeError)?;
        let minute: u8 = mmddhhmm[6..8].parse().map_err(|_| TimeError)?;
        let second: u8 = seconds.parse().map_err(|_| TimeError)?;

        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(TimeError);
        }
        if hour > 23 || minute > 59 || second > 60 {
            return Err(TimeError);
        }

        Ok(IsoTime(format!(
            "{year:04}{month:02}{day:02}T{hour:02}{minute:02}{second:02}"
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year(&self) -> u16 {
        self.0[..4].parse().unwrap()
    }
}

impl fmt::Display for IsoTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
