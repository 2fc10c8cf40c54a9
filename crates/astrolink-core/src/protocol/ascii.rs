//! ASCII command codec
//!
//! Commands are framed as `:` + mnemonic + arguments + `#`. Numeric
//! arguments are fixed-width, zero-padded decimal. Replies are either
//! terminated (usually by `#`), of a fixed length, or absent.
//!
//! Reply parsing fails closed: a field that does not scan is
//! [`ProtocolError::Malformed`], never a partial value.

use std::fmt;

use super::ProtocolError;

/// Shape of the reply the device sends for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Bytes up to (not including) the terminator
    Terminated(u8),
    /// Exactly this many bytes
    Fixed(usize),
    /// The device does not answer
    Silent,
}

impl ReplyShape {
    /// The mount protocol's usual `#`-terminated reply
    pub const HASH: ReplyShape = ReplyShape::Terminated(b'#');
}

/// An immutable framed ASCII command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiCommand {
    mnemonic: String,
    args: String,
}

impl AsciiCommand {
    pub fn new(mnemonic: &str) -> Self {
        Self {
            mnemonic: mnemonic.to_string(),
            args: String::new(),
        }
    }

    /// Append a zero-padded unsigned field of exactly `width` digits
    pub fn digits(mut self, value: i64, width: usize) -> Result<Self, ProtocolError> {
        if value < 0 || value >= pow10(width) {
            return Err(ProtocolError::OutOfRange {
                field: "fixed-width digits",
                value,
            });
        }
        self.args.push_str(&format!("{:0width$}", value, width = width));
        Ok(self)
    }

    /// Append an explicitly signed field: `+` or `-` then `width` digits
    pub fn signed(mut self, value: i64, width: usize) -> Result<Self, ProtocolError> {
        if value.abs() >= pow10(width) {
            return Err(ProtocolError::OutOfRange {
                field: "signed fixed-width digits",
                value,
            });
        }
        let sign = if value < 0 { '-' } else { '+' };
        self.args
            .push_str(&format!("{}{:0width$}", sign, value.abs(), width = width));
        Ok(self)
    }

    /// Append literal text (separators, device names, preformatted fields)
    pub fn text(mut self, s: &str) -> Self {
        self.args.push_str(s);
        self
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for AsciiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}{}#", self.mnemonic, self.args)
    }
}

fn pow10(width: usize) -> i64 {
    10i64.checked_pow(width as u32).unwrap_or(i64::MAX)
}

fn reply_text(reply: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(reply).map_err(|_| ProtocolError::malformed("reply is not ASCII"))
}

/// Scan a fixed-width signed decimal field starting `skip` characters in
///
/// `scan_fixed_field(b"AX1=0500123", 4, 7)` yields `500123`.
pub fn scan_fixed_field(reply: &[u8], skip: usize, width: usize) -> Result<i64, ProtocolError> {
    let text = reply_text(reply)?;
    let field = text.get(skip..skip + width).ok_or_else(|| {
        ProtocolError::malformed(format!(
            "reply {:?} too short for {}-digit field at offset {}",
            text, width, skip
        ))
    })?;

    let digits = field.strip_prefix(['+', '-']).unwrap_or(field);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::malformed(format!(
            "field {:?} in reply {:?} is not a decimal number",
            field, text
        )));
    }

    field
        .parse::<i64>()
        .map_err(|e| ProtocolError::malformed(format!("field {:?}: {}", field, e)))
}

/// Parse a single decimal component such as `"12"` in `12:30:00`
fn parse_component(part: &str, max: u32, text: &str) -> Result<f64, ProtocolError> {
    let value: f64 = part
        .parse()
        .map_err(|_| ProtocolError::malformed(format!("bad component {:?} in {:?}", part, text)))?;
    if !(0.0..(max as f64)).contains(&value) {
        return Err(ProtocolError::malformed(format!(
            "component {:?} out of range in {:?}",
            part, text
        )));
    }
    Ok(value)
}

/// Parse a sexagesimal `HH:MM:SS` (or `HH:MM.T`) reply into decimal hours
pub fn parse_hms(reply: &[u8]) -> Result<f64, ProtocolError> {
    let text = reply_text(reply)?.trim();
    let parts: Vec<&str> = text.split(':').collect();
    match parts.as_slice() {
        [h, m, s] => Ok(parse_component(h, 24, text)?
            + parse_component(m, 60, text)? / 60.0
            + parse_component(s, 60, text)? / 3600.0),
        [h, m] => Ok(parse_component(h, 24, text)? + parse_component(m, 60, text)? / 60.0),
        _ => Err(ProtocolError::malformed(format!("not an HH:MM:SS value: {:?}", text))),
    }
}

/// Parse a `sDD*MM:SS` / `sDD*MM'SS` / `sDD*MM` reply into decimal degrees
pub fn parse_dms(reply: &[u8]) -> Result<f64, ProtocolError> {
    let text = reply_text(reply)?.trim();
    let (negative, body) = match text.chars().next() {
        Some('-') => (true, &text[1..]),
        Some('+') => (false, &text[1..]),
        _ => (false, text),
    };

    let parts: Vec<&str> = body.split(['*', ':', '\'', '\u{df}']).collect();
    let magnitude = match parts.as_slice() {
        [d, m, s] => {
            parse_component(d, 361, text)?
                + parse_component(m, 60, text)? / 60.0
                + parse_component(s, 60, text)? / 3600.0
        }
        [d, m] => parse_component(d, 361, text)? + parse_component(m, 60, text)? / 60.0,
        _ => {
            return Err(ProtocolError::malformed(format!(
                "not a sDD*MM:SS value: {:?}",
                text
            )))
        }
    };

    Ok(if negative { -magnitude } else { magnitude })
}

/// Split a non-negative decimal value into rounded (whole, minutes, seconds)
fn sexagesimal(value: f64) -> (u32, u32, u32) {
    let total = (value.abs() * 3600.0).round() as u32;
    (total / 3600, (total / 60) % 60, total % 60)
}

/// Format decimal hours as `HH:MM:SS`
pub fn format_hms(hours: f64) -> String {
    let (h, m, s) = sexagesimal(hours.rem_euclid(24.0));
    format!("{:02}:{:02}:{:02}", h % 24, m, s)
}

/// Format decimal degrees as `sDD*MM:SS`
pub fn format_dms(degrees: f64) -> String {
    let sign = if degrees < 0.0 { '-' } else { '+' };
    let (d, m, s) = sexagesimal(degrees);
    format!("{}{:02}*{:02}:{:02}", sign, d, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing() {
        let cmd = AsciiCommand::new("X16").digits(501000, 6).unwrap();
        assert_eq!(cmd.to_bytes(), b":X16501000#".to_vec());
        assert_eq!(AsciiCommand::new("GR").to_string(), ":GR#");
    }

    #[test]
    fn test_digits_reject_overflow_and_negative() {
        assert!(matches!(
            AsciiCommand::new("X16").digits(1_000_000, 6),
            Err(ProtocolError::OutOfRange { value: 1_000_000, .. })
        ));
        assert!(AsciiCommand::new("X16").digits(-1, 6).is_err());
    }

    #[test]
    fn test_speed_command_with_separator() {
        let cmd = AsciiCommand::new("X1C")
            .digits(2500, 4)
            .unwrap()
            .text("*")
            .digits(1, 2)
            .unwrap();
        assert_eq!(cmd.to_string(), ":X1C2500*01#");
    }

    #[test]
    fn test_signed_field() {
        let cmd = AsciiCommand::new("SG").signed(-5, 2).unwrap();
        assert_eq!(cmd.to_string(), ":SG-05#");
    }

    #[test]
    fn test_scan_fixed_field() {
        assert_eq!(scan_fixed_field(b"AX1=0500123", 4, 7).unwrap(), 500123);
        assert_eq!(scan_fixed_field(b"AX1=-000042", 4, 7).unwrap(), -42);
    }

    #[test]
    fn test_scan_fixed_field_fails_closed() {
        assert!(scan_fixed_field(b"AX1=05001", 4, 7).is_err());
        assert!(scan_fixed_field(b"AX1=05x0123", 4, 7).is_err());
        assert!(scan_fixed_field(b"AX1=+", 4, 1).is_err());
    }

    #[test]
    fn test_parse_hms_and_dms() {
        assert!((parse_hms(b"12:30:00").unwrap() - 12.5).abs() < 1e-9);
        assert!((parse_dms(b"-45*30:00").unwrap() + 45.5).abs() < 1e-9);
        assert!((parse_dms(b"+10*15").unwrap() - 10.25).abs() < 1e-9);
        assert!(parse_hms(b"25:00:00").is_err());
        assert!(parse_dms(b"garbage").is_err());
    }

    #[test]
    fn test_format_coordinates() {
        assert_eq!(format_hms(12.5), "12:30:00");
        assert_eq!(format_dms(-45.5), "-45*30:00");
        assert_eq!(format_dms(7.0 + 1.0 / 60.0), "+07*01:00");
    }
}
