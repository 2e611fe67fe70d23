//! Field-level codec for the comma-delimited Rank Matcher wire format.
//!
//! A frame is a single line of text made of two kinds of fields:
//!
//! - **numbers**: a run of ASCII digits, e.g. `20`
//! - **strings**: a length prefix followed by exactly that many characters,
//!   e.g. `6,lobby1`. Because the length is explicit, the payload may itself
//!   contain raw commas.
//!
//! Fields are separated by `,`. The separator after the last field of a frame
//! is optional.
//!
//! # Escaping
//!
//! Writers replace `,` inside strings with `\_` and `\` with `\\` before the
//! length is computed, so lengths always count the escaped form. Readers undo
//! both substitutions. Any other backslash sequence is passed through as-is,
//! which keeps frames from older peers (which only ever emit `\_`) readable.

use std::borrow::Cow;

use crate::error::DecodeError;

/// Field separator.
pub const DELIMITER: char = ',';

const ESCAPE: char = '\\';
const ESCAPED_DELIMITER: char = '_';

/// Escape a string for the wire.
///
/// Returns the input unchanged (borrowed) when there is nothing to escape.
pub fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains([DELIMITER, ESCAPE]) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 4);
    for ch in value.chars() {
        match ch {
            DELIMITER => {
                out.push(ESCAPE);
                out.push(ESCAPED_DELIMITER);
            }
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape`].
pub fn unescape(value: &str) -> Cow<'_, str> {
    if !value.contains(ESCAPE) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some(&ESCAPED_DELIMITER) => {
                chars.next();
                out.push(DELIMITER);
            }
            Some(&ESCAPE) => {
                chars.next();
                out.push(ESCAPE);
            }
            _ => out.push(ESCAPE),
        }
    }
    Cow::Owned(out)
}

// ── Reader ──────────────────────────────────────────────────────────

/// Cursor over one immutable frame.
///
/// Every read either succeeds and advances the cursor, or fails and leaves
/// the reader in an unspecified (but memory-safe) position. Callers decode a
/// whole message from a fresh reader and discard it on the first error.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    frame: &'a str,
    /// Byte offset of the cursor.
    offset: usize,
    /// Character offset of the cursor, used for error positions.
    position: usize,
}

impl<'a> FieldReader<'a> {
    /// Create a reader positioned at the start of `frame`.
    pub fn new(frame: &'a str) -> Self {
        Self {
            frame,
            offset: 0,
            position: 0,
        }
    }

    /// Character offset of the cursor.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns `true` once every character of the frame has been consumed.
    pub fn is_empty(&self) -> bool {
        self.rest().is_empty()
    }

    /// Number of characters left after the cursor.
    pub fn remaining(&self) -> usize {
        self.rest().chars().count()
    }

    /// Read an unsigned base-10 number and the separator that follows it.
    ///
    /// # Errors
    ///
    /// [`DecodeError::MalformedNumber`] if no digit is found at the cursor or
    /// the digits do not fit in a `u64`.
    pub fn read_number(&mut self) -> Result<u64, DecodeError> {
        let rest = self.rest();
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let malformed = DecodeError::MalformedNumber {
            position: self.position,
        };
        let text = match rest.get(..digits) {
            Some(text) if !text.is_empty() => text,
            _ => return Err(malformed),
        };
        let value = text.parse::<u64>().map_err(|_| malformed)?;
        self.advance(digits, digits);
        self.skip_delimiter();
        Ok(value)
    }

    /// Read a length-prefixed string, unescaping its payload.
    ///
    /// # Errors
    ///
    /// [`DecodeError::MalformedNumber`] if the length prefix is missing, or
    /// [`DecodeError::TruncatedString`] if the frame ends before the declared
    /// number of characters.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let declared = self.read_number()?;
        let rest = self.rest();

        let mut taken: u64 = 0;
        let mut end = 0;
        for (idx, ch) in rest.char_indices() {
            if taken == declared {
                break;
            }
            end = idx + ch.len_utf8();
            taken += 1;
        }
        if taken < declared {
            return Err(DecodeError::TruncatedString {
                declared,
                remaining: usize::try_from(taken).unwrap_or(usize::MAX),
            });
        }

        let raw = rest.get(..end).unwrap_or_default();
        let value = unescape(raw).into_owned();
        self.advance(end, usize::try_from(taken).unwrap_or(usize::MAX));
        self.skip_delimiter();
        Ok(value)
    }

    fn rest(&self) -> &'a str {
        self.frame.get(self.offset..).unwrap_or_default()
    }

    fn advance(&mut self, bytes: usize, chars: usize) {
        self.offset += bytes;
        self.position += chars;
    }

    fn skip_delimiter(&mut self) {
        if self.rest().starts_with(DELIMITER) {
            self.advance(DELIMITER.len_utf8(), 1);
        }
    }
}

// ── Writer ──────────────────────────────────────────────────────────

/// Builds one frame field by field, inserting separators between fields.
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: String,
}

impl FieldWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a number field.
    pub fn write_number(&mut self, value: u64) -> &mut Self {
        self.separate();
        self.buf.push_str(&value.to_string());
        self
    }

    /// Append a string field as `<escaped-length>,<escaped-payload>`.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let escaped = escape(value);
        self.write_number(escaped.chars().count() as u64);
        self.buf.push(DELIMITER);
        self.buf.push_str(&escaped);
        self
    }

    /// Consume the writer and return the finished frame.
    pub fn finish(self) -> String {
        self.buf
    }

    fn separate(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push(DELIMITER);
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn reads_numbers_with_and_without_trailing_delimiter() {
        let mut reader = FieldReader::new("12,0,345");
        assert_eq!(reader.read_number().unwrap(), 12);
        assert_eq!(reader.read_number().unwrap(), 0);
        assert_eq!(reader.read_number().unwrap(), 345);
        assert!(reader.is_empty());
    }

    #[test]
    fn number_without_digits_is_malformed() {
        let mut reader = FieldReader::new(",5");
        assert_eq!(
            reader.read_number(),
            Err(DecodeError::MalformedNumber { position: 0 })
        );

        let mut reader = FieldReader::new("7,x");
        reader.read_number().unwrap();
        assert_eq!(
            reader.read_number(),
            Err(DecodeError::MalformedNumber { position: 2 })
        );

        let mut reader = FieldReader::new("");
        assert!(matches!(
            reader.read_number(),
            Err(DecodeError::MalformedNumber { .. })
        ));
    }

    #[test]
    fn overflowing_number_is_malformed() {
        let mut reader = FieldReader::new("18446744073709551616");
        assert!(matches!(
            reader.read_number(),
            Err(DecodeError::MalformedNumber { position: 0 })
        ));
        let mut reader = FieldReader::new("18446744073709551615");
        assert_eq!(reader.read_number().unwrap(), u64::MAX);
    }

    #[test]
    fn string_payload_may_contain_raw_delimiters() {
        let mut reader = FieldReader::new("5,a,b,c,9");
        assert_eq!(reader.read_string().unwrap(), "a,b,c");
        assert_eq!(reader.read_number().unwrap(), 9);
    }

    #[test]
    fn empty_string_field() {
        let mut reader = FieldReader::new("0,,3");
        assert_eq!(reader.read_string().unwrap(), "");
        assert_eq!(reader.read_number().unwrap(), 3);

        let mut reader = FieldReader::new("0");
        assert_eq!(reader.read_string().unwrap(), "");
        assert!(reader.is_empty());
    }

    #[test]
    fn string_length_counts_characters() {
        let mut reader = FieldReader::new("3,日本語,1");
        assert_eq!(reader.read_string().unwrap(), "日本語");
        assert_eq!(reader.read_number().unwrap(), 1);
    }

    #[test]
    fn truncated_string_reports_remaining() {
        let mut reader = FieldReader::new("10,abc");
        assert_eq!(
            reader.read_string(),
            Err(DecodeError::TruncatedString {
                declared: 10,
                remaining: 3
            })
        );
    }

    #[test]
    fn escape_round_trips() {
        for value in ["plain", "a,b", r"back\slash", r"\_", r"\\,", ",,", ""] {
            let escaped = escape(value);
            assert!(!escaped.contains(','), "{escaped} still has a delimiter");
            assert_eq!(unescape(&escaped), value);
        }
    }

    #[test]
    fn escape_borrows_when_clean() {
        assert!(matches!(escape("lobby1"), Cow::Borrowed(_)));
        assert!(matches!(unescape("lobby1"), Cow::Borrowed(_)));
    }

    #[test]
    fn unknown_escape_sequence_is_kept() {
        assert_eq!(unescape(r"a\nb"), r"a\nb");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn writer_measures_escaped_length() {
        let mut writer = FieldWriter::new();
        writer.write_number(1).write_string("a,b").write_number(2);
        assert_eq!(writer.finish(), r"1,4,a\_b,2");
    }

    #[test]
    fn writer_output_reads_back() {
        let mut writer = FieldWriter::new();
        writer
            .write_string("x,y")
            .write_string(r"c:\dir")
            .write_number(42);
        let frame = writer.finish();

        let mut reader = FieldReader::new(&frame);
        assert_eq!(reader.read_string().unwrap(), "x,y");
        assert_eq!(reader.read_string().unwrap(), r"c:\dir");
        assert_eq!(reader.read_number().unwrap(), 42);
        assert!(reader.is_empty());
    }
}
