//! Reader and writer for the structured data notation wire format.
//!
//! This is the serialization the RPC pipes speak. A quick sketch of the
//! grammar:
//!
//! ```text
//! !                      undef
//! 1 | 0 | true | false   boolean (also t/f/T/F/TRUE/FALSE)
//! i42                    integer
//! r3.25                  real
//! ucc706f2d-0b68-...     uuid
//! 'str' | "str"          string with \ escapes
//! s(3)"abc"              raw string with a length prefix
//! l"http://example/"     uri
//! d"2024-05-01T00:00:00Z" date, RFC 3339
//! b(3)"xyz" | b64"..." | b16"..."  binary
//! [v, v, ...]            array
//! {'key':v, ...}         map
//! ```
//!
//! Separating commas are optional, real traffic omits them now and then and
//! the parser accepts that.

use std::io::{self, Read, Write};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::sd::Sd;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("unexpected end of input")]
    Eof,

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    Unexpected { byte: u8, offset: usize },

    #[error("bad {what} at offset {offset}")]
    Bad {
        what: &'static str,
        offset: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Parse one value from `reader`, looking at most `max_bytes` ahead.
///
/// Returns the value and the number of bytes consumed by it. Bytes past the
/// value are read off `reader` but not consumed by the parse, use the
/// returned count to account for them.
pub fn from_notation<R: Read>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<(Sd, usize), ParseError> {
    let mut bytes = Vec::with_capacity(max_bytes.min(16 * 1024));
    reader.take(max_bytes as u64).read_to_end(&mut bytes)?;
    let mut parser = Parser {
        bytes: &bytes,
        pos: 0,
    };
    let value = parser.value()?;
    Ok((value, parser.pos))
}

/// Parse a value from an in-memory string.
pub fn from_notation_str(text: &str) -> Result<Sd, ParseError> {
    let mut bytes = text.as_bytes();
    from_notation(&mut bytes, text.len()).map(|(value, _)| value)
}

/// Serialize `value` onto `writer` in notation.
pub fn to_notation<W: Write>(value: &Sd, writer: &mut W) -> io::Result<()> {
    match value {
        Sd::Undef => writer.write_all(b"!"),
        Sd::Boolean(true) => writer.write_all(b"1"),
        Sd::Boolean(false) => writer.write_all(b"0"),
        Sd::Integer(v) => write!(writer, "i{}", v),
        Sd::Real(v) => write!(writer, "r{}", v),
        Sd::String(s) => write!(writer, "'{}'", escape_string(s)),
        Sd::Uuid(u) => write!(writer, "u{}", u),
        Sd::Uri(u) => write!(writer, "l\"{}\"", escape_with(u, b'"')),
        Sd::Date(d) => {
            let stamp = d
                .format(&Rfc3339)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write!(writer, "d\"{}\"", stamp)
        }
        Sd::Binary(bytes) => write!(writer, "b64\"{}\"", base64::encode(bytes)),
        Sd::Map(entries) => {
            writer.write_all(b"{")?;
            for (index, (key, value)) in entries.iter().enumerate() {
                if index > 0 {
                    writer.write_all(b",")?;
                }
                write!(writer, "'{}':", escape_string(key))?;
                to_notation(value, writer)?;
            }
            writer.write_all(b"}")
        }
        Sd::Array(values) => {
            writer.write_all(b"[")?;
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    writer.write_all(b",")?;
                }
                to_notation(value, writer)?;
            }
            writer.write_all(b"]")
        }
    }
}

/// Serialize into an owned string.
pub fn to_notation_string(value: &Sd) -> String {
    let mut out = Vec::new();
    // writing to a Vec cannot fail
    let _ = to_notation(value, &mut out);
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape a string for a single quoted notation literal.
pub fn escape_string(text: &str) -> String {
    escape_with(text, b'\'')
}

fn escape_with(text: &str, delimiter: u8) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b if b == delimiter => {
                out.push('\\');
                out.push(b as char);
            }
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    out
}

////////////////////////////////////////////////////////////////////////////////
// Parser
////////////////////////////////////////////////////////////////////////////////

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8, ParseError> {
        let byte = self.peek().ok_or(ParseError::Eof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), ParseError> {
        let byte = self.next()?;
        if byte == expected {
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                byte,
                offset: self.pos - 1,
            })
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(byte) = self.peek() {
            if matches!(byte, b' ' | b'\t' | b'\r' | b'\n') {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_separator(&mut self) {
        self.skip_whitespace();
        if self.peek() == Some(b',') {
            self.pos += 1;
            self.skip_whitespace();
        }
    }

    fn bad(&self, what: &'static str) -> ParseError {
        ParseError::Bad {
            what,
            offset: self.pos,
        }
    }

    fn value(&mut self) -> Result<Sd, ParseError> {
        self.skip_whitespace();
        let byte = self.peek().ok_or(ParseError::Eof)?;
        match byte {
            b'!' => {
                self.pos += 1;
                Ok(Sd::Undef)
            }
            b'1' => {
                self.pos += 1;
                Ok(Sd::Boolean(true))
            }
            b'0' => {
                self.pos += 1;
                Ok(Sd::Boolean(false))
            }
            b't' | b'T' => {
                self.word()?;
                Ok(Sd::Boolean(true))
            }
            b'f' | b'F' => {
                self.word()?;
                Ok(Sd::Boolean(false))
            }
            b'i' => {
                self.pos += 1;
                self.integer()
            }
            b'r' => {
                self.pos += 1;
                self.real()
            }
            b'u' => {
                self.pos += 1;
                self.uuid()
            }
            b'\'' | b'"' => Ok(Sd::String(self.quoted()?)),
            b's' => {
                self.pos += 1;
                let raw = self.sized_raw()?;
                Ok(Sd::String(String::from_utf8_lossy(&raw).into_owned()))
            }
            b'l' => {
                self.pos += 1;
                Ok(Sd::Uri(self.quoted()?))
            }
            b'd' => {
                self.pos += 1;
                self.date()
            }
            b'b' => {
                self.pos += 1;
                self.binary()
            }
            b'{' => self.map(),
            b'[' => self.array(),
            _ => Err(ParseError::Unexpected {
                byte,
                offset: self.pos,
            }),
        }
    }

    /// Consume an alphabetic word, it must spell a boolean.
    fn word(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphabetic() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = &self.bytes[start..self.pos];
        match word.to_ascii_lowercase().as_slice() {
            b"t" | b"true" | b"f" | b"false" => Ok(()),
            _ => Err(ParseError::Bad {
                what: "boolean",
                offset: start,
            }),
        }
    }

    fn integer(&mut self) -> Result<Sd, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.bad("integer"))?;
        let value: i32 = text.parse().map_err(|_| ParseError::Bad {
            what: "integer",
            offset: start,
        })?;
        Ok(Sd::Integer(value))
    }

    fn real(&mut self) -> Result<Sd, ParseError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9') | Some(b'-') | Some(b'+') | Some(b'.') | Some(b'e') | Some(b'E')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.bad("real"))?;
        let value: f64 = text.parse().map_err(|_| ParseError::Bad {
            what: "real",
            offset: start,
        })?;
        Ok(Sd::Real(value))
    }

    fn uuid(&mut self) -> Result<Sd, ParseError> {
        const UUID_LEN: usize = 36;
        let start = self.pos;
        if self.bytes.len() - self.pos < UUID_LEN {
            return Err(ParseError::Eof);
        }
        self.pos += UUID_LEN;
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.bad("uuid"))?;
        let value = Uuid::parse_str(text).map_err(|_| ParseError::Bad {
            what: "uuid",
            offset: start,
        })?;
        Ok(Sd::Uuid(value))
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        let delimiter = self.next()?;
        if delimiter != b'\'' && delimiter != b'"' {
            return Err(ParseError::Unexpected {
                byte: delimiter,
                offset: self.pos - 1,
            });
        }
        let mut out = Vec::new();
        loop {
            let byte = self.next()?;
            if byte == delimiter {
                break;
            }
            if byte != b'\\' {
                out.push(byte);
                continue;
            }
            let escaped = self.next()?;
            match escaped {
                b'a' => out.push(0x07),
                b'b' => out.push(0x08),
                b'f' => out.push(0x0c),
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b't' => out.push(b'\t'),
                b'v' => out.push(0x0b),
                b'x' => {
                    let hi = self.next()?;
                    let lo = self.next()?;
                    let value = hex_value(hi)
                        .and_then(|h| hex_value(lo).map(|l| (h << 4) | l))
                        .ok_or_else(|| self.bad("hex escape"))?;
                    out.push(value);
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// `(len)"raw bytes"` body shared by sized strings and binary.
    fn sized_raw(&mut self) -> Result<Vec<u8>, ParseError> {
        self.expect(b'(')?;
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.bad("length"))?;
        let len: usize = text.parse().map_err(|_| ParseError::Bad {
            what: "length",
            offset: start,
        })?;
        self.expect(b')')?;
        let delimiter = self.next()?;
        if delimiter != b'\'' && delimiter != b'"' {
            return Err(ParseError::Unexpected {
                byte: delimiter,
                offset: self.pos - 1,
            });
        }
        if self.bytes.len() - self.pos < len {
            return Err(ParseError::Eof);
        }
        let raw = self.bytes[self.pos..self.pos + len].to_vec();
        self.pos += len;
        self.expect(delimiter)?;
        Ok(raw)
    }

    fn date(&mut self) -> Result<Sd, ParseError> {
        let start = self.pos;
        let text = self.quoted()?;
        let value = OffsetDateTime::parse(&text, &Rfc3339).map_err(|_| ParseError::Bad {
            what: "date",
            offset: start,
        })?;
        Ok(Sd::Date(value))
    }

    fn binary(&mut self) -> Result<Sd, ParseError> {
        match self.peek().ok_or(ParseError::Eof)? {
            b'(' => Ok(Sd::Binary(self.sized_raw()?)),
            b'1' => {
                // b16"HEX"
                self.expect(b'1')?;
                self.expect(b'6')?;
                let start = self.pos;
                let text = self.quoted()?;
                let bytes = from_hex(&text).ok_or(ParseError::Bad {
                    what: "base16 binary",
                    offset: start,
                })?;
                Ok(Sd::Binary(bytes))
            }
            b'6' => {
                // b64"BASE64"
                self.expect(b'6')?;
                self.expect(b'4')?;
                let start = self.pos;
                let text = self.quoted()?;
                let bytes = base64::decode(text.trim()).map_err(|_| ParseError::Bad {
                    what: "base64 binary",
                    offset: start,
                })?;
                Ok(Sd::Binary(bytes))
            }
            byte => Err(ParseError::Unexpected {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn map(&mut self) -> Result<Sd, ParseError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek().ok_or(ParseError::Eof)? {
                b'}' => {
                    self.pos += 1;
                    break;
                }
                b'\'' | b'"' => {
                    let key = self.quoted()?;
                    self.skip_whitespace();
                    self.expect(b':')?;
                    let value = self.value()?;
                    entries.push((key, value));
                    self.skip_separator();
                }
                b's' => {
                    self.pos += 1;
                    let raw = self.sized_raw()?;
                    let key = String::from_utf8_lossy(&raw).into_owned();
                    self.skip_whitespace();
                    self.expect(b':')?;
                    let value = self.value()?;
                    entries.push((key, value));
                    self.skip_separator();
                }
                byte => {
                    return Err(ParseError::Unexpected {
                        byte,
                        offset: self.pos,
                    })
                }
            }
        }
        Ok(Sd::Map(entries))
    }

    fn array(&mut self) -> Result<Sd, ParseError> {
        self.expect(b'[')?;
        let mut values = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek().ok_or(ParseError::Eof)? == b']' {
                self.pos += 1;
                break;
            }
            values.push(self.value()?);
            self.skip_separator();
        }
        Ok(Sd::Array(values))
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(value: Sd) {
        let text = to_notation_string(&value);
        let parsed = from_notation_str(&text)
            .unwrap_or_else(|e| panic!("failed to parse {:?}: {}", text, e));
        assert_eq!(parsed, value, "round trip through {:?}", text);
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(Sd::Undef);
        round_trip(Sd::Boolean(true));
        round_trip(Sd::Boolean(false));
        round_trip(Sd::Integer(0));
        round_trip(Sd::Integer(-1075));
        round_trip(Sd::Real(70.9247));
        round_trip(Sd::Real(-0.043753));
        round_trip(Sd::String("".to_string()));
        round_trip(Sd::String("parcel '' is naughty.".to_string()));
        round_trip(Sd::String("tab\there\nand a \\ backslash".to_string()));
        round_trip(Sd::Uri("sl-am:host/location?start=region".to_string()));
        round_trip(Sd::Uuid(
            Uuid::parse_str("3c115e51-04f4-523c-9fa6-98aff1034730").unwrap(),
        ));
        round_trip(Sd::Binary(b"{'task_id':u...}\n\x00\x01\xff".to_vec()));
        round_trip(Sd::Date(
            OffsetDateTime::from_unix_timestamp(1_136_214_245).unwrap(),
        ));
    }

    #[test]
    fn container_round_trips() {
        let mut map = Sd::Undef;
        map.insert("method", "echo");
        map.insert("parameter", Sd::Array(vec![Sd::Integer(1), Sd::Undef]));
        round_trip(map);

        let nested = Sd::Array(vec![
            Sd::Map(vec![("version".to_string(), Sd::Integer(1))]),
            Sd::Map(vec![
                ("failures".to_string(), Sd::Undef),
                (
                    "successfuls".to_string(),
                    Sd::Array(vec![Sd::Uuid(
                        Uuid::parse_str("a2e76fcd-9360-4f6d-a924-000000000003").unwrap(),
                    )]),
                ),
            ]),
        ]);
        round_trip(nested);
    }

    #[test]
    fn parses_request_wire_shape() {
        let sd = from_notation_str("{'method':'echo', 'parameter':i1}").unwrap();
        assert_eq!(sd.at("method").as_str(), "echo");
        assert_eq!(sd.at("parameter").as_int(), 1);
    }

    #[test]
    fn missing_commas_are_tolerated() {
        let sd =
            from_notation_str("{'circuit_code':i1075 'start':'region' 'version':i1}").unwrap();
        assert_eq!(sd.len(), 3);
        assert_eq!(sd.at("circuit_code").as_int(), 1075);
        assert_eq!(sd.at("start").as_str(), "region");
    }

    #[test]
    fn sized_string_and_raw_binary() {
        let sd = from_notation_str("s(5)\"a'b\"c\"").unwrap();
        assert_eq!(sd, Sd::String("a'b\"c".to_string()));

        let sd = from_notation_str("b(3)\"\x01\x02\x03\"").unwrap();
        assert_eq!(sd, Sd::Binary(vec![1, 2, 3]));

        let sd = from_notation_str("b16\"00ff10\"").unwrap();
        assert_eq!(sd, Sd::Binary(vec![0x00, 0xff, 0x10]));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(from_notation_str("{!'foo'@:#'bar'}").is_err());
        assert!(from_notation_str("").is_err());
        assert!(from_notation_str("i").is_err());
        assert!(from_notation_str("{'open':i1").is_err());
    }

    #[test]
    fn consumed_byte_count() {
        let text = "i42 trailing";
        let mut bytes = text.as_bytes();
        let (value, consumed) = from_notation(&mut bytes, text.len()).unwrap();
        assert_eq!(value, Sd::Integer(42));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn escape_string_escapes_quotes_and_controls() {
        assert_eq!(escape_string("it's"), "it\\'s");
        assert_eq!(escape_string("a\\b"), "a\\\\b");
        assert_eq!(escape_string("\x07"), "\\x07");
    }
}
