use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;

/// Nesting limit, so hostile input cannot blow the stack
const MAX_DEPTH: usize = 64;

/// Decode a complete bencoded document. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut parser = Parser::new(data);
    let value = parser.value(0)?;
    if parser.pos != data.len() {
        return Err(err("Trailing data after value"));
    }
    Ok(value)
}

/// Locate `key` in the top-level dictionary and return the raw encoded bytes
/// of its value, exactly as they appear in `data`.
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut parser = Parser::new(data);
    parser.expect(b'd')?;

    while parser.peek()? != b'e' {
        let k = parser.bytes()?;
        let start = parser.pos;
        parser.value(1)?;
        if k == key {
            return Ok(Some(&data[start..parser.pos]));
        }
    }

    Ok(None)
}

fn err(msg: &str) -> BittorrentError {
    BittorrentError::BencodeError(msg.to_string())
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| err("Unexpected end of input"))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(BittorrentError::BencodeError(format!(
                "Expected '{}' at offset {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(err("Nesting too deep"));
        }

        match self.peek()? {
            b'i' => self.integer().map(BencodeValue::Integer),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?.to_vec();
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => self.bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
            c => Err(BittorrentError::BencodeError(format!(
                "Invalid bencode token: {}",
                c as char
            ))),
        }
    }

    fn integer(&mut self) -> Result<i64> {
        self.expect(b'i')?;
        let digits = self.until(b'e')?;
        self.pos += 1;

        let text = std::str::from_utf8(digits).map_err(|_| err("Invalid integer"))?;
        let canonical = match text.strip_prefix('-') {
            Some(rest) => !rest.is_empty() && !rest.starts_with('0'),
            None => !text.is_empty() && (text == "0" || !text.starts_with('0')),
        };
        if !canonical {
            return Err(err("Invalid integer"));
        }

        text.parse::<i64>().map_err(|_| err("Invalid integer"))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        if !self.peek()?.is_ascii_digit() {
            return Err(err("Dictionary key must be a string"));
        }
        let digits = self.until(b':')?;
        self.pos += 1;

        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| err("Invalid string length"))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| err("String length exceeds data"))?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn until(&mut self, delimiter: u8) -> Result<&'a [u8]> {
        let start = self.pos;
        let offset = self.data[start..]
            .iter()
            .position(|&b| b == delimiter)
            .ok_or_else(|| err("Unterminated token"))?;
        self.pos = start + offset;
        Ok(&self.data[start..self.pos])
    }
}
