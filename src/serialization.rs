//! Plain-text model format helpers
//!
//! Models are stored as whitespace-delimited tokens. Real numbers are written in
//! scientific notation with 15 significant digits so that a save/load round trip
//! reproduces every weight to that precision. [`TokenReader`] walks the token stream
//! and turns every missing or malformed field into an [`Error`].

use crate::error::{Error, Result};
use crate::tensor::Shape;
use std::io::{Read, Write};
use std::str::FromStr;

/// Formats one value with 15 significant digits.
pub fn format_value(value: f64) -> String {
    format!("{:.14e}", value)
}

/// Writes values separated by single spaces, followed by a newline.
pub fn write_values(out: &mut dyn Write, values: &[f64]) -> std::io::Result<()> {
    for (i, &v) in values.iter().enumerate() {
        if i > 0 {
            out.write_all(b" ")?;
        }
        out.write_all(format_value(v).as_bytes())?;
    }
    out.write_all(b"\n")
}

/// Writes a sentinel token followed by a group of values.
pub fn write_group(out: &mut dyn Write, sentinel: &str, values: &[f64]) -> std::io::Result<()> {
    writeln!(out, "{}", sentinel)?;
    write_values(out, values)
}

/// Cursor over the tokens of a serialized model.
pub struct TokenReader {
    tokens: Vec<String>,
    position: usize,
}

impl TokenReader {
    pub fn new(text: &str) -> Self {
        Self {
            tokens: text.split_whitespace().map(str::to_string).collect(),
            position: 0,
        }
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Ok(Self::new(&text))
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<&str> {
        self.tokens.get(self.position).map(String::as_str)
    }

    /// Next raw token; `what` names the field for the error message.
    pub fn next_token(&mut self, what: &str) -> Result<&str> {
        let token = self
            .tokens
            .get(self.position)
            .ok_or_else(|| Error::UnexpectedEof(what.to_string()))?;
        self.position += 1;
        Ok(token.as_str())
    }

    /// Next token parsed as `T`.
    pub fn parse<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_token(what)?;
        token
            .parse::<T>()
            .map_err(|_| Error::Malformed(format!("cannot parse '{}' as {}", token, what)))
    }

    /// Consumes `sentinel` or fails with [`Error::MissingSentinel`].
    pub fn expect(&mut self, sentinel: &str) -> Result<()> {
        let token = self.next_token(sentinel)?;
        if token != sentinel {
            return Err(Error::MissingSentinel {
                expected: sentinel.to_string(),
                found: token.to_string(),
            });
        }
        Ok(())
    }

    pub fn shape(&mut self, what: &str) -> Result<Shape> {
        let shape = Shape::new(
            self.parse(what)?,
            self.parse(what)?,
            self.parse(what)?,
        );
        shape.validate()?;
        Ok(shape)
    }

    pub fn values(&mut self, count: usize, what: &str) -> Result<Vec<f64>> {
        (0..count).map(|_| self.parse::<f64>(what)).collect()
    }

    /// Reads a sentinel followed by `count` values.
    pub fn group(&mut self, sentinel: &str, count: usize) -> Result<Vec<f64>> {
        self.expect(sentinel)?;
        self.values(count, sentinel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip_at_15_digits() {
        let values = [0.1, -1.0 / 3.0, 12345.678901234567, 1e-300, 0.0];
        let mut buf = Vec::new();
        write_values(&mut buf, &values).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let mut reader = TokenReader::new(&text);
        let back = reader.values(values.len(), "weights").unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            let scale = a.abs().max(1e-300);
            assert!(((a - b) / scale).abs() < 1e-14, "{} vs {}", a, b);
        }
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_missing_sentinel() {
        let mut reader = TokenReader::new("filter 1.0");
        let err = reader.expect("biases").unwrap_err();
        assert!(matches!(err, Error::MissingSentinel { .. }));
    }

    #[test]
    fn test_premature_end() {
        let mut reader = TokenReader::new("1.0 2.0");
        let err = reader.values(3, "weights").unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof(_)));
    }

    #[test]
    fn test_malformed_number() {
        let mut reader = TokenReader::new("1.0 abc");
        let err = reader.values(2, "weights").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_shape_rejects_zero_dimension() {
        let mut reader = TokenReader::new("4 0 1");
        assert!(reader.shape("input shape").is_err());
    }
}
