//! Parser and printer for the Python literal subset that array headers are
//! written in: strings, integers, `True`/`False`/`None`, tuples, lists and
//! dicts.
//!
//! Every parsed node remembers its byte span in the source text so callers
//! can report the exact offset of whatever they reject.

use std::fmt::Write;

/// Nesting limit; header literals in the wild are a handful of levels deep.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
    Tuple(Vec<Literal>),
    List(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: LiteralValue,
    /// Byte offset of the first character of this node.
    pub offset: usize,
    /// Byte offset one past the last character of this node.
    pub end: usize,
}

impl Literal {
    pub fn kind_name(&self) -> &'static str {
        match self.value {
            LiteralValue::Str(_) => "string",
            LiteralValue::Int(_) => "integer",
            LiteralValue::Bool(_) => "boolean",
            LiteralValue::None => "None",
            LiteralValue::Tuple(_) => "tuple",
            LiteralValue::List(_) => "list",
            LiteralValue::Dict(_) => "dict",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            LiteralValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralError {
    pub offset: usize,
    pub reason: String,
}

/// Parse `text` as exactly one literal, surrounded by optional whitespace.
pub fn parse_literal(text: &str) -> Result<Literal, LiteralError> {
    let mut parser = Parser { src: text, pos: 0 };
    parser.skip_ws();
    let lit = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(lit)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn value(&mut self, depth: usize) -> Result<Literal, LiteralError> {
        if depth > MAX_DEPTH {
            return Err(self.error("literal nested too deeply"));
        }
        let start = self.pos;
        let value = match self.peek() {
            Some('\'') | Some('"') => LiteralValue::Str(self.string()?),
            Some('u') | Some('U')
                if matches!(self.src[self.pos + 1..].chars().next(), Some('\'') | Some('"')) =>
            {
                self.bump();
                LiteralValue::Str(self.string()?)
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' => {
                LiteralValue::Int(self.integer()?)
            }
            Some(c) if c.is_ascii_alphabetic() => self.keyword()?,
            Some('(') => return self.tuple(depth),
            Some('[') => {
                self.bump();
                LiteralValue::List(self.items(']', depth)?.0)
            }
            Some('{') => LiteralValue::Dict(self.dict(depth)?),
            Some(c) => return Err(self.error(format!("unexpected character {c:?}"))),
            None => return Err(self.error("unexpected end of input")),
        };
        Ok(Literal {
            value,
            offset: start,
            end: self.pos,
        })
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let start = self.pos;
        let quote = self.bump().ok_or_else(|| self.error("expected a string"))?;
        let mut out = String::new();
        loop {
            let c = self.bump().ok_or_else(|| LiteralError {
                offset: start,
                reason: "unterminated string".into(),
            })?;
            match c {
                c if c == quote => return Ok(out),
                '\\' => out.push(self.escape()?),
                '\n' => return Err(self.error("newline inside string")),
                c => out.push(c),
            }
        }
    }

    fn escape(&mut self) -> Result<char, LiteralError> {
        let c = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
        let hex_len = match c {
            '\\' => return Ok('\\'),
            '\'' => return Ok('\''),
            '"' => return Ok('"'),
            'n' => return Ok('\n'),
            'r' => return Ok('\r'),
            't' => return Ok('\t'),
            '0' => return Ok('\0'),
            'x' => 2,
            'u' => 4,
            'U' => 8,
            other => return Err(self.error(format!("unsupported escape \\{other}"))),
        };
        let digits = self
            .src
            .get(self.pos..self.pos + hex_len)
            .ok_or_else(|| self.error("truncated escape"))?;
        let code = u32::from_str_radix(digits, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos += hex_len;
        char::from_u32(code).ok_or_else(|| self.error(format!("invalid code point {code:#x}")))
    }

    fn integer(&mut self) -> Result<i64, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        let digits = &self.src[start..self.pos];
        // Python 2 long suffix.
        if matches!(self.peek(), Some('L') | Some('l')) {
            self.bump();
        }
        digits.parse::<i64>().map_err(|_| LiteralError {
            offset: start,
            reason: format!("invalid integer {digits:?}"),
        })
    }

    fn keyword(&mut self) -> Result<LiteralValue, LiteralError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "True" => Ok(LiteralValue::Bool(true)),
            "False" => Ok(LiteralValue::Bool(false)),
            "None" => Ok(LiteralValue::None),
            word => Err(LiteralError {
                offset: start,
                reason: format!("unexpected identifier {word:?}"),
            }),
        }
    }

    fn tuple(&mut self, depth: usize) -> Result<Literal, LiteralError> {
        let start = self.pos;
        self.bump();
        let (mut items, trailing_comma) = self.items(')', depth)?;
        // `(x)` is just a parenthesised value.
        if items.len() == 1 && !trailing_comma {
            if let Some(mut inner) = items.pop() {
                inner.offset = start;
                inner.end = self.pos;
                return Ok(inner);
            }
        }
        Ok(Literal {
            value: LiteralValue::Tuple(items),
            offset: start,
            end: self.pos,
        })
    }

    /// Comma separated values up to `close`. Returns the values and whether
    /// the last one was followed by a comma.
    fn items(&mut self, close: char, depth: usize) -> Result<(Vec<Literal>, bool), LiteralError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok((items, trailing_comma));
            }
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(',') => trailing_comma = true,
                Some(c) if c == close => {
                    self.bump();
                    return Ok((items, false));
                }
                _ => return Err(self.error(format!("expected ',' or '{close}'"))),
            }
            self.bump();
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Vec<(Literal, Literal)>, LiteralError> {
        self.bump();
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(entries);
            }
            let key = self.value(depth + 1)?;
            self.skip_ws();
            if self.peek() != Some(':') {
                return Err(self.error("expected ':' after dict key"));
            }
            self.bump();
            self.skip_ws();
            let value = self.value(depth + 1)?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    return Ok(entries);
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Printing
// ---------------------------------------------------------------------------

/// Append `s` the way Python's `repr(str)` renders it.
pub fn write_str(out: &mut String, s: &str) {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || ('\u{7f}'..='\u{9f}').contains(&c) => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Append a tuple of integers: `()`, `(3,)`, `(2, 3)`.
pub fn write_tuple(out: &mut String, items: &[usize]) {
    out.push('(');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{item}");
    }
    if items.len() == 1 {
        out.push(',');
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_dict() {
        let text = "{'descr': '<f8', 'fortran_order': False, 'shape': (2, 3), }";
        let lit = parse_literal(text).unwrap();
        let LiteralValue::Dict(entries) = lit.value else {
            panic!("expected dict");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.as_str(), Some("descr"));
        assert_eq!(entries[0].1.as_str(), Some("<f8"));
        assert_eq!(entries[0].1.offset, 10);
        assert_eq!(entries[1].1.value, LiteralValue::Bool(false));
        let LiteralValue::Tuple(shape) = &entries[2].1.value else {
            panic!("expected tuple");
        };
        assert_eq!(shape.len(), 2);
    }

    #[test]
    fn single_element_tuple_needs_comma() {
        let lit = parse_literal("(3,)").unwrap();
        assert!(matches!(lit.value, LiteralValue::Tuple(ref v) if v.len() == 1));
        let lit = parse_literal("(3)").unwrap();
        assert_eq!(lit.value, LiteralValue::Int(3));
    }

    #[test]
    fn string_escapes_and_quotes() {
        let lit = parse_literal(r#""it's\x41\n""#).unwrap();
        assert_eq!(lit.as_str(), Some("it'sA\n"));

        let mut out = String::new();
        write_str(&mut out, "it's");
        assert_eq!(out, r#""it's""#);

        let mut out = String::new();
        write_str(&mut out, "a\\b\x01");
        assert_eq!(out, r"'a\\b\x01'");
    }

    #[test]
    fn reports_offsets() {
        let err = parse_literal("[('a', '<i4') ('b', '<i4')]").unwrap_err();
        assert_eq!(err.offset, 14);
        let err = parse_literal("{'x': Maybe}").unwrap_err();
        assert_eq!(err.offset, 6);
        assert!(parse_literal("'open").is_err());
    }

    #[test]
    fn rejects_runaway_nesting() {
        let text = format!("{}{}", "[".repeat(200), "]".repeat(200));
        assert!(parse_literal(&text).is_err());
    }

    #[test]
    fn tuple_printing() {
        let mut out = String::new();
        write_tuple(&mut out, &[]);
        write_tuple(&mut out, &[3]);
        write_tuple(&mut out, &[2, 3]);
        assert_eq!(out, "()(3,)(2, 3)");
    }
}
