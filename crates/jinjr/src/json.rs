//! JSON support: a recursive-descent decoder feeding include-with-data, and
//! value encoding for the `to_json`/`to_jsonc` filters.
//!
//! The decoder walks UTF-8 input with a hard nesting cap to bound stack
//! use. The root must be an array or an object, and anything but whitespace
//! after it is an error. Failures produce one aggregated [`Error::Json`]
//! carrying line/column coordinates and a fixed-width snippet; values
//! allocated before the failure belong to the caller's scope and die with
//! it. Encoding goes through `serde_json` (`to_json` compact, `to_jsonc`
//! pretty).

use crate::diagnostic::{self, Phase};
use crate::error::{Error, Result};
use crate::heap::{Heap, ScopeId};
use crate::object::{self, Payload, alloc_dict, alloc_list, alloc_str};
use crate::value::Value;

/// Maximum nesting depth of arrays/objects.
pub const MAX_DEPTH: usize = 128;

struct Decoder<'a, 'h> {
    src: &'a str,
    bytes: &'a [u8],
    unit: &'a str,
    pos: usize,
    heap: &'h mut Heap,
    scope: ScopeId,
}

/// Decode a JSON document into engine values owned by `scope`.
pub fn decode(heap: &mut Heap, scope: ScopeId, unit: &str, src: &str) -> Result<Value> {
    let mut d = Decoder {
        src,
        bytes: src.as_bytes(),
        unit,
        pos: 0,
        heap,
        scope,
    };
    d.skip_ws();
    let root = match d.peek() {
        Some(b'[') | Some(b'{') => d.parse_value(0)?,
        _ => return d.fail("JSON root must be an array or an object"),
    };
    d.skip_ws();
    if d.pos != d.bytes.len() {
        return d.fail("trailing characters after the JSON document");
    }
    Ok(root)
}

impl Decoder<'_, '_> {
    fn fail<T>(&self, detail: &str) -> Result<T> {
        Err(Error::Json(diagnostic::message(
            Phase::Json,
            self.unit,
            self.src,
            self.pos,
            detail,
        )))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            self.fail(&format!("expected '{}'", c as char))
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value> {
        if depth >= MAX_DEPTH {
            return self.fail("JSON nesting too deep");
        }
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.parse_object(depth),
            Some(b'[') => self.parse_array(depth),
            Some(b'"') => {
                let s = self.parse_string()?;
                Ok(alloc_str(self.heap, self.scope, s))
            }
            Some(b't') => {
                self.parse_word("true")?;
                Ok(Value::Bool(true))
            }
            Some(b'f') => {
                self.parse_word("false")?;
                Ok(Value::Bool(false))
            }
            Some(b'n') => {
                self.parse_word("null")?;
                Ok(Value::None)
            }
            Some(c) if c == b'-' || c.is_ascii_digit() => self.parse_number(),
            Some(_) => self.fail("unexpected character in JSON value"),
            None => self.fail("unexpected end of JSON input"),
        }
    }

    fn parse_word(&mut self, word: &str) -> Result<()> {
        if self.src[self.pos..].starts_with(word) {
            self.pos += word.len();
            Ok(())
        } else {
            self.fail(&format!("expected '{word}'"))
        }
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Value::Number(n)),
            _ => self.fail(&format!("malformed JSON number '{text}'")),
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return self.fail("unterminated JSON string");
            };
            match c {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let Some(esc) = self.peek() else {
                        return self.fail("unterminated escape in JSON string");
                    };
                    self.pos += 1;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{0008}'),
                        b'f' => out.push('\u{000c}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => {
                            let cp = self.parse_hex4()?;
                            // Surrogate pairs encode astral characters.
                            let ch = if (0xd800..0xdc00).contains(&cp) {
                                self.parse_word("\\u")?;
                                let low = self.parse_hex4()?;
                                if !(0xdc00..0xe000).contains(&low) {
                                    return self.fail("invalid surrogate pair");
                                }
                                let c = 0x10000 + ((cp - 0xd800) << 10) + (low - 0xdc00);
                                char::from_u32(c)
                            } else {
                                char::from_u32(cp)
                            };
                            match ch {
                                Some(ch) => out.push(ch),
                                None => return self.fail("invalid unicode escape"),
                            }
                        }
                        _ => return self.fail("unknown escape in JSON string"),
                    }
                }
                0x00..=0x1f => return self.fail("raw control character in JSON string"),
                _ => {
                    let len = match c {
                        0x00..=0x7f => 1,
                        0xc0..=0xdf => 2,
                        0xe0..=0xef => 3,
                        _ => 4,
                    };
                    out.push_str(&self.src[self.pos..self.pos + len]);
                    self.pos += len;
                }
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32> {
        if self.pos + 4 > self.bytes.len() || !self.src.is_char_boundary(self.pos + 4) {
            return self.fail("truncated unicode escape");
        }
        let hex = &self.src[self.pos..self.pos + 4];
        match u32::from_str_radix(hex, 16) {
            Ok(v) => {
                self.pos += 4;
                Ok(v)
            }
            Err(_) => self.fail("malformed unicode escape"),
        }
    }

    fn parse_array(&mut self, depth: usize) -> Result<Value> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(alloc_list(self.heap, self.scope, items));
        }
        loop {
            items.push(self.parse_value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return self.fail("expected ',' or ']' in JSON array"),
            }
        }
        Ok(alloc_list(self.heap, self.scope, items))
    }

    fn parse_object(&mut self, depth: usize) -> Result<Value> {
        self.expect(b'{')?;
        let mut pairs: Vec<(String, Value)> = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(alloc_dict(self.heap, self.scope, pairs));
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            let val = self.parse_value(depth + 1)?;
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(pair) => pair.1 = val,
                None => pairs.push((key, val)),
            }
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                _ => return self.fail("expected ',' or '}' in JSON object"),
            }
        }
        Ok(alloc_dict(self.heap, self.scope, pairs))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Convert an engine value to a `serde_json` value. The depth cap guards
/// against reference cycles, which the scope model permits within a single
/// scope.
fn to_serde(heap: &Heap, v: &Value, depth: usize) -> Result<serde_json::Value> {
    if depth >= MAX_DEPTH {
        return Err(Error::Json("value nesting too deep to encode".into()));
    }
    Ok(match v {
        Value::None | Value::Uninit => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Iter(_) => serde_json::Value::Null,
        Value::Str(_) => {
            serde_json::Value::String(object::str_value(heap, v).unwrap_or_default().to_string())
        }
        Value::Object(r) => match heap.payload(*r) {
            Payload::Str(s) => serde_json::Value::String(s.clone()),
            Payload::ConstStr(s) => serde_json::Value::String(s.to_string()),
            Payload::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(to_serde(heap, item, depth + 1)?);
                }
                serde_json::Value::Array(out)
            }
            Payload::Dict(pairs) => {
                let mut map = serde_json::Map::with_capacity(pairs.len());
                for (k, val) in pairs {
                    map.insert(k.clone(), to_serde(heap, val, depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
            Payload::XRange(n) => {
                serde_json::Value::Array((0..*n).map(|i| serde_json::json!(i)).collect())
            }
            _ => {
                return Err(Error::Json(format!(
                    "type {} cannot be encoded as JSON",
                    object::type_name(heap, v)
                )));
            }
        },
    })
}

/// Compact JSON encoding (the `to_json` filter).
pub fn encode(heap: &Heap, v: &Value) -> Result<String> {
    let sv = to_serde(heap, v, 0)?;
    serde_json::to_string(&sv).map_err(|e| Error::Json(e.to_string()))
}

/// Pretty JSON encoding (the `to_jsonc` filter).
pub fn encode_pretty(heap: &Heap, v: &Value) -> Result<String> {
    let sv = to_serde(heap, v, 0)?;
    serde_json::to_string_pretty(&sv).map_err(|e| Error::Json(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ROOT_SCOPE;

    fn decode_str(src: &str) -> Result<(Heap, Value)> {
        let mut heap = Heap::new();
        let v = decode(&mut heap, ROOT_SCOPE, "test.json", src)?;
        Ok((heap, v))
    }

    #[test]
    fn decodes_nested_document() {
        let (heap, v) = decode_str(r#"{"a": [1, 2.5, true, null], "b": {"c": "x"}}"#).unwrap();
        let Payload::Dict(pairs) = heap.payload(v.obj_ref().unwrap()) else {
            panic!("expected a dict");
        };
        assert_eq!(pairs.len(), 2);
        let Payload::List(items) = heap.payload(pairs[0].1.obj_ref().unwrap()) else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Value::Number(1.0));
        assert_eq!(items[2], Value::Bool(true));
        assert_eq!(items[3], Value::None);
    }

    #[test]
    fn root_must_be_container() {
        assert!(decode_str("42").is_err());
        assert!(decode_str("\"str\"").is_err());
        assert!(decode_str("[42]").is_ok());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        assert!(decode_str("[1] x").is_err());
        assert!(decode_str("[1]   ").is_ok());
    }

    #[test]
    fn depth_cap_is_enforced() {
        let deep = "[".repeat(MAX_DEPTH + 1) + &"]".repeat(MAX_DEPTH + 1);
        let err = decode_str(&deep).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nesting too deep"), "{msg}");
    }

    #[test]
    fn errors_carry_coordinates_and_snippet() {
        let err = decode_str("{\"a\":\n  12x\n}").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("[Json:(test.json:2,"), "{msg}");
        assert!(msg.contains("12x"), "{msg}");
    }

    #[test]
    fn string_escapes_decode() {
        let (heap, v) = decode_str(r#"["a\n\t\"A😀"]"#).unwrap();
        let Payload::List(items) = heap.payload(v.obj_ref().unwrap()) else {
            panic!("expected a list");
        };
        let s = crate::object::str_value(&heap, &items[0]).unwrap();
        assert_eq!(s, "a\n\t\"A😀");
    }

    #[test]
    fn encode_round_trips_containers() {
        let (heap, v) = decode_str(r#"{"k": [1, "two", false]}"#).unwrap();
        let text = encode(&heap, &v).unwrap();
        assert_eq!(text, r#"{"k":[1,"two",false]}"#);
    }
}
