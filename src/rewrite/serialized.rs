// ABOUTME: Parser and writer for length-prefixed serialized values (s:5:"hello"; a:1:{...})
// ABOUTME: Lets URL substitution recurse into containers and recompute every byte length

/// Result of rewriting one stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewritten {
    Unchanged,
    Changed(String),
    /// Looked serialized but did not parse; left untouched.
    Corrupt,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    /// Integers and floats keep their original text.
    Number(u8, Vec<u8>),
    Str(Vec<u8>),
    Enum(Vec<u8>),
    Array(Vec<(Value, Value)>),
    Object(Vec<u8>, Vec<(Value, Value)>),
    Reference(u8, Vec<u8>),
}

/// Containers nested deeper than this are treated as corrupt.
pub const MAX_DEPTH: usize = 512;

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8], depth: usize) -> Self {
        Self {
            input,
            pos: 0,
            depth,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.peek()? == byte {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    /// Reads up to (not including) `terminator` and consumes the terminator.
    fn until(&mut self, terminator: u8) -> Option<&'a [u8]> {
        let start = self.pos;
        let rel = self.input[start..].iter().position(|b| *b == terminator)?;
        self.pos = start + rel + 1;
        Some(&self.input[start..start + rel])
    }

    fn length(&mut self) -> Option<usize> {
        let digits = self.until(b':')?;
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }

    fn quoted(&mut self, len: usize) -> Option<Vec<u8>> {
        self.expect(b'"')?;
        let end = self.pos.checked_add(len)?;
        let bytes = self.input.get(self.pos..end)?.to_vec();
        self.pos = end;
        self.expect(b'"')?;
        Some(bytes)
    }

    fn entries(&mut self, count: usize) -> Option<Vec<(Value, Value)>> {
        self.expect(b'{')?;
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.value()?;
            if !matches!(key, Value::Number(b'i', _) | Value::Str(_)) {
                return None;
            }
            let value = self.value()?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        self.depth -= 1;
        Some(entries)
    }

    fn value(&mut self) -> Option<Value> {
        let tag = self.peek()?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Some(Value::Null);
        }
        self.expect(b':')?;
        match tag {
            b'b' => {
                let raw = self.until(b';')?;
                match raw {
                    b"0" => Some(Value::Bool(false)),
                    b"1" => Some(Value::Bool(true)),
                    _ => None,
                }
            }
            b'i' | b'd' => {
                let raw = self.until(b';')?;
                if raw.is_empty() {
                    return None;
                }
                Some(Value::Number(tag, raw.to_vec()))
            }
            b'r' | b'R' => {
                let raw = self.until(b';')?;
                Some(Value::Reference(tag, raw.to_vec()))
            }
            b's' | b'E' => {
                let len = self.length()?;
                let bytes = self.quoted(len)?;
                self.expect(b';')?;
                Some(if tag == b's' {
                    Value::Str(bytes)
                } else {
                    Value::Enum(bytes)
                })
            }
            b'a' => {
                let count = self.length()?;
                Some(Value::Array(self.entries(count)?))
            }
            b'O' => {
                let len = self.length()?;
                let class = self.quoted(len)?;
                self.expect(b':')?;
                let count = self.length()?;
                Some(Value::Object(class, self.entries(count)?))
            }
            _ => None,
        }
    }

    /// Consumes `s:N:"`, `E:N:"`, `a:N:{` or `O:N:"`.
    fn header(&mut self) -> Option<()> {
        let tag = self.peek()?;
        self.pos += 1;
        self.expect(b':')?;
        self.length()?;
        match tag {
            b's' | b'E' | b'O' => self.expect(b'"'),
            b'a' => self.expect(b'{'),
            _ => None,
        }
    }
}

fn parse(input: &[u8], depth: usize) -> Option<Value> {
    let mut parser = Parser::new(input, depth);
    let value = parser.value()?;
    (parser.pos == input.len()).then_some(value)
}

/// True when `bytes` opens a string or container even though the rest is damaged.
fn has_container_header(bytes: &[u8]) -> bool {
    Parser::new(bytes, 0).header().is_some()
}

fn write_entries(out: &mut Vec<u8>, entries: &[(Value, Value)]) {
    out.extend_from_slice(format!("{}:{{", entries.len()).as_bytes());
    for (key, value) in entries {
        write(out, key);
        write(out, value);
    }
    out.push(b'}');
}

fn write(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"N;"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
        Value::Number(tag, raw) | Value::Reference(tag, raw) => {
            out.push(*tag);
            out.push(b':');
            out.extend_from_slice(raw);
            out.push(b';');
        }
        Value::Str(bytes) | Value::Enum(bytes) => {
            out.push(if matches!(value, Value::Str(_)) { b's' } else { b'E' });
            out.extend_from_slice(format!(":{}:\"", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\";");
        }
        Value::Array(entries) => {
            out.extend_from_slice(b"a:");
            write_entries(out, entries);
        }
        Value::Object(class, entries) => {
            out.extend_from_slice(format!("O:{}:\"", class.len()).as_bytes());
            out.extend_from_slice(class);
            out.extend_from_slice(b"\":");
            write_entries(out, entries);
        }
    }
}

fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || haystack.len() < from.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    let mut changed = false;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
            changed = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    changed.then_some(out)
}

/// True when `bytes` starts like a serialized scalar or container.
pub fn looks_serialized(bytes: &[u8]) -> bool {
    match bytes {
        b"N;" => true,
        [tag, b':', next, .., last] => {
            b"abdiOsE".contains(tag)
                && (next.is_ascii_digit() || *next == b'-')
                && (*last == b';' || *last == b'}')
        }
        _ => false,
    }
}

struct Substitution<'a> {
    pairs: Vec<(&'a [u8], Vec<u8>)>,
}

impl<'a> Substitution<'a> {
    fn plain(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut current: Option<Vec<u8>> = None;
        for (from, to) in &self.pairs {
            let input = current.as_deref().unwrap_or(bytes);
            if let Some(next) = replace_bytes(input, from, to) {
                current = Some(next);
            }
        }
        current
    }

    /// Rewrites one string payload, recursing when it is itself serialized.
    /// `depth` counts containers and nested payloads already entered.
    fn bytes(&self, bytes: &[u8], depth: usize) -> Result<Option<Vec<u8>>, ()> {
        if !looks_serialized(bytes) {
            return Ok(self.plain(bytes));
        }
        if let Some(mut inner) = parse(bytes, depth) {
            if !self.value(&mut inner, depth)? {
                return Ok(None);
            }
            let mut out = Vec::with_capacity(bytes.len());
            write(&mut out, &inner);
            return Ok(Some(out));
        }
        if !has_container_header(bytes) {
            return Ok(self.plain(bytes));
        }
        if self.plain(bytes).is_some() {
            return Err(());
        }
        Ok(None)
    }

    fn entries(&self, entries: &mut [(Value, Value)], depth: usize) -> Result<bool, ()> {
        if depth >= MAX_DEPTH {
            return Err(());
        }
        let mut changed = false;
        for (key, value) in entries.iter_mut() {
            changed |= self.value(key, depth + 1)?;
            changed |= self.value(value, depth + 1)?;
        }
        Ok(changed)
    }

    fn value(&self, value: &mut Value, depth: usize) -> Result<bool, ()> {
        match value {
            Value::Str(bytes) => {
                if depth >= MAX_DEPTH {
                    return Err(());
                }
                match self.bytes(bytes, depth + 1)? {
                    Some(next) => {
                        *bytes = next;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Value::Array(entries) | Value::Object(_, entries) => self.entries(entries, depth),
            _ => Ok(false),
        }
    }
}

/// Replaces `from` with `to` in a stored text value, keeping serialized
/// containers well-formed. JSON-escaped (`\/`) occurrences are replaced too.
pub fn rewrite_value(text: &str, from: &str, to: &str) -> Rewritten {
    let escaped_from = from.replace('/', "\\/");
    if from.is_empty() || (!text.contains(from) && !text.contains(&escaped_from)) {
        return Rewritten::Unchanged;
    }
    let mut pairs = vec![(from.as_bytes(), to.as_bytes().to_vec())];
    if escaped_from != from {
        pairs.push((escaped_from.as_bytes(), to.replace('/', "\\/").into_bytes()));
    }
    let substitution = Substitution { pairs };

    match substitution.bytes(text.as_bytes(), 0) {
        Ok(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(rewritten) if rewritten != text => Rewritten::Changed(rewritten),
            Ok(_) => Rewritten::Unchanged,
            Err(_) => Rewritten::Corrupt,
        },
        Ok(None) => Rewritten::Unchanged,
        Err(()) => Rewritten::Corrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FROM: &str = "https://src.test";
    const TO: &str = "https://dest.example.org";

    fn changed(text: &str) -> String {
        match rewrite_value(text, FROM, TO) {
            Rewritten::Changed(s) => s,
            other => panic!("expected change for {text}, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            changed("see https://src.test/about and https://src.test"),
            "see https://dest.example.org/about and https://dest.example.org"
        );
        assert_eq!(rewrite_value("nothing here", FROM, TO), Rewritten::Unchanged);
    }

    #[test]
    fn test_serialized_string_length_recomputed() {
        let input = r#"s:22:"https://src.test/a.png";"#;
        assert_eq!(changed(input), r#"s:30:"https://dest.example.org/a.png";"#);
    }

    #[test]
    fn test_nested_array_and_object() {
        let input = concat!(
            r#"a:2:{s:4:"home";s:16:"https://src.test";i:0;"#,
            r#"O:8:"stdClass":1:{s:3:"url";s:21:"https://src.test/feed";}}"#
        );
        let output = changed(input);
        assert_eq!(
            output,
            concat!(
                r#"a:2:{s:4:"home";s:24:"https://dest.example.org";i:0;"#,
                r#"O:8:"stdClass":1:{s:3:"url";s:29:"https://dest.example.org/feed";}}"#
            )
        );
        assert!(parse(output.as_bytes(), 0).is_some());
    }

    #[test]
    fn test_serialized_inside_serialized() {
        let inner = r#"s:16:"https://src.test";"#;
        let outer = format!(r#"a:1:{{i:0;s:{}:"{}";}}"#, inner.len(), inner);
        let output = changed(&outer);
        let expected_inner = r#"s:24:"https://dest.example.org";"#;
        assert_eq!(
            output,
            format!(r#"a:1:{{i:0;s:{}:"{}";}}"#, expected_inner.len(), expected_inner)
        );
    }

    #[test]
    fn test_corrupt_container_is_skipped() {
        let broken = r#"a:1:{s:3:"url";s:99:"https://src.test";}"#;
        assert_eq!(rewrite_value(broken, FROM, TO), Rewritten::Corrupt);
    }

    #[test]
    fn test_multibyte_lengths_are_bytes() {
        let input = r#"s:19:"é https://src.test";"#;
        assert_eq!(changed(input), r#"s:27:"é https://dest.example.org";"#);
    }

    #[test]
    fn test_json_escaped_urls() {
        assert_eq!(
            changed(r#"{"url":"https:\/\/src.test\/x"}"#),
            r#"{"url":"https:\/\/dest.example.org\/x"}"#
        );
    }

    #[test]
    fn test_scalars_pass_through() {
        let input = r#"a:4:{i:0;b:1;i:1;d:0.5;i:2;N;i:3;s:16:"https://src.test";}"#;
        assert_eq!(
            changed(input),
            r#"a:4:{i:0;b:1;i:1;d:0.5;i:2;N;i:3;s:24:"https://dest.example.org";}"#
        );
    }

    #[test]
    fn test_prose_resembling_a_tag_is_plain_text() {
        assert_eq!(
            changed("i: moved to https://src.test"),
            "i: moved to https://dest.example.org"
        );
    }

    #[test]
    fn test_prose_with_tag_prefix_is_plain_text() {
        assert_eq!(
            changed("s:1 moved to https://src.test;"),
            "s:1 moved to https://dest.example.org;"
        );
        assert_eq!(
            changed("a:3 items, see https://src.test}"),
            "a:3 items, see https://dest.example.org}"
        );
    }

    #[test]
    fn test_deeply_nested_value_is_corrupt() {
        let depth = 20_000;
        let input = format!(
            r#"{}s:16:"https://src.test";{}"#,
            "a:1:{i:0;".repeat(depth),
            "}".repeat(depth)
        );
        assert_eq!(rewrite_value(&input, FROM, TO), Rewritten::Corrupt);
    }

    #[test]
    fn test_nesting_below_limit_is_rewritten() {
        let depth = 64;
        let input = format!(
            r#"{}s:16:"https://src.test";{}"#,
            "a:1:{i:0;".repeat(depth),
            "}".repeat(depth)
        );
        let expected = format!(
            r#"{}s:24:"https://dest.example.org";{}"#,
            "a:1:{i:0;".repeat(depth),
            "}".repeat(depth)
        );
        assert_eq!(changed(&input), expected);
    }

    #[test]
    fn test_rerun_is_noop() {
        let once = changed(r#"s:16:"https://src.test";"#);
        assert_eq!(rewrite_value(&once, FROM, TO), Rewritten::Unchanged);
    }
}
