//! Extracts at most one tool invocation from freeform model text.
//!
//! Models wrap their calls in prose, fences, single quotes and Python-style
//! triple-quoted strings. Extraction tries, in order:
//!
//! 1. normalizing `: """..."""` values into escaped JSON strings,
//! 2. a fenced block holding an object with both `tool` and `args`,
//! 3. a string-aware brace scan from each `{"tool":` opening, parsed strictly and
//!    then with a permissive literal parser,
//! 4. the `tool_name: {...}` shorthand for known tool names.

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::ActionKind;

/// A parsed request to run one named action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Map::new())
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    /// Build from a parsed object. `tool` must be a string; `args` defaults to `{}` and
    /// must be an object when present.
    fn from_value(value: Value) -> Option<Self> {
        let obj = value.as_object()?;
        let tool = obj.get("tool")?.as_str()?.trim().to_string();
        if tool.is_empty() {
            return None;
        }
        let args = match obj.get("args") {
            None | Some(Value::Null) => empty_args(),
            Some(args @ Value::Object(_)) => args.clone(),
            Some(_) => return None,
        };
        Some(Self { tool, args })
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid interpreter pattern {}: {}", pattern, e);
            None
        }
    })
    .as_ref()
}

fn triple_quote_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?s):\s*"""(.*?)""""#)
}

fn fenced_json_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)```(?:json)?\s*(\{.*?\})\s*```")
}

fn tool_opening_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"\{\s*["']tool["']\s*:"#)
}

fn shorthand_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    if let Some(re) = RE.get() {
        return re.as_ref();
    }
    let names: Vec<&str> = ActionKind::ALL.iter().map(|k| k.name()).collect();
    let pattern = format!(r"({}):\s*(\{{[^}}]+\}})", names.join("|"));
    cached(&RE, &pattern)
}

/// Returns the first well-formed invocation in `text`, or `None` when the model
/// answered without calling a tool.
pub fn interpret(text: &str) -> Option<ToolInvocation> {
    let text = normalize_triple_quotes(text);

    if let Some(found) = from_fenced_block(&text) {
        return Some(found);
    }
    if let Some(found) = from_brace_scan(&text) {
        return Some(found);
    }
    from_shorthand(&text)
}

/// Re-escape `: """..."""` values into ordinary JSON strings.
pub fn normalize_triple_quotes(text: &str) -> String {
    let Some(re) = triple_quote_re() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures<'_>| {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        format!(": \"{}\"", escape_json_string(inner))
    })
    .into_owned()
}

fn escape_json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn from_fenced_block(text: &str) -> Option<ToolInvocation> {
    let body = fenced_json_re()?.captures(text)?.get(1)?.as_str();
    let value: Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("tool") || !obj.contains_key("args") {
        return None;
    }
    ToolInvocation::from_value(value)
}

fn from_brace_scan(text: &str) -> Option<ToolInvocation> {
    for opening in tool_opening_re()?.find_iter(text) {
        let Some(span) = balanced_span(&text[opening.start()..]) else {
            continue;
        };
        let parsed = serde_json::from_str::<Value>(span)
            .ok()
            .or_else(|| literal::parse(span));
        if let Some(found) = parsed.and_then(ToolInvocation::from_value) {
            return Some(found);
        }
    }
    None
}

/// First balanced `{...}` prefix of `text`. Quotes toggle string state and a
/// backslash escapes the next character, so braces inside values do not count.
fn balanced_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn from_shorthand(text: &str) -> Option<ToolInvocation> {
    for caps in shorthand_re()?.captures_iter(text) {
        let (Some(name), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let args = serde_json::from_str::<Value>(body.as_str())
            .ok()
            .or_else(|| literal::parse(body.as_str()));
        if let Some(args @ Value::Object(_)) = args {
            return Some(ToolInvocation::new(name.as_str(), args));
        }
    }
    None
}

/// Permissive parser for Python-literal-shaped objects: single or double quoted
/// strings, `True`/`False`/`None`, and trailing commas.
mod literal {
    use serde_json::{Map, Number, Value};

    pub fn parse(input: &str) -> Option<Value> {
        let mut parser = Parser {
            chars: input.chars().collect(),
            pos: 0,
        };
        let value = parser.value()?;
        parser.skip_ws();
        (parser.pos == parser.chars.len()).then_some(value)
    }

    struct Parser {
        chars: Vec<char>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<char> {
            self.chars.get(self.pos).copied()
        }

        fn bump(&mut self) -> Option<char> {
            let ch = self.peek()?;
            self.pos += 1;
            Some(ch)
        }

        fn skip_ws(&mut self) {
            while matches!(self.peek(), Some(c) if c.is_whitespace()) {
                self.pos += 1;
            }
        }

        fn consume(&mut self, want: char) -> Option<()> {
            self.skip_ws();
            (self.bump()? == want).then_some(())
        }

        fn value(&mut self) -> Option<Value> {
            self.skip_ws();
            match self.peek()? {
                '{' => self.object(),
                '[' => self.array(),
                '"' | '\'' => self.string().map(Value::String),
                c if c == '-' || c.is_ascii_digit() => self.number(),
                _ => self.word(),
            }
        }

        fn object(&mut self) -> Option<Value> {
            self.consume('{')?;
            let mut map = Map::new();
            loop {
                self.skip_ws();
                if self.peek()? == '}' {
                    self.pos += 1;
                    return Some(Value::Object(map));
                }
                let key = self.string()?;
                self.consume(':')?;
                let value = self.value()?;
                map.insert(key, value);
                self.skip_ws();
                match self.bump()? {
                    ',' => continue,
                    '}' => return Some(Value::Object(map)),
                    _ => return None,
                }
            }
        }

        fn array(&mut self) -> Option<Value> {
            self.consume('[')?;
            let mut items = Vec::new();
            loop {
                self.skip_ws();
                if self.peek()? == ']' {
                    self.pos += 1;
                    return Some(Value::Array(items));
                }
                items.push(self.value()?);
                self.skip_ws();
                match self.bump()? {
                    ',' => continue,
                    ']' => return Some(Value::Array(items)),
                    _ => return None,
                }
            }
        }

        fn string(&mut self) -> Option<String> {
            self.skip_ws();
            let quote = self.bump()?;
            if quote != '"' && quote != '\'' {
                return None;
            }
            let mut out = String::new();
            loop {
                match self.bump()? {
                    '\\' => match self.bump()? {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        other => out.push(other),
                    },
                    c if c == quote => return Some(out),
                    c => out.push(c),
                }
            }
        }

        fn number(&mut self) -> Option<Value> {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c == '-' || c == '+' || c == '.' || c == 'e' || c == 'E' || c.is_ascii_digit())
            {
                self.pos += 1;
            }
            let raw: String = self.chars[start..self.pos].iter().collect();
            if let Ok(int) = raw.parse::<i64>() {
                return Some(Value::Number(int.into()));
            }
            raw.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }

        fn word(&mut self) -> Option<Value> {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
                self.pos += 1;
            }
            let raw: String = self.chars[start..self.pos].iter().collect();
            match raw.as_str() {
                "True" | "true" => Some(Value::Bool(true)),
                "False" | "false" => Some(Value::Bool(false)),
                "None" | "null" => Some(Value::Null),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_in_prose() {
        let text = r#"I'll read it now. {"tool": "read_file", "args": {"path": "src/main.rs"}} then continue."#;
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.args, json!({"path": "src/main.rs"}));
    }

    #[test]
    fn fenced_block_wins() {
        let text = "Plan: list files.\n```json\n{\"tool\": \"list_dir\", \"args\": {\"path\": \".\"}}\n```";
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "list_dir");
        assert_eq!(call.args["path"], ".");
    }

    #[test]
    fn triple_quoted_content_is_unescaped_literally() {
        let text = "{\"tool\": \"write_file\", \"args\": {\"path\": \"a.py\", \"content\": \"\"\"def f():\n\treturn \"hi\"\n\"\"\"}}";
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "write_file");
        assert_eq!(call.args["content"], "def f():\n\treturn \"hi\"\n");
    }

    #[test]
    fn braces_inside_strings_do_not_break_the_scan() {
        let text = r#"Doing it: {"tool": "write_file", "args": {"path": "x.rs", "content": "fn main() { println!(\"}\"); }"}}"#;
        let call = interpret(text).unwrap();
        assert_eq!(call.args["content"], "fn main() { println!(\"}\"); }");
    }

    #[test]
    fn single_quoted_literal_falls_back() {
        let text = "{'tool': 'run_command', 'args': {'command': 'ls -la', 'interactive': False,}}";
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "run_command");
        assert_eq!(call.args, json!({"command": "ls -la", "interactive": false}));
    }

    #[test]
    fn shorthand_form() {
        let text = r#"read_file: {"path": "README.md"}"#;
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.args["path"], "README.md");
    }

    #[test]
    fn shorthand_accepts_every_registered_action() {
        for kind in ActionKind::ALL {
            let text = format!(r#"Next step: {}: {{"path": "x"}}"#, kind.name());
            assert_eq!(interpret(&text).unwrap().tool, kind.name());
        }
    }

    #[test]
    fn first_well_formed_candidate_wins() {
        let text = r#"{"tool": broken} and then {"tool": "list_dir", "args": {"path": "src"}} and {"tool": "read_file", "args": {"path": "b"}}"#;
        let call = interpret(text).unwrap();
        assert_eq!(call.tool, "list_dir");
    }

    #[test]
    fn prose_only_yields_none() {
        assert!(interpret("All done. The file now contains the fix.").is_none());
        assert!(interpret("{\"note\": \"no tool here\"}").is_none());
    }

    #[test]
    fn missing_args_default_to_empty_object() {
        let call = interpret(r#"{"tool": "list_dir"}"#).unwrap();
        assert_eq!(call.args, json!({}));
    }
}
