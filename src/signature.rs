//! Derive a flow's parameter schema from the Python source that defines it.
//!
//! Only the signature is inspected: the function is located by name at the top
//! level of the module and its parameter list is split into names, annotations
//! and defaults without evaluating anything.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};

#[derive(Debug, PartialEq)]
struct Parameter {
    name: String,
    annotation: Option<String>,
    default: Option<String>,
}

pub fn parameter_schema(source: &str, function: &str) -> Result<Value> {
    let params = function_parameters(source, function)
        .ok_or_else(|| anyhow!("Could not find function '{}'", function))?;

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (position, param) in params.iter().enumerate() {
        let mut property = Map::new();
        property.insert("title".into(), json!(param.name));
        property.insert("position".into(), json!(position));

        let (json_type, nullable) = param
            .annotation
            .as_deref()
            .map(json_type_for)
            .unwrap_or((None, false));
        if let Some(json_type) = json_type {
            property.insert("type".into(), json!(json_type));
        }
        if let Some(default) = param.default.as_deref().and_then(python_literal) {
            property.insert("default".into(), default);
        }

        if param.default.is_none() && !nullable {
            required.push(json!(param.name));
        }
        properties.insert(param.name.clone(), Value::Object(property));
    }

    Ok(json!({
        "title": "Parameters",
        "type": "object",
        "properties": properties,
        "required": required,
        "definitions": {},
    }))
}

fn function_parameters(source: &str, function: &str) -> Option<Vec<Parameter>> {
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        let rest = line
            .strip_prefix("async def ")
            .or_else(|| line.strip_prefix("def "))
            .map(str::trim_start);
        let Some(rest) = rest.and_then(|r| r.strip_prefix(function)) else {
            continue;
        };
        let rest_trimmed = rest.trim_start();
        if !rest_trimmed.starts_with('(') {
            continue;
        }
        let open = start + (line.len() - rest_trimmed.len());
        let body = balanced_parens(&source[open..])?;
        return Some(
            split_top_level(body, ',')
                .into_iter()
                .filter_map(parse_parameter)
                .collect(),
        );
    }
    None
}

/// Given text starting at `(`, return what lies between it and its matching `)`.
fn balanced_parens(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut scanner = Scanner::default();
    for (idx, c) in text.char_indices() {
        if !scanner.step(c) {
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[1..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut scanner = Scanner::default();
    let mut last = 0;
    for (idx, c) in text.char_indices() {
        if !scanner.step(c) {
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&text[last..idx]);
                last = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[last..]);
    parts
}

fn find_top_level(text: &str, needle: char) -> Option<usize> {
    let parts = split_top_level(text, needle);
    (parts.len() > 1).then(|| parts[0].len())
}

/// Tracks string literals and comments; `step` is true for structural characters.
#[derive(Default)]
struct Scanner {
    quote: Option<char>,
    escaped: bool,
    comment: bool,
}

impl Scanner {
    fn step(&mut self, c: char) -> bool {
        if self.comment {
            if c == '\n' {
                self.comment = false;
            }
            return false;
        }
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == q {
                self.quote = None;
            }
            return false;
        }
        match c {
            '\'' | '"' => {
                self.quote = Some(c);
                false
            }
            '#' => {
                self.comment = true;
                false
            }
            _ => true,
        }
    }
}

fn strip_comments(text: &str) -> String {
    let mut scanner = Scanner::default();
    text.chars()
        .filter(|c| {
            scanner.step(*c);
            !scanner.comment
        })
        .collect()
}

fn parse_parameter(raw: &str) -> Option<Parameter> {
    let cleaned = strip_comments(raw);
    let raw = cleaned.trim();
    if raw.is_empty() || raw == "/" || raw.starts_with('*') {
        return None;
    }

    let (head, default) = match find_top_level(raw, '=') {
        Some(idx) => (&raw[..idx], Some(raw[idx + 1..].trim().to_string())),
        None => (raw, None),
    };
    let (name, annotation) = match find_top_level(head, ':') {
        Some(idx) => (head[..idx].trim(), Some(head[idx + 1..].trim().to_string())),
        None => (head.trim(), None),
    };
    if name == "self" || name == "cls" {
        return None;
    }

    Some(Parameter {
        name: name.to_string(),
        annotation,
        default,
    })
}

/// Map a Python annotation to a JSON schema type, and whether it admits `None`.
fn json_type_for(annotation: &str) -> (Option<&'static str>, bool) {
    let annotation = annotation.trim().trim_matches(|c| c == '"' || c == '\'');

    let union: Vec<&str> = split_top_level(annotation, '|')
        .into_iter()
        .map(str::trim)
        .collect();
    if union.len() > 1 {
        return union_type(&union);
    }

    let (base, inner) = match annotation.split_once('[') {
        Some((base, inner)) => (base.trim(), inner.strip_suffix(']').unwrap_or(inner)),
        None => (annotation, ""),
    };
    let base = base.rsplit('.').next().unwrap_or(base);

    match base {
        "Optional" => (json_type_for(inner).0, true),
        "Union" => {
            let members: Vec<&str> = split_top_level(inner, ',').into_iter().map(str::trim).collect();
            union_type(&members)
        }
        "None" => (None, true),
        "int" => (Some("integer"), false),
        "float" => (Some("number"), false),
        "str" => (Some("string"), false),
        "bool" => (Some("boolean"), false),
        "list" | "List" | "tuple" | "Tuple" | "set" | "Set" => (Some("array"), false),
        "dict" | "Dict" => (Some("object"), false),
        _ => (None, false),
    }
}

fn union_type(members: &[&str]) -> (Option<&'static str>, bool) {
    let nullable = members.contains(&"None");
    let rest: Vec<&str> = members.iter().copied().filter(|t| *t != "None").collect();
    match rest.as_slice() {
        [single] => (json_type_for(single).0, nullable),
        _ => (None, nullable),
    }
}

/// Convert a Python literal default to JSON; `None` for anything that is not a literal.
fn python_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    match text {
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        "None" => return Some(Value::Null),
        _ => {}
    }

    if let Some(s) = python_string(text) {
        return Some(Value::String(s));
    }

    // Numbers and JSON-compatible containers such as `[]`, `{}` or `[1, 2]`.
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Bool(_) | Value::Null) | Err(_) => None,
        Ok(value) => Some(value),
    }
}

fn python_string(text: &str) -> Option<String> {
    let quote = text.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            c if c == quote => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_function() {
        let source = "from prefect import flow\n\n@flow\ndef hello(name: str, count: int = 3):\n    print(name)\n";
        let schema = parameter_schema(source, "hello").unwrap();
        assert_eq!(
            schema,
            json!({
                "title": "Parameters",
                "type": "object",
                "properties": {
                    "name": {"title": "name", "position": 0, "type": "string"},
                    "count": {"title": "count", "position": 1, "type": "integer", "default": 3},
                },
                "required": ["name"],
                "definitions": {},
            })
        );
    }

    #[test]
    fn multiline_async_signature_with_nested_defaults() {
        let source = r#"
async def process(
    self,
    items: list[str] = [],  # things to process
    options: Dict[str, int] = {},
    label: Optional[str] = None,
    ratio: "float" = 0.5,
    when: datetime = datetime.now(),
    *args,
    verbose: bool = False,
    note: str = "a, b (c)",
    **kwargs,
) -> None:
    pass
"#;
        let schema = parameter_schema(source, "process").unwrap();
        let props = schema["properties"].as_object().unwrap();
        let mut names: Vec<_> = props.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["items", "label", "note", "options", "ratio", "verbose", "when"]
        );
        assert_eq!(props["items"]["type"], "array");
        assert_eq!(props["items"]["default"], json!([]));
        assert_eq!(props["options"]["type"], "object");
        assert_eq!(props["label"]["type"], "string");
        assert_eq!(props["label"]["default"], Value::Null);
        assert_eq!(props["ratio"]["type"], "number");
        assert!(props["when"].get("default").is_none());
        assert!(props["when"].get("type").is_none());
        assert_eq!(props["verbose"]["position"], 5);
        assert_eq!(props["note"]["default"], "a, b (c)");
        assert_eq!(schema["required"], json!([]));
    }

    #[test]
    fn optional_annotations_are_not_required() {
        let source = "def f(a: int | None, b: Union[str, None], c: float):\n    pass\n";
        let schema = parameter_schema(source, "f").unwrap();
        assert_eq!(schema["properties"]["a"]["type"], "integer");
        assert_eq!(schema["properties"]["b"]["type"], "string");
        assert_eq!(schema["required"], json!(["c"]));
    }

    #[test]
    fn only_exact_top_level_names_match() {
        let source = "def hello_world():\n    pass\n\nclass A:\n    def hello(self):\n        pass\n";
        let err = parameter_schema(source, "hello").unwrap_err();
        assert_eq!(err.to_string(), "Could not find function 'hello'");

        let schema = parameter_schema(source, "hello_world").unwrap();
        assert_eq!(schema["properties"], json!({}));
    }

    #[test]
    fn literals() {
        assert_eq!(python_literal("'it\\'s'"), Some(json!("it's")));
        assert_eq!(python_literal("-1.5"), Some(json!(-1.5)));
        assert_eq!(python_literal("True"), Some(json!(true)));
        assert_eq!(python_literal("os.environ"), None);
        assert_eq!(python_literal("'a' + 'b'"), None);
    }
}
