//! Generic nested key/value configuration tree.
//!
//! Control files are read into a [`ConfigNode`] by one of two readers:
//! a small recursive-descent reader for the YAML subset used by policy files,
//! or the `toml` crate for `.toml` files. The policy core only ever sees the
//! tree, never the text.
//!
//! YAML subset: indentation-nested mappings, `- ` sequences (including
//! `- key: value` mappings inside sequences), `#` comments outside quotes,
//! quoted and plain scalars, and inline `[a, b]` lists. No anchors, no flow
//! mappings, no multi-line strings. Tabs in indentation are rejected.

use std::collections::BTreeMap;

use crate::core::error::GuardError;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigNode>),
    Map(BTreeMap<String, ConfigNode>),
}

impl ConfigNode {
    pub fn empty_map() -> Self {
        ConfigNode::Map(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Walks nested mappings; `None` as soon as a key is missing.
    pub fn lookup(&self, keys: &[&str]) -> Option<&ConfigNode> {
        keys.iter().try_fold(self, |node, key| node.get(key))
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigNode>> {
        match self {
            ConfigNode::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigNode]> {
        match self {
            ConfigNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConfigNode::Null)
    }

    /// Scalar rendered as a string (numbers and booleans included).
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            ConfigNode::Str(s) => Some(s.clone()),
            ConfigNode::Int(i) => Some(i.to_string()),
            ConfigNode::Float(f) => Some(f.to_string()),
            ConfigNode::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// A list of scalars. `Null` reads as an empty list; anything else is a
    /// shape error naming `what`.
    pub fn string_list(&self, what: &str) -> Result<Vec<String>, GuardError> {
        match self {
            ConfigNode::Null => Ok(Vec::new()),
            ConfigNode::List(items) => items
                .iter()
                .map(|item| {
                    item.scalar_string().ok_or_else(|| {
                        GuardError::ConfigError(format!("{what}: list items must be scalars"))
                    })
                })
                .collect(),
            _ => Err(GuardError::ConfigError(format!("{what}: expected a list"))),
        }
    }

    /// A mapping of scalar values. `Null` reads as empty.
    pub fn string_map(&self, what: &str) -> Result<BTreeMap<String, String>, GuardError> {
        match self {
            ConfigNode::Null => Ok(BTreeMap::new()),
            ConfigNode::Map(m) => m
                .iter()
                .map(|(k, v)| {
                    v.scalar_string()
                        .map(|s| (k.clone(), s))
                        .ok_or_else(|| {
                            GuardError::ConfigError(format!("{what}.{k}: expected a scalar value"))
                        })
                })
                .collect(),
            _ => Err(GuardError::ConfigError(format!("{what}: expected a mapping"))),
        }
    }
}

/// Extensions tried, in order, when looking up a control file by stem.
pub const CONFIG_EXTENSIONS: [&str; 3] = ["yml", "yaml", "toml"];

/// Parse control-file text, choosing the reader by the file name's extension.
/// Errors are prefixed with `name`.
pub fn parse_config_text(name: &str, text: &str) -> Result<ConfigNode, GuardError> {
    let parsed = if name.ends_with(".toml") {
        parse_toml(text)
    } else {
        parse_yaml_subset(text)
    };
    parsed.map_err(|e| match e {
        GuardError::ConfigError(msg) => GuardError::ConfigError(format!("{name}: {msg}")),
        other => other,
    })
}

pub fn parse_toml(text: &str) -> Result<ConfigNode, GuardError> {
    let table: toml::Table =
        toml::from_str(text).map_err(|e| GuardError::ConfigError(e.to_string()))?;
    Ok(from_toml(toml::Value::Table(table)))
}

fn from_toml(value: toml::Value) -> ConfigNode {
    match value {
        toml::Value::String(s) => ConfigNode::Str(s),
        toml::Value::Integer(i) => ConfigNode::Int(i),
        toml::Value::Float(f) => ConfigNode::Float(f),
        toml::Value::Boolean(b) => ConfigNode::Bool(b),
        toml::Value::Datetime(d) => ConfigNode::Str(d.to_string()),
        toml::Value::Array(items) => ConfigNode::List(items.into_iter().map(from_toml).collect()),
        toml::Value::Table(table) => ConfigNode::Map(
            table
                .into_iter()
                .map(|(k, v)| (k, from_toml(v)))
                .collect(),
        ),
    }
}

struct Line {
    number: usize,
    indent: usize,
    content: String,
}

pub fn parse_yaml_subset(text: &str) -> Result<ConfigNode, GuardError> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let stripped = strip_comment(raw);
        if stripped.trim().is_empty() {
            continue;
        }
        let indent_chars: String = stripped.chars().take_while(|c| c.is_whitespace()).collect();
        if indent_chars.contains('\t') {
            return Err(GuardError::ConfigError(format!(
                "line {}: tabs are not allowed in indentation",
                idx + 1
            )));
        }
        lines.push(Line {
            number: idx + 1,
            indent: indent_chars.len(),
            content: stripped.trim().to_string(),
        });
    }

    let mut reader = YamlReader { lines, idx: 0 };
    if reader.lines.is_empty() {
        return Ok(ConfigNode::empty_map());
    }
    let first_indent = reader.lines[0].indent;
    let root = reader.block(first_indent)?;
    if let Some(line) = reader.lines.get(reader.idx) {
        return Err(GuardError::ConfigError(format!(
            "line {}: unexpected indentation",
            line.number
        )));
    }
    Ok(root)
}

struct YamlReader {
    lines: Vec<Line>,
    idx: usize,
}

impl YamlReader {
    fn peek(&self) -> Option<&Line> {
        self.lines.get(self.idx)
    }

    fn block(&mut self, indent: usize) -> Result<ConfigNode, GuardError> {
        let Some(line) = self.peek() else {
            return Ok(ConfigNode::empty_map());
        };
        if line.indent != indent {
            return Err(GuardError::ConfigError(format!(
                "line {}: invalid indentation",
                line.number
            )));
        }
        if is_list_item(&line.content) {
            self.list(indent)
        } else {
            self.mapping(indent)
        }
    }

    /// Value of a `key:` whose scalar part was empty.
    fn nested_value(&mut self, key_indent: usize, allow_same_indent_list: bool) -> Result<ConfigNode, GuardError> {
        match self.peek() {
            Some(next) if next.indent > key_indent => {
                let indent = next.indent;
                self.block(indent)
            }
            Some(next)
                if allow_same_indent_list
                    && next.indent == key_indent
                    && is_list_item(&next.content) =>
            {
                self.list(key_indent)
            }
            _ => Ok(ConfigNode::Null),
        }
    }

    fn list(&mut self, indent: usize) -> Result<ConfigNode, GuardError> {
        let mut items = Vec::new();
        while let Some(line) = self.peek() {
            if line.indent != indent || !is_list_item(&line.content) {
                if line.indent > indent {
                    return Err(GuardError::ConfigError(format!(
                        "line {}: invalid indentation",
                        line.number
                    )));
                }
                break;
            }
            let number = line.number;
            let item = line.content[1..].trim_start().to_string();
            let item_indent = indent + (line.content.len() - item.len());
            self.idx += 1;

            if item.is_empty() {
                items.push(self.nested_value(indent, false)?);
                continue;
            }

            if let Some((key, rest)) = split_key(&item) {
                let mut map = BTreeMap::new();
                let first = if rest.is_empty() {
                    self.nested_value(item_indent, true)?
                } else {
                    parse_scalar(&rest)
                };
                map.insert(key, first);
                while let Some(next) = self.peek() {
                    if next.indent < item_indent || (next.indent == item_indent && is_list_item(&next.content)) {
                        break;
                    }
                    if next.indent > item_indent {
                        return Err(GuardError::ConfigError(format!(
                            "line {}: invalid indentation",
                            next.number
                        )));
                    }
                    let (k, v) = self.key_value(item_indent)?;
                    if map.insert(k.clone(), v).is_some() {
                        return Err(GuardError::ConfigError(format!(
                            "line {number}: duplicate key '{k}'"
                        )));
                    }
                }
                items.push(ConfigNode::Map(map));
            } else {
                items.push(parse_scalar(&item));
            }
        }
        Ok(ConfigNode::List(items))
    }

    fn mapping(&mut self, indent: usize) -> Result<ConfigNode, GuardError> {
        let mut map = BTreeMap::new();
        while let Some(line) = self.peek() {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(GuardError::ConfigError(format!(
                    "line {}: invalid indentation",
                    line.number
                )));
            }
            if is_list_item(&line.content) {
                return Err(GuardError::ConfigError(format!(
                    "line {}: list item found where a mapping entry was expected",
                    line.number
                )));
            }
            let number = line.number;
            let (k, v) = self.key_value(indent)?;
            if map.insert(k.clone(), v).is_some() {
                return Err(GuardError::ConfigError(format!(
                    "line {number}: duplicate key '{k}'"
                )));
            }
        }
        Ok(ConfigNode::Map(map))
    }

    fn key_value(&mut self, indent: usize) -> Result<(String, ConfigNode), GuardError> {
        let line = &self.lines[self.idx];
        let number = line.number;
        let Some((key, rest)) = split_key(&line.content) else {
            return Err(GuardError::ConfigError(format!(
                "line {number}: expected 'key: value', got '{}'",
                line.content
            )));
        };
        self.idx += 1;
        let value = if rest.is_empty() {
            self.nested_value(indent, true)?
        } else {
            parse_scalar(&rest)
        };
        Ok((key, value))
    }
}

fn is_list_item(content: &str) -> bool {
    content == "-" || content.starts_with("- ")
}

/// Split `key: rest` at the first colon (outside quotes) that ends the
/// content or is followed by whitespace.
fn split_key(content: &str) -> Option<(String, String)> {
    let bytes = content.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b':' if !in_single && !in_double => {
                let at_end = i + 1 == bytes.len();
                if at_end || bytes[i + 1] == b' ' {
                    let raw_key = content[..i].trim();
                    let key = match parse_scalar(raw_key) {
                        ConfigNode::Null => raw_key.to_string(),
                        other => other.scalar_string().unwrap_or_default(),
                    };
                    return Some((key, content[i + 1..].trim().to_string()));
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    let mut prev_is_space = true;
    for (i, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double && prev_is_space => return &line[..i],
            _ => {}
        }
        prev_is_space = ch.is_whitespace();
    }
    line
}

fn parse_scalar(raw: &str) -> ConfigNode {
    let v = raw.trim();
    match v {
        "" => return ConfigNode::Str(String::new()),
        "null" | "Null" | "NULL" | "~" => return ConfigNode::Null,
        "true" | "True" | "TRUE" => return ConfigNode::Bool(true),
        "false" | "False" | "FALSE" => return ConfigNode::Bool(false),
        "{}" => return ConfigNode::empty_map(),
        _ => {}
    }
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')))
    {
        return ConfigNode::Str(v[1..v.len() - 1].to_string());
    }
    if v.starts_with('[') && v.ends_with(']') {
        let inner = v[1..v.len() - 1].trim();
        if inner.is_empty() {
            return ConfigNode::List(Vec::new());
        }
        return ConfigNode::List(inner.split(',').map(parse_scalar).collect());
    }
    if looks_like_int(v) {
        if let Ok(i) = v.parse::<i64>() {
            return ConfigNode::Int(i);
        }
    }
    if let Some((whole, frac)) = v.split_once('.') {
        if looks_like_int(whole) && !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(f) = v.parse::<f64>() {
                return ConfigNode::Float(f);
            }
        }
    }
    ConfigNode::Str(v.to_string())
}

fn looks_like_int(v: &str) -> bool {
    let digits = v.strip_prefix('-').unwrap_or(v);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
