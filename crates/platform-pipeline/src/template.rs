//! Pipeline script templates.
//!
//! A deliberately small language:
//!
//! - `{{ path }}` substitutes a variable; paths are dot separated
//!   (`repositories.svc-a.hash`). Lists render space separated.
//! - `{{#each path}} ... {{/each}}` iterates an object in insertion order or
//!   a list. Inside the block `{{@key}}` is the entry key (or index),
//!   `{{this}}` the current value, and bare paths are looked up in the
//!   current value before the enclosing scopes.
//!
//! Undefined variables and malformed tags are errors.

use platform_core::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Template input data. Objects keep insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    List(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn object() -> Self {
        Value::Object(Vec::new())
    }

    /// Builder-style insert for objects; a no-op on other values.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Value::Object(entries) = &mut self {
            entries.push((key.into(), value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn render_into(&self, out: &mut String, name: &str, line: usize) -> Result<(), TemplateError> {
        match self {
            Value::Text(text) => out.push_str(text),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    item.render_into(out, name, line)?;
                }
            }
            Value::Object(_) => {
                return Err(TemplateError::NotRenderable {
                    name: name.to_string(),
                    line,
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Variable {
        path: String,
        line: usize,
    },
    Each {
        path: String,
        line: usize,
        body: Vec<Node>,
    },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

struct OpenBlock {
    path: String,
    line: usize,
    outer: Vec<Node>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut nodes = Vec::new();
        let mut blocks: Vec<OpenBlock> = Vec::new();
        let mut rest = source;
        let mut line = 1;

        while let Some(start) = rest.find(OPEN) {
            let (text, after_text) = rest.split_at(start);
            if !text.is_empty() {
                nodes.push(Node::Text(text.to_string()));
            }
            line += text.matches('\n').count();

            let inner = &after_text[OPEN.len()..];
            let end = inner.find(CLOSE).ok_or_else(|| syntax(line, "unterminated tag"))?;
            let tag = inner[..end].trim();
            let tag_line = line;
            line += inner[..end].matches('\n').count();
            rest = &inner[end + CLOSE.len()..];

            if let Some(path) = tag
                .strip_prefix("#each")
                .filter(|path| path.is_empty() || path.starts_with(char::is_whitespace))
            {
                let path = path.trim();
                if path.is_empty() {
                    return Err(syntax(tag_line, "{{#each}} needs a path"));
                }
                blocks.push(OpenBlock {
                    path: path.to_string(),
                    line: tag_line,
                    outer: std::mem::take(&mut nodes),
                });
            } else if tag == "/each" {
                let block = blocks
                    .pop()
                    .ok_or_else(|| syntax(tag_line, "{{/each}} without matching {{#each}}"))?;
                let body = std::mem::replace(&mut nodes, block.outer);
                nodes.push(Node::Each {
                    path: block.path,
                    line: block.line,
                    body,
                });
            } else if tag.starts_with('#') || tag.starts_with('/') {
                return Err(syntax(tag_line, &format!("unknown block `{tag}`")));
            } else if tag.is_empty() {
                return Err(syntax(tag_line, "empty tag"));
            } else {
                nodes.push(Node::Variable {
                    path: tag.to_string(),
                    line: tag_line,
                });
            }
        }

        if let Some(block) = blocks.last() {
            return Err(syntax(
                block.line,
                &format!("{{{{#each {}}}}} is never closed", block.path),
            ));
        }
        if !rest.is_empty() {
            nodes.push(Node::Text(rest.to_string()));
        }
        Ok(Self { nodes })
    }

    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        let mut scopes = vec![Scope {
            value: data,
            key: None,
        }];
        render_nodes(&self.nodes, &mut scopes, &mut out)?;
        Ok(out)
    }
}

/// Parse and render in one step.
pub fn render(source: &str, data: &Value) -> Result<String, TemplateError> {
    Template::parse(source)?.render(data)
}

fn syntax(line: usize, message: &str) -> TemplateError {
    TemplateError::Syntax {
        line,
        message: message.to_string(),
    }
}

struct Scope<'a> {
    value: &'a Value,
    key: Option<String>,
}

fn render_nodes<'a>(
    nodes: &'a [Node],
    scopes: &mut Vec<Scope<'a>>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Variable { path, line } => {
                if path == "@key" {
                    let key = scopes
                        .last()
                        .and_then(|scope| scope.key.as_deref())
                        .ok_or_else(|| undefined(path, *line))?;
                    out.push_str(key);
                } else {
                    lookup(scopes, path, *line)?.render_into(out, path, *line)?;
                }
            }
            Node::Each { path, line, body } => {
                let value = lookup(scopes, path, *line)?;
                match value {
                    Value::Object(entries) => {
                        for (key, item) in entries {
                            scopes.push(Scope {
                                value: item,
                                key: Some(key.clone()),
                            });
                            let result = render_nodes(body, scopes, out);
                            scopes.pop();
                            result?;
                        }
                    }
                    Value::List(items) => {
                        for (index, item) in items.iter().enumerate() {
                            scopes.push(Scope {
                                value: item,
                                key: Some(index.to_string()),
                            });
                            let result = render_nodes(body, scopes, out);
                            scopes.pop();
                            result?;
                        }
                    }
                    Value::Text(_) => {
                        return Err(TemplateError::NotIterable {
                            name: path.clone(),
                            line: *line,
                        })
                    }
                }
            }
        }
    }
    Ok(())
}

/// Resolve `path` against the innermost scope that defines its first
/// segment. `this` always means the innermost scope.
fn lookup<'a>(scopes: &[Scope<'a>], path: &str, line: usize) -> Result<&'a Value, TemplateError> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();

    let mut value = if first == "this" {
        scopes.last().map(|scope| scope.value)
    } else {
        scopes
            .iter()
            .rev()
            .find_map(|scope| scope.value.get(first))
    }
    .ok_or_else(|| undefined(path, line))?;

    for segment in segments {
        value = value.get(segment).ok_or_else(|| undefined(path, line))?;
    }
    Ok(value)
}

fn undefined(path: &str, line: usize) -> TemplateError {
    TemplateError::UndefinedVariable {
        name: path.to_string(),
        line,
    }
}
