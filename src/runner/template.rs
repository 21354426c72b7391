//! Parameter expansion for task templates
//!
//! Supports a small shell-like grammar:
//! - `$NAME` and `${NAME}`: value of NAME, empty if unset
//! - `${NAME:-default}`: value of NAME if set and non-empty, else `default`
//! - `${NAME:+alt}`: `alt` if NAME is set and non-empty, else empty
//!
//! Default and alternate bodies may themselves contain expansions and are only
//! evaluated when selected. A `$` preceded by an odd number of backslashes is
//! literal and loses the one backslash that escaped it.

use std::collections::{BTreeMap, HashMap};

/// Anything variables can be looked up in
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&str>;
}

impl Lookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Lookup for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl<L: Lookup + ?Sized> Lookup for &L {
    fn lookup(&self, name: &str) -> Option<&str> {
        (**self).lookup(name)
    }
}

/// Parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Literal(String),
    Var(String),
    Default(String, Vec<Node>),
    Alternate(String, Vec<Node>),
}

/// Expand `$NAME` and `${...}` forms in `template`
pub fn expand(template: &str, env: &impl Lookup) -> String {
    render(&Parser::new(template, false).parse_all(), env)
}

/// Expand only braced `${...}` forms, leaving bare `$NAME` untouched
pub fn expand_braced(template: &str, env: &impl Lookup) -> String {
    render(&Parser::new(template, true).parse_all(), env)
}

/// Whether the template references any variable at all
pub fn has_expansions(template: &str) -> bool {
    Parser::new(template, false)
        .parse_all()
        .iter()
        .any(|node| !matches!(node, Node::Literal(_)))
}

fn render(nodes: &[Node], env: &impl Lookup) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Var(name) => {
                if let Some(value) = env.lookup(name) {
                    out.push_str(value);
                }
            }
            Node::Default(name, body) => match env.lookup(name) {
                Some(value) if !value.is_empty() => out.push_str(value),
                _ => out.push_str(&render(body, env)),
            },
            Node::Alternate(name, body) => {
                if env.lookup(name).is_some_and(|v| !v.is_empty()) {
                    out.push_str(&render(body, env));
                }
            }
        }
    }
    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    require_braces: bool,
}

impl Parser {
    fn new(template: &str, require_braces: bool) -> Self {
        Parser {
            chars: template.chars().collect(),
            pos: 0,
            require_braces,
        }
    }

    fn parse_all(&mut self) -> Vec<Node> {
        // top level never fails: an unmatched `}` is plain text there
        self.parse_nodes(false).unwrap_or_default()
    }

    /// Parse until end of input, or until the closing `}` when `nested`.
    /// Returns None when a nested body is never closed.
    fn parse_nodes(&mut self, nested: bool) -> Option<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        while let Some(&c) = self.chars.get(self.pos) {
            match c {
                '}' if nested => {
                    self.pos += 1;
                    flush(&mut text, &mut nodes);
                    return Some(nodes);
                }
                '\\' => {
                    let start = self.pos;
                    while self.chars.get(self.pos) == Some(&'\\') {
                        self.pos += 1;
                    }
                    let count = self.pos - start;
                    if self.chars.get(self.pos) == Some(&'$') && count % 2 == 1 {
                        text.extend(std::iter::repeat('\\').take(count - 1));
                        text.push('$');
                        self.pos += 1;
                    } else {
                        text.extend(std::iter::repeat('\\').take(count));
                    }
                }
                '$' => {
                    let start = self.pos;
                    self.pos += 1;
                    match self.parse_dollar() {
                        Some(node) => {
                            flush(&mut text, &mut nodes);
                            nodes.push(node);
                        }
                        None => {
                            self.pos = start + 1;
                            text.push('$');
                        }
                    }
                }
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        if nested {
            return None;
        }
        flush(&mut text, &mut nodes);
        Some(nodes)
    }

    /// Parse what follows a `$`; None means the `$` is literal
    fn parse_dollar(&mut self) -> Option<Node> {
        if self.chars.get(self.pos) == Some(&'{') {
            self.pos += 1;
            let name = self.parse_name()?;
            match self.chars.get(self.pos) {
                Some('}') => {
                    self.pos += 1;
                    Some(Node::Var(name))
                }
                Some(':') => {
                    let op = *self.chars.get(self.pos + 1)?;
                    if op != '-' && op != '+' {
                        return None;
                    }
                    self.pos += 2;
                    let body = self.parse_nodes(true)?;
                    Some(if op == '-' {
                        Node::Default(name, body)
                    } else {
                        Node::Alternate(name, body)
                    })
                }
                _ => None,
            }
        } else if self.require_braces {
            None
        } else {
            self.parse_name().map(Node::Var)
        }
    }

    fn parse_name(&mut self) -> Option<String> {
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|c| is_name_char(*c)) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Literal(std::mem::take(text)));
    }
}
