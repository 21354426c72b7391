//! Restricted expression language for expr tasks and switch controls
//!
//! Expressions are parsed once when the task registry is built and evaluated
//! in-process against the task's bound arguments, its environment and the
//! extra command line arguments. Only a fixed set of operators and functions
//! is available; there is no way to reach the host system from an expression.

use crate::runner::template::Lookup;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A typed value, shared by expressions and bound task arguments
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
        }
    }

    /// Source-literal form, used when values are handed to a Python script
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('\'', "\\'")
                    .replace('\n', "\\n")
                    .replace('\r', "\\r")
                    .replace('\t', "\\t");
                format!("'{}'", escaped)
            }
            Value::List(items) => format!(
                "[{}]",
                items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
            ),
            other => other.to_string(),
        }
    }

    /// How the value is exposed as an environment variable; None leaves it unset
    pub fn to_env(&self) -> Option<String> {
        match self {
            Value::None | Value::Bool(false) => None,
            Value::Bool(true) => Some("true".to_string()),
            Value::List(items) => Some(
                items
                    .iter()
                    .filter_map(Value::to_env)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            other => Some(other.to_string()),
        }
    }

    fn number(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::List(_) => write!(f, "{}", self.repr()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// What an expression can see while it is evaluated
pub struct Scope<'a> {
    /// Bound task arguments by name
    pub args: &'a BTreeMap<String, Value>,
    /// Task environment for `${VAR}` references
    pub env: &'a dyn Lookup,
    /// Task name followed by extra command line arguments
    pub argv: &'a [String],
}

const FUNCTIONS: &[&str] = &[
    "int",
    "float",
    "str",
    "bool",
    "len",
    "lower",
    "upper",
    "strip",
    "startswith",
    "endswith",
];
/// Longest string `str * int` may produce
const MAX_STRING_LEN: usize = 1 << 24;
const METHODS: &[&str] = &["lower", "upper", "strip", "startswith", "endswith"];
const KEYWORDS: &[&str] = &["and", "or", "not", "in", "if", "else", "True", "False", "None"];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    EnvVar(String),
    Op(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(Value),
    Name(String),
    Env(String),
    Argv,
    Platform,
    List(Vec<Node>),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(Box<Node>, Vec<(CmpOp, Node)>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Index(Box<Node>, Box<Node>),
    Call(&'static str, Vec<Node>),
}

/// A parsed expression
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    /// Parse an expression, reporting syntax errors
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        let mut parser = ExprParser { tokens, pos: 0 };
        let root = parser.ternary()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(format!("unexpected token {:?}", token));
        }
        Ok(Expr {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Argument names the expression refers to
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_names(&self.root, &mut names);
        names.sort();
        names.dedup();
        names
    }

    /// Whether the expression reads any environment variable
    pub fn reads_env(&self) -> bool {
        reads_env(&self.root)
    }

    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, String> {
        eval(&self.root, scope)
    }
}

fn collect_names(node: &Node, out: &mut Vec<String>) {
    match node {
        Node::Name(name) => out.push(name.clone()),
        Node::List(items) | Node::Call(_, items) => {
            items.iter().for_each(|n| collect_names(n, out));
        }
        Node::Neg(inner) | Node::Not(inner) => collect_names(inner, out),
        Node::Binary(_, a, b) | Node::And(a, b) | Node::Or(a, b) | Node::Index(a, b) => {
            collect_names(a, out);
            collect_names(b, out);
        }
        Node::Compare(first, rest) => {
            collect_names(first, out);
            rest.iter().for_each(|(_, n)| collect_names(n, out));
        }
        Node::Ternary(a, b, c) => {
            collect_names(a, out);
            collect_names(b, out);
            collect_names(c, out);
        }
        Node::Const(_) | Node::Env(_) | Node::Argv | Node::Platform => {}
    }
}

fn reads_env(node: &Node) -> bool {
    match node {
        Node::Env(_) => true,
        Node::List(items) | Node::Call(_, items) => items.iter().any(reads_env),
        Node::Neg(inner) | Node::Not(inner) => reads_env(inner),
        Node::Binary(_, a, b) | Node::And(a, b) | Node::Or(a, b) | Node::Index(a, b) => {
            reads_env(a) || reads_env(b)
        }
        Node::Compare(first, rest) => reads_env(first) || rest.iter().any(|(_, n)| reads_env(n)),
        Node::Ternary(a, b, c) => reads_env(a) || reads_env(b) || reads_env(c),
        Node::Const(_) | Node::Name(_) | Node::Argv | Node::Platform => false,
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    const TWO_CHAR: &[&str] = &["==", "!=", "<=", ">=", "//"];
    const ONE_CHAR: &[&str] = &["<", ">", "+", "-", "*", "/", "%", "(", ")", "[", "]", ",", "."];

    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                tokens.push(Token::Float(text.parse().map_err(|_| format!("bad number {}", text))?));
            } else {
                tokens.push(Token::Int(text.parse().map_err(|_| format!("bad number {}", text))?));
            }
        } else if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".to_string()),
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).ok_or("unterminated string literal")?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '$' {
            if chars.get(i + 1) != Some(&'{') {
                return Err("expected '{' after '$'".to_string());
            }
            let start = i + 2;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if end == start || chars.get(end) != Some(&'}') {
                return Err("malformed ${...} reference".to_string());
            }
            tokens.push(Token::EnvVar(chars[start..end].iter().collect()));
            i = end + 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            if let Some(op) = TWO_CHAR.iter().find(|op| rest.starts_with(**op)) {
                tokens.push(Token::Op(*op));
                i += 2;
            } else if let Some(op) = ONE_CHAR.iter().find(|op| rest.starts_with(**op)) {
                tokens.push(Token::Op(*op));
                i += 1;
            } else {
                return Err(format!("unexpected character '{}'", c));
            }
        }
    }

    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult = Result<Node, String>;

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn is_keyword_at(&self, offset: usize, kw: &str) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some(Token::Ident(i)) if i == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword_at(0, kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), String> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(format!("expected '{}'", op))
        }
    }

    fn ternary(&mut self) -> PResult {
        let value = self.or()?;
        if self.eat_keyword("if") {
            let cond = self.or()?;
            if !self.eat_keyword("else") {
                return Err("expected 'else' in conditional expression".to_string());
            }
            let otherwise = self.ternary()?;
            return Ok(Node::Ternary(
                Box::new(cond),
                Box::new(value),
                Box::new(otherwise),
            ));
        }
        Ok(value)
    }

    fn or(&mut self) -> PResult {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            left = Node::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> PResult {
        let mut left = self.not()?;
        while self.eat_keyword("and") {
            left = Node::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> PResult {
        if self.eat_keyword("not") {
            return Ok(Node::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult {
        let first = self.additive()?;
        let mut rest = Vec::new();
        loop {
            let op = if self.eat_op("==") {
                CmpOp::Eq
            } else if self.eat_op("!=") {
                CmpOp::Ne
            } else if self.eat_op("<=") {
                CmpOp::Le
            } else if self.eat_op(">=") {
                CmpOp::Ge
            } else if self.eat_op("<") {
                CmpOp::Lt
            } else if self.eat_op(">") {
                CmpOp::Gt
            } else if self.eat_keyword("in") {
                CmpOp::In
            } else if self.is_keyword_at(0, "not") && self.is_keyword_at(1, "in") {
                self.pos += 2;
                CmpOp::NotIn
            } else {
                break;
            };
            rest.push((op, self.additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Node::Compare(Box::new(first), rest))
        }
    }

    fn additive(&mut self) -> PResult {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            left = Node::Binary(op, Box::new(left), Box::new(self.term()?));
        }
        Ok(left)
    }

    fn term(&mut self) -> PResult {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            left = Node::Binary(op, Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> PResult {
        if self.eat_op("-") {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> PResult {
        let mut node = self.primary()?;
        loop {
            if self.eat_op("[") {
                let index = self.ternary()?;
                self.expect_op("]")?;
                node = Node::Index(Box::new(node), Box::new(index));
            } else if self.eat_op(".") {
                let method = match self.peek() {
                    Some(Token::Ident(name)) => name.clone(),
                    _ => return Err("expected method name after '.'".to_string()),
                };
                self.pos += 1;
                let name = METHODS
                    .iter()
                    .find(|m| **m == method)
                    .ok_or_else(|| format!("unsupported method '{}'", method))?;
                self.expect_op("(")?;
                let mut args = vec![node];
                args.extend(self.call_args()?);
                node = Node::Call(*name, args);
            } else {
                return Ok(node);
            }
        }
    }

    /// Arguments after an opening parenthesis, consuming the closing one
    fn call_args(&mut self) -> Result<Vec<Node>, String> {
        let mut args = Vec::new();
        if self.eat_op(")") {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat_op(")") {
                return Ok(args);
            }
            self.expect_op(",")?;
        }
    }

    fn primary(&mut self) -> PResult {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;

        match token {
            Token::Int(i) => Ok(Node::Const(Value::Int(i))),
            Token::Float(f) => Ok(Node::Const(Value::Float(f))),
            Token::Str(s) => Ok(Node::Const(Value::Str(s))),
            Token::EnvVar(name) => Ok(Node::Env(name)),
            Token::Op("(") => {
                let inner = self.ternary()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                if self.eat_op("]") {
                    return Ok(Node::List(items));
                }
                loop {
                    items.push(self.ternary()?);
                    if self.eat_op("]") {
                        return Ok(Node::List(items));
                    }
                    self.expect_op(",")?;
                    // trailing comma
                    if self.eat_op("]") {
                        return Ok(Node::List(items));
                    }
                }
            }
            Token::Ident(ident) => match ident.as_str() {
                "True" => Ok(Node::Const(Value::Bool(true))),
                "False" => Ok(Node::Const(Value::Bool(false))),
                "None" => Ok(Node::Const(Value::None)),
                "argv" => Ok(Node::Argv),
                "platform" => Ok(Node::Platform),
                "sys" => {
                    self.expect_op(".")?;
                    match self.peek() {
                        Some(Token::Ident(attr)) if attr == "argv" => {
                            self.pos += 1;
                            Ok(Node::Argv)
                        }
                        Some(Token::Ident(attr)) if attr == "platform" => {
                            self.pos += 1;
                            Ok(Node::Platform)
                        }
                        _ => Err("only sys.argv and sys.platform are available".to_string()),
                    }
                }
                kw if KEYWORDS.contains(&kw) => Err(format!("unexpected keyword '{}'", kw)),
                _ if self.is_op("(") => {
                    self.pos += 1;
                    let name = FUNCTIONS
                        .iter()
                        .find(|f| **f == ident)
                        .ok_or_else(|| format!("unsupported function '{}'", ident))?;
                    Ok(Node::Call(*name, self.call_args()?))
                }
                _ => Ok(Node::Name(ident)),
            },
            Token::Op(op) => Err(format!("unexpected '{}'", op)),
        }
    }
}

/// `sys.platform` style name of the host
pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

fn eval(node: &Node, scope: &Scope<'_>) -> Result<Value, String> {
    match node {
        Node::Const(value) => Ok(value.clone()),
        Node::Name(name) => scope
            .args
            .get(name)
            .cloned()
            .ok_or_else(|| format!("name '{}' is not defined", name)),
        Node::Env(name) => Ok(scope
            .env
            .lookup(name)
            .map(|v| Value::Str(v.to_string()))
            .unwrap_or(Value::None)),
        Node::Argv => Ok(Value::List(
            scope.argv.iter().cloned().map(Value::Str).collect(),
        )),
        Node::Platform => Ok(Value::Str(platform().to_string())),
        Node::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|n| eval(n, scope))
                .collect::<Result<_, _>>()?,
        )),
        Node::Neg(inner) => match eval(inner, scope)?.number() {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| "integer overflow".to_string()),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err("bad operand type for unary -".to_string()),
        },
        Node::Not(inner) => Ok(Value::Bool(!eval(inner, scope)?.truthy())),
        Node::And(a, b) => {
            let left = eval(a, scope)?;
            if left.truthy() {
                eval(b, scope)
            } else {
                Ok(left)
            }
        }
        Node::Or(a, b) => {
            let left = eval(a, scope)?;
            if left.truthy() {
                Ok(left)
            } else {
                eval(b, scope)
            }
        }
        Node::Ternary(cond, then, otherwise) => {
            if eval(cond, scope)?.truthy() {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Node::Compare(first, rest) => {
            let mut left = eval(first, scope)?;
            for (op, node) in rest {
                let right = eval(node, scope)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Node::Binary(op, a, b) => arithmetic(*op, eval(a, scope)?, eval(b, scope)?),
        Node::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = match eval(index, scope)?.number() {
                Some(Num::Int(i)) => i,
                _ => return Err("indices must be integers".to_string()),
            };
            match target {
                Value::List(items) => {
                    let at = resolve_index(index, items.len())?;
                    Ok(items[at].clone())
                }
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let at = resolve_index(index, chars.len())?;
                    Ok(Value::Str(chars[at].to_string()))
                }
                other => Err(format!("'{}' object is not subscriptable", other.type_name())),
            }
        }
        Node::Call(name, args) => {
            let args = args
                .iter()
                .map(|n| eval(n, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
    }
}

fn resolve_index(index: i64, len: usize) -> Result<usize, String> {
    let len = len as i64;
    let at = if index < 0 { len + index } else { index };
    if at < 0 || at >= len {
        return Err("index out of range".to_string());
    }
    Ok(at as usize)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.number(), b.number()) {
        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, String> {
    let ordering = || -> Result<Ordering, String> {
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            _ => match (a.number(), b.number()) {
                (Some(x), Some(y)) => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .ok_or_else(|| "cannot order NaN".to_string()),
                _ => Err(format!(
                    "comparison not supported between '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                )),
            },
        }
    };

    match op {
        CmpOp::Eq => Ok(values_equal(a, b)),
        CmpOp::Ne => Ok(!values_equal(a, b)),
        CmpOp::Lt => Ok(ordering()? == Ordering::Less),
        CmpOp::Le => Ok(ordering()? != Ordering::Greater),
        CmpOp::Gt => Ok(ordering()? == Ordering::Greater),
        CmpOp::Ge => Ok(ordering()? != Ordering::Less),
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => Ok(!contains(b, a)?),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::List(items), _) => Ok(items.iter().any(|v| values_equal(v, item))),
        _ => Err(format!(
            "'in' not supported between '{}' and '{}'",
            item.type_name(),
            container.type_name()
        )),
    }
}

fn arithmetic(op: BinOp, a: Value, b: Value) -> Result<Value, String> {
    let overflow = || "integer overflow".to_string();

    match (op, &a, &b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => return Ok(Value::Str(format!("{}{}", x, y))),
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            return Ok(Value::List(x.iter().chain(y.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from(*n).unwrap_or(0);
            return match s.len().checked_mul(count) {
                Some(total) if total <= MAX_STRING_LEN => Ok(Value::Str(s.repeat(count))),
                _ => Err("repeated string is too long".to_string()),
            };
        }
        _ => {}
    }

    let (x, y) = match (a.number(), b.number()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(format!(
                "unsupported operand types '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))
        }
    };

    match (x, y) {
        (Num::Int(x), Num::Int(y)) => match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div if y == 0 => Err("division by zero".to_string()),
            BinOp::Div => Ok(Value::Float(x as f64 / y as f64)),
            BinOp::FloorDiv | BinOp::Mod if y == 0 => Err("integer division by zero".to_string()),
            BinOp::FloorDiv => {
                let q = x.checked_div(y).ok_or_else(overflow)?;
                if x % y != 0 && ((x < 0) != (y < 0)) {
                    Ok(Value::Int(q - 1))
                } else {
                    Ok(Value::Int(q))
                }
            }
            BinOp::Mod => {
                // remainder takes the sign of the divisor
                let r = x.checked_rem(y).ok_or_else(overflow)?;
                if r != 0 && ((r < 0) != (y < 0)) {
                    Ok(Value::Int(r + y))
                } else {
                    Ok(Value::Int(r))
                }
            }
        },
        (x, y) => {
            let (x, y) = (x.as_f64(), y.as_f64());
            match op {
                BinOp::Add => Ok(Value::Float(x + y)),
                BinOp::Sub => Ok(Value::Float(x - y)),
                BinOp::Mul => Ok(Value::Float(x * y)),
                BinOp::Div | BinOp::FloorDiv | BinOp::Mod if y == 0.0 => {
                    Err("float division by zero".to_string())
                }
                BinOp::Div => Ok(Value::Float(x / y)),
                BinOp::FloorDiv => Ok(Value::Float((x / y).floor())),
                BinOp::Mod => Ok(Value::Float(x - y * (x / y).floor())),
            }
        }
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, String> {
    let expect = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{}() takes {} argument(s), got {}", name, n, args.len()))
        }
    };
    let text = |v: &Value| -> Result<String, String> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            other => Err(format!("{}() expects a string, got '{}'", name, other.type_name())),
        }
    };

    match name {
        "int" => {
            expect(1)?;
            match &args[0] {
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| format!("invalid literal for int(): '{}'", s)),
                Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                other => match other.number() {
                    Some(Num::Int(i)) => Ok(Value::Int(i)),
                    _ => Err(format!("int() argument must be a string or a number, not '{}'", other.type_name())),
                },
            }
        }
        "float" => {
            expect(1)?;
            match &args[0] {
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("could not convert string to float: '{}'", s)),
                other => other
                    .number()
                    .map(|n| Value::Float(n.as_f64()))
                    .ok_or_else(|| format!("float() argument must be a string or a number, not '{}'", other.type_name())),
            }
        }
        "str" => {
            expect(1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "bool" => {
            expect(1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "len" => {
            expect(1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(format!("object of type '{}' has no len()", other.type_name())),
            }
        }
        "lower" => {
            expect(1)?;
            Ok(Value::Str(text(&args[0])?.to_lowercase()))
        }
        "upper" => {
            expect(1)?;
            Ok(Value::Str(text(&args[0])?.to_uppercase()))
        }
        "strip" => {
            expect(1)?;
            Ok(Value::Str(text(&args[0])?.trim().to_string()))
        }
        "startswith" => {
            expect(2)?;
            Ok(Value::Bool(text(&args[0])?.starts_with(&text(&args[1])?)))
        }
        "endswith" => {
            expect(2)?;
            Ok(Value::Bool(text(&args[0])?.ends_with(&text(&args[1])?)))
        }
        _ => Err(format!("unsupported function '{}'", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval_with(src: &str, args: &[(&str, Value)], env: &[(&str, &str)], argv: &[&str]) -> Value {
        let args: BTreeMap<String, Value> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let scope = Scope {
            args: &args,
            env: &env,
            argv: &argv,
        };
        Expr::parse(src).unwrap().evaluate(&scope).unwrap()
    }

    fn eval_simple(src: &str) -> Value {
        eval_with(src, &[], &[], &[])
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_simple("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval_simple("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(eval_simple("7 // 2"), Value::Int(3));
        assert_eq!(eval_simple("-7 // 2"), Value::Int(-4));
        assert_eq!(eval_simple("-7 % 3"), Value::Int(2));
        assert_eq!(eval_simple("7 / 2"), Value::Float(3.5));
        assert_eq!(eval_simple("'ab' + 'cd'"), Value::Str("abcd".to_string()));
        assert_eq!(eval_simple("'ab' * 2"), Value::Str("abab".to_string()));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval_simple("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(eval_simple("1 < 3 < 2"), Value::Bool(false));
        assert_eq!(eval_simple("1 == 1.0"), Value::Bool(true));
        assert_eq!(eval_simple("'a' in 'cat'"), Value::Bool(true));
        assert_eq!(eval_simple("3 not in [1, 2]"), Value::Bool(true));
        assert_eq!(eval_simple("not 0 and 'x'"), Value::Str("x".to_string()));
        assert_eq!(eval_simple("'' or 'fallback'"), Value::Str("fallback".to_string()));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            eval_simple("'big' if 10 > 5 else 'small'"),
            Value::Str("big".to_string())
        );
        assert_eq!(eval_simple("1 if False else 2 if False else 3"), Value::Int(3));
    }

    #[test]
    fn test_args_env_and_argv() {
        let result = eval_with(
            "name.upper() + '-' + str(count * 2) + '-' + ${HOME} + '-' + argv[1]",
            &[
                ("name", Value::Str("bob".to_string())),
                ("count", Value::Int(21)),
            ],
            &[("HOME", "/home/bob")],
            &["task", "extra"],
        );
        assert_eq!(result, Value::Str("BOB-42-/home/bob-extra".to_string()));

        assert_eq!(eval_with("${MISSING}", &[], &[], &[]), Value::None);
        assert_eq!(eval_with("len(sys.argv)", &[], &[], &["t", "a", "b"]), Value::Int(3));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_simple("int(' 42 ')"), Value::Int(42));
        assert_eq!(eval_simple("float('1.5') + 1"), Value::Float(2.5));
        assert_eq!(eval_simple("bool([])"), Value::Bool(false));
        assert_eq!(eval_simple("len('héllo')"), Value::Int(5));
        assert_eq!(eval_simple("strip('  x ')"), Value::Str("x".to_string()));
        assert_eq!(eval_simple("'abc'.startswith('ab')"), Value::Bool(true));
        assert_eq!(eval_simple("endswith('abc', 'bc')"), Value::Bool(true));
        assert_eq!(eval_simple("[1, 2, 3][-1]"), Value::Int(3));
        assert_eq!(eval_simple("platform"), Value::Str(platform().to_string()));
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(eval_simple("True").to_string(), "True");
        assert_eq!(eval_simple("2 * 1.5").to_string(), "3.0");
        assert_eq!(eval_simple("['a', 1]").to_string(), "['a', 1]");
        assert_eq!(Value::Str("it's".to_string()).repr(), r"'it\'s'");
    }

    #[test]
    fn test_env_exposure() {
        assert_eq!(Value::Bool(true).to_env(), Some("true".to_string()));
        assert_eq!(Value::Bool(false).to_env(), None);
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("b".to_string())]).to_env(),
            Some("1 b".to_string())
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("(1").is_err());
        assert!(Expr::parse("1 if True").is_err());
        assert!(Expr::parse("open('x')").is_err());
        assert!(Expr::parse("x.__class__").is_err());
        assert!(Expr::parse("'unterminated").is_err());
        assert!(Expr::parse("1 2").is_err());
    }

    #[test]
    fn test_runtime_errors() {
        let args = BTreeMap::new();
        let env: HashMap<String, String> = HashMap::new();
        let scope = Scope {
            args: &args,
            env: &env,
            argv: &[],
        };
        assert!(Expr::parse("1 / 0").unwrap().evaluate(&scope).is_err());
        assert!(Expr::parse("undefined_name").unwrap().evaluate(&scope).is_err());
        assert!(Expr::parse("int('x')").unwrap().evaluate(&scope).is_err());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let eval_n = |src: &str, n: i64| {
            let args: BTreeMap<String, Value> = [("n".to_string(), Value::Int(n))].into_iter().collect();
            let env: HashMap<String, String> = HashMap::new();
            let scope = Scope {
                args: &args,
                env: &env,
                argv: &[],
            };
            Expr::parse(src).unwrap().evaluate(&scope)
        };

        assert_eq!(eval_n("n // -1", i64::MIN), Err("integer overflow".to_string()));
        assert_eq!(eval_n("n % -1", i64::MIN), Err("integer overflow".to_string()));
        assert_eq!(eval_n("-n", i64::MIN), Err("integer overflow".to_string()));
        assert_eq!(eval_n("n % (n - 1)", i64::MAX), Ok(Value::Int(1)));
        assert_eq!(eval_n("-7 % n", i64::MAX), Ok(Value::Int(i64::MAX - 7)));
        assert_eq!(eval_n("n // -1", 5), Ok(Value::Int(-5)));
        assert!(eval_n("'ab' * n", i64::MAX).is_err());
        assert_eq!(eval_n("'ab' * n", -3), Ok(Value::Str(String::new())));
    }

    #[test]
    fn test_names_and_env_reads() {
        let expr = Expr::parse("a + b if c else ${D}").unwrap();
        assert_eq!(expr.names(), vec!["a", "b", "c"]);
        assert!(expr.reads_env());
        assert!(!Expr::parse("1 + 1").unwrap().reads_env());
    }
}
