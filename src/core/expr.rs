//! Pass/fail expressions
//!
//! A deliberately small language evaluated against the captured groups of the
//! inference result line and the test label:
//!
//! ```text
//! groups[1] == label and groups[2] >= 0.75
//! not (groups[-1] == "unknown") || label == 'yes'
//! ```
//!
//! Operands are numbers, quoted strings, `true`/`false`, `label` and
//! `groups[i]`. Operators are the six comparisons, `and`/`&&`, `or`/`||`,
//! `not`/`!` and parentheses. Nothing else is executable.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Expression errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// Tokenizer or parser failure
    #[error("Syntax error at offset {offset}: {message}")]
    Syntax {
        /// Byte offset in the source
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// `groups[i]` outside the captured range
    #[error("Group index {index} out of range ({len} groups captured)")]
    IndexOutOfRange {
        /// Requested index
        index: i64,
        /// Groups available
        len: usize,
    },

    /// Ordering between incompatible values
    #[error("Cannot compare {left} with {right}")]
    TypeMismatch {
        /// Left operand
        left: String,
        /// Right operand
        right: String,
    },
}

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Numeric value
    Number(f64),
    /// Text value
    Str(String),
    /// Boolean value
    Bool(bool),
}

impl Value {
    /// Parse captured text, preferring a number when it looks like one
    pub fn coerce(text: &str) -> Self {
        match text.trim().parse::<f64>() {
            Ok(n) if !text.trim().is_empty() => Self::Number(n),
            _ => Self::Str(text.to_string()),
        }
    }

    /// Truthiness of the value
    pub fn truthy(&self) -> bool {
        match self {
            Self::Number(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bool(b) => *b,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    fn apply(self, left: &Value, right: &Value) -> Result<bool, ExprError> {
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
                match (left.as_number(), right.as_number()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                }
            }
            _ => None,
        };

        match (self, ordering) {
            (Self::Eq, ordering) => Ok(ordering == Some(Ordering::Equal)),
            (Self::Ne, ordering) => Ok(ordering != Some(Ordering::Equal)),
            (_, None) => Err(ExprError::TypeMismatch {
                left: left.to_string(),
                right: right.to_string(),
            }),
            (Self::Lt, Some(o)) => Ok(o == Ordering::Less),
            (Self::Le, Some(o)) => Ok(o != Ordering::Greater),
            (Self::Gt, Some(o)) => Ok(o == Ordering::Greater),
            (Self::Ge, Some(o)) => Ok(o != Ordering::Less),
        }
    }
}

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal value
    Literal(Value),
    /// The test label
    Label,
    /// Captured group by index; negative counts from the end
    Group(i64),
    /// Logical negation
    Not(Box<Node>),
    /// Short-circuit conjunction
    And(Box<Node>, Box<Node>),
    /// Short-circuit disjunction
    Or(Box<Node>, Box<Node>),
    /// Comparison
    Compare(CompareOp, Box<Node>, Box<Node>),
}

/// Values available while evaluating
#[derive(Debug, Clone)]
pub struct Bindings {
    /// Captured groups, numeric where possible
    pub groups: Vec<Value>,
    /// Test label
    pub label: String,
}

impl Bindings {
    /// Build bindings from raw capture groups
    pub fn new(groups: &[String], label: &str) -> Self {
        Self {
            groups: groups.iter().map(|g| Value::coerce(g)).collect(),
            label: label.to_string(),
        }
    }

    fn group(&self, index: i64) -> Result<&Value, ExprError> {
        let len = self.groups.len();
        let resolved = if index < 0 {
            usize::try_from(-index).ok().and_then(|back| len.checked_sub(back))
        } else {
            usize::try_from(index).ok().filter(|&i| i < len)
        };
        resolved
            .and_then(|i| self.groups.get(i))
            .ok_or(ExprError::IndexOutOfRange { index, len })
    }
}

impl Node {
    fn eval(&self, bindings: &Bindings) -> Result<Value, ExprError> {
        Ok(match self {
            Self::Literal(value) => value.clone(),
            Self::Label => Value::Str(bindings.label.clone()),
            Self::Group(index) => bindings.group(*index)?.clone(),
            Self::Not(inner) => Value::Bool(!inner.eval(bindings)?.truthy()),
            Self::And(left, right) => {
                Value::Bool(left.eval(bindings)?.truthy() && right.eval(bindings)?.truthy())
            }
            Self::Or(left, right) => {
                Value::Bool(left.eval(bindings)?.truthy() || right.eval(bindings)?.truthy())
            }
            Self::Compare(op, left, right) => {
                Value::Bool(op.apply(&left.eval(bindings)?, &right.eval(bindings)?)?)
            }
        })
    }
}

/// A parsed pass/fail expression. The empty expression always passes.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Option<Node>,
}

impl Expression {
    /// Parse `source`
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let root = if source.trim().is_empty() {
            None
        } else {
            let tokens = tokenize(source)?;
            let mut parser = Parser { tokens, pos: 0 };
            let node = parser.parse_or()?;
            if let Some(token) = parser.peek() {
                return Err(ExprError::Syntax {
                    offset: token.offset,
                    message: format!("unexpected {}", token.kind),
                });
            }
            Some(node)
        };
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Expression that always passes
    pub fn always() -> Self {
        Self {
            source: String::new(),
            root: None,
        }
    }

    /// Original text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Check whether this is the always-pass expression
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Evaluate to a pass (`true`) or fail (`false`)
    pub fn evaluate(&self, bindings: &Bindings) -> Result<bool, ExprError> {
        match &self.root {
            None => Ok(true),
            Some(node) => Ok(node.eval(bindings)?.truthy()),
        }
    }
}

impl Default for Expression {
    fn default() -> Self {
        Self::always()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Minus,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Ident(s) => write!(f, "identifier `{s}`"),
            Self::Op(op) => write!(f, "operator {op:?}"),
            Self::And => write!(f, "`and`"),
            Self::Or => write!(f, "`or`"),
            Self::Not => write!(f, "`not`"),
            Self::LParen => write!(f, "`(`"),
            Self::RParen => write!(f, "`)`"),
            Self::LBracket => write!(f, "`[`"),
            Self::RBracket => write!(f, "`]`"),
            Self::Minus => write!(f, "`-`"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        let two: &[u8] = bytes.get(i..i + 2).unwrap_or(&[]);

        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'-' => TokenKind::Minus,
            _ if two == b"==" => TokenKind::Op(CompareOp::Eq),
            _ if two == b"!=" => TokenKind::Op(CompareOp::Ne),
            _ if two == b"<=" => TokenKind::Op(CompareOp::Le),
            _ if two == b">=" => TokenKind::Op(CompareOp::Ge),
            _ if two == b"&&" => TokenKind::And,
            _ if two == b"||" => TokenKind::Or,
            b'<' => TokenKind::Op(CompareOp::Lt),
            b'>' => TokenKind::Op(CompareOp::Gt),
            b'!' => TokenKind::Not,
            b'"' | b'\'' => {
                let (text, end) = scan_string(source, i)?;
                i = end;
                tokens.push(Token { kind: TokenKind::Str(text), offset: start });
                continue;
            }
            b'0'..=b'9' | b'.' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || matches!(bytes[i], b'.' | b'e' | b'E')
                        || (matches!(bytes[i], b'+' | b'-') && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                let text = &source[start..i];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(start, format!("invalid number `{text}`")))?;
                tokens.push(Token { kind: TokenKind::Number(n), offset: start });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let kind = match &source[start..i] {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    word => TokenKind::Ident(word.to_string()),
                };
                tokens.push(Token { kind, offset: start });
                continue;
            }
            _ => {
                let ch = source[i..].chars().next().unwrap_or('?');
                return Err(syntax(start, format!("unexpected character `{ch}`")));
            }
        };

        i += match kind {
            TokenKind::Op(CompareOp::Lt | CompareOp::Gt) | TokenKind::Not => 1,
            TokenKind::Op(_) | TokenKind::And | TokenKind::Or => 2,
            _ => 1,
        };
        tokens.push(Token { kind, offset: start });
    }

    Ok(tokens)
}

/// Scan a quoted string starting at `start`, returning its text and end offset
fn scan_string(source: &str, start: usize) -> Result<(String, usize), ExprError> {
    let mut chars = source[start..].char_indices();
    let (_, quote) = chars.next().ok_or_else(|| syntax(start, "expected string"))?;
    let mut text = String::new();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((text, start + offset + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, escaped)) => text.push(escaped),
                None => break,
            },
            c => text.push(c),
        }
    }
    Err(syntax(start, "unterminated string"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map_or(0, |t| t.offset + 1)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if &t.kind == kind => Ok(()),
            Some(t) => Err(syntax(t.offset, format!("expected {kind}, found {}", t.kind))),
            None => Err(syntax(self.end_offset(), format!("expected {kind}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            left = Node::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            left = Node::And(Box::new(left), Box::new(self.parse_not()?));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        if self.eat(&TokenKind::Not) {
            return Ok(Node::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Node, ExprError> {
        let left = self.parse_operand()?;
        if let Some(Token { kind: TokenKind::Op(op), .. }) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Node::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Node, ExprError> {
        let Some(token) = self.next() else {
            return Err(syntax(self.end_offset(), "unexpected end of expression"));
        };

        match token.kind {
            TokenKind::Number(n) => Ok(Node::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Node::Literal(Value::Str(s))),
            TokenKind::Minus => match self.next() {
                Some(Token { kind: TokenKind::Number(n), .. }) => Ok(Node::Literal(Value::Number(-n))),
                _ => Err(syntax(token.offset, "`-` must precede a number")),
            },
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Node::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Node::Literal(Value::Bool(false))),
                "label" => Ok(Node::Label),
                "groups" => self.parse_index(token.offset),
                other => Err(syntax(token.offset, format!("unknown name `{other}`"))),
            },
            other => Err(syntax(token.offset, format!("unexpected {other}"))),
        }
    }

    fn parse_index(&mut self, offset: usize) -> Result<Node, ExprError> {
        self.expect(&TokenKind::LBracket)?;
        let negative = self.eat(&TokenKind::Minus);
        let index = match self.next() {
            #[allow(clippy::cast_possible_truncation)]
            Some(Token { kind: TokenKind::Number(n), .. }) if n.fract() == 0.0 && n >= 0.0 => n as i64,
            _ => return Err(syntax(offset, "group index must be an integer")),
        };
        self.expect(&TokenKind::RBracket)?;
        Ok(Node::Group(if negative { -index } else { index }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, groups: &[&str], label: &str) -> Result<bool, ExprError> {
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        Expression::parse(source)?.evaluate(&Bindings::new(&groups, label))
    }

    #[test]
    fn test_empty_always_passes() {
        assert_eq!(eval("", &[], "x"), Ok(true));
        assert_eq!(eval("   ", &["anything"], "x"), Ok(true));
        assert!(Expression::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_numeric_group_equals_string_label() {
        assert_eq!(eval("groups[0] == label", &["5"], "5"), Ok(true));
        assert_eq!(eval("groups[0] == label", &["5.0"], "5"), Ok(true));
        assert_eq!(eval("groups[0] == label", &["6"], "5"), Ok(false));
    }

    #[test]
    fn test_word_labels() {
        let groups = ["person score 200 no person score 55", "200", "55"];
        assert_eq!(eval("groups[1] > groups[2]", &groups, "person"), Ok(true));
        assert_eq!(eval("groups[-1] < 100 and label == \"person\"", &groups, "person"), Ok(true));
        assert_eq!(eval("label == 'no_person'", &groups, "person"), Ok(false));
    }

    #[test]
    fn test_connectives_and_precedence() {
        assert_eq!(eval("true or false and false", &[], ""), Ok(true));
        assert_eq!(eval("(true or false) and false", &[], ""), Ok(false));
        assert_eq!(eval("not false && !(1 > 2)", &[], ""), Ok(true));
        assert_eq!(eval("1 != 1 || -2 <= -2", &[], ""), Ok(true));
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(eval("groups[0]", &["yes"], ""), Ok(true));
        assert_eq!(eval("groups[0]", &["0"], ""), Ok(false));
        assert_eq!(eval("label", &[], ""), Ok(false));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            eval("groups[3] == 1", &["a"], ""),
            Err(ExprError::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert!(matches!(eval("label < 3", &[], "cat"), Err(ExprError::TypeMismatch { .. })));
        assert!(matches!(Expression::parse("groups[0] ="), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("__import__('os')"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("(1 == 1"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("'open"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Expression::parse("1 == 1 1"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn test_mismatched_equality_is_false_not_error() {
        assert_eq!(eval("label == 3", &[], "three"), Ok(false));
        assert_eq!(eval("label != 3", &[], "three"), Ok(true));
        assert_eq!(eval("true == 1", &[], ""), Ok(false));
    }

    #[test]
    fn test_scientific_numbers() {
        assert_eq!(eval("groups[0] > 1e-3", &["0.5"], ""), Ok(true));
    }
}
