//! Condition evaluation for `when`, `changed_when`, `failed_when` and `until`.
//!
//! Expressions are tokenized, parsed by a small recursive-descent parser into
//! an [`Expression`] tree, and evaluated against a [`VariableScope`].
//!
//! Grammar:
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := filtered ( cmp_op filtered
//!                        | "in" filtered | "not" "in" filtered
//!                        | "is" ["not"] test_name )?
//! filtered   := primary ("|" ident ["(" args ")"])*
//! primary    := literal | path | "(" expr ")" | "[" list "]" | "{" dict "}"
//! path       := ident ("." ident | "." int | "[" expr "]")*
//! ```
//!
//! `not` binds tighter than `and`, which binds tighter than `or`. Both
//! combinators short-circuit left to right.
//!
//! An undefined variable evaluates to `null` wherever its value is used.
//! Only the `defined`/`undefined` tests and the `default` filter observe the
//! absence itself.

use std::cmp::Ordering;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value as JsonValue};

use super::task::TaskResult;
use crate::error::{Error, Result};
use crate::template::strip_delimiters;
use crate::vars::{is_truthy, ScopeLevel, VarMap, VariableScope};

/// A condition attached to a task.
///
/// Deserializes from a YAML/JSON boolean, a string expression, or a list of
/// either. List entries are AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// A boolean literal
    Boolean(bool),
    /// A Jinja2-like expression to evaluate
    Expression(String),
    /// All entries must hold
    List(Vec<Condition>),
}

impl Condition {
    /// Create a condition from a string expression
    pub fn expr(expr: impl Into<String>) -> Self {
        Condition::Expression(expr.into())
    }

    /// Create a list of AND-combined expressions
    pub fn all<I, S>(exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Condition::List(exprs.into_iter().map(|e| Condition::Expression(e.into())).collect())
    }

    /// Visit every string expression contained in this condition
    fn expressions(&self) -> Vec<&str> {
        match self {
            Condition::Boolean(_) => Vec::new(),
            Condition::Expression(e) => vec![e.as_str()],
            Condition::List(items) => items.iter().flat_map(|c| c.expressions()).collect(),
        }
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Condition::Boolean(value)
    }
}

impl From<&str> for Condition {
    fn from(value: &str) -> Self {
        Condition::Expression(value.to_string())
    }
}

impl From<String> for Condition {
    fn from(value: String) -> Self {
        Condition::Expression(value)
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Pipe,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Float(x) => write!(f, "{}", x),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::Comma => write!(f, "','"),
            Token::Colon => write!(f, "':'"),
            Token::Dot => write!(f, "'.'"),
            Token::Pipe => write!(f, "'|'"),
            Token::Minus => write!(f, "'-'"),
            Token::Eq => write!(f, "'=='"),
            Token::Ne => write!(f, "'!='"),
            Token::Lt => write!(f, "'<'"),
            Token::Le => write!(f, "'<='"),
            Token::Gt => write!(f, "'>'"),
            Token::Ge => write!(f, "'>='"),
        }
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => push(&mut tokens, &mut i, Token::LParen),
            ')' => push(&mut tokens, &mut i, Token::RParen),
            '[' => push(&mut tokens, &mut i, Token::LBracket),
            ']' => push(&mut tokens, &mut i, Token::RBracket),
            '{' => push(&mut tokens, &mut i, Token::LBrace),
            '}' => push(&mut tokens, &mut i, Token::RBrace),
            ',' => push(&mut tokens, &mut i, Token::Comma),
            ':' => push(&mut tokens, &mut i, Token::Colon),
            '.' => push(&mut tokens, &mut i, Token::Dot),
            '|' => push(&mut tokens, &mut i, Token::Pipe),
            '-' => push(&mut tokens, &mut i, Token::Minus),
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    _ => return Err(format!("unknown operator '{}' at position {}", c, i)),
                };
                tokens.push(token);
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(other) => value.push(*other),
                                None => return Err("unterminated string literal".to_string()),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // `items.0.name` is an index path, not a float
                let after_dot = matches!(tokens.last(), Some(Token::Dot));
                let is_float = !after_dot
                    && chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
                if is_float {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value = text
                        .parse::<f64>()
                        .map_err(|e| format!("invalid number '{}': {}", text, e))?;
                    tokens.push(Token::Float(value));
                } else {
                    let text: String = chars[start..i].iter().collect();
                    let value = text
                        .parse::<i64>()
                        .map_err(|e| format!("invalid number '{}': {}", text, e))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(format!("unexpected character '{}' at position {}", other, i));
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, token: Token) {
    tokens.push(token);
    *i += 1;
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TestKind {
    Defined,
    Undefined,
    None,
    Succeeded,
    Failed,
    Changed,
    Skipped,
    String,
    Number,
    Mapping,
    Sequence,
}

impl TestKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "defined" => TestKind::Defined,
            "undefined" => TestKind::Undefined,
            "none" => TestKind::None,
            "succeeded" | "success" => TestKind::Succeeded,
            "failed" | "failure" => TestKind::Failed,
            "changed" | "change" => TestKind::Changed,
            "skipped" | "skip" => TestKind::Skipped,
            "string" => TestKind::String,
            "number" => TestKind::Number,
            "mapping" => TestKind::Mapping,
            "sequence" => TestKind::Sequence,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterKind {
    Length,
    Int,
    Float,
    Bool,
    String,
    Lower,
    Upper,
    Trim,
    Default,
}

impl FilterKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "length" | "count" => FilterKind::Length,
            "int" => FilterKind::Int,
            "float" => FilterKind::Float,
            "bool" => FilterKind::Bool,
            "string" => FilterKind::String,
            "lower" => FilterKind::Lower,
            "upper" => FilterKind::Upper,
            "trim" => FilterKind::Trim,
            "default" | "d" => FilterKind::Default,
            _ => return None,
        })
    }

    fn max_args(self) -> usize {
        match self {
            FilterKind::Default => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path { root: String, steps: Vec<Step> },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    In {
        needle: Box<Expr>,
        haystack: Box<Expr>,
        negated: bool,
    },
    Test {
        subject: Box<Expr>,
        kind: TestKind,
        negated: bool,
    },
    Filter {
        subject: Box<Expr>,
        kind: FilterKind,
        args: Vec<Expr>,
    },
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// The original text of the expression
    pub fn source(&self) -> &str {
        &self.source
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        match self.advance() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(format!("expected {}, found {}", expected, t)),
            None => Err(format!("expected {}, found end of expression", expected)),
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.peek_keyword("not") {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_filtered()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_filtered()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }

        if self.peek_keyword("in") {
            self.advance();
            let haystack = self.parse_filtered()?;
            return Ok(Expr::In {
                needle: Box::new(left),
                haystack: Box::new(haystack),
                negated: false,
            });
        }

        if self.peek_keyword("not") && matches!(self.peek_at(1), Some(Token::Ident(s)) if s == "in") {
            self.advance();
            self.advance();
            let haystack = self.parse_filtered()?;
            return Ok(Expr::In {
                needle: Box::new(left),
                haystack: Box::new(haystack),
                negated: true,
            });
        }

        if self.peek_keyword("is") {
            self.advance();
            let negated = if self.peek_keyword("not") {
                self.advance();
                true
            } else {
                false
            };
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                Some(t) => return Err(format!("expected test name after 'is', found {}", t)),
                None => return Err("expected test name after 'is'".to_string()),
            };
            let kind = TestKind::from_name(&name).ok_or_else(|| format!("unknown test '{}'", name))?;
            return Ok(Expr::Test {
                subject: Box::new(left),
                kind,
                negated,
            });
        }

        Ok(left)
    }

    fn parse_filtered(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                Some(t) => return Err(format!("expected filter name after '|', found {}", t)),
                None => return Err("expected filter name after '|'".to_string()),
            };
            let kind =
                FilterKind::from_name(&name).ok_or_else(|| format!("unknown filter '{}'", name))?;

            let mut args = Vec::new();
            if matches!(self.peek(), Some(Token::LParen)) {
                self.advance();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.parse_expr()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
            }
            if args.len() > kind.max_args() {
                return Err(format!(
                    "filter '{}' takes at most {} argument(s)",
                    name,
                    kind.max_args()
                ));
            }

            expr = Expr::Filter {
                subject: Box::new(expr),
                kind,
                args,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Int(i)) => Ok(Expr::Literal(JsonValue::from(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(float_value(f))),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Int(i)) => Ok(Expr::Literal(JsonValue::from(-i))),
                Some(Token::Float(f)) => Ok(Expr::Literal(float_value(-f))),
                _ => Err("expected number after '-'".to_string()),
            },
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.parse_expr()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            // trailing comma
                            if matches!(self.peek(), Some(Token::RBracket)) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !matches!(self.peek(), Some(Token::RBrace)) {
                    loop {
                        let key = self.parse_expr()?;
                        self.expect(Token::Colon)?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(JsonValue::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(JsonValue::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(JsonValue::Null)),
                "and" | "or" | "not" | "in" | "is" => {
                    Err(format!("unexpected keyword '{}'", name))
                }
                _ => self.parse_path(name),
            },
            Some(t) => Err(format!("unexpected token {}", t)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_path(&mut self, root: String) -> ParseResult<Expr> {
        let mut steps = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(key)) => steps.push(Step::Key(key)),
                        Some(Token::Int(idx)) => {
                            steps.push(Step::Index(Box::new(Expr::Literal(JsonValue::from(idx)))))
                        }
                        Some(t) => return Err(format!("expected attribute name after '.', found {}", t)),
                        None => return Err("expected attribute name after '.'".to_string()),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    steps.push(Step::Index(Box::new(index)));
                }
                _ => break,
            }
        }
        Ok(Expr::Path { root, steps })
    }
}

fn float_value(f: f64) -> JsonValue {
    Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

// ============================================================================
// Evaluator
// ============================================================================

/// Largest number of items a `start-end` range may expand to
pub const MAX_RANGE_ITEMS: i64 = 100_000;

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*-\s*(\d+)\s*$").expect("Invalid range regex")
});

/// Evaluates conditions and loop expressions against a variable scope.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    scope: VariableScope,
    strict: bool,
}

impl ConditionEvaluator {
    /// Create an evaluator over `scope`
    pub fn new(scope: VariableScope) -> Self {
        Self {
            scope,
            strict: false,
        }
    }

    /// In strict mode, using an undefined variable is an evaluation error
    /// instead of evaluating to `null`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The scope conditions are evaluated against
    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    /// Parse an expression without evaluating it.
    pub fn parse(expr: &str) -> Result<Expression> {
        let text = normalize(expr);
        if matches!(text, "yes" | "no") {
            return Ok(Expression {
                source: expr.to_string(),
                root: Expr::Literal(JsonValue::Bool(text == "yes")),
            });
        }
        if text.is_empty() {
            return Err(Error::condition_syntax(expr, "empty expression"));
        }

        let tokens = tokenize(text).map_err(|msg| Error::condition_syntax(expr, msg))?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser
            .parse_expr()
            .map_err(|msg| Error::condition_syntax(expr, msg))?;
        if let Some(token) = parser.peek() {
            return Err(Error::condition_syntax(
                expr,
                format!("unexpected trailing token {}", token),
            ));
        }

        Ok(Expression {
            source: expr.to_string(),
            root,
        })
    }

    /// Check that every expression in `condition` parses.
    pub fn validate(condition: &Condition) -> Result<()> {
        for expr in condition.expressions() {
            Self::parse(expr)?;
        }
        Ok(())
    }

    /// Evaluate a `when` condition. `None` is always true.
    pub fn evaluate_when(&self, condition: Option<&Condition>) -> Result<bool> {
        match condition {
            None => Ok(true),
            Some(c) => self.evaluate_condition(c),
        }
    }

    /// Evaluate a `failed_when` condition against a module result.
    ///
    /// Without a condition, the unit failed iff the module reported failure.
    pub fn evaluate_failed_when(
        &self,
        condition: Option<&Condition>,
        result: &TaskResult,
    ) -> Result<bool> {
        match condition {
            None => Ok(!result.success),
            Some(c) => self.with_result(result).evaluate_condition(c),
        }
    }

    /// Evaluate a `changed_when` condition against a module result.
    ///
    /// Without a condition, the module's own `changed` flag stands.
    pub fn evaluate_changed_when(
        &self,
        condition: Option<&Condition>,
        result: &TaskResult,
    ) -> Result<bool> {
        match condition {
            None => Ok(result.changed),
            Some(Condition::Boolean(b)) => Ok(*b),
            Some(c) => self.with_result(result).evaluate_condition(c),
        }
    }

    /// Resolve a `loop`/`with_items` value into the items to iterate.
    ///
    /// * a list is used as-is
    /// * `{{ expr }}` is evaluated and must produce a value
    /// * a bare variable name resolving in scope yields that value
    /// * `"a-b"` is an inclusive ascending integer range
    /// * any other scalar is a single item
    pub fn evaluate_loop_items(&self, loop_expr: Option<&JsonValue>) -> Result<Option<Vec<JsonValue>>> {
        let value = match loop_expr {
            None => return Ok(None),
            Some(v) => v,
        };

        let text = match value {
            JsonValue::Array(items) => return Ok(Some(items.clone())),
            JsonValue::String(s) => s.as_str(),
            JsonValue::Null => return Ok(Some(Vec::new())),
            other => return Ok(Some(vec![other.clone()])),
        };

        if let Some(inner) = strip_delimiters(text) {
            let expr = Self::parse(inner).map_err(|e| Error::loop_expression(text, e.to_string()))?;
            let resolved = self
                .eval(&expr.root)
                .map_err(|e| Error::loop_expression(text, e.to_string()))?
                .ok_or_else(|| Error::loop_expression(text, "loop variable is undefined"))?;
            return Ok(Some(items_of(resolved)));
        }

        if let Some(caps) = RANGE_RE.captures(text) {
            let start: i64 = caps[1]
                .parse()
                .map_err(|e| Error::loop_expression(text, format!("invalid range start: {}", e)))?;
            let end: i64 = caps[2]
                .parse()
                .map_err(|e| Error::loop_expression(text, format!("invalid range end: {}", e)))?;
            if start > end {
                return Err(Error::loop_expression(
                    text,
                    format!("range start {} is greater than end {}", start, end),
                ));
            }
            if end - start >= MAX_RANGE_ITEMS {
                return Err(Error::loop_expression(
                    text,
                    format!(
                        "range of {} items exceeds the limit of {}",
                        end - start + 1,
                        MAX_RANGE_ITEMS
                    ),
                ));
            }
            return Ok(Some((start..=end).map(JsonValue::from).collect()));
        }

        if let Some(resolved) = self.scope.lookup_path(text) {
            return Ok(Some(items_of(resolved.clone())));
        }

        Ok(Some(vec![value.clone()]))
    }

    /// Evaluate an expression to its value. `None` means undefined.
    pub fn evaluate_value(&self, expr: &str) -> Result<Option<JsonValue>> {
        let parsed = Self::parse(expr)?;
        self.eval(&parsed.root)
    }

    /// Evaluate an already parsed expression for truthiness
    pub fn evaluate_expression(&self, expr: &Expression) -> Result<bool> {
        let value = self.eval(&expr.root).map_err(|e| match e {
            Error::ConditionEval { message, .. } => Error::condition_eval(&expr.source, message),
            other => other,
        })?;
        Ok(value.as_ref().is_some_and(is_truthy))
    }

    fn evaluate_condition(&self, condition: &Condition) -> Result<bool> {
        match condition {
            Condition::Boolean(b) => Ok(*b),
            Condition::Expression(expr) => {
                let parsed = Self::parse(expr)?;
                self.evaluate_expression(&parsed)
            }
            Condition::List(items) => {
                for item in items {
                    if !self.evaluate_condition(item)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn with_result(&self, result: &TaskResult) -> Self {
        Self {
            scope: self.scope.with_layer(ScopeLevel::Result, result_vars(result)),
            strict: self.strict,
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Option<JsonValue>> {
        match expr {
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::Path { root, steps } => self.eval_path(root, steps),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.value(item)?);
                }
                Ok(Some(JsonValue::Array(values)))
            }
            Expr::Dict(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(display_value(&self.value(key)?), self.value(value)?);
                }
                Ok(Some(JsonValue::Object(map)))
            }
            Expr::Not(inner) => Ok(Some(JsonValue::Bool(!is_truthy(&self.value(inner)?)))),
            Expr::And(left, right) => {
                if !is_truthy(&self.value(left)?) {
                    return Ok(Some(JsonValue::Bool(false)));
                }
                Ok(Some(JsonValue::Bool(is_truthy(&self.value(right)?))))
            }
            Expr::Or(left, right) => {
                if is_truthy(&self.value(left)?) {
                    return Ok(Some(JsonValue::Bool(true)));
                }
                Ok(Some(JsonValue::Bool(is_truthy(&self.value(right)?))))
            }
            Expr::Compare(op, left, right) => {
                let l = self.value(left)?;
                let r = self.value(right)?;
                Ok(Some(JsonValue::Bool(compare(*op, &l, &r)?)))
            }
            Expr::In {
                needle,
                haystack,
                negated,
            } => {
                let n = self.value(needle)?;
                let h = self.value(haystack)?;
                let found = contains(&h, &n)?;
                Ok(Some(JsonValue::Bool(found != *negated)))
            }
            Expr::Test {
                subject,
                kind,
                negated,
            } => {
                let value = self.eval(subject)?;
                let outcome = self.apply_test(*kind, value)?;
                Ok(Some(JsonValue::Bool(outcome != *negated)))
            }
            Expr::Filter {
                subject,
                kind,
                args,
            } => self.apply_filter(*kind, subject, args).map(Some),
        }
    }

    /// Evaluate to a concrete value, turning undefined into `null`.
    fn value(&self, expr: &Expr) -> Result<JsonValue> {
        match self.eval(expr)? {
            Some(v) => Ok(v),
            None if self.strict => Err(Error::condition_eval(
                "",
                format!("'{}' is undefined", describe(expr)),
            )),
            None => Ok(JsonValue::Null),
        }
    }

    fn eval_path(&self, root: &str, steps: &[Step]) -> Result<Option<JsonValue>> {
        let mut current = match self.scope.get(root) {
            Some(v) => v.clone(),
            None => return Ok(None),
        };

        for step in steps {
            let next = match step {
                Step::Key(key) => match &current {
                    JsonValue::Object(map) => map.get(key).cloned(),
                    _ => None,
                },
                Step::Index(index) => {
                    let index = self.value(index)?;
                    match (&current, &index) {
                        (JsonValue::Array(items), JsonValue::Number(n)) => n
                            .as_i64()
                            .and_then(|i| {
                                let len = i64::try_from(items.len()).ok()?;
                                let i = if i < 0 { len + i } else { i };
                                usize::try_from(i).ok()
                            })
                            .and_then(|i| items.get(i).cloned()),
                        (JsonValue::Object(map), JsonValue::String(key)) => map.get(key).cloned(),
                        (JsonValue::Object(map), JsonValue::Number(n)) => {
                            map.get(&n.to_string()).cloned()
                        }
                        _ => None,
                    }
                }
            };
            match next {
                Some(v) => current = v,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    fn apply_test(&self, kind: TestKind, value: Option<JsonValue>) -> Result<bool> {
        Ok(match kind {
            TestKind::Defined => value.is_some(),
            TestKind::Undefined => value.is_none(),
            TestKind::None => matches!(value, Some(JsonValue::Null)),
            TestKind::String => matches!(value, Some(JsonValue::String(_))),
            TestKind::Number => matches!(value, Some(JsonValue::Number(_))),
            TestKind::Mapping => matches!(value, Some(JsonValue::Object(_))),
            TestKind::Sequence => matches!(value, Some(JsonValue::Array(_) | JsonValue::String(_))),
            TestKind::Succeeded => !result_flag(&value, "failed", "succeeded")?,
            TestKind::Failed => result_flag(&value, "failed", "failed")?,
            TestKind::Changed => result_flag(&value, "changed", "changed")?,
            TestKind::Skipped => result_flag(&value, "skipped", "skipped")?,
        })
    }

    fn apply_filter(&self, kind: FilterKind, subject: &Expr, args: &[Expr]) -> Result<JsonValue> {
        if kind == FilterKind::Default {
            let value = self.eval(subject)?;
            let fallback = match args.first() {
                Some(arg) => self.value(arg)?,
                None => JsonValue::String(String::new()),
            };
            let when_falsy = match args.get(1) {
                Some(arg) => is_truthy(&self.value(arg)?),
                None => false,
            };
            return Ok(match value {
                None => fallback,
                Some(v) if when_falsy && !is_truthy(&v) => fallback,
                Some(v) => v,
            });
        }

        let value = self.value(subject)?;
        Ok(match kind {
            FilterKind::Length => match &value {
                JsonValue::String(s) => JsonValue::from(s.chars().count()),
                JsonValue::Array(a) => JsonValue::from(a.len()),
                JsonValue::Object(o) => JsonValue::from(o.len()),
                JsonValue::Null => JsonValue::from(0),
                other => {
                    return Err(Error::condition_eval(
                        "",
                        format!("object of type {} has no length", type_name(other)),
                    ))
                }
            },
            FilterKind::Int => JsonValue::from(to_i64(&value)),
            FilterKind::Float => float_value(to_f64(&value)),
            FilterKind::Bool => JsonValue::Bool(match &value {
                JsonValue::String(s) => matches!(
                    s.trim().to_lowercase().as_str(),
                    "yes" | "y" | "true" | "on" | "1"
                ),
                other => is_truthy(other),
            }),
            FilterKind::String => JsonValue::String(display_value(&value)),
            FilterKind::Lower => JsonValue::String(display_value(&value).to_lowercase()),
            FilterKind::Upper => JsonValue::String(display_value(&value).to_uppercase()),
            FilterKind::Trim => JsonValue::String(display_value(&value).trim().to_string()),
            FilterKind::Default => unreachable!("handled above"),
        })
    }
}

/// Variables exposed to `failed_when`, `changed_when` and `until`.
pub fn result_vars(result: &TaskResult) -> VarMap {
    let mut vars = VarMap::new();
    for key in ["rc", "stdout", "stderr"] {
        if let Some(v) = result.data.get(key) {
            vars.insert(key.to_string(), v.clone());
        }
    }
    for (stream, key) in [("stdout", "stdout_lines"), ("stderr", "stderr_lines")] {
        let lines = match result.data.get(key) {
            Some(v) => Some(v.clone()),
            None => result
                .data
                .get(stream)
                .and_then(|v| v.as_str())
                .map(|s| JsonValue::from(s.lines().collect::<Vec<_>>())),
        };
        if let Some(lines) = lines {
            vars.insert(key.to_string(), lines);
        }
    }
    vars.insert("changed".to_string(), JsonValue::Bool(result.changed));
    vars.insert("failed".to_string(), JsonValue::Bool(!result.success));
    vars.insert("msg".to_string(), JsonValue::String(result.message.clone()));
    vars.insert("attempts".to_string(), JsonValue::from(result.attempts));
    vars
}

fn normalize(expr: &str) -> &str {
    let trimmed = expr.trim();
    strip_delimiters(trimmed).map(str::trim).unwrap_or(trimmed)
}

fn items_of(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Path { root, steps } => {
            let mut out = root.clone();
            for step in steps {
                match step {
                    Step::Key(k) => {
                        out.push('.');
                        out.push_str(k);
                    }
                    Step::Index(_) => out.push_str("[..]"),
                }
            }
            out
        }
        _ => "expression".to_string(),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "none",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "dict",
    }
}

/// Render a value the way Jinja2 prints it.
fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => "None".to_string(),
        JsonValue::Bool(true) => "True".to_string(),
        JsonValue::Bool(false) => "False".to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn to_f64(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse().unwrap_or(0.0),
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn to_i64(value: &JsonValue) -> i64 {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .unwrap_or_else(|| n.as_f64().map(|f| f.trunc() as i64).unwrap_or(0)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
                .unwrap_or(0)
        }
        JsonValue::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &JsonValue, right: &JsonValue) -> Result<bool> {
    match op {
        CmpOp::Eq => return Ok(values_equal(left, right)),
        CmpOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }

    let ordering = match (left, right) {
        (JsonValue::Null, _) | (_, JsonValue::Null) => return Ok(false),
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(x, y)| x.partial_cmp(&y))
                .unwrap_or(Ordering::Equal),
        },
        (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => a.cmp(b),
        (a, b) => {
            return Err(Error::condition_eval(
                "",
                format!(
                    "cannot compare {} with {}",
                    type_name(a),
                    type_name(b)
                ),
            ))
        }
    };

    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> Result<bool> {
    match haystack {
        JsonValue::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        JsonValue::String(s) => Ok(s.contains(display_value(needle).as_str())),
        JsonValue::Object(map) => Ok(map.contains_key(&display_value(needle))),
        JsonValue::Null => Ok(false),
        other => Err(Error::condition_eval(
            "",
            format!("argument of type {} is not iterable", type_name(other)),
        )),
    }
}

fn result_flag(value: &Option<JsonValue>, field: &str, test: &str) -> Result<bool> {
    match value {
        Some(JsonValue::Object(map)) => Ok(map.get(field).is_some_and(is_truthy)),
        _ => Err(Error::condition_eval(
            "",
            format!("the '{}' test expects a registered result", test),
        )),
    }
}
