//! Expression language for policy conditions, conditional execution, and
//! resolver priority rules.
//!
//! A small, side-effect-free evaluator — not an embedded interpreter.
//! Surface: `&& || !`, the six comparisons, dotted field paths, `in` over
//! literal lists, `contains` on strings, literals (numbers, strings,
//! booleans, arrays), and the aggregations `any(e)` / `all(e)` / `count(e)`
//! which only the resolver binds to sibling responses.
//!
//! Expressions are parsed once at profile load; evaluation walks the AST in
//! O(expression size) and cannot loop.

use serde_json::Value;

use crate::error::ExprError;

// ── AST ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Any,
    All,
    Count,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dotted field path, resolved against the evaluation root.
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    /// `left in [a, b, c]`
    In(Box<Expr>, Box<Expr>),
    /// `field contains "needle"`
    Contains(Box<Expr>, Box<Expr>),
    /// `any(e)` / `all(e)` / `count(e)` over sibling responses.
    Agg(AggKind, Box<Expr>),
}

impl Expr {
    /// Parse an expression string. Malformed input is a load-time error —
    /// profiles carrying one are quarantined before any message runs.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Parse {
                offset: parser.offset(),
                message: "trailing input after expression".to_string(),
            });
        }
        Ok(expr)
    }

    /// Evaluate to a boolean against `root`. Aggregations draw from
    /// `siblings`; an expression using them without siblings is false.
    pub fn eval_bool(&self, root: &Value, siblings: &[Value]) -> bool {
        truthy(&self.eval(root, siblings))
    }

    /// Evaluate to a JSON value.
    pub fn eval(&self, root: &Value, siblings: &[Value]) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => resolve_path(root, path),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(root, siblings))),
            Expr::And(a, b) => Value::Bool(
                truthy(&a.eval(root, siblings)) && truthy(&b.eval(root, siblings)),
            ),
            Expr::Or(a, b) => Value::Bool(
                truthy(&a.eval(root, siblings)) || truthy(&b.eval(root, siblings)),
            ),
            Expr::Cmp(a, op, b) => {
                Value::Bool(compare(&a.eval(root, siblings), *op, &b.eval(root, siblings)))
            }
            Expr::In(needle, haystack) => {
                let needle = needle.eval(root, siblings);
                match haystack.eval(root, siblings) {
                    Value::Array(items) => Value::Bool(items.contains(&needle)),
                    _ => Value::Bool(false),
                }
            }
            Expr::Contains(target, needle) => {
                let target = target.eval(root, siblings);
                let needle = needle.eval(root, siblings);
                let hit = match (&target, &needle) {
                    (Value::String(t), Value::String(n)) => t.contains(n.as_str()),
                    (Value::Array(items), n) => items.contains(n),
                    _ => false,
                };
                Value::Bool(hit)
            }
            Expr::Agg(kind, inner) => {
                let mut count = 0usize;
                for sibling in siblings {
                    if truthy(&inner.eval(sibling, &[])) {
                        count += 1;
                    }
                }
                match kind {
                    AggKind::Any => Value::Bool(count > 0),
                    AggKind::All => Value::Bool(!siblings.is_empty() && count == siblings.len()),
                    AggKind::Count => Value::from(count as u64),
                }
            }
        }
    }
}

fn resolve_path(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Condition truthiness: bools as-is, null false, numbers nonzero,
/// strings and arrays non-empty.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        _ => {
            let ordering = match (a, b) {
                (Value::Number(x), Value::Number(y)) => {
                    match (x.as_f64(), y.as_f64()) {
                        (Some(x), Some(y)) => x.partial_cmp(&y),
                        _ => None,
                    }
                }
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

// ── Lexer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    In,
    Contains,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

struct Spanned {
    token: Token,
    offset: usize,
}

fn lex(input: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let offset = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Spanned { token: Token::LParen, offset });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned { token: Token::RParen, offset });
                i += 1;
            }
            '[' => {
                tokens.push(Spanned { token: Token::LBracket, offset });
                i += 1;
            }
            ']' => {
                tokens.push(Spanned { token: Token::RBracket, offset });
                i += 1;
            }
            ',' => {
                tokens.push(Spanned { token: Token::Comma, offset });
                i += 1;
            }
            '.' => {
                tokens.push(Spanned { token: Token::Dot, offset });
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Spanned { token: Token::AndAnd, offset });
                    i += 2;
                } else {
                    return Err(lex_err(offset, "expected '&&'"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Spanned { token: Token::OrOr, offset });
                    i += 2;
                } else {
                    return Err(lex_err(offset, "expected '||'"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::NotEq, offset });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Bang, offset });
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::EqEq, offset });
                    i += 2;
                } else {
                    return Err(lex_err(offset, "expected '=='"));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Le, offset });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Lt, offset });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Ge, offset });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Gt, offset });
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != quote {
                    j += 1;
                }
                if j == bytes.len() {
                    return Err(lex_err(offset, "unterminated string"));
                }
                tokens.push(Spanned {
                    token: Token::Str(input[start..j].to_string()),
                    offset,
                });
                i = j + 1;
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if i >= bytes.len() || !(bytes[i] as char).is_ascii_digit() {
                        return Err(lex_err(start, "expected digit after '-'"));
                    }
                }
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| lex_err(start, "invalid number literal"))?;
                tokens.push(Spanned { token: Token::Number(n), offset: start });
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "in" => Token::In,
                    "contains" => Token::Contains,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, offset: start });
            }
            _ => return Err(lex_err(offset, &format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

fn lex_err(offset: usize, message: &str) -> ExprError {
    ExprError::Parse {
        offset,
        message: message.to_string(),
    }
}

// ── Parser ──────────────────────────────────────────────────────────
//
// Precedence, loosest to tightest: || , &&, comparison/in/contains, !, primary.

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or_else(|| self.tokens.last().map(|t| t.offset + 1).unwrap_or(0))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|t| t.token.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            _ => Err(ExprError::Parse {
                offset: self.offset(),
                message: format!("expected {what}"),
            }),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::NotEq) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::In) => {
                self.advance();
                let right = self.unary()?;
                return Ok(Expr::In(Box::new(left), Box::new(right)));
            }
            Some(Token::Contains) => {
                self.advance();
                let right = self.unary()?;
                return Ok(Expr::Contains(Box::new(left), Box::new(right)));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.unary()?;
            return Ok(Expr::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        let item = self.expression()?;
                        match item {
                            Expr::Literal(v) => items.push(v),
                            _ => {
                                return Err(ExprError::Parse {
                                    offset: self.offset(),
                                    message: "array elements must be literals".to_string(),
                                })
                            }
                        }
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::Literal(Value::Array(items)))
            }
            Some(Token::Ident(name)) => {
                // Aggregation call?
                if self.peek() == Some(&Token::LParen) {
                    let kind = match name.as_str() {
                        "any" => Some(AggKind::Any),
                        "all" => Some(AggKind::All),
                        "count" => Some(AggKind::Count),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        self.advance();
                        let inner = self.expression()?;
                        self.expect(Token::RParen, "')'")?;
                        return Ok(Expr::Agg(kind, Box::new(inner)));
                    }
                    return Err(ExprError::Parse {
                        offset: self.offset(),
                        message: format!("unknown function '{name}'"),
                    });
                }
                // Dotted path.
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => {
                            return Err(ExprError::Parse {
                                offset: self.offset(),
                                message: "expected identifier after '.'".to_string(),
                            })
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            _ => Err(ExprError::Parse {
                offset: self.offset(),
                message: "expected expression".to_string(),
            }),
        }
    }
}

fn number(n: f64) -> Value {
    // Integral literals stay integral so `== 2` matches a JSON int.
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
