//! Boolean expression evaluator for compiled rules.
//!
//! Operates directly on `serde_json::Value` so parameters resolved from a
//! webhook payload keep their JSON types. Supports the comparison and
//! boolean operators, arithmetic, string/number/bool/null literals, and the
//! registered functions `contains` and `like`.

use std::collections::HashMap;

use serde_json::{Number, Value};

/// Names the rewriter must not treat as path tokens.
const FUNCTION_NAMES: &[&str] = &["contains", "like"];

pub fn is_function(name: &str) -> bool {
    FUNCTION_NAMES.contains(&name)
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token at position {0}")]
    UnexpectedToken(usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{0} expects {1} arguments")]
    Arity(&'static str, usize),
    #[error("operator '{op}' needs {want} operands, got {got}")]
    TypeMismatch {
        op: &'static str,
        want: &'static str,
        got: String,
    },
    #[error("invalid like pattern: {0}")]
    BadPattern(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone)]
pub enum Ast {
    Literal(Value),
    Var(String),
    Not(Box<Ast>),
    Neg(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Parse an already-rewritten expression into an AST.
pub fn parse(expr: &str) -> Result<Ast, EvalError> {
    let tokens = lex(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::UnexpectedToken(parser.pos));
    }
    Ok(ast)
}

/// Collect every variable name the AST references, in first-use order.
pub fn variables(ast: &Ast) -> Vec<String> {
    fn walk(ast: &Ast, out: &mut Vec<String>) {
        match ast {
            Ast::Var(name) => {
                if !out.iter().any(|v| v == name) {
                    out.push(name.clone());
                }
            }
            Ast::Not(inner) | Ast::Neg(inner) => walk(inner, out),
            Ast::Binary(_, lhs, rhs) => {
                walk(lhs, out);
                walk(rhs, out);
            }
            Ast::Call(_, args) => {
                for arg in args {
                    walk(arg, out);
                }
            }
            Ast::Literal(_) => {}
        }
    }
    let mut out = Vec::new();
    walk(ast, &mut out);
    out
}

/// Evaluate the AST against resolved parameters. Unknown variables are null.
pub fn evaluate(ast: &Ast, params: &HashMap<String, Value>) -> Result<Value, EvalError> {
    match ast {
        Ast::Literal(value) => Ok(value.clone()),
        Ast::Var(name) => Ok(params.get(name).cloned().unwrap_or(Value::Null)),
        Ast::Not(inner) => match evaluate(inner, params)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(type_mismatch("!", "a boolean", &other)),
        },
        Ast::Neg(inner) => {
            let value = evaluate(inner, params)?;
            let n = as_number(&value).ok_or_else(|| type_mismatch("-", "a number", &value))?;
            Ok(number(-n))
        }
        Ast::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, params),
        Ast::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, params)?);
            }
            call_function(name, &values)
        }
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Ast,
    rhs: &Ast,
    params: &HashMap<String, Value>,
) -> Result<Value, EvalError> {
    // && and || short-circuit; everything else is strict.
    match op {
        BinOp::And => {
            return match evaluate(lhs, params)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match evaluate(rhs, params)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(type_mismatch("&&", "booleans", &other)),
                },
                other => Err(type_mismatch("&&", "booleans", &other)),
            };
        }
        BinOp::Or => {
            return match evaluate(lhs, params)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match evaluate(rhs, params)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(type_mismatch("||", "booleans", &other)),
                },
                other => Err(type_mismatch("||", "booleans", &other)),
            };
        }
        _ => {}
    }

    let left = evaluate(lhs, params)?;
    let right = evaluate(rhs, params)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&left, &right)
                .ok_or_else(|| type_mismatch(op_name(op), "two numbers or two strings", &left))?;
            let holds = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(holds))
        }
        BinOp::Add => {
            if let (Value::String(a), Value::String(b)) = (&left, &right) {
                return Ok(Value::String(format!("{a}{b}")));
            }
            numeric_op(op, &left, &right)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => numeric_op(op, &left, &right),
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn numeric_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (Some(a), Some(b)) = (as_number(left), as_number(right)) else {
        return Err(type_mismatch(op_name(op), "numbers", left));
    };
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => unreachable!(),
    };
    Ok(number(out))
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Or => "||",
        BinOp::And => "&&",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
    }
}

fn type_mismatch(op: &'static str, want: &'static str, got: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op,
        want,
        got: type_name(got).to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Deep equality with cross-representation numeric comparison
/// (`1 == 1.0` holds).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            a.as_f64().and_then(|x| b.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// -- registered functions --

fn call_function(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "contains" => contains_fn(args),
        "like" => like_fn(args),
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

/// `contains(haystack, needle)`: substring for strings, deep-equal element
/// for arrays, key presence for objects. Null arguments yield false.
fn contains_fn(args: &[Value]) -> Result<Value, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::Arity("contains", 2));
    }
    let (hay, needle) = (&args[0], &args[1]);
    if hay.is_null() || needle.is_null() {
        return Ok(Value::Bool(false));
    }
    let found = match hay {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => false,
    };
    Ok(Value::Bool(found))
}

/// `like(value, pattern)`: SQL LIKE. `%` matches any run, `_` one character,
/// everything else is literal; anchored at both ends.
fn like_fn(args: &[Value]) -> Result<Value, EvalError> {
    if args.len() != 2 {
        return Err(EvalError::Arity("like", 2));
    }
    let (Value::String(value), Value::String(pattern)) = (&args[0], &args[1]) else {
        return Ok(Value::Bool(false));
    };
    let regex = like_pattern_to_regex(pattern);
    let compiled =
        regex::Regex::new(&regex).map_err(|e| EvalError::BadPattern(e.to_string()))?;
    Ok(Value::Bool(compiled.is_match(value)))
}

fn like_pattern_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let escaped = escaped.replace('%', ".*").replace('_', ".");
    format!("^{escaped}$")
}

// -- lexer --

fn lex(expr: &str) -> Result<Vec<Tok>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(_, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' | '"' => {
                chars.next();
                tokens.push(Tok::Str(lex_string(&mut chars, ch)?));
            }
            c if c.is_ascii_digit() => tokens.push(lex_number(&mut chars)?),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let word = lex_word(&mut chars);
                tokens.push(match word.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(word),
                });
            }
            '=' => {
                chars.next();
                expect_char(&mut chars, '=')?;
                tokens.push(Tok::EqEq);
            }
            '!' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Tok::NotEq);
                } else {
                    tokens.push(Tok::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Tok::Le);
                } else {
                    tokens.push(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek().is_some_and(|&(_, c)| c == '=') {
                    chars.next();
                    tokens.push(Tok::Ge);
                } else {
                    tokens.push(Tok::Gt);
                }
            }
            '&' => {
                chars.next();
                expect_char(&mut chars, '&')?;
                tokens.push(Tok::AndAnd);
            }
            '|' => {
                chars.next();
                expect_char(&mut chars, '|')?;
                tokens.push(Tok::OrOr);
            }
            '+' => {
                chars.next();
                tokens.push(Tok::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Tok::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Tok::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Tok::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Tok::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Tok::Comma);
            }
            other => return Err(EvalError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

fn expect_char(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    want: char,
) -> Result<(), EvalError> {
    match chars.next() {
        Some((_, c)) if c == want => Ok(()),
        Some((_, c)) => Err(EvalError::UnexpectedChar(c)),
        None => Err(EvalError::UnexpectedEnd),
    }
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
) -> Result<String, EvalError> {
    let mut out = String::new();
    while let Some((_, ch)) = chars.next() {
        if ch == quote {
            return Ok(out);
        }
        if ch == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, c)) => out.push(c),
                None => return Err(EvalError::UnterminatedString),
            }
            continue;
        }
        out.push(ch);
    }
    Err(EvalError::UnterminatedString)
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<Tok, EvalError> {
    let mut text = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    text.parse::<f64>()
        .map(Tok::Num)
        .map_err(|_| EvalError::InvalidNumber(text))
}

fn lex_word(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> String {
    let mut word = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

// -- parser (precedence climbing) --

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Ast::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.equality()?;
            lhs = Ast::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Ast, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, EvalError> {
        if self.eat(&Tok::Not) {
            return Ok(Ast::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Tok::Minus) {
            return Ok(Ast::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Ast, EvalError> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Ast::Literal(number(n))),
            Some(Tok::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Tok::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Tok::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.eat(&Tok::RParen) {
                                break;
                            }
                            if !self.eat(&Tok::Comma) {
                                return Err(EvalError::UnexpectedToken(self.pos));
                            }
                        }
                    }
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Var(name))
                }
            }
            Some(Tok::LParen) => {
                let inner = self.or_expr()?;
                if !self.eat(&Tok::RParen) {
                    return Err(EvalError::UnexpectedToken(self.pos));
                }
                Ok(inner)
            }
            Some(_) => Err(EvalError::UnexpectedToken(self.pos - 1)),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}
