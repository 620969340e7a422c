//! Small expression language for `Condition` and `=`-prefixed `VariableSet`.
//!
//! ```text
//! expr   := or
//! or     := and ("||" and)*
//! and    := eq ("&&" eq)*
//! eq     := cmp (("==" | "!=") cmp)*
//! cmp    := sum (("<" | "<=" | ">" | ">=") sum)*
//! sum    := term (("+" | "-") term)*
//! term   := unary (("*" | "/" | "%") unary)*
//! unary  := ("!" | "-") unary | atom
//! atom   := number | string | true | false | name | "(" expr ")"
//! ```

use crate::variables::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticType {
    Bool,
    Number,
    Text,
    /// Depends on a variable's runtime value.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            tokens.push((offset, if c == '(' { Token::LParen } else { Token::RParen }));
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let end = chars.get(i).map_or(src.len(), |(o, _)| *o);
            let literal = &src[offset..end];
            let number = literal.parse::<f64>().map_err(|_| ExprError::Syntax {
                offset: chars[start].0,
                message: format!("invalid number '{literal}'"),
            })?;
            tokens.push((offset, Token::Number(number)));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i].1;
                if ch == '\\' && i + 1 < chars.len() {
                    text.push(chars[i + 1].1);
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(ch);
                i += 1;
            }
            if !closed {
                return Err(ExprError::Syntax {
                    offset,
                    message: "unterminated string".to_string(),
                });
            }
            tokens.push((offset, Token::Str(text)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i;
            while end < chars.len() && (chars[end].1.is_ascii_alphanumeric() || chars[end].1 == '_' || chars[end].1 == '.') {
                end += 1;
            }
            let stop = chars.get(end).map_or(src.len(), |(o, _)| *o);
            tokens.push((offset, Token::Ident(src[offset..stop].to_string())));
            i = end;
            continue;
        }
        let rest = &src[offset..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push((offset, Token::Op(op)));
                i += op.len();
            }
            None => {
                return Err(ExprError::Syntax {
                    offset,
                    message: format!("unexpected character '{c}'"),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some((_, Token::Op(op))) => Some(*op),
            _ => None,
        }
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |(o, _)| *o)
    }

    fn binary(&mut self, ops: &[(&str, BinaryOp)], next: fn(&mut Parser) -> Result<Expr, ExprError>) -> Result<Expr, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op() {
            let Some((_, bin)) = ops.iter().find(|(sym, _)| *sym == op) else {
                break;
            };
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary(*bin, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        self.binary(&[("||", BinaryOp::Or)], Parser::and)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        self.binary(&[("&&", BinaryOp::And)], Parser::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.binary(&[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)], Parser::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        self.binary(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::Ge),
            ],
            Parser::sum,
        )
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        self.binary(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Parser::term)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        self.binary(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Parser::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprError::Syntax {
                offset,
                message: "unexpected end of expression".to_string(),
            });
        };
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                _ => Ok(Expr::Var(name)),
            },
            Token::LParen => {
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some((_, Token::RParen)) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(ExprError::Syntax {
                        offset: self.offset(),
                        message: "expected ')'".to_string(),
                    }),
                }
            }
            Token::RParen => Err(ExprError::Syntax {
                offset,
                message: "unexpected ')'".to_string(),
            }),
            Token::Op(op) => Err(ExprError::Syntax {
                offset,
                message: format!("unexpected operator '{op}'"),
            }),
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: src.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExprError::Syntax {
            offset: parser.offset(),
            message: "unexpected trailing input".to_string(),
        });
    }
    Ok(expr)
}

fn number(value: &Value, op: &str) -> Result<f64, ExprError> {
    value
        .as_number()
        .ok_or_else(|| ExprError::Type(format!("'{op}' expects numbers, got {} '{value}'", value.type_name())))
}

fn boolean(value: &Value, op: &str) -> Result<bool, ExprError> {
    value
        .as_bool()
        .ok_or_else(|| ExprError::Type(format!("'{op}' expects booleans, got {} '{value}'", value.type_name())))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => a.to_string() == b.to_string(),
        },
    }
}

impl Expr {
    pub fn static_type(&self) -> StaticType {
        match self {
            Expr::Literal(Value::Bool(_)) => StaticType::Bool,
            Expr::Literal(Value::Number(_)) => StaticType::Number,
            Expr::Literal(Value::Text(_)) => StaticType::Text,
            Expr::Var(_) => StaticType::Unknown,
            Expr::Unary(UnaryOp::Not, _) => StaticType::Bool,
            Expr::Unary(UnaryOp::Neg, _) => StaticType::Number,
            Expr::Binary(op, left, right) => match op {
                BinaryOp::Or
                | BinaryOp::And
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge => StaticType::Bool,
                BinaryOp::Add => match (left.static_type(), right.static_type()) {
                    (StaticType::Number, StaticType::Number) => StaticType::Number,
                    (StaticType::Text, _) | (_, StaticType::Text) => StaticType::Text,
                    _ => StaticType::Unknown,
                },
                BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => StaticType::Number,
            },
        }
    }

    /// Names of every variable the expression reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => out.push(name),
            Expr::Unary(_, inner) => inner.collect_variables(out),
            Expr::Binary(_, left, right) => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }

    pub fn eval(&self, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => resolve(name).ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!boolean(&inner.eval(resolve)?, "!")?)),
            Expr::Unary(UnaryOp::Neg, inner) => Ok(Value::Number(-number(&inner.eval(resolve)?, "-")?)),
            Expr::Binary(BinaryOp::Or, left, right) => {
                if boolean(&left.eval(resolve)?, "||")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(boolean(&right.eval(resolve)?, "||")?))
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !boolean(&left.eval(resolve)?, "&&")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(boolean(&right.eval(resolve)?, "&&")?))
            }
            Expr::Binary(op, left, right) => {
                let a = left.eval(resolve)?;
                let b = right.eval(resolve)?;
                binary(*op, &a, &b)
            }
        }
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    let value = match op {
        BinaryOp::Eq => Value::Bool(loose_eq(a, b)),
        BinaryOp::Ne => Value::Bool(!loose_eq(a, b)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => match (a, b) {
                    (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
                    _ => None,
                },
            }
            .ok_or_else(|| ExprError::Type(format!("cannot compare '{a}' with '{b}'")))?;
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Add => match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::Text(_), _) | (_, Value::Text(_)) => Value::Text(format!("{a}{b}")),
            _ => Value::Number(number(a, "+")? + number(b, "+")?),
        },
        BinaryOp::Sub => Value::Number(number(a, "-")? - number(b, "-")?),
        BinaryOp::Mul => Value::Number(number(a, "*")? * number(b, "*")?),
        BinaryOp::Div | BinaryOp::Rem => {
            let divisor = number(b, "/")?;
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            let dividend = number(a, "/")?;
            Value::Number(if op == BinaryOp::Div {
                dividend / divisor
            } else {
                dividend % divisor
            })
        }
        BinaryOp::Or | BinaryOp::And => unreachable!("logical operators short-circuit in eval"),
    };
    Ok(value)
}
