//! Restricted arithmetic for `custom` backoff formulas
//!
//! Formulas are parsed once into an AST and evaluated against two
//! variables. Nothing outside this grammar is accepted:
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/") unary)*
//! unary   := ("-" | "+") unary | primary
//! primary := NUMBER | "attempt" | "baseDelay"
//!          | func "(" expr ("," expr)* ")"
//!          | "(" expr ")"
//! func    := ["Math."] ("pow" | "log" | "sqrt")
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Longest accepted formula source, in bytes
pub const MAX_SOURCE_LEN: usize = 1024;

/// Deepest accepted nesting of parentheses, calls and unary signs
pub const MAX_DEPTH: usize = 64;

/// Parse or evaluation failure of a formula
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,

    #[error("formula is {len} bytes, limit is {}", MAX_SOURCE_LEN)]
    TooLong { len: usize },

    #[error("formula nests deeper than {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unexpected {found} at {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("{func} takes {expected} argument(s), got {found}")]
    Arity {
        func: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("formula evaluated to a non-finite value ({0})")]
    NonFinite(f64),
}

/// Variables available to a formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormulaVars {
    pub attempt: f64,
    pub base_delay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Attempt,
    BaseDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Pow,
    Log,
    Sqrt,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name.strip_prefix("Math.").unwrap_or(name) {
            "pow" => Some(Self::Pow),
            "log" => Some(Self::Log),
            "sqrt" => Some(Self::Sqrt),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pow => "pow",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Pow => 2,
            Self::Log | Self::Sqrt => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var(Var),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    fn eval(&self, vars: &FormulaVars) -> f64 {
        match self {
            Self::Num(n) => *n,
            Self::Var(Var::Attempt) => vars.attempt,
            Self::Var(Var::BaseDelay) => vars.base_delay,
            Self::Neg(inner) => -inner.eval(vars),
            Self::Binary(op, lhs, rhs) => {
                let (l, r) = (lhs.eval(vars), rhs.eval(vars));
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                }
            }
            Self::Call(func, args) => match func {
                Func::Pow => args[0].eval(vars).powf(args[1].eval(vars)),
                Func::Log => args[0].eval(vars).ln(),
                Func::Sqrt => args[0].eval(vars).sqrt(),
            },
        }
    }
}

// ── Tokenizer ──

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "number {}", n),
            Self::Ident(s) => write!(f, "identifier '{}'", s),
            Self::Plus => write!(f, "'+'"),
            Self::Minus => write!(f, "'-'"),
            Self::Star => write!(f, "'*'"),
            Self::Slash => write!(f, "'/'"),
            Self::LParen => write!(f, "'('"),
            Self::RParen => write!(f, "')'"),
            Self::Comma => write!(f, "','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let start = i;
        let token = match ch {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            c if c.is_ascii_digit() || c == '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError::UnexpectedChar { ch, pos: start })?;
                tokens.push((Token::Num(value), start));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
                continue;
            }
            _ => return Err(FormulaError::UnexpectedChar { ch, pos: start }),
        };
        tokens.push((token, start));
        i += 1;
    }
    Ok(tokens)
}

// ── Parser ──

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        match self.bump() {
            Some((token, _)) if token == expected => Ok(()),
            Some((token, pos)) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                pos,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.depth >= MAX_DEPTH {
            return Err(FormulaError::TooDeep);
        }
        self.depth += 1;
        let result = self.signed();
        self.depth -= 1;
        result
    }

    fn signed(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let (token, pos) = self.bump().ok_or(FormulaError::UnexpectedEnd)?;
        match token {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "attempt" => Ok(Expr::Var(Var::Attempt)),
                "baseDelay" => Ok(Expr::Var(Var::BaseDelay)),
                _ => {
                    let func =
                        Func::lookup(&name).ok_or(FormulaError::UnknownIdentifier(name))?;
                    self.call(func)
                }
            },
            other => Err(FormulaError::UnexpectedToken {
                found: other.to_string(),
                pos,
            }),
        }
    }

    fn call(&mut self, func: Func) -> Result<Expr, FormulaError> {
        self.expect(Token::LParen)?;
        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect(Token::RParen)?;
        if args.len() != func.arity() {
            return Err(FormulaError::Arity {
                func: func.name(),
                expected: func.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call(func, args))
    }
}

/// A parsed formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    ast: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(FormulaError::TooLong { len: source.len() });
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let ast = parser.expr()?;
        if let Some((token, pos)) = parser.bump() {
            return Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                pos,
            });
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate; NaN and infinities are errors
    pub fn eval(&self, vars: FormulaVars) -> Result<f64, FormulaError> {
        let value = self.ast.eval(&vars);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FormulaError::NonFinite(value))
        }
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
