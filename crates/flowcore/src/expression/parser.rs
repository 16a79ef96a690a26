//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, lowest first: `||`, `&&`, equality, comparison, additive,
//! multiplicative, unary, postfix (`.field`, `[index]`, calls).

use super::lexer::{Lexer, Token, TokenKind};
use crate::{ExpressionError, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    /// Root identifier followed by field/index accessors
    Path(String, Vec<Accessor>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Field(String),
    Index(Box<Expr>),
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

pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    if src.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, idx: 0 };
    let expr = parser.or()?;
    parser.expect(&TokenKind::Eof, "end of expression")?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.idx.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ExpressionError> {
        if &self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ExpressionError {
        let token = self.peek();
        ExpressionError::UnexpectedToken {
            expected: expected.to_string(),
            found: token.kind.to_string(),
            pos: token.pos,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.eat(kind) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[(TokenKind::OrOr, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[(TokenKind::AndAnd, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::NotEq, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Ge, BinaryOp::Ge),
                (TokenKind::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&TokenKind::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&TokenKind::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::LParen => {
                let inner = self.or()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let items = self.list(&TokenKind::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let args = self.list(&TokenKind::RParen, "')'")?;
                    return Ok(Expr::Call(name, args));
                }
                let accessors = self.accessors()?;
                Ok(Expr::Path(name, accessors))
            }
            other => Err(ExpressionError::UnexpectedToken {
                expected: "value".to_string(),
                found: other.to_string(),
                pos: token.pos,
            }),
        }
    }

    fn accessors(&mut self) -> Result<Vec<Accessor>, ExpressionError> {
        let mut accessors = Vec::new();
        loop {
            if self.eat(&TokenKind::Dot) {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(field) => accessors.push(Accessor::Field(field)),
                    // `items.0` reads naturally in templates
                    TokenKind::Number(n) if n.fract() == 0.0 => {
                        accessors.push(Accessor::Index(Box::new(Expr::Literal(Value::Number(n)))))
                    }
                    other => {
                        return Err(ExpressionError::UnexpectedToken {
                            expected: "field name".to_string(),
                            found: other.to_string(),
                            pos: token.pos,
                        })
                    }
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.or()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                accessors.push(Accessor::Index(Box::new(index)));
            } else {
                return Ok(accessors);
            }
        }
    }

    fn list(&mut self, close: &TokenKind, expected: &str) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.or()?);
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(&TokenKind::Comma) {
                return Err(self.unexpected(expected));
            }
        }
    }
}
