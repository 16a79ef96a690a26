//! Tokenizer for interpolation expressions.

use crate::ExpressionError;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {}", n),
            Self::Str(s) => write!(f, "string '{}'", s),
            Self::Ident(name) => write!(f, "identifier '{}'", name),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Null => write!(f, "null"),
            Self::LParen => write!(f, "'('"),
            Self::RParen => write!(f, "')'"),
            Self::LBracket => write!(f, "'['"),
            Self::RBracket => write!(f, "']'"),
            Self::Comma => write!(f, "','"),
            Self::Dot => write!(f, "'.'"),
            Self::Plus => write!(f, "'+'"),
            Self::Minus => write!(f, "'-'"),
            Self::Star => write!(f, "'*'"),
            Self::Slash => write!(f, "'/'"),
            Self::Percent => write!(f, "'%'"),
            Self::Bang => write!(f, "'!'"),
            Self::EqEq => write!(f, "'=='"),
            Self::NotEq => write!(f, "'!='"),
            Self::Lt => write!(f, "'<'"),
            Self::Le => write!(f, "'<='"),
            Self::Gt => write!(f, "'>'"),
            Self::Ge => write!(f, "'>='"),
            Self::AndAnd => write!(f, "'&&'"),
            Self::OrOr => write!(f, "'||'"),
            Self::Eof => write!(f, "end of expression"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source
    pub pos: usize,
}

pub struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    idx: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            idx: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let Some((pos, ch)) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos: self.src.len(),
                });
                return Ok(tokens);
            };

            let kind = match ch {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                ',' => self.single(TokenKind::Comma),
                '.' => self.single(TokenKind::Dot),
                '+' => self.single(TokenKind::Plus),
                '-' => self.single(TokenKind::Minus),
                '*' => self.single(TokenKind::Star),
                '/' => self.single(TokenKind::Slash),
                '%' => self.single(TokenKind::Percent),
                '!' => self.one_or_two('=', TokenKind::Bang, TokenKind::NotEq),
                '<' => self.one_or_two('=', TokenKind::Lt, TokenKind::Le),
                '>' => self.one_or_two('=', TokenKind::Gt, TokenKind::Ge),
                '=' => self.pair('=', TokenKind::EqEq, pos, ch)?,
                '&' => self.pair('&', TokenKind::AndAnd, pos, ch)?,
                '|' => self.pair('|', TokenKind::OrOr, pos, ch)?,
                '\'' | '"' => self.string(ch, pos)?,
                c if c.is_ascii_digit() => self.number(pos)?,
                c if c.is_alphabetic() || c == '_' || c == '$' => self.ident(),
                other => return Err(ExpressionError::UnexpectedChar { ch: other, pos }),
            };
            tokens.push(Token { kind, pos });
        }
    }

    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.idx).copied()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.idx + offset).map(|(_, c)| *c)
    }

    fn skip_whitespace(&mut self) {
        while let Some((_, c)) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.idx += 1;
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.idx += 1;
        kind
    }

    fn one_or_two(&mut self, next: char, one: TokenKind, two: TokenKind) -> TokenKind {
        if self.peek_char_at(1) == Some(next) {
            self.idx += 2;
            two
        } else {
            self.idx += 1;
            one
        }
    }

    fn pair(
        &mut self,
        next: char,
        kind: TokenKind,
        pos: usize,
        ch: char,
    ) -> Result<TokenKind, ExpressionError> {
        if self.peek_char_at(1) == Some(next) {
            self.idx += 2;
            Ok(kind)
        } else {
            Err(ExpressionError::UnexpectedChar { ch, pos })
        }
    }

    fn string(&mut self, quote: char, start: usize) -> Result<TokenKind, ExpressionError> {
        self.idx += 1;
        let mut out = String::new();
        while let Some((_, c)) = self.peek() {
            self.idx += 1;
            match c {
                c if c == quote => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let Some((_, escaped)) = self.peek() else {
                        break;
                    };
                    self.idx += 1;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }
        Err(ExpressionError::UnterminatedString { pos: start })
    }

    fn number(&mut self, start: usize) -> Result<TokenKind, ExpressionError> {
        let mut end = start;
        let mut seen_dot = false;
        while let Some((pos, c)) = self.peek() {
            if c.is_ascii_digit() {
                end = pos + 1;
                self.idx += 1;
            } else if c == '.'
                && !seen_dot
                && self.peek_char_at(1).is_some_and(|n| n.is_ascii_digit())
            {
                seen_dot = true;
                end = pos + 1;
                self.idx += 1;
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ExpressionError::UnexpectedToken {
                expected: "number".to_string(),
                found: text.to_string(),
                pos: start,
            })
    }

    fn ident(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some((_, c)) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' || c == '-' && self.dash_continues_ident() {
                name.push(c);
                self.idx += 1;
            } else {
                break;
            }
        }
        match name.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(name),
        }
    }

    /// Node ids such as `fetch-user` may contain dashes; `a - b` (spaced) stays subtraction.
    fn dash_continues_ident(&self) -> bool {
        self.peek_char_at(1)
            .is_some_and(|n| n.is_alphabetic() || n == '_')
    }
}
