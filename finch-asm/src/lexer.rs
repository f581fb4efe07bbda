//! Tokenizer shared by both assembler passes
//!
//! Produces typed tokens with 1-based line and column positions.  Newlines
//! are significant (statements end at them); whitespace and `;` comments are
//! not.  A single token of pushback is enough for the statement grammar.

use crate::{Error, ErrorKind};

/// A lexical token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Identifier or mnemonic; starts with a letter or `_`
    Ident(String),
    /// Integer literal: decimal, `0x` hex, or `0b` binary
    Number(i64),
    /// String literal contents, quotes stripped, escapes applied
    Str(Vec<u8>),
    /// Character literal value
    Char(u8),
    Comma,
    Colon,
    LBracket,
    RBracket,
    Dot,
    Plus,
    Minus,
    Star,
    /// End of a source line
    Newline,
    /// End of input
    Eof,
}

/// A token plus where it started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub tok: Token,
    /// 1-based source line
    pub line: u32,
    /// 1-based column of the token's first byte
    pub col: u32,
}

/// Byte-oriented lexer with one token of pushback
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    pushback: Option<Spanned>,
}

impl<'a> Lexer<'a> {
    /// Builds a lexer over the full source text
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            pushback: None,
        }
    }

    /// Returns a token to be handed out again by the next [`Lexer::next`]
    pub fn push_back(&mut self, t: Spanned) {
        debug_assert!(self.pushback.is_none());
        self.pushback = Some(t);
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn error(&self, kind: ErrorKind, line: u32, col: u32, msg: &str) -> Error {
        Error::new(kind, line, col, msg)
    }

    /// Produces the next token
    ///
    /// Lexical errors (unterminated literals, malformed numbers, stray
    /// bytes) are reported with the position where the offending token
    /// started; the lexer stays usable afterwards.
    pub fn next(&mut self) -> Result<Spanned, Error> {
        if let Some(t) = self.pushback.take() {
            return Ok(t);
        }

        // skip whitespace and comments, but not newlines
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b';') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let col = self.col;
        let spanned = |tok| Spanned { tok, line, col };

        let Some(b) = self.bump() else {
            return Ok(spanned(Token::Eof));
        };

        let tok = match b {
            b'\n' => Token::Newline,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b'.' => Token::Dot,
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'"' => self.string(line, col)?,
            b'\'' => self.char_literal(line, col)?,
            b'0'..=b'9' => self.number(b, line, col)?,
            b if b.is_ascii_alphabetic() || b == b'_' => self.ident(b),
            other => {
                return Err(self.error(
                    ErrorKind::UnexpectedToken,
                    line,
                    col,
                    &format!("unexpected character {:?}", char::from(other)),
                ))
            }
        };
        Ok(spanned(tok))
    }

    fn ident(&mut self, first: u8) -> Token {
        let mut name = String::new();
        name.push(char::from(first));
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                name.push(char::from(b));
                self.bump();
            } else {
                break;
            }
        }
        Token::Ident(name)
    }

    fn number(&mut self, first: u8, line: u32, col: u32) -> Result<Token, Error> {
        let (radix, mut digits) = if first == b'0'
            && matches!(self.peek_byte(), Some(b'x') | Some(b'X'))
        {
            self.bump();
            (16, String::new())
        } else if first == b'0'
            && matches!(self.peek_byte(), Some(b'b') | Some(b'B'))
        {
            self.bump();
            (2, String::new())
        } else {
            (10, String::from(char::from(first)))
        };

        while let Some(b) = self.peek_byte() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                digits.push(char::from(b));
                self.bump();
            } else {
                break;
            }
        }
        let digits = digits.replace('_', "");
        match i64::from_str_radix(&digits, radix) {
            Ok(v) => Ok(Token::Number(v)),
            Err(_) => Err(self.error(
                ErrorKind::NumberOutOfRange,
                line,
                col,
                &format!("invalid numeric literal with radix {radix}"),
            )),
        }
    }

    fn string(&mut self, line: u32, col: u32) -> Result<Token, Error> {
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(self.error(
                        ErrorKind::UnterminatedString,
                        line,
                        col,
                        "unterminated string literal",
                    ))
                }
                Some(b'"') => break,
                Some(b'\\') => {
                    // pass the escaped byte through verbatim
                    match self.bump() {
                        Some(b) if b != b'\n' => out.push(b),
                        _ => {
                            return Err(self.error(
                                ErrorKind::UnterminatedString,
                                line,
                                col,
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                Some(b) => out.push(b),
            }
        }
        Ok(Token::Str(out))
    }

    fn char_literal(&mut self, line: u32, col: u32) -> Result<Token, Error> {
        let err = |s: &Self, msg: &str| {
            s.error(ErrorKind::UnterminatedString, line, col, msg)
        };
        let v = match self.bump() {
            None | Some(b'\n') => {
                return Err(err(self, "unterminated character literal"))
            }
            Some(b'\\') => match self.bump() {
                Some(b'n') => b'\n',
                Some(b'r') => b'\r',
                Some(b't') => b'\t',
                Some(b'0') => 0,
                Some(b'\\') => b'\\',
                Some(b'\'') => b'\'',
                _ => {
                    return Err(self.error(
                        ErrorKind::UnexpectedToken,
                        line,
                        col,
                        "unknown character escape",
                    ))
                }
            },
            Some(b) => b,
        };
        match self.bump() {
            Some(b'\'') => Ok(Token::Char(v)),
            _ => Err(err(self, "unterminated character literal")),
        }
    }
}
