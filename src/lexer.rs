use thiserror::Error;

use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("Unexpected character '{character}' at {span}")]
    UnexpectedCharacter { character: char, span: Span },
    #[error("Unterminated string literal at {span}")]
    UnterminatedString { span: Span },
    #[error("Invalid number literal '{literal}' at {span}")]
    InvalidNumber { literal: String, span: Span },
}

pub type LexResult<T> = Result<T, LexError>;

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    /// Depth of open `(`/`[`/`{` pairs; newlines are suppressed inside.
    nesting: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            nesting: 0,
            tokens: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> LexResult<Vec<Token>> {
        while self.pos < self.chars.len() {
            self.skip_whitespace();

            let Some(ch) = self.peek_char() else { break };

            if ch == '#' {
                self.skip_comment();
                continue;
            }

            if ch == '\n' {
                let span = self.span();
                self.advance();
                self.push_newline(span);
                continue;
            }

            if ch.is_ascii_digit() {
                let token = self.read_number()?;
                self.tokens.push(token);
                continue;
            }

            if ch == '"' || ch == '\'' {
                let token = self.read_string(ch)?;
                self.tokens.push(token);
                continue;
            }

            if ch.is_alphabetic() || ch == '_' {
                let token = self.read_identifier();
                self.tokens.push(token);
                continue;
            }

            let token = self.read_operator(ch)?;
            self.tokens.push(token);
        }

        self.tokens.push(Token::new(TokenKind::Eof, self.span()));
        Ok(self.tokens)
    }

    /// Consecutive newlines collapse into one token; newlines inside open
    /// brackets are dropped entirely.
    fn push_newline(&mut self, span: Span) {
        if self.nesting > 0 {
            return;
        }
        if matches!(self.tokens.last().map(|token| &token.kind), Some(TokenKind::Newline) | None) {
            return;
        }
        self.tokens.push(Token::new(TokenKind::Newline, span));
    }

    fn read_number(&mut self) -> LexResult<Token> {
        let span = self.span();
        let mut literal = String::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() {
                literal.push(ch);
                self.advance();
            } else if ch == '.' && !literal.contains('.') && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit()) {
                literal.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.peek_char(), Some('e') | Some('E')) {
            literal.push('e');
            self.advance();
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                literal.push(self.peek_char().unwrap());
                self.advance();
            }
            let mut exponent_digits = false;
            while let Some(ch) = self.peek_char() {
                if !ch.is_ascii_digit() {
                    break;
                }
                literal.push(ch);
                exponent_digits = true;
                self.advance();
            }
            if !exponent_digits {
                return Err(LexError::InvalidNumber { literal, span });
            }
        }

        let value = literal
            .parse::<f64>()
            .map_err(|_| LexError::InvalidNumber {
                literal: literal.clone(),
                span,
            })?;
        Ok(Token::new(TokenKind::Number(value), span))
    }

    fn read_string(&mut self, quote: char) -> LexResult<Token> {
        let span = self.span();
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            let Some(ch) = self.peek_char() else {
                return Err(LexError::UnterminatedString { span });
            };
            if ch == quote {
                self.advance();
                return Ok(Token::new(TokenKind::Str(value), span));
            }
            if ch == '\\' {
                self.advance();
                let Some(escaped) = self.peek_char() else {
                    return Err(LexError::UnterminatedString { span });
                };
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other, // covers \\ \" \' and passes others through
                });
                self.advance();
            } else {
                value.push(ch);
                self.advance();
            }
        }
    }

    fn read_identifier(&mut self) -> Token {
        let span = self.span();
        let mut ident = String::new();
        while let Some(ch) = self.peek_char() {
            if !ch.is_alphanumeric() && ch != '_' {
                break;
            }
            ident.push(ch);
            self.advance();
        }
        let kind = TokenKind::keyword(&ident).unwrap_or(TokenKind::Identifier(ident));
        Token::new(kind, span)
    }

    /// Longest match wins: two-character operators are checked before their
    /// single-character prefixes.
    fn read_operator(&mut self, ch: char) -> LexResult<Token> {
        let span = self.span();
        self.advance();

        let kind = match ch {
            '+' => self.with_eq(TokenKind::PlusAssign, TokenKind::Plus),
            '-' => {
                if self.peek_char() == Some('>') {
                    self.advance();
                    TokenKind::Arrow
                } else {
                    self.with_eq(TokenKind::MinusAssign, TokenKind::Minus)
                }
            }
            '*' => self.with_eq(TokenKind::StarAssign, TokenKind::Star),
            '/' => self.with_eq(TokenKind::SlashAssign, TokenKind::Slash),
            '%' => TokenKind::Percent,
            '^' => TokenKind::Caret,
            '=' => self.with_eq(TokenKind::EqEq, TokenKind::Assign),
            '<' => self.with_eq(TokenKind::LessEq, TokenKind::Less),
            '>' => self.with_eq(TokenKind::GreaterEq, TokenKind::Greater),
            '!' => {
                if self.peek_char() == Some('=') {
                    self.advance();
                    TokenKind::NotEq
                } else {
                    return Err(LexError::UnexpectedCharacter { character: ch, span });
                }
            }
            '(' => {
                self.nesting += 1;
                TokenKind::LParen
            }
            ')' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RParen
            }
            '{' => {
                self.nesting += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RBrace
            }
            '[' => {
                self.nesting += 1;
                TokenKind::LBracket
            }
            ']' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RBracket
            }
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            other => {
                return Err(LexError::UnexpectedCharacter {
                    character: other,
                    span,
                });
            }
        };
        Ok(Token::new(kind, span))
    }

    fn with_eq(&mut self, combined: TokenKind, single: TokenKind) -> TokenKind {
        if self.peek_char() == Some('=') {
            self.advance();
            combined
        } else {
            single
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(' ') | Some('\t') | Some('\r')) {
            self.advance();
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.pos += 1;
        }
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.column)
    }
}

pub fn tokenize(source: &str) -> LexResult<Vec<Token>> {
    Lexer::new(source).tokenize()
}
