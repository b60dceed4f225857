//! Policy DSL tokenizer.

use std::fmt;

use crate::error::ParseError;
use crate::span::{Location, Range};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    BraceOpen,
    BraceClose,
    Semicolon,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Allow,
    Deny,
    Require,
    Module,
    Label,
    Labels,
    Type,
    True,
    False,
    Identifier,
    String,
    Integer,
    EndOfFile,
}

impl TokenKind {
    /// Keyword for an identifier-shaped word, if it is one.
    fn keyword(word: &str) -> Option<Self> {
        Some(match word {
            "allow" => Self::Allow,
            "deny" => Self::Deny,
            "require" => Self::Require,
            "module" => Self::Module,
            "label" => Self::Label,
            "labels" => Self::Labels,
            "type" => Self::Type,
            "true" => Self::True,
            "false" => Self::False,
            _ => return None,
        })
    }

    const fn punctuation(c: char) -> Option<Self> {
        Some(match c {
            '{' => Self::BraceOpen,
            '}' => Self::BraceClose,
            ';' => Self::Semicolon,
            ',' => Self::Comma,
            '+' => Self::Plus,
            '-' => Self::Minus,
            '*' => Self::Star,
            '/' => Self::Slash,
            '%' => Self::Percent,
            _ => return None,
        })
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BraceOpen => "'{'",
            Self::BraceClose => "'}'",
            Self::Semicolon => "';'",
            Self::Comma => "','",
            Self::Plus => "'+'",
            Self::Minus => "'-'",
            Self::Star => "'*'",
            Self::Slash => "'/'",
            Self::Percent => "'%'",
            Self::Allow => "'allow'",
            Self::Deny => "'deny'",
            Self::Require => "'require'",
            Self::Module => "'module'",
            Self::Label => "'label'",
            Self::Labels => "'labels'",
            Self::Type => "'type'",
            Self::True => "'true'",
            Self::False => "'false'",
            Self::Identifier => "identifier",
            Self::String => "string literal",
            Self::Integer => "integer literal",
            Self::EndOfFile => "end of file",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Literal text; unescaped contents for strings, digits for integers.
    pub value: String,
    pub range: Range,
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn location(&mut self) -> Location {
        let offset = self
            .chars
            .peek()
            .map_or(self.source.len(), |(offset, _)| *offset);
        Location::new(offset, self.line, self.column)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        match c {
            '\n' => {
                self.line += 1;
                self.column = 1;
            }
            // A lone CR is a line break; CRLF counts once, on the LF.
            '\r' if self.peek() != Some('\n') => {
                self.line += 1;
                self.column = 1;
            }
            '\r' => {}
            _ => self.column += 1,
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn token(&mut self, kind: TokenKind, value: String, start: Location) -> Token {
        Token {
            kind,
            value,
            range: Range::new(start, self.location()),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let start = self.location();

            let Some(c) = self.peek() else {
                tokens.push(self.token(TokenKind::EndOfFile, "EOF".into(), start));
                return Ok(tokens);
            };

            if let Some(kind) = TokenKind::punctuation(c) {
                self.bump();
                tokens.push(self.token(kind, c.to_string(), start));
            } else if c == '"' || c == '\'' {
                let value = self.string(c)?;
                tokens.push(self.token(TokenKind::String, value, start));
            } else if c.is_ascii_digit() {
                let mut digits = String::new();
                while let Some(d) = self.peek().filter(char::is_ascii_digit) {
                    digits.push(d);
                    self.bump();
                }
                tokens.push(self.token(TokenKind::Integer, digits, start));
            } else if is_identifier_start(c) {
                let mut word = String::new();
                while let Some(w) = self.peek().filter(|w| is_identifier_part(*w)) {
                    word.push(w);
                    self.bump();
                }
                let kind = TokenKind::keyword(&word).unwrap_or(TokenKind::Identifier);
                tokens.push(self.token(kind, word, start));
            } else {
                self.bump();
                return Err(ParseError::new(
                    format!("Unexpected character '{}'", c.escape_debug()),
                    Range::new(start, self.location()),
                ));
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ParseError> {
        let start = self.location();
        self.bump();
        let mut value = String::new();

        loop {
            let escape_start = self.location();
            match self.bump() {
                None => {
                    return Err(ParseError::new(
                        "Unterminated string literal",
                        Range::new(start, self.location()),
                    ));
                }
                Some(c) if c == quote => return Ok(value),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('r') => '\r',
                        Some('t') => '\t',
                        Some('f') => '\u{000C}',
                        Some('v') => '\u{000B}',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some('\\') => '\\',
                        Some(other) => {
                            return Err(ParseError::new(
                                format!("Invalid escape sequence: '\\{}'", other.escape_debug()),
                                Range::new(escape_start, self.location()),
                            ));
                        }
                        None => {
                            return Err(ParseError::new(
                                "Unterminated string literal",
                                Range::new(start, self.location()),
                            ));
                        }
                    };
                    value.push(escaped);
                }
                Some(c) => value.push(c),
            }
        }
    }
}

const fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

const fn is_identifier_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Tokenize policy source. The result always ends with
/// [`TokenKind::EndOfFile`].
pub fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).run()
}
