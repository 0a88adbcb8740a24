//! Tokenizer for the pattern source language
//!
//! The surface syntax is a small expression language: function calls with
//! string/number arguments and chained method calls, e.g.
//! `s("bd sd").gain(0.8).lpf(1200)`. Tokens carry line/column so syntax
//! errors can point at the offending spot.

use super::PatternError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    /// String literal content, quotes stripped
    Str(String),
    LParen,
    RParen,
    Dot,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, PatternError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1u32;
    let mut column = 1u32;

    while let Some(&c) = chars.peek() {
        let (tok_line, tok_column) = (line, column);

        match c {
            '\n' => {
                chars.next();
                line += 1;
                column = 1;
            }
            c if c.is_whitespace() => {
                chars.next();
                column += 1;
            }
            '(' => {
                chars.next();
                column += 1;
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    line: tok_line,
                    column: tok_column,
                });
            }
            ')' => {
                chars.next();
                column += 1;
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    line: tok_line,
                    column: tok_column,
                });
            }
            '.' => {
                chars.next();
                column += 1;
                tokens.push(Token {
                    kind: TokenKind::Dot,
                    line: tok_line,
                    column: tok_column,
                });
            }
            ',' => {
                chars.next();
                column += 1;
                tokens.push(Token {
                    kind: TokenKind::Comma,
                    line: tok_line,
                    column: tok_column,
                });
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                column += 1;
                let mut content = String::new();
                let mut closed = false;
                while let Some(&c) = chars.peek() {
                    chars.next();
                    if c == '\n' {
                        line += 1;
                        column = 1;
                    } else {
                        column += 1;
                    }
                    if c == quote {
                        closed = true;
                        break;
                    }
                    content.push(c);
                }
                if !closed {
                    return Err(PatternError::UnexpectedEof);
                }
                tokens.push(Token {
                    kind: TokenKind::Str(content),
                    line: tok_line,
                    column: tok_column,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                column += 1;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        // A dot followed by a letter is a method chain, not
                        // a decimal point
                        if c == '.' {
                            let mut ahead = chars.clone();
                            ahead.next();
                            if !ahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                                break;
                            }
                        }
                        text.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                let value: f64 = text.parse().map_err(|_| PatternError::UnexpectedToken {
                    found: text.clone(),
                    line: tok_line,
                    column: tok_column,
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    line: tok_line,
                    column: tok_column,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(name),
                    line: tok_line,
                    column: tok_column,
                });
            }
            other => {
                return Err(PatternError::UnexpectedChar {
                    found: other,
                    line: tok_line,
                    column: tok_column,
                });
            }
        }
    }

    Ok(tokens)
}
