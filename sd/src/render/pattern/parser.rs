//! Parser: source expressions and mini-notation
//!
//! Two layers. The outer expression parser handles calls and chains
//! (`s("...")`, `note("...")`, `stack(...)`, `.gain(x)`, `.fast(n)`). The
//! inner mini-notation parser turns a pattern string like
//! `"bd [sd sd] <hh oh> bd*2 ~"` into the pattern AST.

use super::fraction::Fraction;
use super::lexer::{tokenize, Token, TokenKind};
use super::pattern::Pattern;
use super::value::{Control, EventValue};
use super::PatternError;

/// Parse a full pattern source expression
pub fn parse_source(source: &str) -> Result<Pattern, PatternError> {
    let tokens = tokenize(source)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let pattern = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        let tok = &parser.tokens[parser.pos];
        return Err(PatternError::UnexpectedToken {
            found: describe(&tok.kind),
            line: tok.line,
            column: tok.column,
        });
    }
    Ok(pattern)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => name.clone(),
        TokenKind::Number(n) => n.to_string(),
        TokenKind::Str(s) => format!("\"{}\"", s),
        TokenKind::LParen => "(".to_string(),
        TokenKind::RParen => ")".to_string(),
        TokenKind::Dot => ".".to_string(),
        TokenKind::Comma => ",".to_string(),
    }
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token, PatternError> {
        let tok = self.tokens.get(self.pos).ok_or(PatternError::UnexpectedEof)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), PatternError> {
        let tok = self.next()?;
        if &tok.kind == kind {
            Ok(())
        } else {
            Err(PatternError::UnexpectedToken {
                found: describe(&tok.kind),
                line: tok.line,
                column: tok.column,
            })
        }
    }

    fn parse_expression(&mut self) -> Result<Pattern, PatternError> {
        let mut pattern = self.parse_primary()?;

        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Dot)) {
            self.next()?;
            pattern = self.parse_method(pattern)?;
        }

        Ok(pattern)
    }

    fn parse_primary(&mut self) -> Result<Pattern, PatternError> {
        let tok = self.next()?.clone();
        let (name, line, column) = match &tok.kind {
            TokenKind::Ident(name) => (name.clone(), tok.line, tok.column),
            other => {
                return Err(PatternError::UnexpectedToken {
                    found: describe(other),
                    line: tok.line,
                    column: tok.column,
                });
            }
        };

        match name.as_str() {
            "s" | "sound" => {
                let (content, str_tok) = self.string_argument()?;
                parse_mini(&content, AtomMode::Sample, str_tok.line, str_tok.column)
            }
            "note" => {
                let (content, str_tok) = self.string_argument()?;
                parse_mini(&content, AtomMode::Note, str_tok.line, str_tok.column)
            }
            "stack" => {
                self.expect(&TokenKind::LParen)?;
                let mut layers = vec![self.parse_expression()?];
                while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
                    self.next()?;
                    layers.push(self.parse_expression()?);
                }
                self.expect(&TokenKind::RParen)?;
                Ok(Pattern::Stack(layers))
            }
            "silence" => {
                // Bare identifier or an empty call
                if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
                    self.next()?;
                    self.expect(&TokenKind::RParen)?;
                }
                Ok(Pattern::Silence)
            }
            _ => Err(PatternError::UnknownFunction { name, line, column }),
        }
    }

    fn parse_method(&mut self, inner: Pattern) -> Result<Pattern, PatternError> {
        let tok = self.next()?.clone();
        let (name, line, column) = match &tok.kind {
            TokenKind::Ident(name) => (name.clone(), tok.line, tok.column),
            other => {
                return Err(PatternError::UnexpectedToken {
                    found: describe(other),
                    line: tok.line,
                    column: tok.column,
                });
            }
        };

        let value = self.number_argument()?;

        let pattern = match name.as_str() {
            "gain" => Pattern::Control(Control::Gain(value), Box::new(inner)),
            "pan" => Pattern::Control(Control::Pan(value), Box::new(inner)),
            "lpf" | "cutoff" => Pattern::Control(Control::Lpf(value), Box::new(inner)),
            "hpf" => Pattern::Control(Control::Hpf(value), Box::new(inner)),
            "room" => Pattern::Control(Control::Room(value), Box::new(inner)),
            "delay" => Pattern::Control(Control::Delay(value), Box::new(inner)),
            "attack" => Pattern::Control(Control::Attack(value), Box::new(inner)),
            "decay" => Pattern::Control(Control::Decay(value), Box::new(inner)),
            "sustain" => Pattern::Control(Control::Sustain(value), Box::new(inner)),
            "release" => Pattern::Control(Control::Release(value), Box::new(inner)),
            "fast" => Pattern::Fast(Fraction::from_f64(value), Box::new(inner)),
            "slow" => Pattern::Slow(Fraction::from_f64(value), Box::new(inner)),
            _ => return Err(PatternError::UnknownFunction { name, line, column }),
        };
        Ok(pattern)
    }

    fn string_argument(&mut self) -> Result<(String, Token), PatternError> {
        self.expect(&TokenKind::LParen)?;
        let tok = self.next()?.clone();
        let content = match &tok.kind {
            TokenKind::Str(content) => content.clone(),
            other => {
                return Err(PatternError::UnexpectedToken {
                    found: describe(other),
                    line: tok.line,
                    column: tok.column,
                });
            }
        };
        self.expect(&TokenKind::RParen)?;
        Ok((content, tok))
    }

    fn number_argument(&mut self) -> Result<f64, PatternError> {
        self.expect(&TokenKind::LParen)?;
        let tok = self.next()?.clone();
        let value = match tok.kind {
            TokenKind::Number(n) => n,
            other => {
                return Err(PatternError::UnexpectedToken {
                    found: describe(&other),
                    line: tok.line,
                    column: tok.column,
                });
            }
        };
        self.expect(&TokenKind::RParen)?;
        Ok(value)
    }
}

/// How bare words inside mini-notation are interpreted
#[derive(Debug, Clone, Copy, PartialEq)]
enum AtomMode {
    /// `bd`, `sd:2`
    Sample,
    /// `c3`, `e#4`, `60`
    Note,
}

struct MiniParser<'a> {
    chars: Vec<char>,
    pos: usize,
    mode: AtomMode,
    /// Position of the enclosing string literal, for error locations
    base_line: u32,
    base_column: u32,
    source: &'a str,
}

fn parse_mini(content: &str, mode: AtomMode, base_line: u32, base_column: u32) -> Result<Pattern, PatternError> {
    let mut parser = MiniParser {
        chars: content.chars().collect(),
        pos: 0,
        mode,
        base_line,
        base_column,
        source: content,
    };
    let items = parser.parse_sequence(None)?;
    Ok(match items.len() {
        0 => Pattern::Silence,
        1 => items.into_iter().next().unwrap_or(Pattern::Silence),
        _ => Pattern::Sequence(items),
    })
}

impl MiniParser<'_> {
    /// Line/column of an offset into the pattern string, in source terms
    fn position(&self, offset: usize) -> (u32, u32) {
        let prefix: String = self.source.chars().take(offset).collect();
        let newlines = prefix.matches('\n').count() as u32;
        if newlines == 0 {
            // +1 skips the opening quote
            (self.base_line, self.base_column + 1 + offset as u32)
        } else {
            let last = prefix.rsplit('\n').next().unwrap_or("");
            (self.base_line + newlines, last.chars().count() as u32 + 1)
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_sequence(&mut self, terminator: Option<char>) -> Result<Vec<Pattern>, PatternError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => {
                    if terminator.is_some() {
                        return Err(PatternError::UnexpectedEof);
                    }
                    return Ok(items);
                }
                Some(c) if Some(c) == terminator => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(_) => items.push(self.parse_element()?),
            }
        }
    }

    fn parse_element(&mut self) -> Result<Pattern, PatternError> {
        let unit = match self.peek() {
            Some('[') => {
                self.pos += 1;
                Pattern::Sequence(self.parse_sequence(Some(']'))?)
            }
            Some('<') => {
                self.pos += 1;
                Pattern::Cat(self.parse_sequence(Some('>'))?)
            }
            Some('~') => {
                self.pos += 1;
                Pattern::Silence
            }
            Some(c) if c == ']' || c == '>' => {
                let (line, column) = self.position(self.pos);
                return Err(PatternError::UnexpectedChar { found: c, line, column });
            }
            Some(_) => self.parse_atom()?,
            None => return Err(PatternError::UnexpectedEof),
        };

        // Optional repetition suffix: `bd*4`
        if self.peek() == Some('*') {
            self.pos += 1;
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            if start == self.pos {
                let (line, column) = self.position(self.pos);
                return Err(PatternError::UnexpectedChar {
                    found: self.peek().unwrap_or(' '),
                    line,
                    column,
                });
            }
            let count: i64 = self.chars[start..self.pos]
                .iter()
                .collect::<String>()
                .parse()
                .unwrap_or(1);
            return Ok(Pattern::Fast(Fraction::from_int(count), Box::new(unit)));
        }

        Ok(unit)
    }

    fn parse_atom(&mut self) -> Result<Pattern, PatternError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == ':' || c == '#' || c == '.' || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            let (line, column) = self.position(start);
            return Err(PatternError::UnexpectedChar {
                found: self.peek().unwrap_or(' '),
                line,
                column,
            });
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        match self.mode {
            AtomMode::Sample => {
                let (name, index) = match word.split_once(':') {
                    Some((name, idx)) => {
                        let index = idx.parse().map_err(|_| {
                            let (line, column) = self.position(start);
                            PatternError::InvalidAtom {
                                atom: word.clone(),
                                line,
                                column,
                            }
                        })?;
                        (name.to_string(), index)
                    }
                    None => (word.clone(), 0),
                };
                Ok(Pattern::Atom(EventValue::sample(name, index)))
            }
            AtomMode::Note => {
                let midi = parse_note(&word).ok_or_else(|| {
                    let (line, column) = self.position(start);
                    PatternError::InvalidAtom {
                        atom: word.clone(),
                        line,
                        column,
                    }
                })?;
                Ok(Pattern::Atom(EventValue::note(midi)))
            }
        }
    }
}

/// Note name or plain MIDI number to a MIDI note value
///
/// `c4` is MIDI 60; accidentals are `#` and `b`; a bare octave-less name
/// defaults to octave 3.
fn parse_note(word: &str) -> Option<f64> {
    if let Ok(midi) = word.parse::<f64>() {
        return (0.0..=127.0).contains(&midi).then_some(midi);
    }

    let mut chars = word.chars();
    let letter = chars.next()?.to_ascii_lowercase();
    let semitone: i32 = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };

    let rest: String = chars.collect();
    let (accidental, octave_text) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };

    let octave: i32 = if octave_text.is_empty() {
        3
    } else {
        octave_text.parse().ok()?
    };

    let midi = 12 * (octave + 1) + semitone + accidental;
    (0..=127).contains(&midi).then_some(midi as f64)
}
