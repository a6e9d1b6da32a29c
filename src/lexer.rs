// Hand lexer for Josh source.
//
// The grammar is line-oriented and identifiers may contain dots
// (`prior.age`, `steps.low`), which rules out the generated lexer:
// runs of blank lines and comments collapse into a single Newline
// token, and a dotted word is one Ident token, split downstream by
// the compiler (handler-name decoding) or the resolver (scope-chain
// namespaces). A bare word that exactly matches a keyword lexes as
// that keyword; the same word with a dot anywhere stays an Ident, so
// `age.step` and `water.end` never collide with `step` or `end`.

use std::fmt;

use bigdecimal::BigDecimal;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    Newline,
    Ident(String),
    Int(i64),
    Decimal(BigDecimal),
    Str(String),

    // Keywords.
    Start,
    End,
    State,
    Unit,
    Alias,
    Simulation,
    Patch,
    Agent,
    Organism,
    Management,
    Disturbance,
    External,
    Import,
    Config,
    If,
    Elif,
    Else,
    And,
    Or,
    Xor,
    Not,
    As,
    To,
    Of,
    At,
    Within,
    Limit,
    Map,
    From,
    Sample,
    With,
    Without,
    Replacement,
    Uniform,
    Normal,
    Mean,
    Std,
    Create,
    Here,
    True,
    False,

    // Symbols.
    Percent,
    Assign,
    EqEq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    Plus,
    Minus,
    Times,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Question,
    Bang,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Tok::Newline => write!(f, "end of line"),
            Tok::Ident(name) => write!(f, "'{}'", name),
            Tok::Int(v) => write!(f, "'{}'", v),
            Tok::Decimal(v) => write!(f, "'{}'", v),
            Tok::Str(s) => write!(f, "\"{}\"", s),
            other => write!(f, "{:?}", other),
        }
    }
}

fn keyword(word: &str) -> Option<Tok> {
    let tok = match word {
        "start" => Tok::Start,
        "end" => Tok::End,
        "state" => Tok::State,
        "unit" => Tok::Unit,
        "alias" => Tok::Alias,
        "simulation" => Tok::Simulation,
        "patch" => Tok::Patch,
        "agent" => Tok::Agent,
        "organism" => Tok::Organism,
        "management" => Tok::Management,
        "disturbance" => Tok::Disturbance,
        "external" => Tok::External,
        "import" => Tok::Import,
        "config" => Tok::Config,
        "if" => Tok::If,
        "elif" => Tok::Elif,
        "else" => Tok::Else,
        "and" => Tok::And,
        "or" => Tok::Or,
        "xor" => Tok::Xor,
        "not" => Tok::Not,
        "as" => Tok::As,
        "to" => Tok::To,
        "of" => Tok::Of,
        "at" => Tok::At,
        "within" => Tok::Within,
        "limit" => Tok::Limit,
        "map" => Tok::Map,
        "from" => Tok::From,
        "sample" => Tok::Sample,
        "with" => Tok::With,
        "without" => Tok::Without,
        "replacement" => Tok::Replacement,
        "uniform" => Tok::Uniform,
        "normal" => Tok::Normal,
        "mean" => Tok::Mean,
        "std" => Tok::Std,
        "create" => Tok::Create,
        "here" => Tok::Here,
        "true" => Tok::True,
        "false" => Tok::False,
        _ => return None,
    };
    Some(tok)
}

#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub location: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type Spanned = Result<(usize, Tok, usize), LexError>;

pub struct Lexer<'input> {
    text: &'input str,
    chars: Vec<(usize, char)>,
    pos: usize,
    emitted_any: bool,
    last_was_newline: bool,
    done: bool,
}

impl<'input> Lexer<'input> {
    pub fn new(text: &'input str) -> Lexer<'input> {
        Lexer {
            text,
            chars: text.char_indices().collect(),
            pos: 0,
            emitted_any: false,
            last_was_newline: true,
            done: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.pos + 1).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.text.len())
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn err(&self, location: usize, message: String) -> Spanned {
        Err(LexError { location, message })
    }

    fn word(&mut self) -> (usize, Tok, usize) {
        let start = self.offset();
        let mut dotted = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else if c == '.'
                && self
                    .peek2()
                    .map(|n| n.is_ascii_alphabetic() || n == '_')
                    .unwrap_or(false)
            {
                dotted = true;
                self.bump();
            } else {
                break;
            }
        }
        let end = self.offset();
        let word = &self.text[start..end];
        let tok = if dotted {
            Tok::Ident(word.to_string())
        } else {
            keyword(word).unwrap_or_else(|| Tok::Ident(word.to_string()))
        };
        (start, tok, end)
    }

    fn number(&mut self) -> Spanned {
        let start = self.offset();
        let mut decimal = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.'
                && !decimal
                && self.peek2().map(|n| n.is_ascii_digit()).unwrap_or(false)
            {
                decimal = true;
                self.bump();
            } else {
                break;
            }
        }
        let end = self.offset();
        let text = &self.text[start..end];
        if decimal {
            match BigDecimal::from_str(text) {
                Ok(v) => Ok((start, Tok::Decimal(v), end)),
                Err(_) => self.err(start, format!("invalid number '{}'", text)),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => Ok((start, Tok::Int(v), end)),
                Err(_) => self.err(start, format!("integer '{}' out of range", text)),
            }
        }
    }

    fn string(&mut self) -> Spanned {
        let start = self.offset();
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok((start, Tok::Str(value), self.offset())),
                Some('\\') => match self.bump() {
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some('n') => value.push('\n'),
                    other => {
                        return self.err(
                            start,
                            format!("unsupported escape '\\{}'", other.unwrap_or(' ')),
                        )
                    }
                },
                Some('\n') | None => {
                    return self.err(start, "unterminated string literal".to_string())
                }
                Some(c) => value.push(c),
            }
        }
    }
}

impl<'input> Iterator for Lexer<'input> {
    type Item = Spanned;

    fn next(&mut self) -> Option<Spanned> {
        loop {
            let start = self.offset();
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    // Guarantee a trailing Newline so every line rule
                    // in the grammar can end uniformly.
                    if self.done || self.last_was_newline || !self.emitted_any {
                        return None;
                    }
                    self.done = true;
                    self.last_was_newline = true;
                    return Some(Ok((start, Tok::Newline, start)));
                }
            };

            let spanned = match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                '\n' => {
                    self.bump();
                    if self.last_was_newline {
                        continue;
                    }
                    Ok((start, Tok::Newline, self.offset()))
                }
                '"' => self.string(),
                '0'..='9' => self.number(),
                c if c.is_ascii_alphabetic() || c == '_' => Ok(self.word()),
                '%' => {
                    self.bump();
                    Ok((start, Tok::Percent, self.offset()))
                }
                '=' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                        Ok((start, Tok::EqEq, self.offset()))
                    } else {
                        Ok((start, Tok::Assign, self.offset()))
                    }
                }
                '!' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                        Ok((start, Tok::Neq, self.offset()))
                    } else {
                        Ok((start, Tok::Bang, self.offset()))
                    }
                }
                '<' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                        Ok((start, Tok::Lte, self.offset()))
                    } else {
                        Ok((start, Tok::Lt, self.offset()))
                    }
                }
                '>' => {
                    self.bump();
                    if self.peek() == Some('=') {
                        self.bump();
                        Ok((start, Tok::Gte, self.offset()))
                    } else {
                        Ok((start, Tok::Gt, self.offset()))
                    }
                }
                '+' => {
                    self.bump();
                    Ok((start, Tok::Plus, self.offset()))
                }
                '-' => {
                    self.bump();
                    Ok((start, Tok::Minus, self.offset()))
                }
                '*' => {
                    self.bump();
                    Ok((start, Tok::Times, self.offset()))
                }
                '/' => {
                    self.bump();
                    Ok((start, Tok::Slash, self.offset()))
                }
                '^' => {
                    self.bump();
                    Ok((start, Tok::Caret, self.offset()))
                }
                '(' => {
                    self.bump();
                    Ok((start, Tok::LParen, self.offset()))
                }
                ')' => {
                    self.bump();
                    Ok((start, Tok::RParen, self.offset()))
                }
                '[' => {
                    self.bump();
                    Ok((start, Tok::LBracket, self.offset()))
                }
                ']' => {
                    self.bump();
                    Ok((start, Tok::RBracket, self.offset()))
                }
                '{' => {
                    self.bump();
                    Ok((start, Tok::LBrace, self.offset()))
                }
                '}' => {
                    self.bump();
                    Ok((start, Tok::RBrace, self.offset()))
                }
                ',' => {
                    self.bump();
                    Ok((start, Tok::Comma, self.offset()))
                }
                ':' => {
                    self.bump();
                    Ok((start, Tok::Colon, self.offset()))
                }
                '?' => {
                    self.bump();
                    Ok((start, Tok::Question, self.offset()))
                }
                other => {
                    self.bump();
                    self.err(start, format!("unexpected character '{}'", other))
                }
            };

            if let Ok((_, tok, _)) = &spanned {
                self.last_was_newline = *tok == Tok::Newline;
                self.emitted_any = true;
            }
            return Some(spanned);
        }
    }
}

/// Map a byte offset back to a 1-based (line, column) pair.
pub fn line_col(text: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in text.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(text: &str) -> Vec<Tok> {
        Lexer::new(text).map(|t| t.unwrap().1).collect()
    }

    #[test]
    fn test_words_and_keywords() {
        assert_eq!(
            toks("start patch Default"),
            vec![
                Tok::Start,
                Tok::Patch,
                Tok::Ident("Default".into()),
                Tok::Newline
            ]
        );
    }

    #[test]
    fn test_dotted_idents_do_not_collide_with_keywords() {
        assert_eq!(
            toks("age.step water.end"),
            vec![
                Tok::Ident("age.step".into()),
                Tok::Ident("water.end".into()),
                Tok::Newline
            ]
        );
        assert_eq!(toks("end")[0], Tok::End);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("5 2.75"),
            vec![
                Tok::Int(5),
                Tok::Decimal(BigDecimal::from_str("2.75").unwrap()),
                Tok::Newline
            ]
        );
    }

    #[test]
    fn test_newline_collapse_and_comments() {
        assert_eq!(
            toks("a\n\n# note\n\nb"),
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Newline
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            toks("a == b != c <= d >= e"),
            vec![
                Tok::Ident("a".into()),
                Tok::EqEq,
                Tok::Ident("b".into()),
                Tok::Neq,
                Tok::Ident("c".into()),
                Tok::Lte,
                Tok::Ident("d".into()),
                Tok::Gte,
                Tok::Ident("e".into()),
                Tok::Newline
            ]
        );
    }

    #[test]
    fn test_string_literal() {
        assert_eq!(
            toks("\"adult\""),
            vec![Tok::Str("adult".into()), Tok::Newline]
        );
        assert!(Lexer::new("\"oops").any(|t| t.is_err()));
    }

    #[test]
    fn test_line_col() {
        let text = "ab\ncd";
        assert_eq!(line_col(text, 0), (1, 1));
        assert_eq!(line_col(text, 1), (1, 2));
        assert_eq!(line_col(text, 3), (2, 1));
        assert_eq!(line_col(text, 4), (2, 2));
    }
}
