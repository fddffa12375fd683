//! Tokenizer for the operation language.
//!
//! Tokens: identifiers (hyphens are allowed inside names when followed by
//! a letter, so `point-distance` lexes as one identifier), double-quoted
//! strings, integer and float literals (with optional sign), unit text in
//! square brackets, braces for dimension lists, and the operator symbols
//! of the filter grammar. Every token records its byte position for error
//! reporting.

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    /// Unit text between square brackets, verbatim.
    Unit(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=&` — all mask bits set
    EqAmp,
    /// `=|` — any mask bit set
    EqPipe,
    /// `!&` — no mask bit set
    NotAmp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub position: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                pos += 1;
            }
            '(' => {
                tokens.push(SpannedToken { token: Token::LParen, position: start });
                pos += 1;
            }
            ')' => {
                tokens.push(SpannedToken { token: Token::RParen, position: start });
                pos += 1;
            }
            '{' => {
                tokens.push(SpannedToken { token: Token::LBrace, position: start });
                pos += 1;
            }
            '}' => {
                tokens.push(SpannedToken { token: Token::RBrace, position: start });
                pos += 1;
            }
            ',' => {
                tokens.push(SpannedToken { token: Token::Comma, position: start });
                pos += 1;
            }
            ';' => {
                tokens.push(SpannedToken { token: Token::Semicolon, position: start });
                pos += 1;
            }
            '[' => {
                let end = source[pos + 1..]
                    .find(']')
                    .map(|i| pos + 1 + i)
                    .ok_or_else(|| PipelineError::script(start, "unterminated unit"))?;
                tokens.push(SpannedToken {
                    token: Token::Unit(source[pos + 1..end].trim().to_string()),
                    position: start,
                });
                pos = end + 1;
            }
            '"' => {
                let mut value = String::new();
                pos += 1;
                loop {
                    if pos >= bytes.len() {
                        return Err(PipelineError::script(start, "unterminated string"));
                    }
                    match bytes[pos] as char {
                        '"' => {
                            pos += 1;
                            break;
                        }
                        '\\' if pos + 1 < bytes.len() => {
                            value.push(bytes[pos + 1] as char);
                            pos += 2;
                        }
                        other => {
                            value.push(other);
                            pos += 1;
                        }
                    }
                }
                tokens.push(SpannedToken { token: Token::Str(value), position: start });
            }
            '=' => match bytes.get(pos + 1).map(|&b| b as char) {
                Some('=') => {
                    tokens.push(SpannedToken { token: Token::EqEq, position: start });
                    pos += 2;
                }
                Some('&') => {
                    tokens.push(SpannedToken { token: Token::EqAmp, position: start });
                    pos += 2;
                }
                Some('|') => {
                    tokens.push(SpannedToken { token: Token::EqPipe, position: start });
                    pos += 2;
                }
                _ => return Err(PipelineError::script(start, "unexpected '='")),
            },
            '!' => match bytes.get(pos + 1).map(|&b| b as char) {
                Some('=') => {
                    tokens.push(SpannedToken { token: Token::NotEq, position: start });
                    pos += 2;
                }
                Some('&') => {
                    tokens.push(SpannedToken { token: Token::NotAmp, position: start });
                    pos += 2;
                }
                _ => return Err(PipelineError::script(start, "unexpected '!'")),
            },
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(SpannedToken { token: Token::Le, position: start });
                    pos += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Lt, position: start });
                    pos += 1;
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(SpannedToken { token: Token::Ge, position: start });
                    pos += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Gt, position: start });
                    pos += 1;
                }
            }
            _ if c.is_ascii_digit()
                || c == '.'
                || ((c == '-' || c == '+')
                    && bytes
                        .get(pos + 1)
                        .is_some_and(|&b| (b as char).is_ascii_digit() || b == b'.')) =>
            {
                pos += 1;
                let mut is_float = c == '.';
                while pos < bytes.len() {
                    let d = bytes[pos] as char;
                    if d.is_ascii_digit() {
                        pos += 1;
                    } else if d == '.' && !is_float {
                        is_float = true;
                        pos += 1;
                    } else if (d == 'e' || d == 'E')
                        && bytes
                            .get(pos + 1)
                            .is_some_and(|&b| (b as char).is_ascii_digit() || b == b'-' || b == b'+')
                    {
                        is_float = true;
                        pos += 2;
                        while pos < bytes.len() && (bytes[pos] as char).is_ascii_digit() {
                            pos += 1;
                        }
                        break;
                    } else {
                        break;
                    }
                }
                let text = &source[start..pos];
                let token = if is_float {
                    Token::Float(text.parse::<f64>().map_err(|_| {
                        PipelineError::script(start, format!("invalid number '{text}'"))
                    })?)
                } else {
                    Token::Int(text.parse::<i64>().map_err(|_| {
                        PipelineError::script(start, format!("invalid integer '{text}'"))
                    })?)
                };
                tokens.push(SpannedToken { token, position: start });
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                pos += 1;
                while pos < bytes.len() {
                    let d = bytes[pos] as char;
                    if d.is_ascii_alphanumeric() || d == '_' {
                        pos += 1;
                    } else if d == '-'
                        && bytes
                            .get(pos + 1)
                            .is_some_and(|&b| (b as char).is_ascii_alphabetic())
                    {
                        pos += 2;
                    } else {
                        break;
                    }
                }
                tokens.push(SpannedToken {
                    token: Token::Ident(source[start..pos].to_string()),
                    position: start,
                });
            }
            other => {
                return Err(PipelineError::script(
                    start,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn lexes_a_comparison_clause() {
        assert_eq!(
            kinds("t > 15.5 [K]"),
            vec![
                Token::Ident("t".to_string()),
                Token::Gt,
                Token::Float(15.5),
                Token::Unit("K".to_string()),
            ]
        );
    }

    #[test]
    fn hyphenated_function_names_are_one_identifier() {
        assert_eq!(
            kinds("point-distance(20,-30)"),
            vec![
                Token::Ident("point-distance".to_string()),
                Token::LParen,
                Token::Int(20),
                Token::Comma,
                Token::Int(-30),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn bit_mask_operators() {
        assert_eq!(
            kinds("flags =& 5; flags =| 2; flags !& 1"),
            vec![
                Token::Ident("flags".to_string()),
                Token::EqAmp,
                Token::Int(5),
                Token::Semicolon,
                Token::Ident("flags".to_string()),
                Token::EqPipe,
                Token::Int(2),
                Token::Semicolon,
                Token::Ident("flags".to_string()),
                Token::NotAmp,
                Token::Int(1),
            ]
        );
    }

    #[test]
    fn strings_support_escapes() {
        assert_eq!(
            kinds(r#"set(afgl86, "en\"abled")"#),
            vec![
                Token::Ident("set".to_string()),
                Token::LParen,
                Token::Ident("afgl86".to_string()),
                Token::Comma,
                Token::Str("en\"abled".to_string()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn dimension_braces() {
        assert_eq!(
            kinds("index{time} < 3"),
            vec![
                Token::Ident("index".to_string()),
                Token::LBrace,
                Token::Ident("time".to_string()),
                Token::RBrace,
                Token::Lt,
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn errors_carry_positions() {
        let error = tokenize("t > $").unwrap_err();
        match error {
            PipelineError::Script { position, .. } => assert_eq!(position, 4),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn scientific_notation() {
        assert_eq!(kinds("1.5e3"), vec![Token::Float(1500.0)]);
        assert_eq!(kinds("2e-2"), vec![Token::Float(0.02)]);
    }
}
