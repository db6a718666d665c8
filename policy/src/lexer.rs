//! Tokenizer for the supported Cedar subset.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Str(String),
    ColonColon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    EqEq,
    AndAnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal starting on line {0}")]
    UnterminatedString(usize),
    #[error("unexpected character '{0}' on line {1}")]
    UnexpectedChar(char, usize),
}

pub fn lex(input: &str) -> Result<Vec<Spanned>, LexError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    let mut line = 1usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' => {
                line += 1;
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Spanned { token: Token::LParen, line });
                i += 1;
            }
            ')' => {
                tokens.push(Spanned { token: Token::RParen, line });
                i += 1;
            }
            '{' => {
                tokens.push(Spanned { token: Token::LBrace, line });
                i += 1;
            }
            '}' => {
                tokens.push(Spanned { token: Token::RBrace, line });
                i += 1;
            }
            '[' => {
                tokens.push(Spanned { token: Token::LBracket, line });
                i += 1;
            }
            ']' => {
                tokens.push(Spanned { token: Token::RBracket, line });
                i += 1;
            }
            ',' => {
                tokens.push(Spanned { token: Token::Comma, line });
                i += 1;
            }
            ';' => {
                tokens.push(Spanned { token: Token::Semicolon, line });
                i += 1;
            }
            '.' => {
                tokens.push(Spanned { token: Token::Dot, line });
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                tokens.push(Spanned { token: Token::ColonColon, line });
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Spanned { token: Token::EqEq, line });
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Spanned { token: Token::AndAnd, line });
                i += 2;
            }
            '"' => {
                let start_line = line;
                i += 1;
                let mut value = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        '\\' if chars.get(i + 1) == Some(&'"') => {
                            value.push('"');
                            i += 2;
                        }
                        '\n' => {
                            line += 1;
                            value.push('\n');
                            i += 1;
                        }
                        other => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(LexError::UnterminatedString(start_line));
                }
                tokens.push(Spanned { token: Token::Str(value), line: start_line });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Spanned { token: Token::Ident(ident), line });
            }
            other => return Err(LexError::UnexpectedChar(other, line)),
        }
    }

    Ok(tokens)
}
