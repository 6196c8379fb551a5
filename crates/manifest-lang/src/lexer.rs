//! Hand-rolled lexer for Manifest source.
//!
//! Keywords are not distinguished here; the parser decides contextually
//! whether an identifier is `entity`, a severity, a type name, etc.

use crate::diagnostics::{Diagnostic, Span};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Comma,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Tokenize source text. Lexical errors become diagnostics; the bad
/// character is skipped so the parser still sees the rest of the file.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];

        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
            }
            // line comment
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'{' => push_single(&mut tokens, TokenKind::LBrace, &mut pos),
            b'}' => push_single(&mut tokens, TokenKind::RBrace, &mut pos),
            b'(' => push_single(&mut tokens, TokenKind::LParen, &mut pos),
            b')' => push_single(&mut tokens, TokenKind::RParen, &mut pos),
            b':' => push_single(&mut tokens, TokenKind::Colon, &mut pos),
            b',' => push_single(&mut tokens, TokenKind::Comma, &mut pos),
            b'.' => push_single(&mut tokens, TokenKind::Dot, &mut pos),
            b'+' => push_single(&mut tokens, TokenKind::Plus, &mut pos),
            b'-' => push_single(&mut tokens, TokenKind::Minus, &mut pos),
            b'*' => push_single(&mut tokens, TokenKind::Star, &mut pos),
            b'/' => push_single(&mut tokens, TokenKind::Slash, &mut pos),
            b'%' => push_single(&mut tokens, TokenKind::Percent, &mut pos),
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::EqEq,
                        span: Span::new(start, pos),
                    });
                } else {
                    push_single(&mut tokens, TokenKind::Assign, &mut pos);
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::NotEq,
                        span: Span::new(start, pos),
                    });
                } else {
                    diagnostics.push(Diagnostic::error(
                        "unexpected character '!' (use 'not' or '!=')",
                        Span::new(start, start + 1),
                    ));
                    pos += 1;
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::Le,
                        span: Span::new(start, pos),
                    });
                } else {
                    push_single(&mut tokens, TokenKind::Lt, &mut pos);
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    tokens.push(Token {
                        kind: TokenKind::Ge,
                        span: Span::new(start, pos),
                    });
                } else {
                    push_single(&mut tokens, TokenKind::Gt, &mut pos);
                }
            }
            b'"' => {
                pos += 1;
                let mut raw: Vec<u8> = Vec::new();
                let mut closed = false;
                while pos < bytes.len() {
                    match bytes[pos] {
                        b'"' => {
                            pos += 1;
                            closed = true;
                            break;
                        }
                        b'\\' => {
                            let escaped = bytes.get(pos + 1).copied();
                            match escaped {
                                Some(b'"') => raw.push(b'"'),
                                Some(b'\\') => raw.push(b'\\'),
                                Some(b'n') => raw.push(b'\n'),
                                Some(b't') => raw.push(b'\t'),
                                Some(other) => raw.push(other),
                                None => break,
                            }
                            pos += 2;
                        }
                        other => {
                            raw.push(other);
                            pos += 1;
                        }
                    }
                }
                if !closed {
                    diagnostics.push(Diagnostic::error(
                        "unterminated string literal",
                        Span::new(start, pos),
                    ));
                }
                tokens.push(Token {
                    kind: TokenKind::Str(String::from_utf8_lossy(&raw).into_owned()),
                    span: Span::new(start, pos),
                });
            }
            b'0'..=b'9' => {
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                if pos < bytes.len()
                    && bytes[pos] == b'.'
                    && bytes.get(pos + 1).is_some_and(|b| b.is_ascii_digit())
                {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                let text = &source[start..pos];
                match text.parse::<f64>() {
                    Ok(n) => tokens.push(Token {
                        kind: TokenKind::Number(n),
                        span: Span::new(start, pos),
                    }),
                    Err(_) => diagnostics.push(Diagnostic::error(
                        format!("invalid number literal '{text}'"),
                        Span::new(start, pos),
                    )),
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(source[start..pos].to_string()),
                    span: Span::new(start, pos),
                });
            }
            other => {
                diagnostics.push(Diagnostic::error(
                    format!("unexpected character '{}'", other as char),
                    Span::new(start, start + 1),
                ));
                pos += 1;
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(bytes.len(), bytes.len()),
    });
    (tokens, diagnostics)
}

fn push_single(tokens: &mut Vec<Token>, kind: TokenKind, pos: &mut usize) {
    tokens.push(Token {
        kind,
        span: Span::new(*pos, *pos + 1),
    });
    *pos += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, diagnostics) = tokenize(source);
        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("{ } ( ) : , . = == != < > <= >= + - * / %"),
            vec![
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Colon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Assign,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_identifiers_and_numbers() {
        assert_eq!(
            kinds("entity PrepTask qty 42 3.25"),
            vec![
                TokenKind::Ident("entity".to_string()),
                TokenKind::Ident("PrepTask".to_string()),
                TokenKind::Ident("qty".to_string()),
                TokenKind::Number(42.0),
                TokenKind::Number(3.25),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a \"quoted\" line\n""#),
            vec![
                TokenKind::Str("a \"quoted\" line\n".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("# heading\nentity # trailing\n"),
            vec![TokenKind::Ident("entity".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_reports_error() {
        let (_, diagnostics) = tokenize("\"oops");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("unterminated"));
    }

    #[test]
    fn test_unexpected_character_reports_error_and_continues() {
        let (tokens, diagnostics) = tokenize("@entity");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Ident("entity".to_string()));
    }
}
