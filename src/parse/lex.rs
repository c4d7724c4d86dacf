//! The lexer.
//!
//! Produces a flat vector of spanned tokens. String literals have their
//! escapes resolved here but keep `${…}` interpolation markers verbatim;
//! those are expanded later by the interpolation pass.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::ast::{Pos, Span};
use crate::error::{ParseError, ParseErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    /// A `$name` variable reference.
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),

    // Keywords
    Class,
    Include,
    Import,
    If,
    Else,
    As,
    FuncKw,
    StructKw,

    // Punctuation and operators
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Dot,
    Assign,
    FatArrow,
    Arrow,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Not,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier `{s}`"),
            Token::Var(s) => write!(f, "variable `${s}`"),
            Token::Str(_) => write!(f, "string literal"),
            Token::Int(v) => write!(f, "integer `{v}`"),
            Token::Float(v) => write!(f, "float `{v}`"),
            Token::Bool(v) => write!(f, "`{v}`"),
            Token::Class => write!(f, "`class`"),
            Token::Include => write!(f, "`include`"),
            Token::Import => write!(f, "`import`"),
            Token::If => write!(f, "`if`"),
            Token::Else => write!(f, "`else`"),
            Token::As => write!(f, "`as`"),
            Token::FuncKw => write!(f, "`func`"),
            Token::StructKw => write!(f, "`struct`"),
            Token::LBrace => write!(f, "`{{`"),
            Token::RBrace => write!(f, "`}}`"),
            Token::LBracket => write!(f, "`[`"),
            Token::RBracket => write!(f, "`]`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::Comma => write!(f, "`,`"),
            Token::Dot => write!(f, "`.`"),
            Token::Assign => write!(f, "`=`"),
            Token::FatArrow => write!(f, "`=>`"),
            Token::Arrow => write!(f, "`->`"),
            Token::EqEq => write!(f, "`==`"),
            Token::Ne => write!(f, "`!=`"),
            Token::Lt => write!(f, "`<`"),
            Token::Le => write!(f, "`<=`"),
            Token::Gt => write!(f, "`>`"),
            Token::Ge => write!(f, "`>=`"),
            Token::Plus => write!(f, "`+`"),
            Token::Minus => write!(f, "`-`"),
            Token::Star => write!(f, "`*`"),
            Token::Slash => write!(f, "`/`"),
            Token::Percent => write!(f, "`%`"),
            Token::AndAnd => write!(f, "`&&`"),
            Token::OrOr => write!(f, "`||`"),
            Token::Not => write!(f, "`!`"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub tok: Token,
    pub span: Span,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn err(&self, start: Pos, kind: ParseErrorKind) -> ParseError {
        ParseError {
            span: Span::new(start, self.pos()),
            kind,
        }
    }

    fn ident(&mut self, first: char) -> String {
        let mut s = String::new();
        s.push(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    fn number(&mut self, first: char, start: Pos) -> Result<Token, ParseError> {
        let mut s = String::new();
        s.push(first);
        let mut is_float = false;
        loop {
            match self.chars.peek() {
                Some(&c) if c.is_ascii_digit() => {
                    s.push(c);
                    self.bump();
                }
                Some('.') if !is_float => {
                    // Only a digit after the dot makes this a float; a
                    // bare `1.` is an invalid literal.
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.peek() {
                        Some(c) if c.is_ascii_digit() => {
                            is_float = true;
                            s.push('.');
                            self.bump();
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        if is_float {
            s.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.err(start, ParseErrorKind::InvalidNumber(s.clone())))
        } else {
            s.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| self.err(start, ParseErrorKind::InvalidNumber(s.clone())))
        }
    }

    fn string(&mut self, start: Pos) -> Result<Token, ParseError> {
        let mut s = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.err(start, ParseErrorKind::UnterminatedString));
            };
            match c {
                '"' => return Ok(Token::Str(s)),
                '\\' => {
                    let Some(esc) = self.bump() else {
                        return Err(self.err(start, ParseErrorKind::UnterminatedString));
                    };
                    match esc {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        '\\' => s.push('\\'),
                        '"' => s.push('"'),
                        'u' => {
                            let mut code = 0u32;
                            for _ in 0..4 {
                                let Some(h) = self.bump().and_then(|c| c.to_digit(16)) else {
                                    return Err(self.err(start, ParseErrorKind::InvalidEscape('u')));
                                };
                                code = code * 16 + h;
                            }
                            match char::from_u32(code) {
                                Some(c) => s.push(c),
                                None => {
                                    return Err(self.err(start, ParseErrorKind::InvalidEscape('u')));
                                }
                            }
                        }
                        other => return Err(self.err(start, ParseErrorKind::InvalidEscape(other))),
                    }
                }
                c => s.push(c),
            }
        }
    }
}

fn keyword(ident: &str) -> Option<Token> {
    match ident {
        "class" => Some(Token::Class),
        "include" => Some(Token::Include),
        "import" => Some(Token::Import),
        "if" => Some(Token::If),
        "else" => Some(Token::Else),
        "as" => Some(Token::As),
        "func" => Some(Token::FuncKw),
        "struct" => Some(Token::StructKw),
        "true" => Some(Token::Bool(true)),
        "false" => Some(Token::Bool(false)),
        _ => None,
    }
}

pub fn lex(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut lx = Lexer::new(input);
    let mut out = Vec::new();

    while let Some(&c) = lx.chars.peek() {
        let start = lx.pos();

        // Skip whitespace and comments.
        if c.is_whitespace() {
            lx.bump();
            continue;
        }
        if c == '#' {
            while let Some(&c) = lx.chars.peek() {
                if c == '\n' {
                    break;
                }
                lx.bump();
            }
            continue;
        }

        lx.bump();
        let tok = match c {
            '"' => lx.string(start)?,
            '$' => {
                let Some(&first) = lx.chars.peek() else {
                    return Err(lx.err(start, ParseErrorKind::UnexpectedChar('$')));
                };
                if !(first.is_ascii_alphabetic() || first == '_') {
                    return Err(lx.err(start, ParseErrorKind::UnexpectedChar('$')));
                }
                lx.bump();
                Token::Var(lx.ident(first))
            }
            c if c.is_ascii_digit() => lx.number(c, start)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let ident = lx.ident(c);
                keyword(&ident).unwrap_or(Token::Ident(ident))
            }
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '+' => Token::Plus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '-' => match lx.chars.peek() {
                Some('>') => {
                    lx.bump();
                    Token::Arrow
                }
                _ => Token::Minus,
            },
            '=' => match lx.chars.peek() {
                Some('=') => {
                    lx.bump();
                    Token::EqEq
                }
                Some('>') => {
                    lx.bump();
                    Token::FatArrow
                }
                _ => Token::Assign,
            },
            '!' => match lx.chars.peek() {
                Some('=') => {
                    lx.bump();
                    Token::Ne
                }
                _ => Token::Not,
            },
            '<' => match lx.chars.peek() {
                Some('=') => {
                    lx.bump();
                    Token::Le
                }
                _ => Token::Lt,
            },
            '>' => match lx.chars.peek() {
                Some('=') => {
                    lx.bump();
                    Token::Ge
                }
                _ => Token::Gt,
            },
            '&' => match lx.chars.peek() {
                Some('&') => {
                    lx.bump();
                    Token::AndAnd
                }
                _ => return Err(lx.err(start, ParseErrorKind::UnexpectedChar('&'))),
            },
            '|' => match lx.chars.peek() {
                Some('|') => {
                    lx.bump();
                    Token::OrOr
                }
                _ => return Err(lx.err(start, ParseErrorKind::UnexpectedChar('|'))),
            },
            other => return Err(lx.err(start, ParseErrorKind::UnexpectedChar(other))),
        };

        out.push(Spanned {
            tok,
            span: Span::new(start, lx.pos()),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(input: &str) -> Vec<Token> {
        lex(input).unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn basic_statement() {
        assert_eq!(
            toks(r#"noop "n1" {}"#),
            vec![
                Token::Ident("noop".into()),
                Token::Str("n1".into()),
                Token::LBrace,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn operators_disambiguate() {
        assert_eq!(
            toks("= == => -> - != ! <= <"),
            vec![
                Token::Assign,
                Token::EqEq,
                Token::FatArrow,
                Token::Arrow,
                Token::Minus,
                Token::Ne,
                Token::Not,
                Token::Le,
                Token::Lt,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("42"), vec![Token::Int(42)]);
        assert_eq!(toks("4.25"), vec![Token::Float(4.25)]);
        // A dot not followed by a digit is a separate token.
        assert_eq!(
            toks("4.x"),
            vec![Token::Int(4), Token::Dot, Token::Ident("x".into())]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            toks(r#""a\nb\t\"\\ A""#),
            vec![Token::Str("a\nb\t\"\\ A".into())]
        );
    }

    #[test]
    fn interpolation_marker_survives() {
        assert_eq!(
            toks(r#""pre ${$x + 1} post""#),
            vec![Token::Str("pre ${$x + 1} post".into())]
        );
    }

    #[test]
    fn comments_skipped() {
        assert_eq!(
            toks("# a comment\n$x = 1 # trailing"),
            vec![Token::Var("x".into()), Token::Assign, Token::Int(1)]
        );
    }

    #[test]
    fn positions_tracked() {
        let spanned = lex("$a =\n  $b").unwrap();
        assert_eq!(spanned[0].span.start, Pos { line: 1, col: 1 });
        assert_eq!(spanned[2].span.start, Pos { line: 2, col: 3 });
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(lex(r#""abc"#).is_err());
    }

    #[test]
    fn keywords() {
        assert_eq!(
            toks("class include import if else as true false"),
            vec![
                Token::Class,
                Token::Include,
                Token::Import,
                Token::If,
                Token::Else,
                Token::As,
                Token::Bool(true),
                Token::Bool(false),
            ]
        );
    }
}
