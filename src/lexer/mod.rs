use logos::Logos;

use crate::ast::{self, Span};

/// Numeric literal as written; decimal integers that overflow become floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeral {
    Int(i64),
    Float(f64),
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\x0c]+")]
pub enum Token {
    #[token("--", lex_comment)]
    Comment,

    // Keywords
    #[token("and")]
    And,
    #[token("break")]
    Break,
    #[token("do")]
    Do,
    #[token("else")]
    Else,
    #[token("elseif")]
    Elseif,
    #[token("end")]
    End,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("if")]
    If,
    #[token("in")]
    In,
    #[token("local")]
    Local,
    #[token("nil")]
    Nil,
    #[token("not")]
    Not,
    #[token("or")]
    Or,
    #[token("repeat")]
    Repeat,
    #[token("return")]
    Return,
    #[token("then")]
    Then,
    #[token("true")]
    True,
    #[token("until")]
    Until,
    #[token("while")]
    While,

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("==")]
    Eq,
    #[token("~=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("..")]
    Concat,
    #[token("...")]
    Ellipsis,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F]+", parse_hex)]
    #[regex(r"[0-9]+", parse_decimal)]
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    Number(Numeral),

    #[regex(r#""([^"\\\n]|\\z[ \t\r\n]*|\\(.|\n))*""#, parse_short_string)]
    #[regex(r#"'([^'\\\n]|\\z[ \t\r\n]*|\\(.|\n))*'"#, parse_short_string)]
    #[regex(r"\[=*\[", lex_long_string)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),
}

/// Lex source code into a stream of tokens with positions.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push((token, Span { start: span.start, end: span.end })),
            Err(()) => {
                let snippet: String = source[span.clone()].chars().take(24).collect();
                let line = ast::line_at(source, span.start);
                return Err(LexError {
                    position: span.start,
                    line,
                    suggestion: suggest_fix(&snippet),
                    snippet,
                });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> String {
    match bad_token.chars().next() {
        Some('"') | Some('\'') => {
            "unfinished string or invalid escape sequence (escapes must produce UTF-8 text)".into()
        }
        Some('[') => "unfinished long string; close it with a matching ']]'".into(),
        Some('!') => "use 'not' or '~=' instead of '!'".into(),
        Some('&') | Some('|') => "use 'and' / 'or' for boolean logic".into(),
        Some(c) if c.is_ascii_digit() => "malformed number".into(),
        _ => "unexpected symbol".into(),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("line {line}: unexpected '{snippet}' ({suggestion})")]
pub struct LexError {
    pub position: usize,
    pub line: usize,
    pub snippet: String,
    pub suggestion: String,
}

// ── Callbacks ──────────────────────────────────────────────────────

fn lex_comment(lex: &mut logos::Lexer<Token>) -> logos::Skip {
    let remainder = lex.remainder();
    if let Some(level) = long_bracket_level(remainder) {
        let close = format!("]{}]", "=".repeat(level));
        match remainder.find(&close) {
            Some(end) => lex.bump(end + close.len()),
            None => lex.bump(remainder.len()),
        }
    } else {
        let end = remainder.find('\n').unwrap_or(remainder.len());
        lex.bump(end);
    }
    logos::Skip
}

/// Level of an opening long bracket (`[[` is 0, `[==[` is 2) at the start of `s`.
fn long_bracket_level(s: &str) -> Option<usize> {
    let rest = s.strip_prefix('[')?;
    let level = rest.bytes().take_while(|b| *b == b'=').count();
    (rest.as_bytes().get(level) == Some(&b'[')).then_some(level)
}

fn lex_long_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let level = lex.slice().len() - 2;
    let close = format!("]{}]", "=".repeat(level));
    let remainder = lex.remainder();
    let end = remainder.find(&close)?;
    let body = &remainder[..end];
    // A newline right after the opening bracket is not part of the string.
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body)
        .to_string();
    lex.bump(end + close.len());
    Some(body)
}

fn parse_hex(lex: &mut logos::Lexer<Token>) -> Option<Numeral> {
    // Hex literals wrap around like two's complement.
    u64::from_str_radix(&lex.slice()[2..], 16)
        .ok()
        .map(|n| Numeral::Int(n as i64))
}

fn parse_decimal(lex: &mut logos::Lexer<Token>) -> Option<Numeral> {
    let s = lex.slice();
    match s.parse::<i64>() {
        Ok(n) => Some(Numeral::Int(n)),
        Err(_) => s.parse::<f64>().ok().map(Numeral::Float),
    }
}

fn parse_float(lex: &mut logos::Lexer<Token>) -> Option<Numeral> {
    lex.slice().parse::<f64>().ok().map(Numeral::Float)
}

fn parse_short_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let s = lex.slice();
    unescape(&s[1..s.len() - 1])
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' | '\n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            'z' => {
                while chars.peek().is_some_and(|c| c.is_ascii_whitespace()) {
                    chars.next();
                }
            }
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                out.push(ascii_char(hi * 16 + lo)?);
            }
            'u' => {
                if chars.next()? != '{' {
                    return None;
                }
                let mut code = 0u32;
                let mut digits = 0;
                loop {
                    let c = chars.next()?;
                    if c == '}' {
                        break;
                    }
                    code = code.checked_mul(16)?.checked_add(c.to_digit(16)?)?;
                    digits += 1;
                }
                if digits == 0 {
                    return None;
                }
                out.push(char::from_u32(code)?);
            }
            d if d.is_ascii_digit() => {
                let mut code = d.to_digit(10)?;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(10)) {
                        Some(n) => {
                            code = code * 10 + n;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(ascii_char(code)?);
            }
            _ => return None,
        }
    }

    Some(out)
}

/// Byte escapes above 0x7f would produce invalid UTF-8.
fn ascii_char(code: u32) -> Option<char> {
    (code < 0x80).then(|| char::from(code as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_assignment() {
        assert_eq!(
            kinds("x = 1 + 2"),
            vec![
                Token::Name("x".into()),
                Token::Assign,
                Token::Number(Numeral::Int(1)),
                Token::Plus,
                Token::Number(Numeral::Int(2)),
            ]
        );
    }

    #[test]
    fn lex_keywords_win_over_names() {
        assert_eq!(kinds("local function")[..], [Token::Local, Token::Function]);
        assert_eq!(kinds("locals"), vec![Token::Name("locals".into())]);
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(kinds("0x10"), vec![Token::Number(Numeral::Int(16))]);
        assert_eq!(kinds("2.5"), vec![Token::Number(Numeral::Float(2.5))]);
        assert_eq!(kinds(".5"), vec![Token::Number(Numeral::Float(0.5))]);
        assert_eq!(kinds("1e3"), vec![Token::Number(Numeral::Float(1000.0))]);
        assert_eq!(
            kinds("9223372036854775808"),
            vec![Token::Number(Numeral::Float(9223372036854775808.0))]
        );
    }

    #[test]
    fn lex_vararg_and_concat() {
        assert_eq!(kinds("... .. ."), vec![Token::Ellipsis, Token::Concat, Token::Dot]);
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(kinds(r#""a\tb\n""#), vec![Token::Str("a\tb\n".into())]);
        assert_eq!(kinds(r"'it\'s'"), vec![Token::Str("it's".into())]);
        assert_eq!(kinds(r#""\65\x42\u{e9}""#), vec![Token::Str("ABé".into())]);
        assert_eq!(kinds(r#""a\0b""#), vec![Token::Str("a\0b".into())]);
    }

    #[test]
    fn lex_long_string() {
        assert_eq!(kinds("[[\nline\n]]"), vec![Token::Str("line\n".into())]);
        assert_eq!(kinds("[==[a]]b]==]"), vec![Token::Str("a]]b".into())]);
    }

    #[test]
    fn lex_comments_skipped() {
        assert_eq!(kinds("-- note\nx"), vec![Token::Name("x".into())]);
        assert_eq!(
            kinds("--[[ block ]] y --[==[ a\nb ]==] z"),
            vec![Token::Name("y".into()), Token::Name("z".into())]
        );
    }

    #[test]
    fn lex_error_reports_line() {
        let err = lex("x = 1\ny = !x").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.suggestion.contains("not"));
    }

    #[test]
    fn lex_rejects_non_utf8_escape() {
        assert!(lex(r#""\xff""#).is_err());
        assert!(lex(r#""\300""#).is_err());
    }

    #[test]
    fn lex_unterminated_string() {
        let err = lex("s = \"abc").unwrap_err();
        assert!(err.suggestion.contains("string"));
    }
}
