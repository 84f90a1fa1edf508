//! Line analyzer for KBasic source.
//!
//! Tokenizes one logical line at a time. The analyzer keeps a byte cursor
//! into the line; [`LineAnalyzer::rewind_token`] restores it by subtracting
//! the last token's *original* byte span, which lets the parser reposition
//! to an arbitrary remembered offset and re-run the shunting-yard driver
//! over the same expression text.

use std::str::FromStr;

use strum::{EnumString, IntoStaticStr};

/// Classification of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum TokenKind {
    /// Malformed input; the token content carries a diagnostic.
    Error,
    /// End of the line, a `;` soft separator or a `#` comment.
    LineEnd,
    Numeric,
    Identifier,
    Operator,
    ParenL,
    ParenR,
    BracketL,
    BracketR,
    Comma,
    /// String literal; the content is fully escape-decoded.
    String,
    /// The `:` that closes a label declaration.
    LabelSign,
    Keyword,
    Undefined,
}

/// Reserved words of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Dim,
    Redim,
    Goto,
    If,
    ElseIf,
    Else,
    While,
    Do,
    For,
    To,
    Step,
    Next,
    Continue,
    Break,
    End,
    Return,
    Func,
    Exit,
}

/// One token with its decoded content and original span within the line.
///
/// `source_length` is the raw byte span (for strings it includes the quotes
/// and undecoded escapes), so `cursor - source_length` is exactly where the
/// token began.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub content: String,
    pub source_start: usize,
    pub source_length: usize,
}

impl Token {
    /// The keyword this token names, if it is a keyword token.
    pub fn keyword(&self) -> Option<Keyword> {
        if self.kind == TokenKind::Keyword {
            Keyword::from_str(&self.content).ok()
        } else {
            None
        }
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.keyword() == Some(keyword)
    }

    pub fn is_operator(&self, symbol: &str) -> bool {
        self.kind == TokenKind::Operator && self.content == symbol
    }
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn is_line_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

/// Tokenizer over a single source line.
pub struct LineAnalyzer<'a> {
    line: &'a str,
    cursor: usize,
    last_token_length: usize,
}

impl<'a> LineAnalyzer<'a> {
    pub fn new(line: &'a str) -> Self {
        Self {
            line,
            cursor: 0,
            last_token_length: 0,
        }
    }

    /// Current byte offset into the line.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Repositions the cursor; used to re-parse a remembered expression span.
    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
        self.last_token_length = 0;
    }

    /// Moves the cursor back over the token most recently produced.
    pub fn rewind_token(&mut self) {
        self.cursor -= self.last_token_length;
        self.last_token_length = 0;
    }

    /// Resets the cursor to the start of the line.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.last_token_length = 0;
    }

    /// The byte at the cursor, `0` once the line is exhausted.
    pub fn byte_at_cursor(&self) -> u8 {
        self.line.as_bytes().get(self.cursor).copied().unwrap_or(0)
    }

    fn peek(&self, ahead: usize) -> u8 {
        self.line
            .as_bytes()
            .get(self.cursor + ahead)
            .copied()
            .unwrap_or(0)
    }

    fn make_token(&mut self, kind: TokenKind, content: String, start: usize) -> Token {
        self.last_token_length = self.cursor - start;
        Token {
            kind,
            content,
            source_start: start,
            source_length: self.cursor - start,
        }
    }

    fn single_char_token(&mut self, kind: TokenKind, start: usize) -> Token {
        let ch = self.peek(0) as char;
        self.cursor += 1;
        self.make_token(kind, ch.to_string(), start)
    }

    fn two_char_token(&mut self, kind: TokenKind, start: usize) -> Token {
        let content: String = [self.peek(0) as char, self.peek(1) as char].iter().collect();
        self.cursor += 2;
        self.make_token(kind, content, start)
    }

    /// Produces the next token, advancing the cursor past it.
    ///
    /// A line end (`\0`, `;` or `#`) does not consume the terminating byte,
    /// so the caller can distinguish a soft `;` separator from a real end of
    /// line by inspecting [`byte_at_cursor`](Self::byte_at_cursor).
    pub fn next_token(&mut self) -> Token {
        while is_line_space(self.peek(0)) && self.cursor < self.line.len() {
            self.cursor += 1;
        }

        let start = self.cursor;
        let first = self.peek(0);

        match first {
            // `;` ends the statement, `#` ends the line; the parser decides
            // whether to resume after the semicolon
            0 | b';' | b'#' => self.make_token(TokenKind::LineEnd, String::new(), start),
            b'+' | b'-' | b'*' | b'/' | b'^' | b'%' | b'=' | b'!' | b'\\' => {
                self.single_char_token(TokenKind::Operator, start)
            }
            b'(' => self.single_char_token(TokenKind::ParenL, start),
            b')' => self.single_char_token(TokenKind::ParenR, start),
            b'[' => self.single_char_token(TokenKind::BracketL, start),
            b']' => self.single_char_token(TokenKind::BracketR, start),
            b',' => self.single_char_token(TokenKind::Comma, start),
            b':' => self.single_char_token(TokenKind::LabelSign, start),
            b'>' => {
                if self.peek(1) == b'=' {
                    self.two_char_token(TokenKind::Operator, start)
                } else {
                    self.single_char_token(TokenKind::Operator, start)
                }
            }
            b'<' => {
                if self.peek(1) == b'=' || self.peek(1) == b'>' {
                    self.two_char_token(TokenKind::Operator, start)
                } else {
                    self.single_char_token(TokenKind::Operator, start)
                }
            }
            b'~' => {
                // a lone `~` is not an operator
                if self.peek(1) == b'=' {
                    self.two_char_token(TokenKind::Operator, start)
                } else {
                    self.single_char_token(TokenKind::Undefined, start)
                }
            }
            b'&' => {
                if self.peek(1) == b'&' {
                    self.two_char_token(TokenKind::Operator, start)
                } else {
                    self.single_char_token(TokenKind::Operator, start)
                }
            }
            b'|' => {
                // a lone `|` is not an operator
                if self.peek(1) == b'|' {
                    self.two_char_token(TokenKind::Operator, start)
                } else {
                    self.single_char_token(TokenKind::Undefined, start)
                }
            }
            b'0'..=b'9' => self.lex_numeric(start),
            b'"' => self.lex_string(start),
            _ if is_ident_start(first) => self.lex_identifier(start),
            _ => {
                // advance one whole character so the cursor stays on a
                // UTF-8 boundary
                let ch = self.line[self.cursor..].chars().next().unwrap_or('\0');
                self.cursor += ch.len_utf8();
                self.make_token(TokenKind::Undefined, ch.to_string(), start)
            }
        }
    }

    fn lex_numeric(&mut self, start: usize) -> Token {
        let mut content = String::new();
        while self.peek(0).is_ascii_digit() {
            content.push(self.peek(0) as char);
            self.cursor += 1;
        }
        // optional fraction; no exponent form
        if self.peek(0) == b'.' {
            content.push('.');
            self.cursor += 1;
            while self.peek(0).is_ascii_digit() {
                content.push(self.peek(0) as char);
                self.cursor += 1;
            }
        }
        self.make_token(TokenKind::Numeric, content, start)
    }

    fn lex_identifier(&mut self, start: usize) -> Token {
        let mut content = String::new();
        while is_ident_continue(self.peek(0)) {
            content.push(self.peek(0) as char);
            self.cursor += 1;
        }
        if Keyword::from_str(&content).is_ok() {
            self.make_token(TokenKind::Keyword, content, start)
        } else {
            self.make_token(TokenKind::Identifier, content, start)
        }
    }

    fn lex_string(&mut self, start: usize) -> Token {
        let mut content = String::new();
        // opening quote
        self.cursor += 1;

        loop {
            match self.peek(0) {
                b'"' => break,
                0 => {
                    return self.make_token(
                        TokenKind::Error,
                        "Incomplete string".to_owned(),
                        start,
                    );
                }
                b'\\' => {
                    self.cursor += 1;
                    match self.peek(0) {
                        b'n' => content.push('\n'),
                        b'r' => content.push('\r'),
                        b't' => content.push('\t'),
                        b'"' => content.push('"'),
                        b'\\' => content.push('\\'),
                        b'x' => {
                            let mut digits = 0;
                            let mut value: u32 = 0;
                            while digits < 2 {
                                let hex = self.peek(1);
                                let Some(nibble) = (hex as char).to_digit(16) else {
                                    break;
                                };
                                value = (value << 4) + nibble;
                                self.cursor += 1;
                                digits += 1;
                            }
                            if digits == 0 {
                                return self.make_token(
                                    TokenKind::Error,
                                    "Invalid hex escape char".to_owned(),
                                    start,
                                );
                            }
                            content.push(char::from_u32(value).unwrap_or('\u{fffd}'));
                        }
                        _ => {
                            return self.make_token(
                                TokenKind::Error,
                                "Invalid escape char".to_owned(),
                                start,
                            );
                        }
                    }
                    self.cursor += 1;
                }
                _ => {
                    let ch = self.line[self.cursor..].chars().next().unwrap_or('\0');
                    content.push(ch);
                    self.cursor += ch.len_utf8();
                }
            }
        }

        // closing quote
        self.cursor += 1;
        self.make_token(TokenKind::String, content, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(line: &str) -> Vec<TokenKind> {
        let mut analyzer = LineAnalyzer::new(line);
        let mut out = Vec::new();
        loop {
            let token = analyzer.next_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::LineEnd || kind == TokenKind::Error {
                break;
            }
        }
        out
    }

    #[test]
    fn classifies_statement_tokens() {
        assert_eq!(
            kinds("dim x = 3 + 4"),
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Operator,
                TokenKind::Numeric,
                TokenKind::Operator,
                TokenKind::Numeric,
                TokenKind::LineEnd,
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        for symbol in [">=", "<=", "<>", "~=", "&&", "||"] {
            let mut analyzer = LineAnalyzer::new(symbol);
            let token = analyzer.next_token();
            assert_eq!(token.kind, TokenKind::Operator, "{symbol}");
            assert_eq!(token.content, symbol);
        }
    }

    #[test]
    fn lone_tilde_and_pipe_are_undefined() {
        assert_eq!(kinds("~")[0], TokenKind::Undefined);
        assert_eq!(kinds("|")[0], TokenKind::Undefined);
    }

    #[test]
    fn numeric_with_fraction() {
        let mut analyzer = LineAnalyzer::new("12.5");
        let token = analyzer.next_token();
        assert_eq!(token.kind, TokenKind::Numeric);
        assert_eq!(token.content, "12.5");
        assert_eq!(token.source_length, 4);
    }

    #[test]
    fn string_escapes_decode() {
        let mut analyzer = LineAnalyzer::new(r#""a\n\t\"\\\x41\x9""#);
        let token = analyzer.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.content, "a\n\t\"\\A\u{9}");
    }

    #[test]
    fn string_span_covers_quotes_and_escapes() {
        let raw = r#""a\n""#;
        let mut analyzer = LineAnalyzer::new(raw);
        let token = analyzer.next_token();
        assert_eq!(token.source_start, 0);
        assert_eq!(token.source_length, raw.len());
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut analyzer = LineAnalyzer::new("\"abc");
        assert_eq!(analyzer.next_token().kind, TokenKind::Error);
    }

    #[test]
    fn invalid_escape_is_an_error() {
        let mut analyzer = LineAnalyzer::new(r#""a\q""#);
        assert_eq!(analyzer.next_token().kind, TokenKind::Error);
        let mut analyzer = LineAnalyzer::new(r#""a\xzz""#);
        assert_eq!(analyzer.next_token().kind, TokenKind::Error);
    }

    #[test]
    fn semicolon_and_comment_end_the_line_without_consuming() {
        let mut analyzer = LineAnalyzer::new("a; b");
        assert_eq!(analyzer.next_token().kind, TokenKind::Identifier);
        assert_eq!(analyzer.next_token().kind, TokenKind::LineEnd);
        assert_eq!(analyzer.byte_at_cursor(), b';');

        let mut analyzer = LineAnalyzer::new("# comment");
        assert_eq!(analyzer.next_token().kind, TokenKind::LineEnd);
        assert_eq!(analyzer.byte_at_cursor(), b'#');
    }

    #[test]
    fn rewind_restores_the_cursor() {
        let mut analyzer = LineAnalyzer::new("foo + 1");
        let token = analyzer.next_token();
        assert_eq!(token.content, "foo");
        analyzer.rewind_token();
        let again = analyzer.next_token();
        assert_eq!(again.content, "foo");
        assert_eq!(again.source_start, token.source_start);
    }

    #[test]
    fn keywords_are_tagged() {
        for word in [
            "dim", "redim", "goto", "if", "elseif", "else", "while", "do", "for", "to", "step",
            "next", "continue", "break", "end", "return", "func", "exit",
        ] {
            let mut analyzer = LineAnalyzer::new(word);
            assert_eq!(analyzer.next_token().kind, TokenKind::Keyword, "{word}");
        }
        let mut analyzer = LineAnalyzer::new("dimension");
        assert_eq!(analyzer.next_token().kind, TokenKind::Identifier);
    }

    #[test]
    fn label_sign() {
        assert_eq!(
            kinds("loop_start:"),
            vec![TokenKind::Identifier, TokenKind::LabelSign, TokenKind::LineEnd]
        );
    }
}
