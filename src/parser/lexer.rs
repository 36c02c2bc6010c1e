//! Lexer (tokenizer) for C source code
//!
//! Converts raw source text into a flat [`Token`] stream consumed by the parser.
//! Preprocessor lines (`#include`, `#define`, ...) are skipped rather than
//! interpreted; the front end has no preprocessor.
//!
//! Multi-character operators are resolved with one character of lookahead
//! (two for the `<<=` / `>>=` / `...` family).

use super::ast::SourceLocation;
use std::fmt;

/// Token categories. Literal kinds carry their decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    IntLiteral(i64),
    FloatLiteral(f64),
    CharLiteral(i64),
    StringLiteral(String),

    // Identifiers
    Ident(String),

    // Type keywords
    Int,
    Char,
    Void,
    Float,
    Double,
    Long,
    Short,
    Unsigned,
    Signed,
    Const,
    Static,
    Extern,
    Struct,

    // Statement keywords
    If,
    Else,
    While,
    Do,
    For,
    Return,
    Break,
    Continue,
    Sizeof,

    // Module keywords
    Module,
    Import,
    Export,
    From,

    // Arithmetic
    Plus,    // +
    Minus,   // -
    Star,    // *
    Slash,   // /
    Percent, // %

    // Comparison
    EqEq,  // ==
    NotEq, // !=
    Lt,    // <
    Le,    // <=
    Gt,    // >
    Ge,    // >=

    // Logical
    AndAnd, // &&
    OrOr,   // ||
    Bang,   // !

    // Bitwise
    Amp,   // &
    Pipe,  // |
    Caret, // ^
    Tilde, // ~
    LtLt,  // <<
    GtGt,  // >>

    // Assignment
    Eq,        // =
    PlusEq,    // +=
    MinusEq,   // -=
    StarEq,    // *=
    SlashEq,   // /=
    PercentEq, // %=
    AmpEq,     // &=
    PipeEq,    // |=
    CaretEq,   // ^=
    LtLtEq,    // <<=
    GtGtEq,    // >>=

    // Increment/Decrement
    PlusPlus,   // ++
    MinusMinus, // --

    // Member access
    Dot,      // .
    Arrow,    // ->
    Ellipsis, // ...

    // Ternary
    Question, // ?
    Colon,    // :

    // Punctuation
    LParen,    // (
    RParen,    // )
    LBrace,    // {
    RBrace,    // }
    LBracket,  // [
    RBracket,  // ]
    Semicolon, // ;
    Comma,     // ,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::IntLiteral(n) => write!(f, "int literal {}", n),
            TokenKind::FloatLiteral(x) => write!(f, "float literal {}", x),
            TokenKind::CharLiteral(c) => write!(f, "char literal {}", c),
            TokenKind::StringLiteral(s) => write!(f, "string literal \"{}\"", s.escape_default()),
            TokenKind::Ident(s) => write!(f, "identifier '{}'", s),
            TokenKind::Eof => write!(f, "end of file"),
            other => match other.spelling() {
                Some(text) => write!(f, "'{}'", text),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

impl TokenKind {
    /// Fixed spelling of keyword and punctuation tokens.
    pub fn spelling(&self) -> Option<&'static str> {
        let text = match self {
            TokenKind::Int => "int",
            TokenKind::Char => "char",
            TokenKind::Void => "void",
            TokenKind::Float => "float",
            TokenKind::Double => "double",
            TokenKind::Long => "long",
            TokenKind::Short => "short",
            TokenKind::Unsigned => "unsigned",
            TokenKind::Signed => "signed",
            TokenKind::Const => "const",
            TokenKind::Static => "static",
            TokenKind::Extern => "extern",
            TokenKind::Struct => "struct",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::Do => "do",
            TokenKind::For => "for",
            TokenKind::Return => "return",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Sizeof => "sizeof",
            TokenKind::Module => "module",
            TokenKind::Import => "import",
            TokenKind::Export => "export",
            TokenKind::From => "from",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Bang => "!",
            TokenKind::Amp => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::LtLt => "<<",
            TokenKind::GtGt => ">>",
            TokenKind::Eq => "=",
            TokenKind::PlusEq => "+=",
            TokenKind::MinusEq => "-=",
            TokenKind::StarEq => "*=",
            TokenKind::SlashEq => "/=",
            TokenKind::PercentEq => "%=",
            TokenKind::AmpEq => "&=",
            TokenKind::PipeEq => "|=",
            TokenKind::CaretEq => "^=",
            TokenKind::LtLtEq => "<<=",
            TokenKind::GtGtEq => ">>=",
            TokenKind::PlusPlus => "++",
            TokenKind::MinusMinus => "--",
            TokenKind::Dot => ".",
            TokenKind::Arrow => "->",
            TokenKind::Ellipsis => "...",
            TokenKind::Question => "?",
            TokenKind::Colon => ":",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Semicolon => ";",
            TokenKind::Comma => ",",
            _ => return None,
        };
        Some(text)
    }

    fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "int" => TokenKind::Int,
            "char" => TokenKind::Char,
            "void" => TokenKind::Void,
            "float" => TokenKind::Float,
            "double" => TokenKind::Double,
            "long" => TokenKind::Long,
            "short" => TokenKind::Short,
            "unsigned" => TokenKind::Unsigned,
            "signed" => TokenKind::Signed,
            "const" => TokenKind::Const,
            "static" => TokenKind::Static,
            "extern" => TokenKind::Extern,
            "struct" => TokenKind::Struct,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "for" => TokenKind::For,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "sizeof" => TokenKind::Sizeof,
            "module" => TokenKind::Module,
            "import" => TokenKind::Import,
            "export" => TokenKind::Export,
            "from" => TokenKind::From,
            _ => return None,
        };
        Some(kind)
    }
}

/// A token: its kind, the exact source text, and where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub location: SourceLocation,
}

impl Token {
    pub fn location(&self) -> SourceLocation {
        self.location
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

/// Lexer error type
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub location: SourceLocation,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lexer error at line {}, column {}: {}",
            self.location.line, self.location.column, self.message
        )
    }
}

impl std::error::Error for LexError {}

/// Lexer for C source code
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    /// Position and location where the current token started
    token_start: (usize, SourceLocation),
}

impl Lexer {
    /// Create a new lexer for the given source string.
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
            token_start: (0, SourceLocation::new(1, 1)),
        }
    }

    /// Tokenize the entire input, stopping at the first error.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let (tokens, mut errors) = self.tokenize_all();
        if errors.is_empty() {
            Ok(tokens)
        } else {
            Err(errors.swap_remove(0))
        }
    }

    /// Tokenize the entire input, recording every error and resuming after it.
    ///
    /// The token stream always ends with [`TokenKind::Eof`].
    pub fn tokenize_all(&mut self) -> (Vec<Token>, Vec<LexError>) {
        let mut tokens = Vec::new();
        let mut errors = Vec::new();

        loop {
            if let Err(err) = self.skip_whitespace_and_comments() {
                errors.push(err);
            }

            if self.is_at_end() {
                let loc = self.current_location();
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    text: String::new(),
                    location: loc,
                });
                break;
            }

            if self.peek() == Some('#') && self.at_line_start() {
                self.skip_preprocessor_directive();
                continue;
            }

            self.token_start = (self.position, self.current_location());
            match self.next_token() {
                Ok(kind) => {
                    let (start, location) = self.token_start;
                    let text: String = self.input[start..self.position].iter().collect();
                    tokens.push(Token {
                        kind,
                        text,
                        location,
                    });
                }
                Err(err) => errors.push(err),
            }
        }

        (tokens, errors)
    }

    /// Get next token kind; the caller records text and location
    fn next_token(&mut self) -> Result<TokenKind, LexError> {
        let loc = self.current_location();
        let ch = self.advance().ok_or_else(|| LexError {
            message: "Unexpected end of file".to_string(),
            location: loc,
        })?;

        let kind = match ch {
            '"' => return self.string_literal(),
            '\'' => return self.char_literal(),
            '0'..='9' => return self.number_literal(ch),
            '.' if self.peek().is_some_and(|c| c.is_ascii_digit()) => {
                return self.number_literal(ch)
            }
            'a'..='z' | 'A'..='Z' | '_' => return Ok(self.identifier_or_keyword(ch)),

            '+' => self.select(&[('+', TokenKind::PlusPlus), ('=', TokenKind::PlusEq)], TokenKind::Plus),
            '-' => self.select(
                &[
                    ('-', TokenKind::MinusMinus),
                    ('=', TokenKind::MinusEq),
                    ('>', TokenKind::Arrow),
                ],
                TokenKind::Minus,
            ),
            '*' => self.select(&[('=', TokenKind::StarEq)], TokenKind::Star),
            '/' => self.select(&[('=', TokenKind::SlashEq)], TokenKind::Slash),
            '%' => self.select(&[('=', TokenKind::PercentEq)], TokenKind::Percent),
            '=' => self.select(&[('=', TokenKind::EqEq)], TokenKind::Eq),
            '!' => self.select(&[('=', TokenKind::NotEq)], TokenKind::Bang),
            '^' => self.select(&[('=', TokenKind::CaretEq)], TokenKind::Caret),
            '&' => self.select(&[('&', TokenKind::AndAnd), ('=', TokenKind::AmpEq)], TokenKind::Amp),
            '|' => self.select(&[('|', TokenKind::OrOr), ('=', TokenKind::PipeEq)], TokenKind::Pipe),
            '<' => {
                if self.peek() == Some('<') {
                    self.advance();
                    self.select(&[('=', TokenKind::LtLtEq)], TokenKind::LtLt)
                } else {
                    self.select(&[('=', TokenKind::Le)], TokenKind::Lt)
                }
            }
            '>' => {
                if self.peek() == Some('>') {
                    self.advance();
                    self.select(&[('=', TokenKind::GtGtEq)], TokenKind::GtGt)
                } else {
                    self.select(&[('=', TokenKind::Ge)], TokenKind::Gt)
                }
            }
            '.' => {
                if self.peek() == Some('.') && self.peek_ahead(1) == Some('.') {
                    self.advance();
                    self.advance();
                    TokenKind::Ellipsis
                } else {
                    TokenKind::Dot
                }
            }
            '~' => TokenKind::Tilde,
            '?' => TokenKind::Question,
            ':' => TokenKind::Colon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,

            _ => {
                return Err(LexError {
                    message: format!("Unexpected character: '{}'", ch),
                    location: loc,
                })
            }
        };

        Ok(kind)
    }

    /// One-character lookahead: consume the first matching follower, if any
    fn select(&mut self, followers: &[(char, TokenKind)], single: TokenKind) -> TokenKind {
        for (next, kind) in followers {
            if self.peek() == Some(*next) {
                self.advance();
                return kind.clone();
            }
        }
        single
    }

    fn escape(&mut self) -> Result<char, LexError> {
        let escaped = self.advance().ok_or_else(|| LexError {
            message: "Unexpected end of file in escape sequence".to_string(),
            location: self.current_location(),
        })?;

        let value = match escaped {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'a' => '\u{7}',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '\\' => '\\',
            '?' => '?',
            '0' => '\0',
            'x' => {
                let mut digits = String::new();
                while let Some(c) = self.peek().filter(|c| c.is_ascii_hexdigit()) {
                    digits.push(c);
                    self.advance();
                }
                let code = u8::from_str_radix(&digits, 16).map_err(|_| LexError {
                    message: format!("Invalid hex escape sequence: \\x{}", digits),
                    location: self.current_location(),
                })?;
                code as char
            }
            '"' | '\'' => escaped,
            _ => {
                return Err(LexError {
                    message: format!("Unknown escape sequence: \\{}", escaped),
                    location: self.current_location(),
                });
            }
        };
        Ok(value)
    }

    /// Parse string literal
    fn string_literal(&mut self) -> Result<TokenKind, LexError> {
        let loc = self.token_start.1;
        let mut string = String::new();

        while let Some(ch) = self.peek() {
            match ch {
                '"' => {
                    self.advance(); // consume closing quote
                    return Ok(TokenKind::StringLiteral(string));
                }
                '\n' => break,
                '\\' => {
                    self.advance();
                    string.push(self.escape()?);
                }
                _ => {
                    string.push(ch);
                    self.advance();
                }
            }
        }

        Err(LexError {
            message: "Unterminated string literal".to_string(),
            location: loc,
        })
    }

    /// Parse character literal
    fn char_literal(&mut self) -> Result<TokenKind, LexError> {
        let ch = self.advance().ok_or_else(|| LexError {
            message: "Unexpected end of file in character literal".to_string(),
            location: self.current_location(),
        })?;

        let value = if ch == '\\' { self.escape()? } else { ch };

        if self.advance() != Some('\'') {
            return Err(LexError {
                message: "Expected closing quote in character literal".to_string(),
                location: self.current_location(),
            });
        }

        Ok(TokenKind::CharLiteral(value as i64))
    }

    /// Parse numeric literal: decimal, hex, octal integers and floats
    fn number_literal(&mut self, first: char) -> Result<TokenKind, LexError> {
        let loc = self.token_start.1;

        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            let digits = self.take_while(|c| c.is_ascii_hexdigit());
            self.skip_integer_suffix();
            return i64::from_str_radix(&digits, 16)
                .map(TokenKind::IntLiteral)
                .map_err(|_| LexError {
                    message: format!("Invalid hex literal: 0x{}", digits),
                    location: loc,
                });
        }

        let mut text = String::new();
        text.push(first);
        text.push_str(&self.take_while(|c| c.is_ascii_digit()));

        let mut is_float = first == '.';
        if !is_float && self.peek() == Some('.') {
            is_float = true;
            self.advance();
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.advance();
            text.push('e');
            if let Some(sign @ ('+' | '-')) = self.peek() {
                self.advance();
                text.push(sign);
            }
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }

        if is_float {
            if matches!(self.peek(), Some('f') | Some('F') | Some('l') | Some('L')) {
                self.advance();
            }
            return text
                .parse::<f64>()
                .map(TokenKind::FloatLiteral)
                .map_err(|_| LexError {
                    message: format!("Invalid float literal: {}", text),
                    location: loc,
                });
        }

        self.skip_integer_suffix();
        let parsed = if text.len() > 1 && text.starts_with('0') {
            i64::from_str_radix(&text[1..], 8)
        } else {
            text.parse::<i64>()
        };
        parsed.map(TokenKind::IntLiteral).map_err(|_| LexError {
            message: format!("Invalid integer literal: {}", text),
            location: loc,
        })
    }

    fn skip_integer_suffix(&mut self) {
        while matches!(self.peek(), Some('u') | Some('U') | Some('l') | Some('L')) {
            self.advance();
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(ch) = self.peek().filter(|c| pred(*c)) {
            out.push(ch);
            self.advance();
        }
        out
    }

    /// Parse identifier or keyword
    fn identifier_or_keyword(&mut self, first_char: char) -> TokenKind {
        let mut ident = String::new();
        ident.push(first_char);
        ident.push_str(&self.take_while(|c| c.is_ascii_alphanumeric() || c == '_'));

        TokenKind::keyword(&ident).unwrap_or(TokenKind::Ident(ident))
    }

    /// Skip whitespace and comments
    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') | Some('\n') => {
                    self.advance();
                }
                Some('/') if self.peek_ahead(1) == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek_ahead(1) == Some('*') => self.skip_block_comment()?,
                _ => break,
            }
        }
        Ok(())
    }

    /// Skip single-line comment (// ...)
    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.peek() {
            self.advance();
            if ch == '\n' {
                break;
            }
        }
    }

    /// Skip multi-line comment (/* ... */)
    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start_loc = self.current_location();
        self.advance(); // skip '/'
        self.advance(); // skip '*'

        while !self.is_at_end() {
            if self.peek() == Some('*') && self.peek_ahead(1) == Some('/') {
                self.advance();
                self.advance();
                return Ok(());
            }
            self.advance();
        }

        Err(LexError {
            message: "Unterminated block comment".to_string(),
            location: start_loc,
        })
    }

    /// Skip preprocessor directive, honouring backslash line continuations
    fn skip_preprocessor_directive(&mut self) {
        while let Some(ch) = self.peek() {
            self.advance();
            if ch == '\\' && self.peek() == Some('\n') {
                self.advance();
            } else if ch == '\n' {
                break;
            }
        }
    }

    /// True when only whitespace precedes the cursor on the current line
    fn at_line_start(&self) -> bool {
        self.input[..self.position]
            .iter()
            .rev()
            .take_while(|c| **c != '\n')
            .all(|c| c.is_whitespace())
    }

    /// Peek at current character without consuming
    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    /// Peek ahead n characters
    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.input.get(self.position + n).copied()
    }

    /// Advance to next character
    fn advance(&mut self) -> Option<char> {
        let ch = *self.input.get(self.position)?;
        self.position += 1;

        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }

        Some(ch)
    }

    /// Check if at end of input
    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    /// Get current source location
    fn current_location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_tokens() {
        let tokens = Lexer::new("int main() { return 0; }").tokenize().unwrap();

        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[1].kind, TokenKind::Ident("main".to_string()));
        assert_eq!(tokens[1].text, "main");
        assert_eq!(tokens[1].location, SourceLocation::new(1, 5));
        assert_eq!(tokens[2].kind, TokenKind::LParen);
        assert_eq!(tokens[3].kind, TokenKind::RParen);
        assert_eq!(tokens[4].kind, TokenKind::LBrace);
        assert_eq!(tokens[5].kind, TokenKind::Return);
        assert_eq!(tokens[6].kind, TokenKind::IntLiteral(0));
        assert_eq!(tokens[7].kind, TokenKind::Semicolon);
        assert_eq!(tokens[8].kind, TokenKind::RBrace);
        assert_eq!(tokens[9].kind, TokenKind::Eof);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("++ -- += -= == != && || -> <<= >>= << >> <= >= &= |= ^= ..."),
            vec![
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Arrow,
                TokenKind::LtLtEq,
                TokenKind::GtGtEq,
                TokenKind::LtLt,
                TokenKind::GtGt,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::AmpEq,
                TokenKind::PipeEq,
                TokenKind::CaretEq,
                TokenKind::Ellipsis,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        let tokens = kinds("int x; // comment\nint y; /* block\ncomment */ int z;");

        assert_eq!(tokens[0], TokenKind::Int);
        assert_eq!(tokens[1], TokenKind::Ident("x".to_string()));
        assert_eq!(tokens[2], TokenKind::Semicolon);
        assert_eq!(tokens[3], TokenKind::Int);
        assert_eq!(tokens[4], TokenKind::Ident("y".to_string()));
        assert_eq!(tokens[6], TokenKind::Int);
        assert_eq!(tokens[7], TokenKind::Ident("z".to_string()));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 0x2A 052 3.5 1e3 2.0f 10u"),
            vec![
                TokenKind::IntLiteral(42),
                TokenKind::IntLiteral(42),
                TokenKind::IntLiteral(42),
                TokenKind::FloatLiteral(3.5),
                TokenKind::FloatLiteral(1000.0),
                TokenKind::FloatLiteral(2.0),
                TokenKind::IntLiteral(10),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_and_char_literals() {
        let tokens = kinds(r#""hello\nworld" 'a' '\n' '\x41'"#);

        assert_eq!(tokens[0], TokenKind::StringLiteral("hello\nworld".to_string()));
        assert_eq!(tokens[1], TokenKind::CharLiteral(97));
        assert_eq!(tokens[2], TokenKind::CharLiteral(10));
        assert_eq!(tokens[3], TokenKind::CharLiteral(65));
    }

    #[test]
    fn test_module_keywords() {
        assert_eq!(
            kinds("module m; import io from \"io.rt\"; export f;")[..6],
            [
                TokenKind::Module,
                TokenKind::Ident("m".to_string()),
                TokenKind::Semicolon,
                TokenKind::Import,
                TokenKind::Ident("io".to_string()),
                TokenKind::From,
            ]
        );
    }

    #[test]
    fn test_preprocessor_skip() {
        let tokens = kinds("#include <stdio.h>\n#define X \\\n 1\nint x;");

        assert_eq!(tokens[0], TokenKind::Int);
        assert_eq!(tokens[1], TokenKind::Ident("x".to_string()));
    }

    #[test]
    fn test_errors_are_collected() {
        let (tokens, errors) = Lexer::new("int @ x; $").tokenize_all();

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].location, SourceLocation::new(1, 5));
        assert!(errors[0].message.contains('@'));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Ident("x".to_string())));
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert!(err.to_string().contains("Unterminated string literal"));
    }
}
