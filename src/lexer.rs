use std::fmt;

use tracing::debug;

use crate::error::{DiagnosticKind, Diagnostics, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Func,
    As,
    And,
    Or,
    Not,
    Bool,
    Int,
    Long,
    Float,
    Idiv,
    Mod,
    True,
    False,
    Nothing,
    Var,
    If,
    Else,
    While,
    Do,
    For,
    Return,
    Operation,
    Stage,
    Now,
    Next,
    Param,
    Init,
    Holds,
    Each,
    At,
    In,
    Struct,
    To,
    SByte,
    UByte,
    Break,
    Continue,
    Parallel,
}

impl Keyword {
    pub const ALL: [(&'static str, Keyword); 38] = [
        ("func", Keyword::Func),
        ("as", Keyword::As),
        ("and", Keyword::And),
        ("or", Keyword::Or),
        ("not", Keyword::Not),
        ("bool", Keyword::Bool),
        ("int", Keyword::Int),
        ("long", Keyword::Long),
        ("float", Keyword::Float),
        ("idiv", Keyword::Idiv),
        ("mod", Keyword::Mod),
        ("true", Keyword::True),
        ("false", Keyword::False),
        ("nothing", Keyword::Nothing),
        ("var", Keyword::Var),
        ("if", Keyword::If),
        ("else", Keyword::Else),
        ("while", Keyword::While),
        ("do", Keyword::Do),
        ("for", Keyword::For),
        ("return", Keyword::Return),
        ("operation", Keyword::Operation),
        ("stage", Keyword::Stage),
        ("now", Keyword::Now),
        ("next", Keyword::Next),
        ("param", Keyword::Param),
        ("init", Keyword::Init),
        ("holds", Keyword::Holds),
        ("each", Keyword::Each),
        ("at", Keyword::At),
        ("in", Keyword::In),
        ("struct", Keyword::Struct),
        ("to", Keyword::To),
        ("sbyte", Keyword::SByte),
        ("ubyte", Keyword::UByte),
        ("break", Keyword::Break),
        ("continue", Keyword::Continue),
        ("parallel", Keyword::Parallel),
    ];

    pub fn from_word(word: &str) -> Option<Keyword> {
        Self::ALL
            .iter()
            .find(|(text, _)| *text == word)
            .map(|(_, keyword)| *keyword)
    }

    pub fn as_str(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, keyword)| keyword == self)
            .map(|(text, _)| *text)
            .unwrap_or("?")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    AddStageAssign,
    SubtractStageAssign,
    MultiplyStageAssign,
    DivideStageAssign,
    Increment,
    Decrement,
    AddAssign,
    SubtractAssign,
    MultiplyAssign,
    DivideAssign,
    LessOrEqual,
    GreaterOrEqual,
    NotEqual,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Plus,
    Minus,
    Star,
    Slash,
    Less,
    Greater,
    Bang,
    Equals,
}

// Longest match wins: the three tables are tried in this order.
const THREE_CHAR_SYMBOLS: [(&str, Symbol); 4] = [
    ("+<=", Symbol::AddStageAssign),
    ("-<=", Symbol::SubtractStageAssign),
    ("*<=", Symbol::MultiplyStageAssign),
    ("/<=", Symbol::DivideStageAssign),
];

const TWO_CHAR_SYMBOLS: [(&str, Symbol); 9] = [
    ("++", Symbol::Increment),
    ("--", Symbol::Decrement),
    ("+=", Symbol::AddAssign),
    ("-=", Symbol::SubtractAssign),
    ("*=", Symbol::MultiplyAssign),
    ("/=", Symbol::DivideAssign),
    ("<=", Symbol::LessOrEqual),
    (">=", Symbol::GreaterOrEqual),
    ("!=", Symbol::NotEqual),
];

const ONE_CHAR_SYMBOLS: [(char, Symbol); 19] = [
    ('.', Symbol::Dot),
    (',', Symbol::Comma),
    (':', Symbol::Colon),
    (';', Symbol::Semicolon),
    ('?', Symbol::Question),
    ('{', Symbol::LeftBrace),
    ('}', Symbol::RightBrace),
    ('(', Symbol::LeftParen),
    (')', Symbol::RightParen),
    ('[', Symbol::LeftBracket),
    (']', Symbol::RightBracket),
    ('+', Symbol::Plus),
    ('-', Symbol::Minus),
    ('*', Symbol::Star),
    ('/', Symbol::Slash),
    ('<', Symbol::Less),
    ('>', Symbol::Greater),
    ('!', Symbol::Bang),
    ('=', Symbol::Equals),
];

impl Symbol {
    pub fn as_str(&self) -> &'static str {
        if let Some((text, _)) = THREE_CHAR_SYMBOLS.iter().find(|(_, s)| s == self) {
            return text;
        }
        if let Some((text, _)) = TWO_CHAR_SYMBOLS.iter().find(|(_, s)| s == self) {
            return text;
        }
        match self {
            Symbol::Dot => ".",
            Symbol::Comma => ",",
            Symbol::Colon => ":",
            Symbol::Semicolon => ";",
            Symbol::Question => "?",
            Symbol::LeftBrace => "{",
            Symbol::RightBrace => "}",
            Symbol::LeftParen => "(",
            Symbol::RightParen => ")",
            Symbol::LeftBracket => "[",
            Symbol::RightBracket => "]",
            Symbol::Plus => "+",
            Symbol::Minus => "-",
            Symbol::Star => "*",
            Symbol::Slash => "/",
            Symbol::Less => "<",
            Symbol::Greater => ">",
            Symbol::Bang => "!",
            Symbol::Equals => "=",
            _ => "?",
        }
    }

    /// Every lexable symbol with its source text.
    pub fn table() -> Vec<(String, Symbol)> {
        let mut table: Vec<(String, Symbol)> = Vec::new();
        table.extend(THREE_CHAR_SYMBOLS.iter().map(|(t, s)| (t.to_string(), *s)));
        table.extend(TWO_CHAR_SYMBOLS.iter().map(|(t, s)| (t.to_string(), *s)));
        table.extend(ONE_CHAR_SYMBOLS.iter().map(|(c, s)| (c.to_string(), *s)));
        table
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Keyword(Keyword),
    Symbol(Symbol),
    IntegerLiteral(i64),
    FloatLiteral(f64),
    Invalid,
    EndOfInput,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Identifier(name) => write!(f, "identifier '{}'", name),
            TokenKind::Keyword(keyword) => write!(f, "'{}'", keyword.as_str()),
            TokenKind::Symbol(symbol) => write!(f, "'{}'", symbol.as_str()),
            TokenKind::IntegerLiteral(value) => write!(f, "integer {}", value),
            TokenKind::FloatLiteral(value) => write!(f, "number {}", value),
            TokenKind::Invalid => write!(f, "invalid token"),
            TokenKind::EndOfInput => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: Position,
}

impl Token {
    pub fn new(kind: TokenKind, position: Position) -> Self {
        Self { kind, position }
    }

    pub fn end_of_input() -> Self {
        Self::new(TokenKind::EndOfInput, Position::END_OF_INPUT)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    pub fn is_symbol(&self, symbol: Symbol) -> bool {
        self.kind == TokenKind::Symbol(symbol)
    }

    pub fn is_end(&self) -> bool {
        self.kind == TokenKind::EndOfInput
    }

    pub fn identifier(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Identifier(name) => Some(name),
            _ => None,
        }
    }
}

/// Randomly addressable token sequence with a cursor. Reads past the end keep
/// yielding the end-of-input token.
#[derive(Debug, Clone)]
pub struct TokenStream {
    tokens: Vec<Token>,
    cursor: usize,
    end: Token,
}

impl TokenStream {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            cursor: 0,
            end: Token::end_of_input(),
        }
    }

    pub fn peek(&self) -> &Token {
        self.look_ahead(0)
    }

    pub fn look_ahead(&self, offset: usize) -> &Token {
        self.tokens.get(self.cursor + offset).unwrap_or(&self.end)
    }

    pub fn read(&mut self) -> Token {
        let token = self.peek().clone();
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
        }
        token
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor back to a position previously returned by `cursor()`.
    pub fn rewind(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.tokens.len());
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    diagnostics: Diagnostics,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 0,
            column: 0,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn tokenize(mut self) -> (TokenStream, Diagnostics) {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia();
            if self.is_at_end() {
                break;
            }
            tokens.push(self.next_token());
        }

        debug!(tokens = tokens.len(), errors = self.diagnostics.len(), "lexed source");
        (TokenStream::new(tokens), self.diagnostics)
    }

    fn next_token(&mut self) -> Token {
        let start = Position::new(self.line, self.column);
        let ch = self.current_char();

        let kind = if ch.is_alphabetic() || ch == '_' {
            self.read_identifier()
        } else if ch.is_ascii_digit() {
            self.read_number(start)
        } else {
            self.read_symbol(start)
        };

        Token::new(kind, start)
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut value = String::new();

        while !self.is_at_end() && (self.current_char().is_alphanumeric() || self.current_char() == '_') {
            value.push(self.current_char());
            self.advance();
        }

        match Keyword::from_word(&value) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier(value),
        }
    }

    fn read_number(&mut self, start: Position) -> TokenKind {
        let mut value = String::new();

        while !self.is_at_end() && self.current_char().is_ascii_digit() {
            value.push(self.current_char());
            self.advance();
        }

        let is_float = self.current_char() == '.' && self.char_at(1).is_ascii_digit();
        if is_float {
            value.push('.');
            self.advance();
            while !self.is_at_end() && self.current_char().is_ascii_digit() {
                value.push(self.current_char());
                self.advance();
            }
            return match value.parse::<f64>() {
                Ok(number) => TokenKind::FloatLiteral(number),
                Err(_) => self.invalid_number(start, &value),
            };
        }

        match value.parse::<i64>() {
            Ok(number) => TokenKind::IntegerLiteral(number),
            Err(_) => self.invalid_number(start, &value),
        }
    }

    fn invalid_number(&mut self, start: Position, text: &str) -> TokenKind {
        self.diagnostics.error(
            DiagnosticKind::Lexical,
            start,
            format!("numeric literal '{}' is out of range", text),
        );
        TokenKind::Invalid
    }

    fn read_symbol(&mut self, start: Position) -> TokenKind {
        for (text, symbol) in THREE_CHAR_SYMBOLS.iter() {
            if self.starts_with(text) {
                self.advance_by(3);
                return TokenKind::Symbol(*symbol);
            }
        }
        for (text, symbol) in TWO_CHAR_SYMBOLS.iter() {
            if self.starts_with(text) {
                self.advance_by(2);
                return TokenKind::Symbol(*symbol);
            }
        }

        let ch = self.current_char();
        self.advance();
        match ONE_CHAR_SYMBOLS.iter().find(|(c, _)| *c == ch) {
            Some((_, symbol)) => TokenKind::Symbol(*symbol),
            None => {
                self.diagnostics.error(
                    DiagnosticKind::Lexical,
                    start,
                    format!("invalid symbol '{}'", ch),
                );
                TokenKind::Invalid
            }
        }
    }

    fn skip_trivia(&mut self) {
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '/' && self.char_at(1) == '/' {
                while !self.is_at_end() && self.current_char() != '\n' {
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars().enumerate().all(|(i, c)| self.char_at(i) == c)
    }

    fn current_char(&self) -> char {
        self.char_at(0)
    }

    fn char_at(&self, offset: usize) -> char {
        self.input.get(self.position + offset).copied().unwrap_or('\0')
    }

    fn advance_by(&mut self, count: usize) {
        for _ in 0..count {
            self.advance();
        }
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            if self.current_char() == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }
}

/// Lexes a whole source text.
pub fn lex(source: &str) -> (TokenStream, Diagnostics) {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, diagnostics) = lex(source);
        assert!(!diagnostics.has_errors(), "unexpected diagnostics: {}", diagnostics);
        tokens.tokens().iter().map(|t| t.kind.clone()).collect()
    }

    #[test]
    fn test_every_keyword_lexes_alone() {
        for (text, keyword) in Keyword::ALL.iter() {
            let (tokens, diagnostics) = lex(text);
            assert!(!diagnostics.has_errors());
            assert_eq!(tokens.len(), 1, "keyword {}", text);
            assert_eq!(tokens.peek().kind, TokenKind::Keyword(*keyword));
            assert_eq!(tokens.peek().position, Position::new(0, 0));
        }
    }

    #[test]
    fn test_every_symbol_lexes_alone() {
        for (text, symbol) in Symbol::table() {
            let (tokens, diagnostics) = lex(&text);
            assert!(!diagnostics.has_errors());
            assert_eq!(tokens.len(), 1, "symbol {}", text);
            assert_eq!(tokens.peek().kind, TokenKind::Symbol(symbol));
            assert_eq!(tokens.peek().position, Position::new(0, 0));
            assert_eq!(symbol.as_str(), text);
        }
    }

    #[test]
    fn test_stage_assign_is_not_split() {
        assert_eq!(kinds("+<="), vec![TokenKind::Symbol(Symbol::AddStageAssign)]);
        assert_eq!(
            kinds("+<=-<="),
            vec![
                TokenKind::Symbol(Symbol::AddStageAssign),
                TokenKind::Symbol(Symbol::SubtractStageAssign),
            ]
        );
        assert_eq!(
            kinds("+= +"),
            vec![TokenKind::Symbol(Symbol::AddAssign), TokenKind::Symbol(Symbol::Plus)]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("42"), vec![TokenKind::IntegerLiteral(42)]);
        assert_eq!(kinds("2.5"), vec![TokenKind::FloatLiteral(2.5)]);
        assert_eq!(
            kinds("3."),
            vec![TokenKind::IntegerLiteral(3), TokenKind::Symbol(Symbol::Dot)]
        );
    }

    #[test]
    fn test_identifiers_and_comments() {
        let tokens = kinds("stage value_1 as int; // trailing\nnow");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Keyword(Keyword::Stage),
                TokenKind::Identifier("value_1".to_string()),
                TokenKind::Keyword(Keyword::As),
                TokenKind::Keyword(Keyword::Int),
                TokenKind::Symbol(Symbol::Semicolon),
                TokenKind::Keyword(Keyword::Now),
            ]
        );
    }

    #[test]
    fn test_positions_track_lines() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!(tokens.tokens()[0].position, Position::new(0, 0));
        assert_eq!(tokens.tokens()[1].position, Position::new(1, 2));
    }

    #[test]
    fn test_invalid_symbol_reports_and_continues() {
        let (tokens, diagnostics) = lex("a # b");
        assert_eq!(diagnostics.errors().count(), 1);
        let error = diagnostics.errors().next().unwrap();
        assert_eq!(error.kind, DiagnosticKind::Lexical);
        assert_eq!(error.position, Position::new(0, 2));
        assert!(matches!(tokens.tokens()[1].kind, TokenKind::Invalid));
        assert_eq!(tokens.tokens()[2].identifier(), Some("b"));
    }

    #[test]
    fn test_out_of_range_integer() {
        let (_, diagnostics) = lex("99999999999999999999");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Lexical), 1);
    }

    #[test]
    fn test_stream_is_bounds_safe() {
        let (mut tokens, _) = lex("x ;");
        assert_eq!(tokens.look_ahead(1).kind, TokenKind::Symbol(Symbol::Semicolon));
        assert!(tokens.look_ahead(5).is_end());
        tokens.read();
        tokens.read();
        assert!(tokens.is_at_end());
        let past_end = tokens.read();
        assert!(past_end.is_end());
        assert_eq!(past_end.position, Position::END_OF_INPUT);
        tokens.reset();
        assert_eq!(tokens.peek().identifier(), Some("x"));
    }
}
