//! Lexer for the accelerator language using logos
//!
//! Supports tokens like:
//! - Identifiers and keywords: a, src_mem, decl, for, unroll
//! - Integers: 0, 32, 1024
//! - Operators: + - * < <= == && << := += ..
//! - Punctuation: ( ) [ ] { } , ; :

use logos::Logos;

/// Token types for the accelerator language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"([ \t\n\r]+|//[^\n]*)")] // Skip whitespace and line comments
pub enum Token {
    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u64>().ok())]
    Int(u64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Keywords
    #[token("decl")]
    Decl,
    #[token("let")]
    Let,
    #[token("def")]
    Def,
    #[token("for")]
    For,
    #[token("unroll")]
    Unroll,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("advance")]
    Advance,
    #[token("bank")]
    Bank,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("bool")]
    BoolTy,
    #[token("ubit")]
    UBitTy,
    #[token("bit")]
    BitTy,
    #[token("fix")]
    FixTy,

    // Operators
    #[token(":=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("..")]
    DotDot,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("&")]
    Amp,
    #[token("=")]
    Equals,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::Int(n) => return write!(f, "{}", n),
            Token::Ident(s) => return write!(f, "{}", s),
            Token::Decl => "decl",
            Token::Let => "let",
            Token::Def => "def",
            Token::For => "for",
            Token::Unroll => "unroll",
            Token::If => "if",
            Token::Else => "else",
            Token::Advance => "advance",
            Token::Bank => "bank",
            Token::True => "true",
            Token::False => "false",
            Token::BoolTy => "bool",
            Token::UBitTy => "ubit",
            Token::BitTy => "bit",
            Token::FixTy => "fix",
            Token::Assign => ":=",
            Token::PlusAssign => "+=",
            Token::MinusAssign => "-=",
            Token::StarAssign => "*=",
            Token::DotDot => "..",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Amp => "&",
            Token::Equals => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Colon => ":",
        };
        f.write_str(text)
    }
}

/// Lexer wrapper that provides a stream of tokens with source spans
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }

    /// Span of the most recently produced token
    pub fn span(&self) -> std::ops::Range<usize> {
        self.inner.span()
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<Token, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
