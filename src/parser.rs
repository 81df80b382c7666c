//! Parser for accelerator programs
//!
//! Parses programs like:
//! - `decl a: ubit<32>[8 bank 2];`
//! - `def scale(a: ubit<32>[4]) { for (let i = 0..4) { a[i] *= 2; } }`
//! - `let x = a[0] + 1; scale(a);`
//!
//! Every command receives a fresh source position in source order.

use crate::ast::{BinOp, Command, CommandKind, Decl, Dim, Expr, FuncDef, Pos, Prog, Type};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Token};

/// Parser for accelerator programs
pub struct Parser<'source> {
    source: &'source str,
    lexer: Lexer<'source>,
    current: Option<Token>,
    next_pos: u32,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            lexer: Lexer::new(source),
            current: None,
            next_pos: 0,
        }
    }

    /// Advance to the next token, surfacing lexer failures
    fn advance(&mut self) -> CompileResult<Option<Token>> {
        let next = match self.lexer.next() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(())) => {
                let span = self.lexer.span();
                return Err(CompileError::LexerError {
                    position: span.start,
                    message: format!("unexpected input `{}`", &self.source[span]),
                });
            }
            None => None,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume the token if it matches
    fn eat(&mut self, expected: &Token) -> CompileResult<bool> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<Token> {
        if self.check(&expected) {
            self.advance()?
                .ok_or_else(|| CompileError::parse_error("unexpected end of input"))
        } else {
            Err(self.unexpected(&format!("`{}`", expected)))
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.current.clone() {
            Some(Token::Ident(name)) => {
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn expect_int(&mut self) -> CompileResult<u64> {
        match self.current {
            Some(Token::Int(n)) => {
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.unexpected("an integer")),
        }
    }

    fn unexpected(&self, wanted: &str) -> CompileError {
        match &self.current {
            Some(tok) => CompileError::parse_error(format!(
                "expected {}, found `{}` at position {}",
                wanted,
                tok,
                self.lexer.span().start
            )),
            None => CompileError::parse_error(format!("expected {}, found end of input", wanted)),
        }
    }

    fn fresh_pos(&mut self) -> Pos {
        let pos = Pos(self.next_pos);
        self.next_pos += 1;
        pos
    }

    /// Parse a complete program: external declarations, function
    /// definitions, then the top-level body
    pub fn parse_program(&mut self) -> CompileResult<Prog> {
        self.advance()?;

        let mut decls = Vec::new();
        while self.check(&Token::Decl) {
            let pos = self.fresh_pos();
            self.advance()?;
            let (name, ty) = self.parse_binding()?;
            self.expect(Token::Semicolon)?;
            decls.push(Decl { pos, name, ty });
        }

        let mut defs = Vec::new();
        while self.check(&Token::Def) {
            defs.push(self.parse_def()?);
        }

        let body = if self.current.is_some() {
            Some(self.parse_commands()?)
        } else {
            None
        };

        Ok(Prog { decls, defs, body })
    }

    /// `name: type`
    fn parse_binding(&mut self) -> CompileResult<(String, Type)> {
        let name = self.expect_ident()?;
        self.expect(Token::Colon)?;
        let ty = self.parse_type()?;
        Ok((name, ty))
    }

    fn parse_def(&mut self) -> CompileResult<FuncDef> {
        let pos = self.fresh_pos();
        self.expect(Token::Def)?;
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;

        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let pos = self.fresh_pos();
                let (name, ty) = self.parse_binding()?;
                params.push(Decl { pos, name, ty });
                if !self.eat(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        let body = self.parse_block()?;
        Ok(FuncDef {
            pos,
            name,
            params,
            body,
        })
    }

    /// Parse a type: a scalar followed by optional array dimensions
    pub fn parse_type(&mut self) -> CompileResult<Type> {
        let scalar = match self.current {
            Some(Token::BoolTy) => {
                self.advance()?;
                Type::Bool
            }
            Some(Token::UBitTy) | Some(Token::BitTy) => {
                let signed = self.check(&Token::BitTy);
                self.advance()?;
                self.expect(Token::Lt)?;
                let width = self.parse_width()?;
                self.expect(Token::Gt)?;
                Type::Bit { width, signed }
            }
            Some(Token::FixTy) => {
                self.advance()?;
                self.expect(Token::Lt)?;
                let width = self.parse_width()?;
                self.expect(Token::Comma)?;
                let frac = self.parse_width()?;
                self.expect(Token::Gt)?;
                Type::Fix { width, frac }
            }
            _ => return Err(self.unexpected("a type")),
        };

        let mut dims = Vec::new();
        while self.eat(&Token::LBracket)? {
            let size = self.expect_int()?;
            let bank = if self.eat(&Token::Bank)? {
                self.expect_int()?
            } else {
                size
            };
            self.expect(Token::RBracket)?;
            dims.push(Dim::new(size, bank));
        }

        if dims.is_empty() {
            Ok(scalar)
        } else {
            Ok(Type::array(scalar, dims))
        }
    }

    fn parse_width(&mut self) -> CompileResult<u32> {
        let n = self.expect_int()?;
        u32::try_from(n)
            .ok()
            .filter(|w| *w > 0)
            .ok_or_else(|| CompileError::parse_error(format!("invalid bit width {}", n)))
    }

    /// `{ commands }`
    fn parse_block(&mut self) -> CompileResult<Command> {
        self.expect(Token::LBrace)?;
        let body = if self.check(&Token::RBrace) {
            Command::new(self.fresh_pos(), CommandKind::Empty)
        } else {
            self.parse_commands()?
        };
        self.expect(Token::RBrace)?;
        Ok(body)
    }

    /// Parse commands until `}` or end of input
    fn parse_commands(&mut self) -> CompileResult<Command> {
        let pos = self.fresh_pos();
        let mut cmds = Vec::new();
        while self.current.is_some() && !self.check(&Token::RBrace) {
            // Stray separators are allowed
            if self.eat(&Token::Semicolon)? {
                continue;
            }
            cmds.push(self.parse_command()?);
        }
        if cmds.len() == 1 {
            Ok(cmds.remove(0))
        } else {
            Ok(Command::new(pos, CommandKind::Seq(cmds)))
        }
    }

    fn parse_command(&mut self) -> CompileResult<Command> {
        let pos = self.fresh_pos();
        let kind = match self.current {
            Some(Token::Decl) => {
                self.advance()?;
                let (name, ty) = self.parse_binding()?;
                self.expect(Token::Semicolon)?;
                CommandKind::Decl { name, ty }
            }
            Some(Token::Let) => {
                self.advance()?;
                let name = self.expect_ident()?;
                let ty = if self.eat(&Token::Colon)? {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect(Token::Equals)?;
                let init = self.parse_expr()?;
                self.expect(Token::Semicolon)?;
                CommandKind::Let { name, ty, init }
            }
            Some(Token::For) => {
                self.advance()?;
                self.expect(Token::LParen)?;
                self.expect(Token::Let)?;
                let iter = self.expect_ident()?;
                self.expect(Token::Equals)?;
                let start = self.expect_int()?;
                self.expect(Token::DotDot)?;
                let end = self.expect_int()?;
                self.expect(Token::RParen)?;
                let unroll = if self.eat(&Token::Unroll)? {
                    Some(self.expect_int()?)
                } else {
                    None
                };
                let body = self.parse_block()?;
                CommandKind::For {
                    iter,
                    start,
                    end,
                    unroll,
                    body: Box::new(body),
                }
            }
            Some(Token::If) => {
                self.advance()?;
                self.expect(Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(Token::RParen)?;
                let then_branch = self.parse_block()?;
                let else_branch = if self.eat(&Token::Else)? {
                    if self.check(&Token::If) {
                        Some(Box::new(self.parse_command()?))
                    } else {
                        Some(Box::new(self.parse_block()?))
                    }
                } else {
                    None
                };
                CommandKind::If {
                    cond,
                    then_branch: Box::new(then_branch),
                    else_branch,
                }
            }
            Some(Token::Advance) => {
                self.advance()?;
                let array = self.expect_ident()?;
                self.expect(Token::Semicolon)?;
                CommandKind::Advance(array)
            }
            _ => {
                let target = self.parse_expr()?;
                let kind = match self.current {
                    Some(Token::Assign) => {
                        self.advance()?;
                        let value = self.parse_expr()?;
                        CommandKind::Update { target, value }
                    }
                    Some(Token::PlusAssign) | Some(Token::MinusAssign) | Some(Token::StarAssign) => {
                        let op = match self.advance()? {
                            Some(Token::PlusAssign) => BinOp::Add,
                            Some(Token::MinusAssign) => BinOp::Sub,
                            _ => BinOp::Mul,
                        };
                        let value = self.parse_expr()?;
                        CommandKind::Reduce { op, target, value }
                    }
                    _ => CommandKind::Expr(target),
                };
                self.expect(Token::Semicolon)?;
                kind
            }
        };
        Ok(Command::new(pos, kind))
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr)? {
            let right = self.parse_and()?;
            left = Expr::binop(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::AndAnd)? {
            let right = self.parse_comparison()?;
            left = Expr::binop(BinOp::And, left, right);
        }
        Ok(left)
    }

    /// Comparisons do not chain
    fn parse_comparison(&mut self) -> CompileResult<Expr> {
        let left = self.parse_bitwise()?;
        let op = match self.current {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Neq,
            _ => return Ok(left),
        };
        self.advance()?;
        let right = self.parse_bitwise()?;
        Ok(Expr::binop(op, left, right))
    }

    fn parse_bitwise(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current {
                Some(Token::Shl) => BinOp::Shl,
                Some(Token::Shr) => BinOp::Shr,
                Some(Token::Amp) => BinOp::BitAnd,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_additive()?;
            left = Expr::binop(op, left, right);
        }
        Ok(left)
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::binop(op, left, right);
        }
        Ok(left)
    }

    /// Parse multiplicative expressions: a * b
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_primary()?;
        while self.eat(&Token::Star)? {
            let right = self.parse_primary()?;
            left = Expr::binop(BinOp::Mul, left, right);
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.current.clone() {
            Some(Token::Int(n)) => {
                self.advance()?;
                Ok(Expr::Int(n))
            }
            Some(Token::True) => {
                self.advance()?;
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance()?;
                Ok(Expr::Bool(false))
            }
            Some(Token::LParen) => {
                self.advance()?;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.advance()?;
                if self.eat(&Token::LParen)? {
                    let mut args = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Token::Comma)? {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    return Ok(Expr::App { func: name, args });
                }

                let mut idxs = Vec::new();
                while self.eat(&Token::LBracket)? {
                    idxs.push(self.parse_expr()?);
                    self.expect(Token::RBracket)?;
                }
                if idxs.is_empty() {
                    Ok(Expr::Var(name))
                } else {
                    Ok(Expr::Access { array: name, idxs })
                }
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Prog {
        Parser::new(source).parse_program().unwrap()
    }

    #[test]
    fn test_parse_declarations() {
        let prog = parse("decl a: ubit<32>[8 bank 2][4]; decl f: fix<16, 8>;");
        assert_eq!(prog.decls.len(), 2);
        assert_eq!(
            prog.decls[0].ty,
            Type::array(Type::ubit(32), vec![Dim::new(8, 2), Dim::unbanked(4)])
        );
        assert_eq!(prog.decls[1].ty, Type::Fix { width: 16, frac: 8 });
        assert!(prog.body.is_none());
    }

    #[test]
    fn test_parse_let_and_store() {
        let prog = parse("decl a: ubit<32>[4]; let x = a[0] + 1; a[1] := x;");
        let body = prog.body.unwrap();
        if let CommandKind::Seq(cmds) = &body.kind {
            assert_eq!(cmds.len(), 2);
            assert_eq!(cmds[0].to_string(), "let x = a[0] + 1;");
            assert!(matches!(cmds[1].kind, CommandKind::Update { .. }));
        } else {
            panic!("Expected Seq");
        }
    }

    #[test]
    fn test_parse_nested_loops() {
        let prog = parse(
            "decl a: ubit<32>[1][2]; let x = 1;
             for (let i = 0..1) { for (let j = 0..2) unroll 2 { a[i][j] += x; } }",
        );
        let body = prog.body.unwrap();
        let CommandKind::Seq(cmds) = &body.kind else {
            panic!("Expected Seq");
        };
        let CommandKind::For { iter, end, body, .. } = &cmds[1].kind else {
            panic!("Expected For");
        };
        assert_eq!(iter, "i");
        assert_eq!(*end, 1);
        let CommandKind::For { unroll, body, .. } = &body.kind else {
            panic!("Expected inner For");
        };
        assert_eq!(*unroll, Some(2));
        assert!(matches!(
            body.kind,
            CommandKind::Reduce { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn test_parse_def_and_call() {
        let prog = parse(
            "decl m: ubit<8>[4];
             def clear(a: ubit<8>[4]) { for (let i = 0..4) { a[i] := 0; } }
             clear(m);",
        );
        assert_eq!(prog.defs.len(), 1);
        assert_eq!(prog.defs[0].to_string(), "def clear(a: ubit<8>[4])");
        let body = prog.body.unwrap();
        assert!(matches!(body.kind, CommandKind::Expr(Expr::App { .. })));
    }

    #[test]
    fn test_precedence() {
        let mut parser = Parser::new("a + b * c < d && e");
        parser.advance().unwrap();
        let expr = parser.parse_expr().unwrap();
        assert_eq!(expr.to_string(), "((a + (b * c)) < d) && e");
    }

    #[test]
    fn test_positions_are_unique() {
        let prog = parse("let x = 0; let y = 1; advance a;");
        let CommandKind::Seq(cmds) = prog.body.unwrap().kind else {
            panic!("Expected Seq");
        };
        let mut positions: Vec<_> = cmds.iter().map(|c| c.pos).collect();
        positions.dedup();
        assert_eq!(positions.len(), 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Parser::new("let x = ;").parse_program(),
            Err(CompileError::ParseError { .. })
        ));
        assert!(matches!(
            Parser::new("let x = 1 $ 2;").parse_program(),
            Err(CompileError::LexerError { .. })
        ));
    }
}
