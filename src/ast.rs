//! Abstract Syntax Tree definitions for accelerator programs
//!
//! Holds both the source tree produced by the parser and the typed tree
//! produced by the type checker and refined by the banking rewriter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Id = String;

/// Source-position tag attached to every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos(pub u32);

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimal unsigned width able to represent `n`, never less than one bit
pub fn bits_needed(n: u64) -> u32 {
    (u64::BITS - n.leading_zeros()).max(1)
}

/// One array dimension of `size` elements. The bank factor `bank` is the
/// number of elements per physical memory, so the dimension is split across
/// `size / bank` memories. An unannotated dimension has `bank == size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub size: u64,
    pub bank: u64,
}

impl Dim {
    pub fn new(size: u64, bank: u64) -> Self {
        Self { size, bank }
    }

    /// A dimension held by a single memory
    pub fn unbanked(size: u64) -> Self {
        Self { size, bank: size }
    }

    /// Number of elements held by each bank along this dimension
    pub fn bank_len(&self) -> u64 {
        self.bank
    }

    /// Number of physical memories along this dimension
    pub fn bank_count(&self) -> u64 {
        self.size / self.bank
    }
}

/// Source-level types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Bool,
    /// `ubit<w>` when unsigned, `bit<w>` when signed
    Bit { width: u32, signed: bool },
    /// Fixed point with `width` total bits, `frac` of them fractional
    Fix { width: u32, frac: u32 },
    /// Compile-time integer; the type of integer literals
    Static(u64),
    /// Loop iterator over `[_, bound)`, `bank` is the loop's unroll factor
    Idx { bound: u64, bank: Option<u64> },
    Array { elem: Box<Type>, dims: Vec<Dim> },
    /// Result of a function application
    Void,
}

impl Type {
    pub fn ubit(width: u32) -> Self {
        Type::Bit { width, signed: false }
    }

    pub fn array(elem: Type, dims: Vec<Dim>) -> Self {
        Type::Array {
            elem: Box::new(elem),
            dims,
        }
    }

    /// Bit width of a value of this type. Arrays report their element width.
    pub fn width(&self) -> u32 {
        match self {
            Type::Bool => 1,
            Type::Bit { width, .. } | Type::Fix { width, .. } => *width,
            Type::Static(n) => bits_needed(*n),
            Type::Idx { bound, .. } => bits_needed(bound.saturating_sub(1)),
            Type::Array { elem, .. } => elem.width(),
            Type::Void => 0,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Bit { .. } | Type::Static(_) | Type::Idx { .. })
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Type::Bit { signed: true, .. })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Bit { width, signed: false } => write!(f, "ubit<{}>", width),
            Type::Bit { width, signed: true } => write!(f, "bit<{}>", width),
            Type::Fix { width, frac } => write!(f, "fix<{}, {}>", width, frac),
            Type::Static(n) => write!(f, "static<{}>", n),
            Type::Idx { bound, bank: None } => write!(f, "idx<{}>", bound),
            Type::Idx { bound, bank: Some(b) } => write!(f, "idx<{}, {}>", bound, b),
            Type::Array { elem, dims } => {
                write!(f, "{}", elem)?;
                for dim in dims {
                    if dim.bank == dim.size {
                        write!(f, "[{}]", dim.size)?;
                    } else {
                        write!(f, "[{} bank {}]", dim.size, dim.bank)?;
                    }
                }
                Ok(())
            }
            Type::Void => write!(f, "void"),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    And,
    Or,
    Shl,
    Shr,
    BitAnd,
}

impl BinOp {
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Neq
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn is_bitwise(&self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::BitAnd)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Source expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(u64),
    Bool(bool),
    Var(Id),
    Binop {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `a[i][j]`
    Access { array: Id, idxs: Vec<Expr> },
    /// `f(a, b)`
    App { func: Id, args: Vec<Expr> },
}

impl Expr {
    pub fn var(name: impl Into<Id>) -> Self {
        Expr::Var(name.into())
    }

    pub fn binop(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binop {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn access(array: impl Into<Id>, idxs: Vec<Expr>) -> Self {
        Expr::Access {
            array: array.into(),
            idxs,
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    match e {
        Expr::Binop { .. } => write!(f, "({})", e),
        _ => write!(f, "{}", e),
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Binop { op, lhs, rhs } => {
                write_operand(f, lhs)?;
                write!(f, " {} ", op)?;
                write_operand(f, rhs)
            }
            Expr::Access { array, idxs } => {
                write!(f, "{}", array)?;
                for idx in idxs {
                    write!(f, "[{}]", idx)?;
                }
                Ok(())
            }
            Expr::App { func, args } => {
                write!(f, "{}(", func)?;
                write_list(f, args)?;
                write!(f, ")")
            }
        }
    }
}

/// A command tagged with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub pos: Pos,
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// `decl x: T;`
    Decl { name: Id, ty: Type },
    /// `let x[: T] = e;`
    Let {
        name: Id,
        ty: Option<Type>,
        init: Expr,
    },
    Seq(Vec<Command>),
    If {
        cond: Expr,
        then_branch: Box<Command>,
        else_branch: Option<Box<Command>>,
    },
    /// `for (let i = start..end) unroll k { body }`
    For {
        iter: Id,
        start: u64,
        end: u64,
        unroll: Option<u64>,
        body: Box<Command>,
    },
    /// `x := e;` or `a[i] := e;`
    Update { target: Expr, value: Expr },
    /// `x += e;`, `a[i] *= e;`
    Reduce { op: BinOp, target: Expr, value: Expr },
    Expr(Expr),
    /// `advance a;`
    Advance(Id),
    Empty,
}

impl Command {
    pub fn new(pos: Pos, kind: CommandKind) -> Self {
        Self { pos, kind }
    }
}

/// One-line reconstruction of the command; compound commands print their
/// header only.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::Decl { name, ty } => write!(f, "decl {}: {};", name, ty),
            CommandKind::Let {
                name,
                ty: Some(ty),
                init,
            } => write!(f, "let {}: {} = {};", name, ty, init),
            CommandKind::Let { name, ty: None, init } => write!(f, "let {} = {};", name, init),
            CommandKind::Seq(cmds) => write!(f, "{{ {} commands }}", cmds.len()),
            CommandKind::If { cond, .. } => write!(f, "if ({})", cond),
            CommandKind::For {
                iter,
                start,
                end,
                unroll,
                ..
            } => {
                write!(f, "for (let {} = {}..{})", iter, start, end)?;
                if let Some(k) = unroll {
                    write!(f, " unroll {}", k)?;
                }
                Ok(())
            }
            CommandKind::Update { target, value } => write!(f, "{} := {};", target, value),
            CommandKind::Reduce { op, target, value } => {
                write!(f, "{} {}= {};", target, op, value)
            }
            CommandKind::Expr(e) => write!(f, "{};", e),
            CommandKind::Advance(array) => write!(f, "advance {};", array),
            CommandKind::Empty => Ok(()),
        }
    }
}

/// A named, typed declaration: top-level `decl` or function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub pos: Pos,
    pub name: Id,
    pub ty: Type,
}

impl fmt::Display for Decl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty)
    }
}

/// `def f(a: T, ...) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub pos: Pos,
    pub name: Id,
    pub params: Vec<Decl>,
    pub body: Command,
}

impl fmt::Display for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def {}(", self.name)?;
        write_list(f, &self.params)?;
        write!(f, ")")
    }
}

/// A complete program
#[derive(Debug, Clone, PartialEq)]
pub struct Prog {
    pub decls: Vec<Decl>,
    pub defs: Vec<FuncDef>,
    pub body: Option<Command>,
}

/// Maps each source position to a reconstruction of its statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    lines: BTreeMap<Pos, String>,
}

impl SourceMap {
    pub fn from_prog(prog: &Prog) -> Self {
        let mut map = SourceMap::default();
        for decl in &prog.decls {
            map.lines.insert(decl.pos, format!("decl {};", decl));
        }
        for def in &prog.defs {
            map.lines.insert(def.pos, def.to_string());
            for param in &def.params {
                map.lines.insert(param.pos, param.to_string());
            }
            map.collect(&def.body);
        }
        if let Some(body) = &prog.body {
            map.collect(body);
        }
        map
    }

    fn collect(&mut self, cmd: &Command) {
        match &cmd.kind {
            CommandKind::Seq(cmds) => cmds.iter().for_each(|c| self.collect(c)),
            CommandKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.lines.insert(cmd.pos, cmd.to_string());
                self.collect(then_branch);
                if let Some(branch) = else_branch {
                    self.collect(branch);
                }
            }
            CommandKind::For { body, .. } => {
                self.lines.insert(cmd.pos, cmd.to_string());
                self.collect(body);
            }
            CommandKind::Empty => {}
            _ => {
                self.lines.insert(cmd.pos, cmd.to_string());
            }
        }
    }

    pub fn get(&self, pos: Pos) -> Option<&str> {
        self.lines.get(&pos).map(String::as_str)
    }

    /// Reconstruction for `pos`, or a placeholder naming the position
    pub fn describe(&self, pos: Pos) -> String {
        self.get(pos)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<statement {}>", pos))
    }
}

/// Typed expression with its resolved type
#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: Type,
}

impl TypedExpr {
    pub fn new(kind: TypedExprKind, ty: Type) -> Self {
        Self { kind, ty }
    }

    pub fn int(n: u64) -> Self {
        Self::new(TypedExprKind::Int(n), Type::Static(n))
    }

    pub fn binop(op: BinOp, lhs: TypedExpr, rhs: TypedExpr, ty: Type) -> Self {
        Self::new(
            TypedExprKind::Binop {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }
}

/// Typed expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    Int(u64),
    Bool(bool),
    Var(Id),
    Binop {
        op: BinOp,
        lhs: Box<TypedExpr>,
        rhs: Box<TypedExpr>,
    },
    /// Logical access into a possibly banked array
    Access { array: Id, idxs: Vec<TypedExpr> },
    /// Function application; arguments are array names
    App { func: Id, args: Vec<Id> },
    /// Physical access into a single memory at an offset address
    Mem { mem: Id, addr: Vec<TypedExpr> },
    /// Read multiplexed over `banks`; `select` picks `banks[k]`
    MuxRead {
        banks: Vec<Id>,
        select: Box<TypedExpr>,
        addr: Vec<TypedExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedCommand {
    pub pos: Pos,
    pub kind: TypedCommandKind,
}

impl TypedCommand {
    pub fn new(pos: Pos, kind: TypedCommandKind) -> Self {
        Self { pos, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedCommandKind {
    Decl { name: Id, ty: Type },
    Let { name: Id, ty: Type, init: TypedExpr },
    Seq(Vec<TypedCommand>),
    If {
        cond: TypedExpr,
        then_branch: Box<TypedCommand>,
        else_branch: Option<Box<TypedCommand>>,
    },
    For {
        iter: Id,
        start: u64,
        end: u64,
        unroll: Option<u64>,
        body: Box<TypedCommand>,
    },
    Update { target: TypedExpr, value: TypedExpr },
    Reduce {
        op: BinOp,
        target: TypedExpr,
        value: TypedExpr,
    },
    Expr(TypedExpr),
    Advance(Id),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedDef {
    pub pos: Pos,
    pub name: Id,
    pub params: Vec<Decl>,
    pub body: TypedCommand,
}

/// A typed program
#[derive(Debug, Clone, PartialEq)]
pub struct TypedProg {
    pub decls: Vec<Decl>,
    pub defs: Vec<TypedDef>,
    pub body: Option<TypedCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_needed() {
        assert_eq!(bits_needed(0), 1);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(3), 2);
        assert_eq!(bits_needed(4), 3);
        assert_eq!(bits_needed(255), 8);
    }

    #[test]
    fn test_iterator_width() {
        let ty = Type::Idx {
            bound: 8,
            bank: None,
        };
        assert_eq!(ty.width(), 3);
        let ty = Type::Idx {
            bound: 9,
            bank: Some(3),
        };
        assert_eq!(ty.width(), 4);
    }

    #[test]
    fn test_type_display() {
        let ty = Type::array(Type::ubit(32), vec![Dim::new(8, 2), Dim::unbanked(4)]);
        assert_eq!(ty.to_string(), "ubit<32>[8 bank 2][4]");
        let single = Type::array(Type::ubit(8), vec![Dim::new(4, 1)]);
        assert_eq!(single.to_string(), "ubit<8>[4 bank 1]");
        assert_eq!(Type::Fix { width: 16, frac: 8 }.to_string(), "fix<16, 8>");
    }

    #[test]
    fn test_command_reconstruction() {
        let cmd = Command::new(
            Pos(3),
            CommandKind::Reduce {
                op: BinOp::Add,
                target: Expr::access("a", vec![Expr::var("i"), Expr::var("j")]),
                value: Expr::binop(BinOp::Mul, Expr::var("x"), Expr::Int(2)),
            },
        );
        assert_eq!(cmd.to_string(), "a[i][j] += x * 2;");
    }
}
