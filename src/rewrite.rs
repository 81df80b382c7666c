//! View and banking rewriter
//!
//! Lowers logical array accesses onto physical bank memories. Along a
//! dimension of size `s` with bank factor `b`, every bank holds `b`
//! consecutive elements and there are `s / b` banks, so index `i` lives in
//! bank `i / b` at offset `i % b`. Multi-dimensional bank numbers are
//! flattened row-major.
//!
//! Accesses whose bank is known at compile time become direct `Mem`
//! accesses. Reads whose bank varies become multiplexed reads; writes whose
//! bank varies are rejected.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, trace};

use crate::ast::*;
use crate::env::ScopedEnv;
use crate::error::{CompileError, CompileResult};

/// Physical organisation of one logical array
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub name: Id,
    pub elem: Type,
    pub dims: Vec<Dim>,
}

impl Layout {
    pub fn new(name: &str, ty: &Type) -> Option<Self> {
        match ty {
            Type::Array { elem, dims } => Some(Self {
                name: name.to_string(),
                elem: elem.as_ref().clone(),
                dims: dims.clone(),
            }),
            _ => None,
        }
    }

    pub fn bank_count(&self) -> u64 {
        self.dims.iter().map(|d| d.bank_count()).product()
    }

    /// Physical memory names in flattened bank order
    pub fn banks(&self) -> Vec<Id> {
        let count = self.bank_count();
        if count == 1 {
            vec![self.name.clone()]
        } else {
            (0..count).map(|k| format!("{}_b{}", self.name, k)).collect()
        }
    }

    /// Type of every physical bank
    pub fn bank_type(&self) -> Type {
        Type::array(
            self.elem.clone(),
            self.dims.iter().map(|d| Dim::unbanked(d.bank_len())).collect(),
        )
    }

    /// Row-major stride of each dimension's bank number
    fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1; self.dims.len()];
        for d in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.dims[d + 1].bank_count();
        }
        strides
    }

    fn split(&self, pos: Pos) -> Vec<Decl> {
        let ty = self.bank_type();
        self.banks()
            .into_iter()
            .map(|name| Decl {
                pos,
                name,
                ty: ty.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Array(Layout),
    /// Loop iterator ranging over `[lo, hi]`
    Iter { lo: u64, hi: u64 },
    Scalar,
}

type Env = ScopedEnv<Binding>;

/// Rotating bank offset introduced by `advance`
#[derive(Debug, Clone)]
struct Rotation {
    register: Id,
    banks: u64,
}

/// Output of the rewriter: a program over physical memories only
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenProg {
    pub prog: TypedProg,
    /// Top-level logical array to its physical bank names
    pub bindings: BTreeMap<Id, Vec<Id>>,
}

/// Rewrites logical array accesses into physical bank accesses
pub struct Rewriter<'a> {
    sources: &'a SourceMap,
}

impl<'a> Rewriter<'a> {
    pub fn new(sources: &'a SourceMap) -> Self {
        Self { sources }
    }

    pub fn rewrite(&self, prog: &TypedProg) -> CompileResult<RewrittenProg> {
        let mut defs = Vec::with_capacity(prog.defs.len());
        for def in &prog.defs {
            let mut env = Env::new();
            let mut params = Vec::new();
            for param in &def.params {
                match Layout::new(&param.name, &param.ty) {
                    Some(layout) => {
                        params.extend(layout.split(param.pos));
                        env = env.rebind(param.name.clone(), Binding::Array(layout));
                    }
                    None => {
                        params.push(param.clone());
                        env = env.rebind(param.name.clone(), Binding::Scalar);
                    }
                }
            }
            let body = self.component(env, &def.body)?;
            debug!("rewrote function `{}` with {} physical parameter(s)", def.name, params.len());
            defs.push(TypedDef {
                pos: def.pos,
                name: def.name.clone(),
                params,
                body,
            });
        }

        let mut env = Env::new();
        let mut decls = Vec::new();
        let mut bindings = BTreeMap::new();
        for decl in &prog.decls {
            match Layout::new(&decl.name, &decl.ty) {
                Some(layout) => {
                    decls.extend(layout.split(decl.pos));
                    bindings.insert(decl.name.clone(), layout.banks());
                    env = env.rebind(decl.name.clone(), Binding::Array(layout));
                }
                None => {
                    decls.push(decl.clone());
                    env = env.rebind(decl.name.clone(), Binding::Scalar);
                }
            }
        }

        let body = match &prog.body {
            Some(body) => Some(self.component(env, body)?),
            None => None,
        };
        debug!(
            "rewrote {} logical array(s) into {} physical declaration(s)",
            bindings.len(),
            decls.len()
        );

        Ok(RewrittenProg {
            prog: TypedProg { decls, defs, body },
            bindings,
        })
    }

    /// Rewrite one component body, setting up rotation registers for every
    /// array it advances
    fn component(&self, env: Env, body: &TypedCommand) -> CompileResult<TypedCommand> {
        let mut advanced = Vec::new();
        collect_advances(body, &mut advanced);
        let mut taken = HashSet::new();
        collect_binders(body, &mut taken);

        let mut env = env;
        let mut rotations = HashMap::new();
        let mut prologue = Vec::new();
        for (array, pos) in advanced {
            let layout = match env.get(&array) {
                Some(Binding::Array(layout)) => Some(layout.clone()),
                _ => find_decl(body, &array).and_then(|ty| Layout::new(&array, &ty)),
            }
            .ok_or_else(|| CompileError::internal(format!("advanced array `{}` has no layout", array)))?;

            let banks = layout.bank_count();
            if banks == 1 {
                continue;
            }
            if !banks.is_power_of_two() {
                return Err(CompileError::capability(
                    self.sources.describe(pos),
                    format!(
                        "`{}` has {} banks; rotating requires a power-of-two bank count",
                        array, banks
                    ),
                ));
            }

            let register = unbound_name(&format!("{}_bank", array), &env, &taken);
            taken.insert(register.clone());
            prologue.push(TypedCommand::new(
                pos,
                TypedCommandKind::Let {
                    name: register.clone(),
                    ty: Type::ubit(bits_needed(banks - 1)),
                    init: TypedExpr::int(0),
                },
            ));
            env = env.rebind(register.clone(), Binding::Scalar);
            trace!("`{}` rotates over {} banks via `{}`", array, banks, register);
            rotations.insert(array, Rotation { register, banks });
        }

        let pass = Pass {
            sources: self.sources,
            rotations: &rotations,
        };
        let (rewritten, _) = pass.command(env, body)?;
        if prologue.is_empty() {
            Ok(rewritten)
        } else {
            let pos = rewritten.pos;
            prologue.push(rewritten);
            Ok(TypedCommand::new(pos, TypedCommandKind::Seq(prologue)))
        }
    }
}

/// Every advanced array with the position of its first `advance`
fn collect_advances(cmd: &TypedCommand, out: &mut Vec<(Id, Pos)>) {
    match &cmd.kind {
        TypedCommandKind::Advance(array) => {
            if !out.iter().any(|(name, _)| name == array) {
                out.push((array.clone(), cmd.pos));
            }
        }
        TypedCommandKind::Seq(cmds) => cmds.iter().for_each(|c| collect_advances(c, out)),
        TypedCommandKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_advances(then_branch, out);
            if let Some(branch) = else_branch {
                collect_advances(branch, out);
            }
        }
        TypedCommandKind::For { body, .. } => collect_advances(body, out),
        _ => {}
    }
}

/// Every name a declaration, let or loop inside `cmd` binds
fn collect_binders(cmd: &TypedCommand, out: &mut HashSet<Id>) {
    match &cmd.kind {
        TypedCommandKind::Decl { name, .. } | TypedCommandKind::Let { name, .. } => {
            out.insert(name.clone());
        }
        TypedCommandKind::Seq(cmds) => cmds.iter().for_each(|c| collect_binders(c, out)),
        TypedCommandKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_binders(then_branch, out);
            if let Some(branch) = else_branch {
                collect_binders(branch, out);
            }
        }
        TypedCommandKind::For { iter, body, .. } => {
            out.insert(iter.clone());
            collect_binders(body, out);
        }
        _ => {}
    }
}

/// `base`, or `base_1`, `base_2`, ... when the component already binds it
fn unbound_name(base: &str, env: &Env, taken: &HashSet<Id>) -> Id {
    std::iter::once(base.to_string())
        .chain((1..).map(|k| format!("{}_{}", base, k)))
        .find(|name| !env.contains(name) && !taken.contains(name))
        .unwrap_or_else(|| base.to_string())
}

fn find_decl(cmd: &TypedCommand, array: &str) -> Option<Type> {
    match &cmd.kind {
        TypedCommandKind::Decl { name, ty } if name == array => Some(ty.clone()),
        TypedCommandKind::Seq(cmds) => cmds.iter().find_map(|c| find_decl(c, array)),
        TypedCommandKind::If {
            then_branch,
            else_branch,
            ..
        } => find_decl(then_branch, array)
            .or_else(|| else_branch.as_ref().and_then(|b| find_decl(b, array))),
        TypedCommandKind::For { body, .. } => find_decl(body, array),
        _ => None,
    }
}

/// Unsigned arithmetic on rewritten index expressions, wide enough not to
/// overflow
fn arith(op: BinOp, lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    let (l, r) = (lhs.ty.width(), rhs.ty.width());
    let width = match op {
        BinOp::Add => l.max(r) + 1,
        BinOp::Mul => l + r,
        _ => l,
    };
    TypedExpr::binop(op, lhs, rhs, Type::ubit(width))
}

/// Rewriting context for one component
struct Pass<'a> {
    sources: &'a SourceMap,
    rotations: &'a HashMap<Id, Rotation>,
}

impl<'a> Pass<'a> {
    fn command(&self, env: Env, cmd: &TypedCommand) -> CompileResult<(TypedCommand, Env)> {
        let pos = cmd.pos;
        let (kind, env) = match &cmd.kind {
            TypedCommandKind::Decl { name, ty } => match Layout::new(name, ty) {
                Some(layout) => {
                    let decls = layout
                        .split(pos)
                        .into_iter()
                        .map(|d| {
                            TypedCommand::new(pos, TypedCommandKind::Decl { name: d.name, ty: d.ty })
                        })
                        .collect::<Vec<_>>();
                    let env = env.rebind(name.clone(), Binding::Array(layout));
                    if decls.len() == 1 {
                        (decls[0].kind.clone(), env)
                    } else {
                        (TypedCommandKind::Seq(decls), env)
                    }
                }
                None => {
                    let env = env.rebind(name.clone(), Binding::Scalar);
                    (cmd.kind.clone(), env)
                }
            },

            TypedCommandKind::Let { name, ty, init } => {
                let init = self.read(&env, init, pos)?;
                let env = env.rebind(name.clone(), Binding::Scalar);
                (
                    TypedCommandKind::Let {
                        name: name.clone(),
                        ty: ty.clone(),
                        init,
                    },
                    env,
                )
            }

            TypedCommandKind::Seq(cmds) => {
                let mut env = env;
                let mut out = Vec::with_capacity(cmds.len());
                for c in cmds {
                    let (c, next) = self.command(env, c)?;
                    out.push(c);
                    env = next;
                }
                (TypedCommandKind::Seq(out), env)
            }

            TypedCommandKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.read(&env, cond, pos)?;
                let then_branch = Box::new(self.command(env.enter(), then_branch)?.0);
                let else_branch = match else_branch {
                    Some(branch) => Some(Box::new(self.command(env.enter(), branch)?.0)),
                    None => None,
                };
                (
                    TypedCommandKind::If {
                        cond,
                        then_branch,
                        else_branch,
                    },
                    env,
                )
            }

            TypedCommandKind::For {
                iter,
                start,
                end,
                unroll,
                body,
            } => {
                let body_env = env.enter().rebind(
                    iter.clone(),
                    Binding::Iter {
                        lo: *start,
                        hi: end - 1,
                    },
                );
                let (body, _) = self.command(body_env, body)?;
                (
                    TypedCommandKind::For {
                        iter: iter.clone(),
                        start: *start,
                        end: *end,
                        unroll: *unroll,
                        body: Box::new(body),
                    },
                    env,
                )
            }

            TypedCommandKind::Update { target, value } => {
                let target = self.write(&env, target, pos)?;
                let value = self.read(&env, value, pos)?;
                (TypedCommandKind::Update { target, value }, env)
            }

            TypedCommandKind::Reduce { op, target, value } => {
                let target = self.write(&env, target, pos)?;
                let value = self.read(&env, value, pos)?;
                (
                    TypedCommandKind::Reduce {
                        op: *op,
                        target,
                        value,
                    },
                    env,
                )
            }

            TypedCommandKind::Expr(e) => {
                let e = self.read(&env, e, pos)?;
                (TypedCommandKind::Expr(e), env)
            }

            TypedCommandKind::Advance(array) => match self.rotations.get(array) {
                Some(rotation) => {
                    let ty = Type::ubit(bits_needed(rotation.banks - 1));
                    let current = TypedExpr::new(TypedExprKind::Var(rotation.register.clone()), ty.clone());
                    let next = TypedExpr::binop(
                        BinOp::BitAnd,
                        arith(BinOp::Add, current.clone(), TypedExpr::int(1)),
                        TypedExpr::int(rotation.banks - 1),
                        ty,
                    );
                    (
                        TypedCommandKind::Update {
                            target: current,
                            value: next,
                        },
                        env,
                    )
                }
                // Single-bank arrays have nothing to rotate
                None => (TypedCommandKind::Empty, env),
            },

            TypedCommandKind::Empty => (TypedCommandKind::Empty, env),
        };
        Ok((TypedCommand::new(pos, kind), env))
    }

    fn read(&self, env: &Env, e: &TypedExpr, pos: Pos) -> CompileResult<TypedExpr> {
        match &e.kind {
            TypedExprKind::Binop { op, lhs, rhs } => Ok(TypedExpr::binop(
                *op,
                self.read(env, lhs, pos)?,
                self.read(env, rhs, pos)?,
                e.ty.clone(),
            )),
            TypedExprKind::Access { array, idxs } => self.access(env, array, idxs, &e.ty, false, pos),
            TypedExprKind::App { func, args } => {
                let mut physical = Vec::new();
                for arg in args {
                    physical.extend(self.layout(env, arg)?.banks());
                }
                Ok(TypedExpr::new(
                    TypedExprKind::App {
                        func: func.clone(),
                        args: physical,
                    },
                    e.ty.clone(),
                ))
            }
            _ => Ok(e.clone()),
        }
    }

    fn write(&self, env: &Env, target: &TypedExpr, pos: Pos) -> CompileResult<TypedExpr> {
        match &target.kind {
            TypedExprKind::Access { array, idxs } => self.access(env, array, idxs, &target.ty, true, pos),
            _ => Ok(target.clone()),
        }
    }

    fn layout<'e>(&self, env: &'e Env, array: &str) -> CompileResult<&'e Layout> {
        match env.get(array) {
            Some(Binding::Array(layout)) => Ok(layout),
            _ => Err(CompileError::internal(format!("`{}` has no array layout", array))),
        }
    }

    /// Bank number along a dimension with bank length `len`, when every
    /// value the index can take falls in the same bank
    fn static_bank(&self, env: &Env, idx: &TypedExpr, dim: &Dim) -> Option<u64> {
        if dim.bank_count() == 1 {
            return Some(0);
        }
        let (lo, hi) = interval(env, idx)?;
        let len = dim.bank_len();
        (lo / len == hi / len).then_some(lo / len)
    }

    fn access(
        &self,
        env: &Env,
        array: &str,
        idxs: &[TypedExpr],
        elem: &Type,
        write: bool,
        pos: Pos,
    ) -> CompileResult<TypedExpr> {
        let layout = self.layout(env, array)?;
        let rotation = self.rotations.get(array);
        let strides = layout.strides();

        let mut base = 0u64;
        let mut terms = Vec::new();
        let mut addr = Vec::with_capacity(idxs.len());
        for ((idx, dim), stride) in idxs.iter().zip(&layout.dims).zip(strides) {
            let idx = self.read(env, idx, pos)?;
            let len = dim.bank_len();
            match self.static_bank(env, &idx, dim) {
                Some(k) => {
                    base += k * stride;
                    let offset = k * len;
                    addr.push(match idx.kind {
                        TypedExprKind::Int(n) => TypedExpr::int(n - offset),
                        _ if offset == 0 => idx,
                        _ => {
                            let ty = idx.ty.clone();
                            TypedExpr::binop(BinOp::Sub, idx, TypedExpr::int(offset), Type::ubit(ty.width()))
                        }
                    });
                }
                None => {
                    if !len.is_power_of_two() {
                        return Err(CompileError::capability(
                            self.sources.describe(pos),
                            format!(
                                "bank of `{}` index `{}` varies at run time and bank length {} is not a power of two",
                                array,
                                describe_index(&idx),
                                len
                            ),
                        ));
                    }
                    let shift = u64::from(len.trailing_zeros());
                    let select = if shift == 0 {
                        idx.clone()
                    } else {
                        arith(BinOp::Shr, idx.clone(), TypedExpr::int(shift))
                    };
                    terms.push(if stride == 1 {
                        select
                    } else {
                        arith(BinOp::Mul, select, TypedExpr::int(stride))
                    });
                    addr.push(if len == 1 {
                        TypedExpr::int(0)
                    } else {
                        arith(BinOp::BitAnd, idx, TypedExpr::int(len - 1))
                    });
                }
            }
        }

        let banks = layout.banks();
        if terms.is_empty() && rotation.is_none() {
            let mem = banks
                .get(base as usize)
                .cloned()
                .ok_or_else(|| CompileError::internal(format!("bank {} of `{}` does not exist", base, array)))?;
            trace!("`{}` access resolved to bank `{}`", array, mem);
            return Ok(TypedExpr::new(TypedExprKind::Mem { mem, addr }, elem.clone()));
        }

        if write {
            let reason = match rotation {
                Some(_) => format!("`{}` is rotated by `advance`, so its bank is only known at run time", array),
                None => format!("the bank written in `{}` is only known at run time", array),
            };
            return Err(CompileError::capability(self.sources.describe(pos), reason));
        }

        let mut select = terms.into_iter().reduce(|acc, t| arith(BinOp::Add, acc, t));
        if base > 0 || select.is_none() {
            let constant = TypedExpr::int(base);
            select = Some(match select {
                Some(s) => arith(BinOp::Add, s, constant),
                None => constant,
            });
        }
        let mut select = select.unwrap_or_else(|| TypedExpr::int(0));
        if let Some(rotation) = rotation {
            let current = TypedExpr::new(
                TypedExprKind::Var(rotation.register.clone()),
                Type::ubit(bits_needed(rotation.banks - 1)),
            );
            select = TypedExpr::binop(
                BinOp::BitAnd,
                arith(BinOp::Add, select, current),
                TypedExpr::int(rotation.banks - 1),
                Type::ubit(bits_needed(rotation.banks - 1)),
            );
        }
        trace!("`{}` access multiplexed over {} banks", array, banks.len());

        Ok(TypedExpr::new(
            TypedExprKind::MuxRead {
                banks,
                select: Box::new(select),
                addr,
            },
            elem.clone(),
        ))
    }
}

fn describe_index(e: &TypedExpr) -> String {
    match &e.kind {
        TypedExprKind::Int(n) => n.to_string(),
        TypedExprKind::Var(name) => name.clone(),
        TypedExprKind::Binop { op, lhs, rhs } => {
            format!("{} {} {}", describe_index(lhs), op, describe_index(rhs))
        }
        _ => "<expr>".to_string(),
    }
}

/// Inclusive range of values an index expression can take, when it is
/// built from literals and loop iterators
fn interval(env: &Env, e: &TypedExpr) -> Option<(u64, u64)> {
    match &e.kind {
        TypedExprKind::Int(n) => Some((*n, *n)),
        TypedExprKind::Var(name) => match env.get(name) {
            Some(Binding::Iter { lo, hi }) => Some((*lo, *hi)),
            _ => None,
        },
        TypedExprKind::Binop { op, lhs, rhs } => {
            let (a, b) = interval(env, lhs)?;
            let (c, d) = interval(env, rhs)?;
            match op {
                BinOp::Add => Some((a.checked_add(c)?, b.checked_add(d)?)),
                BinOp::Sub => Some((a.checked_sub(d)?, b.checked_sub(c)?)),
                BinOp::Mul => Some((a.checked_mul(c)?, b.checked_mul(d)?)),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::typecheck::TypeChecker;

    fn rewrite(source: &str) -> CompileResult<RewrittenProg> {
        let prog = Parser::new(source).parse_program().unwrap();
        let typed = TypeChecker::new().check(&prog).unwrap();
        let sources = SourceMap::from_prog(&prog);
        Rewriter::new(&sources).rewrite(&typed)
    }

    fn body_cmds(prog: &RewrittenProg) -> Vec<TypedCommand> {
        match prog.prog.body.clone().unwrap() {
            TypedCommand {
                kind: TypedCommandKind::Seq(cmds),
                ..
            } => cmds,
            cmd => vec![cmd],
        }
    }

    fn let_init(cmd: &TypedCommand) -> &TypedExpr {
        match &cmd.kind {
            TypedCommandKind::Let { init, .. } => init,
            other => panic!("Expected Let, found {:?}", other),
        }
    }

    #[test]
    fn test_single_bank_passes_through() {
        let out = rewrite("decl a: ubit<32>[4]; let x = a[2];").unwrap();
        assert_eq!(out.bindings["a"], vec!["a".to_string()]);
        assert_eq!(out.prog.decls.len(), 1);
        let cmds = body_cmds(&out);
        assert_eq!(
            let_init(&cmds[0]).kind,
            TypedExprKind::Mem {
                mem: "a".to_string(),
                addr: vec![TypedExpr::int(2)],
            }
        );
    }

    #[test]
    fn test_static_bank_offset() {
        let out = rewrite("decl a: ubit<32>[8 bank 2]; let x = a[5];").unwrap();
        assert_eq!(out.bindings["a"], vec!["a_b0", "a_b1", "a_b2", "a_b3"]);
        assert_eq!(out.prog.decls[0].ty, Type::array(Type::ubit(32), vec![Dim::unbanked(2)]));
        let cmds = body_cmds(&out);
        assert_eq!(
            let_init(&cmds[0]).kind,
            TypedExprKind::Mem {
                mem: "a_b2".to_string(),
                addr: vec![TypedExpr::int(1)],
            }
        );
    }

    #[test]
    fn test_iterator_within_one_bank() {
        let out = rewrite("decl a: ubit<32>[8 bank 4]; for (let i = 4..8) { let v = a[i]; }").unwrap();
        let cmds = body_cmds(&out);
        let TypedCommandKind::For { body, .. } = &cmds[0].kind else {
            panic!("Expected For");
        };
        let TypedExprKind::Mem { mem, addr } = &let_init(body).kind else {
            panic!("Expected Mem");
        };
        assert_eq!(mem, "a_b1");
        assert!(matches!(addr[0].kind, TypedExprKind::Binop { op: BinOp::Sub, .. }));
    }

    #[test]
    fn test_dynamic_read_is_multiplexed() {
        let out = rewrite("decl a: ubit<32>[8 bank 2]; for (let i = 0..8) { let v = a[i]; }").unwrap();
        let cmds = body_cmds(&out);
        let TypedCommandKind::For { body, .. } = &cmds[0].kind else {
            panic!("Expected For");
        };
        let TypedExprKind::MuxRead { banks, select, addr } = &let_init(body).kind else {
            panic!("Expected MuxRead");
        };
        assert_eq!(banks.len(), 4);
        assert!(matches!(select.kind, TypedExprKind::Binop { op: BinOp::Shr, .. }));
        assert!(matches!(addr[0].kind, TypedExprKind::Binop { op: BinOp::BitAnd, .. }));
    }

    #[test]
    fn test_dynamic_write_is_rejected() {
        let err = rewrite("decl a: ubit<32>[8 bank 2]; for (let i = 0..8) unroll 2 { a[i] := 1; }")
            .unwrap_err();
        assert!(matches!(err, CompileError::RewriteCapability { .. }));
        assert_eq!(err.statement(), Some("a[i] := 1;"));
    }

    #[test]
    fn test_non_power_of_two_dynamic_bank() {
        let err = rewrite("decl a: ubit<32>[6 bank 3]; for (let i = 0..6) { let v = a[i]; }").unwrap_err();
        assert!(matches!(err, CompileError::RewriteCapability { .. }));
    }

    #[test]
    fn test_multi_dimensional_banks() {
        let out = rewrite("decl m: ubit<8>[4 bank 2][4 bank 2]; let x = m[3][1];").unwrap();
        assert_eq!(out.bindings["m"].len(), 4);
        assert_eq!(
            out.prog.decls[0].ty,
            Type::array(Type::ubit(8), vec![Dim::unbanked(2), Dim::unbanked(2)])
        );
        let cmds = body_cmds(&out);
        assert_eq!(
            let_init(&cmds[0]).kind,
            TypedExprKind::Mem {
                mem: "m_b2".to_string(),
                addr: vec![TypedExpr::int(1), TypedExpr::int(1)],
            }
        );
    }

    #[test]
    fn test_advance_rotates_bank_selection() {
        let out = rewrite("decl a: ubit<32>[4 bank 2]; let x = a[0]; advance a;").unwrap();
        let cmds = body_cmds(&out);
        let TypedCommandKind::Let { name, ty, .. } = &cmds[0].kind else {
            panic!("Expected rotation register");
        };
        assert_eq!(name, "a_bank");
        assert_eq!(*ty, Type::ubit(1));

        let TypedCommandKind::Seq(rest) = &cmds[1].kind else {
            panic!("Expected Seq");
        };
        assert!(matches!(let_init(&rest[0]).kind, TypedExprKind::MuxRead { .. }));
        assert!(matches!(
            &rest[1].kind,
            TypedCommandKind::Update { target: TypedExpr { kind: TypedExprKind::Var(v), .. }, .. } if v == "a_bank"
        ));
    }

    #[test]
    fn test_rotation_register_avoids_user_names() {
        let out = rewrite(
            "decl a: ubit<32>[4 bank 2];
             let a_bank: ubit<1> = 1;
             let x = a[0];
             advance a;",
        )
        .unwrap();
        let cmds = body_cmds(&out);
        let TypedCommandKind::Let { name, .. } = &cmds[0].kind else {
            panic!("Expected rotation register");
        };
        assert_eq!(name, "a_bank_1");

        let TypedCommandKind::Seq(rest) = &cmds[1].kind else {
            panic!("Expected Seq");
        };
        let TypedExprKind::MuxRead { select, .. } = &let_init(&rest[1]).kind else {
            panic!("Expected MuxRead");
        };
        let TypedExprKind::Binop { lhs, .. } = &select.kind else {
            panic!("Expected rotated select");
        };
        let TypedExprKind::Binop { rhs: current, .. } = &lhs.kind else {
            panic!("Expected select plus rotation");
        };
        assert_eq!(current.kind, TypedExprKind::Var("a_bank_1".to_string()));
        assert!(matches!(
            &rest[2].kind,
            TypedCommandKind::Update { target: TypedExpr { kind: TypedExprKind::Var(v), .. }, .. } if v == "a_bank_1"
        ));
    }

    #[test]
    fn test_advance_single_bank_is_dropped() {
        let out = rewrite("decl a: ubit<32>[4]; let x = a[0]; advance a;").unwrap();
        let cmds = body_cmds(&out);
        assert_eq!(cmds[1].kind, TypedCommandKind::Empty);
    }

    #[test]
    fn test_parameters_and_arguments_are_split() {
        let out = rewrite(
            "decl m: ubit<8>[4 bank 2];
             def clear(a: ubit<8>[4 bank 2]) { a[0] := 0; }
             clear(m);",
        )
        .unwrap();
        let params: Vec<_> = out.prog.defs[0].params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["a_b0", "a_b1"]);
        let cmds = body_cmds(&out);
        let TypedCommandKind::Expr(TypedExpr {
            kind: TypedExprKind::App { args, .. },
            ..
        }) = &cmds[0].kind
        else {
            panic!("Expected App");
        };
        assert_eq!(args, &vec!["m_b0".to_string(), "m_b1".to_string()]);
    }
}
