//! Type checker for accelerator programs
//!
//! Resolves every expression's type against a scoped environment, enforces
//! width-exact assignment, index/dimension agreement and static bank
//! selection inside parallel loops, and produces the typed tree.

use std::collections::HashMap;

use log::debug;

use crate::ast::*;
use crate::env::ScopedEnv;
use crate::error::{CompileError, CompileResult};

/// What a name is bound to during checking
#[derive(Debug, Clone, PartialEq)]
enum Binding {
    /// Register or let-bound value
    Var(Type),
    /// Loop iterator; readable, never assignable
    Iter(Type),
    Array(Type),
}

impl Binding {
    fn ty(&self) -> &Type {
        match self {
            Binding::Var(ty) | Binding::Iter(ty) | Binding::Array(ty) => ty,
        }
    }
}

type Env = ScopedEnv<Binding>;

/// Type checker for programs. Checking is a pure function of the input.
#[derive(Debug, Default)]
pub struct TypeChecker;

impl TypeChecker {
    pub fn new() -> Self {
        Self
    }

    /// Check a program and produce its typed form
    pub fn check(&self, prog: &Prog) -> CompileResult<TypedProg> {
        let mut funcs: HashMap<Id, Vec<Decl>> = HashMap::new();
        let mut defs = Vec::with_capacity(prog.defs.len());

        for def in &prog.defs {
            if funcs.contains_key(&def.name) {
                return Err(CompileError::scope(
                    def,
                    format!("function `{}` is already defined", def.name),
                ));
            }

            let mut env = Env::new();
            for param in &def.params {
                let stmt = format!("{} {}", def, param);
                validate_type(&param.ty, &stmt)?;
                if !matches!(param.ty, Type::Array { .. }) {
                    return Err(CompileError::mismatch(
                        stmt,
                        format!("parameter `{}` must be an array, found {}", param.name, param.ty),
                    ));
                }
                env = env
                    .bind(param.name.clone(), Binding::Array(param.ty.clone()))
                    .ok_or_else(|| {
                        CompileError::scope(
                            def,
                            format!("parameter `{}` is declared twice", param.name),
                        )
                    })?;
            }

            let checker = Checker {
                funcs: &funcs,
                in_par: false,
            };
            let (body, _) = checker.command(env, &def.body)?;
            debug!("checked function `{}`", def.name);

            defs.push(TypedDef {
                pos: def.pos,
                name: def.name.clone(),
                params: def.params.clone(),
                body,
            });
            funcs.insert(def.name.clone(), def.params.clone());
        }

        let mut env = Env::new();
        for decl in &prog.decls {
            let stmt = format!("decl {};", decl);
            validate_type(&decl.ty, &stmt)?;
            env = env.bind(decl.name.clone(), binding_for(&decl.ty)).ok_or_else(|| {
                CompileError::scope(&stmt, format!("`{}` is already declared", decl.name))
            })?;
        }

        let checker = Checker {
            funcs: &funcs,
            in_par: false,
        };
        let body = match &prog.body {
            Some(cmd) => Some(checker.command(env, cmd)?.0),
            None => None,
        };

        debug!(
            "type checked {} declaration(s), {} function(s)",
            prog.decls.len(),
            defs.len()
        );
        Ok(TypedProg {
            decls: prog.decls.clone(),
            defs,
            body,
        })
    }
}

fn binding_for(ty: &Type) -> Binding {
    match ty {
        Type::Array { .. } => Binding::Array(ty.clone()),
        _ => Binding::Var(ty.clone()),
    }
}

/// Reject malformed declared types
fn validate_type(ty: &Type, stmt: &str) -> CompileResult<()> {
    match ty {
        Type::Bit { width: 0, .. } | Type::Fix { width: 0, .. } => {
            Err(CompileError::mismatch(stmt, "zero-width type"))
        }
        Type::Fix { width, frac } if frac > width => Err(CompileError::mismatch(
            stmt,
            format!("fractional width {} exceeds total width {}", frac, width),
        )),
        Type::Array { elem, dims } => {
            if !matches!(**elem, Type::Bool | Type::Bit { .. } | Type::Fix { .. }) {
                return Err(CompileError::mismatch(
                    stmt,
                    format!("array elements must be scalar, found {}", elem),
                ));
            }
            validate_type(elem, stmt)?;
            for dim in dims {
                if dim.size == 0 || dim.bank == 0 || dim.size % dim.bank != 0 {
                    return Err(CompileError::mismatch(
                        stmt,
                        format!(
                            "bank factor {} must evenly divide dimension size {}",
                            dim.bank, dim.size
                        ),
                    ));
                }
            }
            Ok(())
        }
        Type::Static(_) | Type::Idx { .. } | Type::Void => Err(CompileError::mismatch(
            stmt,
            format!("{} cannot be declared", ty),
        )),
        _ => Ok(()),
    }
}

/// Can a value of type `src` be stored into a location of type `dst`?
/// Only literal coercions are permitted; runtime values must match exactly.
pub fn assignable(src: &Type, dst: &Type) -> bool {
    match (src, dst) {
        _ if src == dst => true,
        (Type::Static(n), Type::Bit { width, signed }) => {
            let needed = bits_needed(*n) + u32::from(*signed);
            needed <= *width
        }
        (Type::Idx { .. }, Type::Bit { width, signed: false }) => *width == src.width(),
        _ => false,
    }
}

/// Result type of `l op r`, or a description of why they do not combine
pub fn binop_type(op: BinOp, l: &Type, r: &Type) -> Result<Type, String> {
    if op.is_logical() {
        return match (l, r) {
            (Type::Bool, Type::Bool) => Ok(Type::Bool),
            _ => Err(format!("`{}` requires bool operands, found {} and {}", op, l, r)),
        };
    }

    if op.is_comparison() {
        if matches!(op, BinOp::Eq | BinOp::Neq) && *l == Type::Bool && *r == Type::Bool {
            return Ok(Type::Bool);
        }
        return numeric_join(op, l, r).map(|_| Type::Bool);
    }

    if op.is_bitwise() && (matches!(l, Type::Fix { .. }) || matches!(r, Type::Fix { .. })) {
        return Err(format!("`{}` is not defined on fixed-point values", op));
    }

    if let (Type::Static(a), Type::Static(b)) = (l, r) {
        let folded = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Sub => a.checked_sub(*b),
            BinOp::Mul => a.checked_mul(*b),
            BinOp::Shl => u32::try_from(*b).ok().and_then(|s| a.checked_shl(s)),
            BinOp::Shr => u32::try_from(*b).ok().and_then(|s| a.checked_shr(s)),
            BinOp::BitAnd => Some(a & b),
            _ => None,
        };
        return folded
            .map(Type::Static)
            .ok_or_else(|| format!("static expression {} {} {} is not representable", a, op, b));
    }

    numeric_join(op, l, r)
}

/// Promote two numeric operands to a common type without truncation
fn numeric_join(op: BinOp, l: &Type, r: &Type) -> Result<Type, String> {
    match (l, r) {
        (Type::Fix { width: w1, frac: f1 }, Type::Fix { width: w2, frac: f2 }) => {
            if f1 == f2 {
                Ok(Type::Fix {
                    width: (*w1).max(*w2),
                    frac: *f1,
                })
            } else {
                Err(format!(
                    "fixed-point operands of `{}` have fractional widths {} and {}",
                    op, f1, f2
                ))
            }
        }
        (Type::Fix { .. }, _) | (_, Type::Fix { .. }) => Err(format!(
            "`{}` cannot mix fixed-point and non-fixed-point operands {} and {}",
            op, l, r
        )),
        _ if l.is_integer() && r.is_integer() => {
            if let (Type::Bit { signed: s1, .. }, Type::Bit { signed: s2, .. }) = (l, r) {
                if s1 != s2 {
                    return Err(format!(
                        "`{}` cannot mix signed and unsigned operands {} and {}",
                        op, l, r
                    ));
                }
            }
            Ok(Type::Bit {
                width: l.width().max(r.width()),
                signed: l.is_signed() || r.is_signed(),
            })
        }
        _ => Err(format!("`{}` is not defined on {} and {}", op, l, r)),
    }
}

/// Per-traversal checking context
#[derive(Clone, Copy)]
struct Checker<'t> {
    funcs: &'t HashMap<Id, Vec<Decl>>,
    /// Inside the body of a loop with an unroll factor above one
    in_par: bool,
}

impl<'t> Checker<'t> {
    /// Check a command, returning its typed form and the environment
    /// visible to the commands that follow it
    fn command(&self, env: Env, cmd: &Command) -> CompileResult<(TypedCommand, Env)> {
        let (kind, env) = match &cmd.kind {
            CommandKind::Decl { name, ty } => {
                validate_type(ty, &cmd.to_string())?;
                let env = self.declare(&env, cmd, name, binding_for(ty))?;
                (
                    TypedCommandKind::Decl {
                        name: name.clone(),
                        ty: ty.clone(),
                    },
                    env,
                )
            }

            CommandKind::Let { name, ty, init } => {
                let init = self.expr(&env, init, cmd)?;
                let ty = match ty {
                    Some(ty) => {
                        validate_type(ty, &cmd.to_string())?;
                        if matches!(ty, Type::Array { .. }) {
                            return Err(CompileError::mismatch(cmd, "cannot bind an array"));
                        }
                        if !assignable(&init.ty, ty) {
                            return Err(CompileError::mismatch(
                                cmd,
                                format!("cannot assign {} to `{}` of type {}", init.ty, name, ty),
                            ));
                        }
                        ty.clone()
                    }
                    None => match &init.ty {
                        Type::Static(n) => Type::ubit(bits_needed(*n).max(32)),
                        Type::Idx { .. } => Type::ubit(init.ty.width()),
                        other => other.clone(),
                    },
                };
                let env = self.declare(&env, cmd, name, Binding::Var(ty.clone()))?;
                (
                    TypedCommandKind::Let {
                        name: name.clone(),
                        ty,
                        init,
                    },
                    env,
                )
            }

            CommandKind::Seq(cmds) => {
                let mut env = env;
                let mut typed = Vec::with_capacity(cmds.len());
                for c in cmds {
                    let (t, next) = self.command(env, c)?;
                    typed.push(t);
                    env = next;
                }
                (TypedCommandKind::Seq(typed), env)
            }

            CommandKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(&env, cond, cmd)?;
                if cond.ty != Type::Bool {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("condition must be bool, found {}", cond.ty),
                    ));
                }
                let (then_branch, _) = self.command(env.enter(), then_branch)?;
                let else_branch = match else_branch {
                    Some(branch) => Some(Box::new(self.command(env.enter(), branch)?.0)),
                    None => None,
                };
                (
                    TypedCommandKind::If {
                        cond,
                        then_branch: Box::new(then_branch),
                        else_branch,
                    },
                    env,
                )
            }

            CommandKind::For {
                iter,
                start,
                end,
                unroll,
                body,
            } => {
                if start >= end {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("loop range {}..{} is empty", start, end),
                    ));
                }
                if let Some(k) = unroll {
                    if *k == 0 || (end - start) % k != 0 {
                        return Err(CompileError::mismatch(
                            cmd,
                            format!(
                                "unroll factor {} does not divide the trip count {}",
                                k,
                                end - start
                            ),
                        ));
                    }
                }
                let iter_ty = Type::Idx {
                    bound: *end,
                    bank: *unroll,
                };
                let body_env = env.enter().rebind(iter.clone(), Binding::Iter(iter_ty));
                let checker = Checker {
                    in_par: self.in_par || unroll.map_or(false, |k| k > 1),
                    ..*self
                };
                let (body, _) = checker.command(body_env, body)?;
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

            CommandKind::Update { target, value } => {
                let target = self.target(&env, target, cmd)?;
                let value = self.expr(&env, value, cmd)?;
                if !assignable(&value.ty, &target.ty) {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("cannot assign {} to a location of type {}", value.ty, target.ty),
                    ));
                }
                (TypedCommandKind::Update { target, value }, env)
            }

            CommandKind::Reduce { op, target, value } => {
                let target = self.target(&env, target, cmd)?;
                if !matches!(target.ty, Type::Bit { .. } | Type::Fix { .. }) {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("reduction target must be numeric, found {}", target.ty),
                    ));
                }
                let value = self.expr(&env, value, cmd)?;
                if !assignable(&value.ty, &target.ty) {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!(
                            "reduction combines {} into {}; both sides must share a numeric type",
                            value.ty, target.ty
                        ),
                    ));
                }
                (
                    TypedCommandKind::Reduce {
                        op: *op,
                        target,
                        value,
                    },
                    env,
                )
            }

            CommandKind::Expr(Expr::App { func, args }) => {
                let app = self.application(&env, func, args, cmd)?;
                (TypedCommandKind::Expr(app), env)
            }

            CommandKind::Expr(e) => {
                let e = self.expr(&env, e, cmd)?;
                (TypedCommandKind::Expr(e), env)
            }

            CommandKind::Advance(array) => match env.get(array) {
                Some(Binding::Array(_)) => (TypedCommandKind::Advance(array.clone()), env),
                Some(_) => {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("`{}` is not an array", array),
                    ))
                }
                None => {
                    return Err(CompileError::scope(
                        cmd,
                        format!("`{}` is not declared", array),
                    ))
                }
            },

            CommandKind::Empty => (TypedCommandKind::Empty, env),
        };

        Ok((TypedCommand::new(cmd.pos, kind), env))
    }

    fn declare(&self, env: &Env, cmd: &Command, name: &str, binding: Binding) -> CompileResult<Env> {
        env.bind(name, binding).ok_or_else(|| {
            CompileError::scope(cmd, format!("`{}` is already declared in this scope", name))
        })
    }

    /// Check the left-hand side of an update or reduction
    fn target(&self, env: &Env, target: &Expr, cmd: &Command) -> CompileResult<TypedExpr> {
        match target {
            Expr::Var(name) => match env.get(name) {
                Some(Binding::Var(ty)) => Ok(TypedExpr::new(TypedExprKind::Var(name.clone()), ty.clone())),
                Some(Binding::Iter(_)) => Err(CompileError::mismatch(
                    cmd,
                    format!("loop iterator `{}` cannot be assigned", name),
                )),
                Some(Binding::Array(_)) => Err(CompileError::mismatch(
                    cmd,
                    format!("array `{}` cannot be assigned as a whole", name),
                )),
                None => Err(CompileError::scope(cmd, format!("`{}` is not declared", name))),
            },
            Expr::Access { .. } => self.expr(env, target, cmd),
            other => Err(CompileError::mismatch(
                cmd,
                format!("`{}` is not assignable", other),
            )),
        }
    }

    fn expr(&self, env: &Env, e: &Expr, cmd: &Command) -> CompileResult<TypedExpr> {
        match e {
            Expr::Int(n) => Ok(TypedExpr::int(*n)),
            Expr::Bool(b) => Ok(TypedExpr::new(TypedExprKind::Bool(*b), Type::Bool)),

            Expr::Var(name) => match env.get(name) {
                Some(Binding::Array(_)) => Err(CompileError::mismatch(
                    cmd,
                    format!("array `{}` used as a value", name),
                )),
                Some(binding) => Ok(TypedExpr::new(
                    TypedExprKind::Var(name.clone()),
                    binding.ty().clone(),
                )),
                None => Err(CompileError::scope(cmd, format!("`{}` is not declared", name))),
            },

            Expr::Binop { op, lhs, rhs } => {
                let lhs = self.expr(env, lhs, cmd)?;
                let rhs = self.expr(env, rhs, cmd)?;
                let ty = binop_type(*op, &lhs.ty, &rhs.ty)
                    .map_err(|msg| CompileError::mismatch(cmd, msg))?;
                Ok(TypedExpr::binop(*op, lhs, rhs, ty))
            }

            Expr::Access { array, idxs } => {
                let (elem, dims) = match env.get(array) {
                    Some(Binding::Array(Type::Array { elem, dims })) => (elem.as_ref().clone(), dims.clone()),
                    Some(_) => {
                        return Err(CompileError::mismatch(
                            cmd,
                            format!("`{}` is not an array", array),
                        ))
                    }
                    None => {
                        return Err(CompileError::scope(
                            cmd,
                            format!("`{}` is not declared", array),
                        ))
                    }
                };
                if idxs.len() != dims.len() {
                    return Err(CompileError::dimension(
                        cmd,
                        format!(
                            "`{}` has {} dimension(s) but is indexed with {}",
                            array,
                            dims.len(),
                            idxs.len()
                        ),
                    ));
                }

                let mut typed = Vec::with_capacity(idxs.len());
                for (idx, dim) in idxs.iter().zip(&dims) {
                    let t = self.expr(env, idx, cmd)?;
                    check_index(&t.ty, dim, cmd)?;
                    if self.in_par && dim.bank_count() > 1 && !is_static_selector(env, idx) {
                        return Err(CompileError::non_static_bank(
                            cmd,
                            format!(
                                "index `{}` into banked dimension of `{}` is only known at run time inside a parallel loop",
                                idx, array
                            ),
                        ));
                    }
                    typed.push(t);
                }
                Ok(TypedExpr::new(
                    TypedExprKind::Access {
                        array: array.clone(),
                        idxs: typed,
                    },
                    elem,
                ))
            }

            Expr::App { func, .. } => Err(CompileError::mismatch(
                cmd,
                format!("application of `{}` produces no value", func),
            )),
        }
    }

    fn application(&self, env: &Env, func: &str, args: &[Expr], cmd: &Command) -> CompileResult<TypedExpr> {
        let params = self
            .funcs
            .get(func)
            .ok_or_else(|| CompileError::scope(cmd, format!("function `{}` is not defined", func)))?;
        if params.len() != args.len() {
            return Err(CompileError::mismatch(
                cmd,
                format!(
                    "`{}` expects {} argument(s), found {}",
                    func,
                    params.len(),
                    args.len()
                ),
            ));
        }

        let mut names = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(params) {
            let name = match arg {
                Expr::Var(name) => name,
                other => {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!("argument `{}` must name an array", other),
                    ))
                }
            };
            match env.get(name) {
                Some(Binding::Array(ty)) if *ty == param.ty => names.push(name.clone()),
                Some(binding) => {
                    return Err(CompileError::mismatch(
                        cmd,
                        format!(
                            "argument `{}` has type {} but parameter `{}` expects {}",
                            name,
                            binding.ty(),
                            param.name,
                            param.ty
                        ),
                    ))
                }
                None => return Err(CompileError::scope(cmd, format!("`{}` is not declared", name))),
            }
        }

        Ok(TypedExpr::new(
            TypedExprKind::App {
                func: func.to_string(),
                args: names,
            },
            Type::Void,
        ))
    }
}

/// An index must be unsigned and able to address every element of `dim`
fn check_index(ty: &Type, dim: &Dim, cmd: &Command) -> CompileResult<()> {
    match ty {
        Type::Static(n) if *n >= dim.size => Err(CompileError::dimension(
            cmd,
            format!("index {} is out of bounds for a dimension of size {}", n, dim.size),
        )),
        Type::Idx { bound, .. } if *bound > dim.size => Err(CompileError::dimension(
            cmd,
            format!(
                "iterator reaches {} but the dimension has size {}",
                bound - 1,
                dim.size
            ),
        )),
        Type::Static(_) | Type::Idx { .. } => Ok(()),
        Type::Bit {
            width,
            signed: false,
        } => {
            let needed = bits_needed(dim.size - 1);
            if *width < needed {
                Err(CompileError::mismatch(
                    cmd,
                    format!("index of type {} cannot address {} elements", ty, dim.size),
                ))
            } else {
                Ok(())
            }
        }
        other => Err(CompileError::mismatch(
            cmd,
            format!("index must be an unsigned integer, found {}", other),
        )),
    }
}

/// Built only from literals and loop iterators
fn is_static_selector(env: &Env, e: &Expr) -> bool {
    match e {
        Expr::Int(_) => true,
        Expr::Var(name) => matches!(env.get(name), Some(Binding::Iter(_))),
        Expr::Binop { lhs, rhs, .. } => is_static_selector(env, lhs) && is_static_selector(env, rhs),
        _ => false,
    }
}
