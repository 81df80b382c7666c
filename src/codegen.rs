//! Backend code generator
//!
//! Lowers a rewritten program into the control IR. Every array read becomes
//! a two-cycle group capturing into a register, every store a one-cycle
//! group, and loops become bounded `while` nodes around an iterator
//! register. Groups run strictly in sequence, so memory ports are never
//! shared within a cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use crate::ast::*;
use crate::config::CompilerConfig;
use crate::env::ScopedEnv;
use crate::error::{CompileError, CompileResult};
use crate::ir::*;
use crate::rewrite::RewrittenProg;

/// Storage backing a name in the current component
#[derive(Debug, Clone)]
enum Store {
    Reg {
        cell: Id,
        width: u32,
    },
    /// Iterator register, wide enough for the exit value; `slice` narrows
    /// it to the iterator type's width
    Iter {
        cell: Id,
        slice: Option<Id>,
        width: u32,
    },
    Mem {
        cell: Id,
        sizes: Vec<u64>,
        width: u32,
    },
}

type Env = ScopedEnv<Store>;

/// Code generator for the control IR
pub struct CodeGenerator<'a> {
    config: &'a CompilerConfig,
    sources: &'a SourceMap,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(config: &'a CompilerConfig, sources: &'a SourceMap) -> Self {
        Self { config, sources }
    }

    /// Generate the netlist: one component per function, then the root
    pub fn generate(&self, program: &RewrittenProg) -> CompileResult<Netlist> {
        let prog = &program.prog;
        let signatures: HashMap<Id, Vec<Id>> = prog
            .defs
            .iter()
            .map(|def| (def.name.clone(), def.params.iter().map(|p| p.name.clone()).collect()))
            .collect();
        if signatures.contains_key(&self.config.top_name) {
            return Err(CompileError::config(format!(
                "function `{}` clashes with the root component name",
                self.config.top_name
            )));
        }

        let mut metadata = BTreeMap::new();
        let mut components = Vec::with_capacity(prog.defs.len() + 1);

        for def in &prog.defs {
            let mut builder = Builder::new(&def.name, self, &signatures, &mut metadata);
            let mut env = Env::new();
            for param in &def.params {
                env = builder.declare(env, param, Binding::Ref)?;
            }
            let (control, _) = builder.command(env, &def.body)?;
            components.push(builder.finish(control));
        }

        let mut builder = Builder::new(&self.config.top_name, self, &signatures, &mut metadata);
        let mut env = Env::new();
        for decl in &prog.decls {
            env = builder.declare(env, decl, Binding::External)?;
        }
        for def in &prog.defs {
            builder.instance(&def.name);
        }
        let control = match &prog.body {
            Some(body) => builder.command(env, body)?.0,
            None => Control::Empty,
        };
        let root = builder.finish(control);
        for (array, banks) in &program.bindings {
            if let Some(bank) = banks.iter().find(|b| !root.cell(b).map_or(false, |c| c.external)) {
                return Err(CompileError::internal(format!(
                    "bank `{}` of `{}` is not an external memory",
                    bank, array
                )));
            }
        }
        components.push(root);

        debug!("generated {} component(s)", components.len());
        Ok(Netlist {
            components,
            memories: program.bindings.clone(),
            metadata,
        })
    }
}

/// How a declaration is exposed by its component
#[derive(Debug, Clone, Copy, PartialEq)]
enum Binding {
    Local,
    External,
    Ref,
}

/// Fresh, collision-free cell and group names within a component
#[derive(Debug, Default)]
struct Names {
    used: HashSet<String>,
    counters: HashMap<String, u32>,
}

impl Names {
    /// `prefix0`, `prefix1`, ...
    fn fresh(&mut self, prefix: &str) -> String {
        loop {
            let counter = self.counters.entry(prefix.to_string()).or_insert(0);
            let name = format!("{}{}", prefix, counter);
            *counter += 1;
            if self.used.insert(name.clone()) {
                return name;
            }
        }
    }

    /// `base` itself when free, otherwise `base_1`, `base_2`, ...
    fn unique(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        (1..)
            .map(|k| format!("{}_{}", base, k))
            .find(|name| self.used.insert(name.clone()))
            .unwrap_or_else(|| base.to_string())
    }

    fn reserve(&mut self, name: &str) -> bool {
        self.used.insert(name.to_string())
    }
}

/// Assignments feeding one group, plus the control that must run first
#[derive(Debug, Default)]
struct Wiring {
    assigns: Vec<Assignment>,
    pre: Vec<Control>,
}

impl Wiring {
    fn assign(&mut self, assign: Assignment) {
        if !self.assigns.contains(&assign) {
            self.assigns.push(assign);
        }
    }
}

/// Library primitive implementing `op` at `width`
fn primitive(op: BinOp, width: u32, signed: bool, frac: Option<u32>) -> (&'static str, Vec<u64>) {
    let w = u64::from(width);
    if let Some(f) = frac {
        let f = u64::from(f);
        let name = match op {
            BinOp::Add => Some("std_fp_add"),
            BinOp::Sub => Some("std_fp_sub"),
            BinOp::Mul => Some("std_fp_mult"),
            _ => None,
        };
        if let Some(name) = name {
            return (name, vec![w, w - f, f]);
        }
    }
    let name = match (op, signed) {
        (BinOp::Add, _) => "std_add",
        (BinOp::Sub, _) => "std_sub",
        (BinOp::Mul, _) => "std_mult",
        (BinOp::Lt, false) => "std_lt",
        (BinOp::Lt, true) => "std_slt",
        (BinOp::Le, false) => "std_le",
        (BinOp::Le, true) => "std_sle",
        (BinOp::Gt, false) => "std_gt",
        (BinOp::Gt, true) => "std_sgt",
        (BinOp::Ge, false) => "std_ge",
        (BinOp::Ge, true) => "std_sge",
        (BinOp::Eq, _) => "std_eq",
        (BinOp::Neq, _) => "std_neq",
        (BinOp::And, _) | (BinOp::BitAnd, _) => "std_and",
        (BinOp::Or, _) => "std_or",
        (BinOp::Shl, _) => "std_lsh",
        (BinOp::Shr, false) => "std_rsh",
        (BinOp::Shr, true) => "std_srsh",
    };
    (name, vec![w])
}

fn frac_of(ty: &Type) -> Option<u32> {
    match ty {
        Type::Fix { frac, .. } => Some(*frac),
        _ => None,
    }
}

/// Builds one component
struct Builder<'g> {
    comp: Component,
    names: Names,
    consts: HashMap<(u32, u64), Id>,
    instances: HashMap<Id, Id>,
    signatures: &'g HashMap<Id, Vec<Id>>,
    config: &'g CompilerConfig,
    sources: &'g SourceMap,
    metadata: &'g mut BTreeMap<Pos, String>,
}

impl<'g> Builder<'g> {
    fn new(
        name: &str,
        gen: &CodeGenerator<'g>,
        signatures: &'g HashMap<Id, Vec<Id>>,
        metadata: &'g mut BTreeMap<Pos, String>,
    ) -> Self {
        Self {
            comp: Component::new(name),
            names: Names::default(),
            consts: HashMap::new(),
            instances: HashMap::new(),
            signatures,
            config: gen.config,
            sources: gen.sources,
            metadata,
        }
    }

    fn finish(mut self, control: Control) -> Component {
        self.comp.control = control;
        debug!(
            "lowered component `{}`: {} cells, {} groups",
            self.comp.name,
            self.comp.cells.len(),
            self.comp.groups.len()
        );
        self.comp
    }

    fn position(&mut self, pos: Pos) -> Option<Pos> {
        if !self.config.emit_positions {
            return None;
        }
        if self.config.emit_metadata {
            let text = self.sources.describe(pos);
            self.metadata.entry(pos).or_insert(text);
        }
        Some(pos)
    }

    fn enable(&mut self, group: Id, pos: Pos) -> Control {
        Control::Enable {
            group,
            pos: self.position(pos),
        }
    }

    fn add_group(&mut self, name: &str, latency: Option<u64>, assignments: Vec<Assignment>) {
        self.comp.groups.push(Group {
            name: name.to_string(),
            latency,
            assignments,
        });
    }

    fn prim(&mut self, prefix: &str, prim: &str, params: Vec<u64>) -> Id {
        let name = self.names.fresh(prefix);
        self.comp.cells.push(Cell::primitive(name.clone(), prim, params));
        name
    }

    fn register(&mut self, base: &str, width: u32) -> Id {
        let name = self.names.unique(base);
        self.comp
            .cells
            .push(Cell::primitive(name.clone(), "std_reg", vec![u64::from(width)]));
        name
    }

    fn fresh_register(&mut self, prefix: &str, width: u32) -> Id {
        self.prim(prefix, "std_reg", vec![u64::from(width)])
    }

    fn constant(&mut self, width: u32, value: u64) -> CompileResult<Port> {
        if width < 64 && value >> width != 0 {
            return Err(CompileError::internal(format!(
                "constant {} does not fit in {} bits",
                value, width
            )));
        }
        if let Some(cell) = self.consts.get(&(width, value)) {
            return Ok(Port::cell(cell.clone(), "out"));
        }
        let cell = self.prim("const", "std_const", vec![u64::from(width), value]);
        self.consts.insert((width, value), cell.clone());
        Ok(Port::cell(cell, "out"))
    }

    fn instance(&mut self, func: &str) -> Id {
        if let Some(cell) = self.instances.get(func) {
            return cell.clone();
        }
        let cell = self.names.fresh(func);
        self.comp.cells.push(Cell::instance(cell.clone(), func));
        self.instances.insert(func.to_string(), cell.clone());
        cell
    }

    /// Allocate storage for a declaration
    fn declare(&mut self, env: Env, decl: &Decl, binding: Binding) -> CompileResult<Env> {
        match &decl.ty {
            Type::Array { elem, dims } => {
                if dims.len() > 4 {
                    return Err(CompileError::capability(
                        self.sources.describe(decl.pos),
                        format!("memories have at most four dimensions, `{}` has {}", decl.name, dims.len()),
                    ));
                }
                // Interface memories keep their names; locals may be renamed
                let name = if binding == Binding::Local {
                    self.names.unique(&decl.name)
                } else if self.names.reserve(&decl.name) {
                    decl.name.clone()
                } else {
                    return Err(CompileError::capability(
                        self.sources.describe(decl.pos),
                        format!("memory `{}` collides with another memory of the same name", decl.name),
                    ));
                };
                let width = elem.width();
                let sizes: Vec<u64> = dims.iter().map(|d| d.size).collect();
                let mut params = vec![u64::from(width)];
                params.extend(&sizes);
                params.extend(sizes.iter().map(|s| u64::from(bits_needed(s - 1))));

                let mut cell = Cell::primitive(name.clone(), &format!("seq_mem_d{}", dims.len()), params);
                cell.external = binding == Binding::External;
                cell.reference = binding == Binding::Ref;
                self.comp.cells.push(cell);
                Ok(env.rebind(
                    decl.name.clone(),
                    Store::Mem {
                        cell: name,
                        sizes,
                        width,
                    },
                ))
            }
            ty => {
                let width = ty.width();
                let cell = self.register(&decl.name, width);
                Ok(env.rebind(decl.name.clone(), Store::Reg { cell, width }))
            }
        }
    }

    fn memory(&self, env: &Env, name: &str) -> CompileResult<(Id, Vec<u64>, u32)> {
        match env.get(name) {
            Some(Store::Mem { cell, sizes, width }) => Ok((cell.clone(), sizes.clone(), *width)),
            _ => Err(CompileError::internal(format!("`{}` is not a memory", name))),
        }
    }

    /// Lower one command, returning its control and the environment for
    /// the commands after it
    fn command(&mut self, env: Env, cmd: &TypedCommand) -> CompileResult<(Control, Env)> {
        let pos = cmd.pos;
        match &cmd.kind {
            TypedCommandKind::Decl { name, ty } => {
                let decl = Decl {
                    pos,
                    name: name.clone(),
                    ty: ty.clone(),
                };
                let env = self.declare(env, &decl, Binding::Local)?;
                Ok((Control::Empty, env))
            }

            TypedCommandKind::Let { name, ty, init } => {
                let width = ty.width();
                let cell = self.register(name, width);
                let control = self.assign_register(&env, &cell, width, init, "let", pos)?;
                let env = env.rebind(name.clone(), Store::Reg { cell, width });
                Ok((control, env))
            }

            TypedCommandKind::Seq(cmds) => {
                let mut env = env;
                let mut controls = Vec::with_capacity(cmds.len());
                for c in cmds {
                    let (control, next) = self.command(env, c)?;
                    controls.push(control);
                    env = next;
                }
                Ok((Control::seq(controls), env))
            }

            TypedCommandKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut wiring = Wiring::default();
                let port = self.lower_expr(&env, cond, 1, &mut wiring, pos)?;
                let cond_group = if wiring.assigns.is_empty() {
                    None
                } else {
                    let name = self.names.fresh("cond");
                    self.add_group(&name, None, std::mem::take(&mut wiring.assigns));
                    Some(name)
                };
                let (then_control, _) = self.command(env.enter(), then_branch)?;
                let else_control = match else_branch {
                    Some(branch) => self.command(env.enter(), branch)?.0,
                    None => Control::Empty,
                };
                let mut controls = wiring.pre;
                controls.push(Control::If {
                    port,
                    cond: cond_group,
                    then_branch: Box::new(then_control),
                    else_branch: Box::new(else_control),
                });
                Ok((Control::seq(controls), env))
            }

            TypedCommandKind::For {
                iter,
                start,
                end,
                body,
                ..
            } => {
                let control = self.lower_for(&env, iter, *start, *end, body, pos)?;
                Ok((control, env))
            }

            TypedCommandKind::Update { target, value } => {
                let control = match &target.kind {
                    TypedExprKind::Var(name) => {
                        let (cell, width) = self.register_of(&env, name)?;
                        self.assign_register(&env, &cell, width, value, "assign", pos)?
                    }
                    TypedExprKind::Mem { mem, addr } => self.store(&env, mem, addr, value, pos)?,
                    _ => {
                        return Err(CompileError::internal(format!(
                            "cannot store to `{}`",
                            self.sources.describe(pos)
                        )))
                    }
                };
                Ok((control, env))
            }

            TypedCommandKind::Reduce { op, target, value } => {
                let frac = frac_of(&target.ty);
                let signed = target.ty.is_signed();
                let control = match &target.kind {
                    TypedExprKind::Var(name) => {
                        let (cell, width) = self.register_of(&env, name)?;
                        self.reduce_register(&env, *op, &cell, width, signed, frac, value, pos)?
                    }
                    TypedExprKind::Mem { mem, addr } => {
                        self.reduce_memory(&env, *op, mem, addr, signed, frac, value, pos)?
                    }
                    _ => {
                        return Err(CompileError::internal(format!(
                            "cannot reduce into `{}`",
                            self.sources.describe(pos)
                        )))
                    }
                };
                Ok((control, env))
            }

            TypedCommandKind::Expr(TypedExpr {
                kind: TypedExprKind::App { func, args },
                ..
            }) => {
                let params = self
                    .signatures
                    .get(func)
                    .ok_or_else(|| CompileError::internal(format!("no component for `{}`", func)))?;
                if params.len() != args.len() {
                    return Err(CompileError::internal(format!(
                        "`{}` takes {} memories but was invoked with {}",
                        func,
                        params.len(),
                        args.len()
                    )));
                }
                let mut refs = Vec::with_capacity(args.len());
                for (param, arg) in params.iter().zip(args) {
                    let (cell, _, _) = self.memory(&env, arg)?;
                    refs.push((param.clone(), cell));
                }
                let cell = self.instance(func);
                let control = Control::Invoke {
                    cell,
                    refs,
                    pos: self.position(pos),
                };
                Ok((control, env))
            }

            // Only the reads of a discarded value take time
            TypedCommandKind::Expr(e) => {
                let mut controls = Vec::new();
                self.discard(&env, e, &mut controls, pos)?;
                Ok((Control::seq(controls), env))
            }

            TypedCommandKind::Advance(array) => Err(CompileError::internal(format!(
                "`advance {}` survived bank rewriting",
                array
            ))),

            TypedCommandKind::Empty => Ok((Control::Empty, env)),
        }
    }

    fn discard(&mut self, env: &Env, e: &TypedExpr, controls: &mut Vec<Control>, pos: Pos) -> CompileResult<()> {
        match &e.kind {
            TypedExprKind::Binop { lhs, rhs, .. } => {
                self.discard(env, lhs, controls, pos)?;
                self.discard(env, rhs, controls, pos)
            }
            TypedExprKind::Mem { .. } | TypedExprKind::MuxRead { .. } => {
                let reg = self.fresh_register("r", e.ty.width());
                controls.extend(self.read_into(env, e, &reg, pos)?);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn register_of(&self, env: &Env, name: &str) -> CompileResult<(Id, u32)> {
        match env.get(name) {
            Some(Store::Reg { cell, width }) => Ok((cell.clone(), *width)),
            _ => Err(CompileError::internal(format!("`{}` is not a register", name))),
        }
    }

    /// `reg := value`: a direct read captures straight into `reg`,
    /// anything else is a one-cycle group
    fn assign_register(
        &mut self,
        env: &Env,
        reg: &str,
        width: u32,
        value: &TypedExpr,
        prefix: &str,
        pos: Pos,
    ) -> CompileResult<Control> {
        let direct = matches!(value.kind, TypedExprKind::Mem { .. } | TypedExprKind::MuxRead { .. });
        if direct && value.ty.width() == width {
            return Ok(Control::seq(self.read_into(env, value, reg, pos)?));
        }

        let mut wiring = Wiring::default();
        let port = self.lower_expr(env, value, width, &mut wiring, pos)?;
        let group = self.names.fresh(prefix);
        wiring.assign(Assignment::new(Port::cell(reg, "in"), port));
        wiring.assign(Assignment::new(Port::cell(reg, "write_en"), Atom::high()));
        wiring.assign(Assignment::new(Port::done(&group), Port::cell(reg, "done")));
        self.add_group(&group, Some(1), wiring.assigns);

        let mut controls = wiring.pre;
        controls.push(self.enable(group, pos));
        Ok(Control::seq(controls))
    }

    fn lower_addrs(
        &mut self,
        env: &Env,
        addr: &[TypedExpr],
        sizes: &[u64],
        wiring: &mut Wiring,
        pos: Pos,
    ) -> CompileResult<Vec<Port>> {
        if addr.len() != sizes.len() {
            return Err(CompileError::internal(format!(
                "{} address(es) for a {}-dimensional memory",
                addr.len(),
                sizes.len()
            )));
        }
        addr.iter()
            .zip(sizes)
            .map(|(a, size)| self.lower_expr(env, a, bits_needed(size - 1), wiring, pos))
            .collect()
    }

    /// Two-cycle read of `mem` at `addrs` into `reg`: `%0` presents the
    /// address, `%1` captures the data
    fn read_group(
        &mut self,
        mem: &str,
        addrs: &[Port],
        select: Guard,
        wiring: &mut Wiring,
        reg: &str,
    ) {
        let request = Guard::Cycle(0).and(select.clone());
        let capture = Guard::Cycle(1).and(select);
        for (k, a) in addrs.iter().enumerate() {
            wiring.assign(Assignment::new(Port::cell(mem, format!("addr{}", k)), a.clone()).guarded(request.clone()));
        }
        wiring.assign(Assignment::new(Port::cell(mem, "read_en"), Atom::high()).guarded(request));
        wiring.assign(
            Assignment::new(Port::cell(reg, "in"), Port::cell(mem, "read_data")).guarded(capture.clone()),
        );
        wiring.assign(
            Assignment::new(Port::cell(reg, "write_en"), Atom::high())
                .guarded(capture.and(Guard::Port(Port::cell(mem, "read_done")))),
        );
    }

    /// Read a `Mem` or `MuxRead` expression into `reg`; returns the control
    /// for the read, preceded by any reads its address depends on
    fn read_into(&mut self, env: &Env, e: &TypedExpr, reg: &str, pos: Pos) -> CompileResult<Vec<Control>> {
        let mut wiring = Wiring::default();
        match &e.kind {
            TypedExprKind::Mem { mem, addr } => {
                let (cell, sizes, _) = self.memory(env, mem)?;
                let addrs = self.lower_addrs(env, addr, &sizes, &mut wiring, pos)?;
                self.read_group(&cell, &addrs, Guard::True, &mut wiring, reg);
            }
            TypedExprKind::MuxRead { banks, select, addr } => {
                let first = banks
                    .first()
                    .ok_or_else(|| CompileError::internal("multiplexed read over no banks"))?;
                let (_, sizes, _) = self.memory(env, first)?;
                let sel_width = bits_needed(banks.len() as u64 - 1);
                let sel = self.lower_expr(env, select, sel_width, &mut wiring, pos)?;
                let addrs = self.lower_addrs(env, addr, &sizes, &mut wiring, pos)?;
                for (k, bank) in banks.iter().enumerate() {
                    let (cell, _, _) = self.memory(env, bank)?;
                    let eq = self.prim("eq", "std_eq", vec![u64::from(sel_width)]);
                    let k_port = self.constant(sel_width, k as u64)?;
                    wiring.assign(Assignment::new(Port::cell(&eq, "left"), sel.clone()));
                    wiring.assign(Assignment::new(Port::cell(&eq, "right"), k_port));
                    self.read_group(&cell, &addrs, Guard::Port(Port::cell(&eq, "out")), &mut wiring, reg);
                }
            }
            _ => {
                return Err(CompileError::internal(format!(
                    "read of a non-memory expression in `{}`",
                    self.sources.describe(pos)
                )))
            }
        }

        let group = self.names.fresh("read");
        wiring.assign(Assignment::new(Port::done(&group), Port::cell(reg, "done")));
        self.add_group(&group, Some(2), wiring.assigns);
        let mut controls = wiring.pre;
        controls.push(self.enable(group, pos));
        Ok(controls)
    }

    /// One-cycle store group
    fn store(&mut self, env: &Env, mem: &str, addr: &[TypedExpr], value: &TypedExpr, pos: Pos) -> CompileResult<Control> {
        let (cell, sizes, width) = self.memory(env, mem)?;
        let mut wiring = Wiring::default();
        let addrs = self.lower_addrs(env, addr, &sizes, &mut wiring, pos)?;
        let data = self.lower_expr(env, value, width, &mut wiring, pos)?;
        let group = self.names.fresh("write");
        self.write_group(&group, &cell, &addrs, data, &mut wiring);
        self.add_group(&group, Some(1), wiring.assigns);

        let mut controls = wiring.pre;
        controls.push(self.enable(group, pos));
        Ok(Control::seq(controls))
    }

    fn write_group(&mut self, group: &str, mem: &str, addrs: &[Port], data: Port, wiring: &mut Wiring) {
        for (k, a) in addrs.iter().enumerate() {
            wiring.assign(Assignment::new(Port::cell(mem, format!("addr{}", k)), a.clone()));
        }
        wiring.assign(Assignment::new(Port::cell(mem, "write_data"), data));
        wiring.assign(Assignment::new(Port::cell(mem, "write_en"), Atom::high()));
        wiring.assign(Assignment::new(Port::done(group), Port::cell(mem, "write_done")));
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce_register(
        &mut self,
        env: &Env,
        op: BinOp,
        reg: &str,
        width: u32,
        signed: bool,
        frac: Option<u32>,
        value: &TypedExpr,
        pos: Pos,
    ) -> CompileResult<Control> {
        let mut wiring = Wiring::default();
        let rhs = self.lower_expr(env, value, width, &mut wiring, pos)?;
        let (prim, params) = primitive(op, width, signed, frac);
        let cell = self.prim(prim.trim_start_matches("std_"), prim, params);
        let group = self.names.fresh("reduce");
        wiring.assign(Assignment::new(Port::cell(&cell, "left"), Port::cell(reg, "out")));
        wiring.assign(Assignment::new(Port::cell(&cell, "right"), rhs));
        wiring.assign(Assignment::new(Port::cell(reg, "in"), Port::cell(&cell, "out")));
        wiring.assign(Assignment::new(Port::cell(reg, "write_en"), Atom::high()));
        wiring.assign(Assignment::new(Port::done(&group), Port::cell(reg, "done")));
        self.add_group(&group, Some(1), wiring.assigns);

        let mut controls = wiring.pre;
        controls.push(self.enable(group, pos));
        Ok(Control::seq(controls))
    }

    /// `a[i] op= e`: read the old element into a capture register, then
    /// combine and store in one cycle
    #[allow(clippy::too_many_arguments)]
    fn reduce_memory(
        &mut self,
        env: &Env,
        op: BinOp,
        mem: &str,
        addr: &[TypedExpr],
        signed: bool,
        frac: Option<u32>,
        value: &TypedExpr,
        pos: Pos,
    ) -> CompileResult<Control> {
        let (cell, sizes, width) = self.memory(env, mem)?;
        let mut addr_wiring = Wiring::default();
        let addrs = self.lower_addrs(env, addr, &sizes, &mut addr_wiring, pos)?;

        let old = self.fresh_register("r", width);
        let read = self.names.fresh("read");
        let mut read_wiring = Wiring {
            assigns: addr_wiring.assigns.clone(),
            pre: Vec::new(),
        };
        self.read_group(&cell, &addrs, Guard::True, &mut read_wiring, &old);
        read_wiring.assign(Assignment::new(Port::done(&read), Port::cell(&old, "done")));
        self.add_group(&read, Some(2), read_wiring.assigns);

        let mut write_wiring = Wiring {
            assigns: addr_wiring.assigns,
            pre: Vec::new(),
        };
        let rhs = self.lower_expr(env, value, width, &mut write_wiring, pos)?;
        let (prim, params) = primitive(op, width, signed, frac);
        let op_cell = self.prim(prim.trim_start_matches("std_"), prim, params);
        write_wiring.assign(Assignment::new(Port::cell(&op_cell, "left"), Port::cell(&old, "out")));
        write_wiring.assign(Assignment::new(Port::cell(&op_cell, "right"), rhs));
        let write = self.names.fresh("write");
        self.write_group(&write, &cell, &addrs, Port::cell(&op_cell, "out"), &mut write_wiring);
        self.add_group(&write, Some(1), write_wiring.assigns);

        let mut controls = addr_wiring.pre;
        controls.extend(write_wiring.pre);
        controls.push(self.enable(read, pos));
        controls.push(self.enable(write, pos));
        Ok(Control::seq(controls))
    }

    /// `seq { init; @bound(trip) while lt.out with cond { seq { body; incr } } }`
    fn lower_for(
        &mut self,
        env: &Env,
        iter: &str,
        start: u64,
        end: u64,
        body: &TypedCommand,
        pos: Pos,
    ) -> CompileResult<Control> {
        let reg_width = bits_needed(end);
        let width = bits_needed(end - 1);
        let reg = self.register(iter, reg_width);
        let slice = (reg_width > width).then(|| {
            self.prim(
                "slice",
                "std_slice",
                vec![u64::from(reg_width), u64::from(width)],
            )
        });

        let init = self.names.unique(&format!("init_{}", iter));
        let start_port = self.constant(reg_width, start)?;
        self.add_group(
            &init,
            Some(1),
            vec![
                Assignment::new(Port::cell(&reg, "in"), start_port),
                Assignment::new(Port::cell(&reg, "write_en"), Atom::high()),
                Assignment::new(Port::done(&init), Port::cell(&reg, "done")),
            ],
        );

        let cond = self.names.unique(&format!("cond_{}", iter));
        let lt = self.prim("lt", "std_lt", vec![u64::from(reg_width)]);
        let end_port = self.constant(reg_width, end)?;
        self.add_group(
            &cond,
            None,
            vec![
                Assignment::new(Port::cell(&lt, "left"), Port::cell(&reg, "out")),
                Assignment::new(Port::cell(&lt, "right"), end_port),
            ],
        );

        let incr = self.names.unique(&format!("incr_{}", iter));
        let add = self.prim("add", "std_add", vec![u64::from(reg_width)]);
        let one = self.constant(reg_width, 1)?;
        self.add_group(
            &incr,
            Some(1),
            vec![
                Assignment::new(Port::cell(&add, "left"), Port::cell(&reg, "out")),
                Assignment::new(Port::cell(&add, "right"), one),
                Assignment::new(Port::cell(&reg, "in"), Port::cell(&add, "out")),
                Assignment::new(Port::cell(&reg, "write_en"), Atom::high()),
                Assignment::new(Port::done(&incr), Port::cell(&reg, "done")),
            ],
        );

        let body_env = env.enter().rebind(
            iter.to_string(),
            Store::Iter {
                cell: reg,
                slice,
                width,
            },
        );
        let (body, _) = self.command(body_env, body)?;

        let init = self.enable(init, pos);
        let incr = self.enable(incr, pos);
        Ok(Control::seq(vec![
            init,
            Control::While {
                port: Port::cell(lt, "out"),
                cond: Some(cond),
                body: Box::new(Control::seq(vec![body, incr])),
                bound: Some(end - start),
            },
        ]))
    }

    /// Width adapter from `from` to `to` bits; signed values widen by sign
    /// extension
    fn adapt(&mut self, port: Port, from: u32, to: u32, signed: bool, wiring: &mut Wiring) -> Port {
        if from == to {
            return port;
        }
        let (prefix, prim) = if from > to {
            ("slice", "std_slice")
        } else if signed {
            ("signext", "std_signext")
        } else {
            ("pad", "std_pad")
        };
        let cell = self.prim(prefix, prim, vec![u64::from(from), u64::from(to)]);
        wiring.assign(Assignment::new(Port::cell(&cell, "in"), port));
        Port::cell(cell, "out")
    }

    /// Lower an expression to a port carrying its value at `width` bits.
    /// Combinational wiring goes to `wiring.assigns`; array reads are
    /// hoisted into `wiring.pre`.
    fn lower_expr(
        &mut self,
        env: &Env,
        e: &TypedExpr,
        width: u32,
        wiring: &mut Wiring,
        pos: Pos,
    ) -> CompileResult<Port> {
        // Folded at type checking
        if let (TypedExprKind::Binop { .. }, Type::Static(n)) = (&e.kind, &e.ty) {
            return self.constant(width, *n);
        }
        match &e.kind {
            TypedExprKind::Int(n) => self.constant(width, *n),
            TypedExprKind::Bool(b) => {
                let port = self.constant(1, u64::from(*b))?;
                Ok(self.adapt(port, 1, width, false, wiring))
            }
            TypedExprKind::Var(name) => {
                let (port, from) = match env.get(name) {
                    Some(Store::Reg { cell, width }) => (Port::cell(cell.clone(), "out"), *width),
                    Some(Store::Iter {
                        cell,
                        slice: Some(slice),
                        width,
                    }) => {
                        wiring.assign(Assignment::new(
                            Port::cell(slice.clone(), "in"),
                            Port::cell(cell.clone(), "out"),
                        ));
                        (Port::cell(slice.clone(), "out"), *width)
                    }
                    Some(Store::Iter {
                        cell,
                        slice: None,
                        width,
                    }) => (Port::cell(cell.clone(), "out"), *width),
                    Some(Store::Mem { .. }) | None => {
                        return Err(CompileError::internal(format!(
                            "`{}` has no register in `{}`",
                            name,
                            self.sources.describe(pos)
                        )))
                    }
                };
                Ok(self.adapt(port, from, width, e.ty.is_signed(), wiring))
            }
            TypedExprKind::Binop { op, lhs, rhs } => {
                let (op_width, out_width) = if op.is_comparison() {
                    (lhs.ty.width().max(rhs.ty.width()), 1)
                } else if op.is_logical() {
                    (1, 1)
                } else {
                    (e.ty.width(), e.ty.width())
                };
                let signed = lhs.ty.is_signed() || rhs.ty.is_signed();
                let frac = if op.is_arithmetic() {
                    frac_of(&e.ty)
                } else {
                    None
                };
                let left = self.lower_expr(env, lhs, op_width, wiring, pos)?;
                let right = self.lower_expr(env, rhs, op_width, wiring, pos)?;
                let (prim, params) = primitive(*op, op_width, signed, frac);
                let cell = self.prim(prim.trim_start_matches("std_"), prim, params);
                wiring.assign(Assignment::new(Port::cell(&cell, "left"), left));
                wiring.assign(Assignment::new(Port::cell(&cell, "right"), right));
                let out_signed = !op.is_comparison() && !op.is_logical() && e.ty.is_signed();
                Ok(self.adapt(Port::cell(cell, "out"), out_width, width, out_signed, wiring))
            }
            TypedExprKind::Mem { .. } | TypedExprKind::MuxRead { .. } => {
                let elem_width = e.ty.width();
                let reg = self.fresh_register("r", elem_width);
                let controls = self.read_into(env, e, &reg, pos)?;
                wiring.pre.extend(controls);
                Ok(self.adapt(Port::cell(reg, "out"), elem_width, width, e.ty.is_signed(), wiring))
            }
            TypedExprKind::Access { array, .. } => Err(CompileError::internal(format!(
                "logical access to `{}` reached the backend",
                array
            ))),
            TypedExprKind::App { func, .. } => Err(CompileError::internal(format!(
                "application of `{}` used as a value",
                func
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    fn generate(source: &str) -> Netlist {
        compile(source, &CompilerConfig::default()).unwrap()
    }

    fn main_of(netlist: &Netlist) -> &Component {
        netlist.component("main").unwrap()
    }

    #[test]
    fn test_literal_let() {
        let netlist = generate("let x = 0;");
        let main = main_of(&netlist);
        assert_eq!(main.groups.len(), 1);
        let group = &main.groups[0];
        assert_eq!(group.latency, Some(1));
        assert_eq!(group.assignments[0].to_string(), "x.in = const0.out;");
        assert_eq!(main.cell("const0").unwrap().prototype.to_string(), "std_const(32, 0)");
        assert_eq!(main.cell("x").unwrap().prototype.to_string(), "std_reg(32)");
    }

    #[test]
    fn test_read_group_timing() {
        let netlist = generate("decl a: ubit<32>[4]; let v = a[1];");
        let main = main_of(&netlist);
        let read = main.group("read0").unwrap();
        assert_eq!(read.latency, Some(2));
        let lines: Vec<String> = read.assignments.iter().map(|a| a.to_string()).collect();
        assert!(lines.contains(&"a.addr0 = %0 ? const0.out;".to_string()));
        assert!(lines.contains(&"a.read_en = %0 ? 1'd1;".to_string()));
        assert!(lines.contains(&"v.in = %1 ? a.read_data;".to_string()));
        assert!(lines.contains(&"v.write_en = %1 & a.read_done ? 1'd1;".to_string()));
        assert!(lines.contains(&"read0[done] = v.done;".to_string()));
    }

    #[test]
    fn test_external_memories() {
        let netlist = generate("decl a: ubit<8>[8 bank 2][3]; let v = a[0][0];");
        let main = main_of(&netlist);
        let bank = main.cell("a_b0").unwrap();
        assert!(bank.external);
        assert_eq!(bank.prototype.to_string(), "seq_mem_d2(8, 2, 3, 1, 2)");
        assert!(main.cell("a_b3").unwrap().external);
        assert_eq!(netlist.memories["a"], vec!["a_b0", "a_b1", "a_b2", "a_b3"]);
    }

    #[test]
    fn test_sibling_local_memories_are_renamed() {
        let netlist = generate(
            "decl c: bool;
             if (c) { decl t: ubit<8>[2]; t[0] := 1; } else { decl t: ubit<8>[2]; t[1] := 1; }",
        );
        let main = main_of(&netlist);
        let first = main.cell("t").unwrap();
        let second = main.cell("t_1").unwrap();
        assert!(!first.external && !second.external);
        assert_eq!(second.prototype.to_string(), "seq_mem_d1(8, 2, 1)");
        let write = |name: &str| -> Vec<String> {
            main.group(name).unwrap().assignments.iter().map(|a| a.to_string()).collect()
        };
        assert!(write("write0").contains(&"t.write_en = 1'd1;".to_string()));
        assert!(write("write1").contains(&"t_1.write_en = 1'd1;".to_string()));

        let netlist = generate(
            "decl c: bool;
             if (c) { let t = 1; } else { decl t: ubit<8>[2]; t[1] := 1; }",
        );
        let main = main_of(&netlist);
        assert_eq!(main.cell("t").unwrap().prototype.to_string(), "std_reg(32)");
        assert_eq!(main.cell("t_1").unwrap().prototype.to_string(), "seq_mem_d1(8, 2, 1)");
    }

    #[test]
    fn test_wide_literal_keeps_its_value() {
        let netlist = generate("let x = 5000000000;");
        let main = main_of(&netlist);
        assert_eq!(main.cell("x").unwrap().prototype.to_string(), "std_reg(33)");
        assert_eq!(
            main.cell("const0").unwrap().prototype.to_string(),
            "std_const(33, 5000000000)"
        );
    }

    #[test]
    fn test_oversized_constant_is_internal_error() {
        let config = CompilerConfig::default();
        let sources = SourceMap::default();
        let gen = CodeGenerator::new(&config, &sources);
        let signatures = HashMap::new();
        let mut metadata = BTreeMap::new();
        let mut builder = Builder::new("main", &gen, &signatures, &mut metadata);
        assert!(builder.constant(4, 15).is_ok());
        assert!(builder.constant(4, 16).unwrap_err().is_internal());
    }

    #[test]
    fn test_signed_operands_are_sign_extended() {
        let netlist = generate(
            "decl a: bit<8>; decl b: bit<16>;
             let d = a - 1;
             let c = d + b;",
        );
        let main = main_of(&netlist);
        let ext = main.cells_of("std_signext");
        assert_eq!(ext.len(), 1);
        assert_eq!(ext[0].prototype.to_string(), "std_signext(8, 16)");
        assert!(main.cells_of("std_pad").is_empty());

        let netlist = generate("decl a: ubit<8>; decl b: ubit<16>; let c = a + b;");
        let main = main_of(&netlist);
        assert!(main.cells_of("std_signext").is_empty());
        assert_eq!(main.cells_of("std_pad")[0].prototype.to_string(), "std_pad(8, 16)");
    }

    #[test]
    fn test_fixed_point_arithmetic_uses_fp_adder() {
        let netlist = generate(
            "decl f: fix<16, 8>; decl g: fix<16, 8>; decl acc: fix<16, 8>[2];
             let h = f + g;
             h += f;
             acc[1] += h;",
        );
        let main = main_of(&netlist);
        let adders = main.cells_of("std_fp_add");
        assert_eq!(adders.len(), 3);
        assert!(adders
            .iter()
            .all(|c| c.prototype.to_string() == "std_fp_add(16, 8, 8)"));
        assert!(main.cells_of("std_add").is_empty());
    }

    #[test]
    fn test_discarded_expression_only_reads() {
        let netlist = generate("decl a: ubit<8>[2]; let x: ubit<8> = 1; a[0] + x;");
        let main = main_of(&netlist);
        assert!(main.cells_of("std_add").is_empty());
        assert_eq!(main.control.enables(), vec!["let0", "read0"]);
        assert_eq!(main.group("read0").unwrap().latency, Some(2));
    }

    #[test]
    fn test_iterator_register_holds_exit_value() {
        let netlist = generate("decl a: ubit<32>[8]; for (let i = 0..8) { a[i] := 1; }");
        let main = main_of(&netlist);
        assert_eq!(main.cell("i").unwrap().prototype.to_string(), "std_reg(4)");
        assert_eq!(main.cells_of("std_slice")[0].prototype.to_string(), "std_slice(4, 3)");
        let Control::Seq(items) = &main.control else {
            panic!("Expected Seq");
        };
        let Control::While { bound, cond, .. } = &items[1] else {
            panic!("Expected While");
        };
        assert_eq!(*bound, Some(8));
        assert_eq!(cond.as_deref(), Some("cond_i"));
    }

    #[test]
    fn test_multiplexed_read_guards() {
        let netlist = generate("decl a: ubit<32>[8 bank 2]; for (let i = 0..8) { let v = a[i]; }");
        let main = main_of(&netlist);
        assert_eq!(main.cells_of("std_eq").len(), 4);
        let read = main.group("read0").unwrap();
        let lines: Vec<String> = read.assignments.iter().map(|a| a.to_string()).collect();
        assert!(lines.contains(&"a_b1.read_en = %0 & eq1.out ? 1'd1;".to_string()));
        assert!(lines.contains(&"v.in = %1 & eq0.out ? a_b0.read_data;".to_string()));
    }

    #[test]
    fn test_invoke_orders_refs_by_parameter() {
        let netlist = generate(
            "decl x: ubit<8>[4]; decl y: ubit<8>[4];
             def copy(dst: ubit<8>[4], src: ubit<8>[4]) { let t = src[0]; dst[0] := t; }
             copy(y, x);",
        );
        let copy = netlist.component("copy").unwrap();
        assert!(copy.cell("dst").unwrap().reference);
        let main = main_of(&netlist);
        assert!(main.cell("copy0").is_some());
        assert_eq!(
            main.control,
            Control::Invoke {
                cell: "copy0".to_string(),
                refs: vec![
                    ("dst".to_string(), "y".to_string()),
                    ("src".to_string(), "x".to_string()),
                ],
                pos: Some(Pos(9)),
            }
        );
    }

    #[test]
    fn test_positions_can_be_disabled() {
        let config = CompilerConfig {
            emit_positions: false,
            ..CompilerConfig::default()
        };
        let netlist = compile("let x = 0;", &config).unwrap();
        assert!(netlist.metadata.is_empty());
        assert_eq!(
            main_of(&netlist).control,
            Control::Enable {
                group: "let0".to_string(),
                pos: None,
            }
        );
    }
}
