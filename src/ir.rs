//! Hardware control IR
//!
//! A netlist of components, each made of cells (primitive or component
//! instances), groups of guarded assignments, and a control tree that
//! schedules the groups. Prints as the textual IR and serializes as JSON.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::ast::{Id, Pos};

/// What a cell instantiates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Prototype {
    /// A library primitive such as `std_reg(32)`
    Primitive { name: String, params: Vec<u64> },
    /// An instance of another component in the netlist
    Component(Id),
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prototype::Primitive { name, params } => {
                write!(f, "{}(", name)?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
            Prototype::Component(name) => write!(f, "{}()", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub name: Id,
    pub prototype: Prototype,
    /// Exposed as a top-level memory port
    pub external: bool,
    /// Bound by the caller's invoke
    pub reference: bool,
}

impl Cell {
    pub fn primitive(name: impl Into<Id>, prim: &str, params: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            prototype: Prototype::Primitive {
                name: prim.to_string(),
                params,
            },
            external: false,
            reference: false,
        }
    }

    pub fn instance(name: impl Into<Id>, component: impl Into<Id>) -> Self {
        Self {
            name: name.into(),
            prototype: Prototype::Component(component.into()),
            external: false,
            reference: false,
        }
    }

    /// Name of the primitive this cell instantiates, if any
    pub fn primitive_name(&self) -> Option<&str> {
        match &self.prototype {
            Prototype::Primitive { name, .. } => Some(name),
            Prototype::Component(_) => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.external {
            write!(f, "@external ")?;
        }
        if self.reference {
            write!(f, "ref ")?;
        }
        write!(f, "{} = {};", self.name, self.prototype)
    }
}

/// A port of a cell, or a hole of a group such as `g[done]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Port {
    Cell { cell: Id, port: Id },
    Hole { group: Id, port: Id },
}

impl Port {
    pub fn cell(cell: impl Into<Id>, port: impl Into<Id>) -> Self {
        Port::Cell {
            cell: cell.into(),
            port: port.into(),
        }
    }

    pub fn done(group: impl Into<Id>) -> Self {
        Port::Hole {
            group: group.into(),
            port: "done".to_string(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Cell { cell, port } => write!(f, "{}.{}", cell, port),
            Port::Hole { group, port } => write!(f, "{}[{}]", group, port),
        }
    }
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Atom {
    Port(Port),
    Const { width: u32, value: u64 },
}

impl Atom {
    pub fn high() -> Self {
        Atom::Const { width: 1, value: 1 }
    }
}

impl From<Port> for Atom {
    fn from(port: Port) -> Self {
        Atom::Port(port)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Port(port) => write!(f, "{}", port),
            Atom::Const { width, value } => write!(f, "{}'d{}", width, value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Guard {
    True,
    Port(Port),
    /// High only during the given cycle of a static group
    Cycle(u64),
    And(Box<Guard>, Box<Guard>),
}

impl Guard {
    pub fn and(self, other: Guard) -> Guard {
        match (self, other) {
            (Guard::True, g) | (g, Guard::True) => g,
            (a, b) => Guard::And(Box::new(a), Box::new(b)),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::True => Ok(()),
            Guard::Port(port) => write!(f, "{}", port),
            Guard::Cycle(k) => write!(f, "%{}", k),
            Guard::And(a, b) => write!(f, "{} & {}", a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub dst: Port,
    pub src: Atom,
    pub guard: Guard,
}

impl Assignment {
    pub fn new(dst: Port, src: impl Into<Atom>) -> Self {
        Self {
            dst,
            src: src.into(),
            guard: Guard::True,
        }
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.guard {
            Guard::True => write!(f, "{} = {};", self.dst, self.src),
            guard => write!(f, "{} = {} ? {};", self.dst, guard, self.src),
        }
    }
}

/// A unit of wiring. Static groups take a fixed number of cycles;
/// combinational groups only compute conditions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub name: Id,
    /// `None` for a combinational group
    pub latency: Option<u64>,
    pub assignments: Vec<Assignment>,
}

impl Group {
    pub fn is_static(&self) -> bool {
        self.latency.is_some()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.latency {
            Some(n) => writeln!(f, "    static<{}> group {} {{", n, self.name)?,
            None => writeln!(f, "    comb group {} {{", self.name)?,
        }
        for assign in &self.assignments {
            writeln!(f, "      {}", assign)?;
        }
        writeln!(f, "    }}")
    }
}

/// Schedule of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Control {
    Empty,
    Enable {
        group: Id,
        pos: Option<Pos>,
    },
    Seq(Vec<Control>),
    While {
        port: Port,
        cond: Option<Id>,
        body: Box<Control>,
        /// Static trip count
        bound: Option<u64>,
    },
    If {
        port: Port,
        cond: Option<Id>,
        then_branch: Box<Control>,
        else_branch: Box<Control>,
    },
    Invoke {
        cell: Id,
        /// `(parameter, argument)` pairs in the callee's parameter order
        refs: Vec<(Id, Id)>,
        pos: Option<Pos>,
    },
}

impl Control {
    /// Sequence `items`, flattening nested sequences and dropping empties
    pub fn seq(items: Vec<Control>) -> Control {
        let mut flat = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Control::Seq(inner) => flat.extend(inner),
                Control::Empty => {}
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Control::Empty,
            1 => flat.remove(0),
            _ => Control::Seq(flat),
        }
    }

    /// Groups enabled anywhere in this tree, in schedule order
    pub fn enables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_enables(&mut out);
        out
    }

    fn collect_enables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Control::Empty | Control::Invoke { .. } => {}
            Control::Enable { group, .. } => out.push(group),
            Control::Seq(items) => items.iter().for_each(|c| c.collect_enables(out)),
            Control::While { body, .. } => body.collect_enables(out),
            Control::If {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.collect_enables(out);
                else_branch.collect_enables(out);
            }
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        match self {
            Control::Empty => Ok(()),
            Control::Enable { group, pos } => {
                write!(f, "{}", pad)?;
                if let Some(pos) = pos {
                    write!(f, "@pos({}) ", pos)?;
                }
                writeln!(f, "{};", group)
            }
            Control::Seq(items) => {
                writeln!(f, "{}seq {{", pad)?;
                for item in items {
                    item.write_indented(f, indent + 2)?;
                }
                writeln!(f, "{}}}", pad)
            }
            Control::While {
                port,
                cond,
                body,
                bound,
            } => {
                write!(f, "{}", pad)?;
                if let Some(bound) = bound {
                    write!(f, "@bound({}) ", bound)?;
                }
                write!(f, "while {}", port)?;
                if let Some(cond) = cond {
                    write!(f, " with {}", cond)?;
                }
                writeln!(f, " {{")?;
                body.write_indented(f, indent + 2)?;
                writeln!(f, "{}}}", pad)
            }
            Control::If {
                port,
                cond,
                then_branch,
                else_branch,
            } => {
                write!(f, "{}if {}", pad, port)?;
                if let Some(cond) = cond {
                    write!(f, " with {}", cond)?;
                }
                writeln!(f, " {{")?;
                then_branch.write_indented(f, indent + 2)?;
                if **else_branch == Control::Empty {
                    writeln!(f, "{}}}", pad)
                } else {
                    writeln!(f, "{}}} else {{", pad)?;
                    else_branch.write_indented(f, indent + 2)?;
                    writeln!(f, "{}}}", pad)
                }
            }
            Control::Invoke { cell, refs, pos } => {
                write!(f, "{}", pad)?;
                if let Some(pos) = pos {
                    write!(f, "@pos({}) ", pos)?;
                }
                write!(f, "invoke {}[", cell)?;
                for (i, (param, arg)) in refs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", param, arg)?;
                }
                writeln!(f, "]()();")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    pub name: Id,
    pub cells: Vec<Cell>,
    pub groups: Vec<Group>,
    pub control: Control,
}

impl Component {
    pub fn new(name: impl Into<Id>) -> Self {
        Self {
            name: name.into(),
            cells: Vec::new(),
            groups: Vec::new(),
            control: Control::Empty,
        }
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Cells instantiating the given primitive
    pub fn cells_of(&self, prim: &str) -> Vec<&Cell> {
        self.cells
            .iter()
            .filter(|c| c.primitive_name() == Some(prim))
            .collect()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "component {}() -> () {{", self.name)?;
        writeln!(f, "  cells {{")?;
        for cell in &self.cells {
            writeln!(f, "    {}", cell)?;
        }
        writeln!(f, "  }}")?;
        writeln!(f, "  wires {{")?;
        for group in &self.groups {
            write!(f, "{}", group)?;
        }
        writeln!(f, "  }}")?;
        writeln!(f, "  control {{")?;
        self.control.write_indented(f, 4)?;
        writeln!(f, "  }}")?;
        writeln!(f, "}}")
    }
}

/// A complete compiled design
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Netlist {
    pub components: Vec<Component>,
    /// Top-level logical array to the external memories holding its banks
    pub memories: BTreeMap<Id, Vec<Id>>,
    /// Source statement behind each `@pos` used in the control
    pub metadata: BTreeMap<Pos, String>,
}

impl Netlist {
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Netlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "import \"primitives/core.futil\";")?;
        for component in &self.components {
            write!(f, "{}", component)?;
        }
        if !self.metadata.is_empty() {
            writeln!(f, "metadata #{{")?;
            for (pos, text) in &self.metadata {
                writeln!(f, "  {}: {}", pos, text)?;
            }
            writeln!(f, "}}#")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_assignment_display() {
        let assign = Assignment::new(Port::cell("r", "write_en"), Atom::high())
            .guarded(Guard::Cycle(1).and(Guard::Port(Port::cell("mem", "read_done"))));
        assert_eq!(assign.to_string(), "r.write_en = %1 & mem.read_done ? 1'd1;");
        let done = Assignment::new(Port::done("read0"), Port::cell("r", "done"));
        assert_eq!(done.to_string(), "read0[done] = r.done;");
    }

    #[test]
    fn test_seq_flattening() {
        let enable = |g: &str| Control::Enable {
            group: g.to_string(),
            pos: None,
        };
        let ctrl = Control::seq(vec![
            Control::Empty,
            Control::seq(vec![enable("a"), enable("b")]),
            enable("c"),
        ]);
        assert_eq!(ctrl, Control::Seq(vec![enable("a"), enable("b"), enable("c")]));
        assert_eq!(Control::seq(vec![enable("a")]), enable("a"));
        assert_eq!(ctrl.enables(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_component_display() {
        let mut comp = Component::new("main");
        let mut mem = Cell::primitive("src", "seq_mem_d1", vec![32, 4, 2]);
        mem.external = true;
        comp.cells.push(mem);
        comp.cells.push(Cell::primitive("x", "std_reg", vec![32]));
        comp.groups.push(Group {
            name: "let0".to_string(),
            latency: Some(1),
            assignments: vec![
                Assignment::new(Port::cell("x", "write_en"), Atom::high()),
                Assignment::new(Port::done("let0"), Port::cell("x", "done")),
            ],
        });
        comp.control = Control::Enable {
            group: "let0".to_string(),
            pos: Some(Pos(0)),
        };

        let netlist = Netlist {
            components: vec![comp],
            memories: BTreeMap::from([("src".to_string(), vec!["src".to_string()])]),
            metadata: BTreeMap::from([(Pos(0), "let x = 0;".to_string())]),
        };
        let text = netlist.to_string();
        assert!(text.starts_with("import \"primitives/core.futil\";\ncomponent main() -> () {"));
        assert!(text.contains("    @external src = seq_mem_d1(32, 4, 2);\n"));
        assert!(text.contains("    static<1> group let0 {\n      x.write_en = 1'd1;\n"));
        assert!(text.contains("    @pos(0) let0;\n"));
        assert!(text.ends_with("metadata #{\n  0: let x = 0;\n}#\n"));
    }

    #[test]
    fn test_invoke_display() {
        let mut comp = Component::new("main");
        comp.control = Control::Invoke {
            cell: "scale0".to_string(),
            refs: vec![
                ("a_b0".to_string(), "m_b0".to_string()),
                ("a_b1".to_string(), "m_b1".to_string()),
            ],
            pos: Some(Pos(4)),
        };
        assert!(comp
            .to_string()
            .contains("    @pos(4) invoke scale0[a_b0=m_b0, a_b1=m_b1]()();\n"));
    }
}
