//! End-to-end compilation scenarios

use pretty_assertions::assert_eq;

use accelc::ir::{Component, Control, Netlist};
use accelc::{bits_needed, check, compile, CompileError, CompilerConfig, Type};

fn compile_default(source: &str) -> Netlist {
    compile(source, &CompilerConfig::default()).unwrap()
}

fn root(netlist: &Netlist) -> &Component {
    netlist.component("main").unwrap()
}

/// Compact rendering of a control tree: enables by name, loops with bound
fn shape(control: &Control) -> String {
    match control {
        Control::Empty => "empty".to_string(),
        Control::Enable { group, .. } => group.clone(),
        Control::Seq(items) => format!(
            "seq[{}]",
            items.iter().map(shape).collect::<Vec<_>>().join(", ")
        ),
        Control::While { body, bound, .. } => {
            format!("while({})[{}]", bound.unwrap_or(0), shape_inner(body))
        }
        Control::If {
            then_branch,
            else_branch,
            ..
        } => format!("if[{}][{}]", shape(then_branch), shape(else_branch)),
        Control::Invoke { cell, .. } => format!("invoke {}", cell),
    }
}

fn shape_inner(control: &Control) -> String {
    match control {
        Control::Seq(items) => items.iter().map(shape).collect::<Vec<_>>().join(", "),
        other => shape(other),
    }
}

fn latency_of(component: &Component, group: &str) -> Option<u64> {
    component.group(group).and_then(|g| g.latency)
}

#[test]
fn simple_copy_is_three_timed_steps() {
    let netlist = compile_default(
        "decl src: ubit<32>[1];
         decl dest: ubit<32>[1];
         let i = 0;
         let v = src[i];
         dest[i] := v;",
    );
    let main = root(&netlist);
    assert_eq!(shape(&main.control), "seq[let0, read0, write0]");
    assert_eq!(latency_of(main, "let0"), Some(1));
    assert_eq!(latency_of(main, "read0"), Some(2));
    assert_eq!(latency_of(main, "write0"), Some(1));

    let metadata: Vec<_> = netlist.metadata.values().cloned().collect();
    assert_eq!(
        metadata,
        vec![
            "let i = 0;".to_string(),
            "let v = src[i];".to_string(),
            "dest[i] := v;".to_string(),
        ]
    );
}

#[test]
fn literal_let_renders_one_group() {
    let netlist = compile_default("let x = 0;");
    let expected = r#"import "primitives/core.futil";
component main() -> () {
  cells {
    x = std_reg(32);
    const0 = std_const(32, 0);
  }
  wires {
    static<1> group let0 {
      x.in = const0.out;
      x.write_en = 1'd1;
      let0[done] = x.done;
    }
  }
  control {
    @pos(1) let0;
  }
}
metadata #{
  1: let x = 0;
}#
"#;
    assert_eq!(netlist.to_string(), expected);
}

#[test]
fn nested_reduction_loops() {
    let netlist = compile_default(
        "decl a: ubit<32>[1][2];
         let x: ubit<32> = 1;
         for (let i = 0..1) {
           for (let j = 0..2) {
             a[i][j] += x;
           }
         }",
    );
    let main = root(&netlist);
    assert_eq!(
        shape(&main.control),
        "seq[let0, init_i, while(1)[init_j, while(2)[read0, write0, incr_j], incr_i]]"
    );
    assert_eq!(latency_of(main, "read0"), Some(2));
    assert_eq!(latency_of(main, "write0"), Some(1));
    assert!(main.cells_of("std_add").len() >= 3);
}

#[test]
fn dynamic_bank_write_in_parallel_loop_is_rejected() {
    let err = compile(
        "decl a: ubit<32>[8 bank 2];
         for (let i = 0..8) unroll 2 { a[i] := 1; }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::RewriteCapability { .. }));
    assert_eq!(err.statement(), Some("a[i] := 1;"));
    assert!(!err.is_internal());
}

#[test]
fn bool_into_integer_emits_no_ir() {
    let result = compile("decl x: ubit<32>; x := true;", &CompilerConfig::default());
    match result {
        Err(CompileError::TypeMismatch { stmt, .. }) => assert_eq!(stmt, "x := true;"),
        other => panic!("expected a type mismatch, got {:?}", other),
    }
}

#[test]
fn type_checking_is_idempotent() {
    let source = "decl a: ubit<32>[8 bank 2];
                  let s: ubit<32> = 0;
                  for (let i = 0..4) { s += a[i]; }";
    assert_eq!(check(source).unwrap(), check(source).unwrap());
}

#[test]
fn iterator_type_width_is_minimal() {
    for bound in 1..=40u64 {
        let ty = Type::Idx { bound, bank: None };
        let w = ty.width();
        assert!((1u64 << w) - 1 >= bound - 1, "bound {}", bound);
        if w > 1 {
            assert!((1u64 << (w - 1)) - 1 < bound - 1, "bound {}", bound);
        }
    }
}

#[test]
fn iterator_register_holds_exit_value() {
    for bound in 1..=40u64 {
        let netlist = compile_default(&format!(
            "decl a: ubit<8>[{b}]; for (let i = 0..{b}) {{ a[i] := 0; }}",
            b = bound
        ));
        let main = root(&netlist);
        let reg_width = bits_needed(bound);
        assert_eq!(
            main.cell("i").unwrap().prototype.to_string(),
            format!("std_reg({})", reg_width)
        );
        assert!((1u64 << reg_width) - 1 >= bound, "bound {}", bound);
        if reg_width > 1 {
            assert!((1u64 << (reg_width - 1)) - 1 < bound, "bound {}", bound);
        }

        // Uses are narrowed to the iterator type whenever the register is wider
        let type_width = Type::Idx { bound, bank: None }.width();
        let slices = main.cells_of("std_slice");
        if reg_width > type_width {
            assert_eq!(
                slices[0].prototype.to_string(),
                format!("std_slice({}, {})", reg_width, type_width)
            );
        } else {
            assert!(slices.is_empty(), "bound {}", bound);
        }
    }
}

#[test]
fn wrong_index_count_is_a_dimension_error() {
    for source in [
        "decl a: ubit<32>[4][4]; a[0] := 1;",
        "decl a: ubit<32>[4]; let x = a[0][1];",
    ] {
        let err = compile(source, &CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::DimensionError { .. }), "{}", source);
    }
}

#[test]
fn every_read_and_write_has_fixed_latency() {
    let netlist = compile_default(
        "decl a: ubit<32>[4];
         decl b: ubit<32>[4];
         let x = a[0] + a[1];
         b[0] := x;
         b[1] := a[2];",
    );
    let main = root(&netlist);
    let reads: Vec<_> = main.groups.iter().filter(|g| g.latency == Some(2)).collect();
    assert_eq!(reads.len(), 3);
    let captures = main
        .cells_of("std_reg")
        .into_iter()
        .filter(|c| c.name.starts_with('r'))
        .count();
    assert_eq!(captures, 3);
    let writes: Vec<_> = main
        .groups
        .iter()
        .filter(|g| g.name.starts_with("write"))
        .collect();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|g| g.latency == Some(1)));
}

#[test]
fn functions_become_components() {
    let netlist = compile_default(
        "decl m: ubit<8>[4 bank 2];
         def clear(a: ubit<8>[4 bank 2]) {
           for (let i = 0..2) { a[i] := 0; }
         }
         clear(m);",
    );
    assert_eq!(netlist.components.len(), 2);
    let clear = netlist.component("clear").unwrap();
    assert!(clear.cell("a_b0").unwrap().reference);
    assert!(clear.cell("a_b1").unwrap().reference);

    let text = netlist.to_string();
    assert!(text.contains("invoke clear0[a_b0=m_b0, a_b1=m_b1]()();"));
    assert!(text.contains("@external m_b0 = seq_mem_d1(8, 2, 1);"));
}

#[test]
fn rotation_register_is_allocated() {
    let netlist = compile_default(
        "decl a: ubit<32>[4 bank 2];
         decl out: ubit<32>[1];
         let x = a[0];
         advance a;
         let y = a[0];
         out[0] := y;",
    );
    let main = root(&netlist);
    assert_eq!(main.cell("a_bank").unwrap().prototype.to_string(), "std_reg(1)");
    assert_eq!(main.cells_of("std_eq").len(), 4);
}

#[test]
fn rotation_register_does_not_capture_user_variable() {
    let netlist = compile_default(
        "decl a: ubit<32>[4 bank 2];
         decl out: ubit<1>[1];
         let a_bank: ubit<1> = 1;
         let x = a[0];
         advance a;
         out[0] := a_bank;",
    );
    let main = root(&netlist);
    let writers = |reg: &str| {
        let prefix = format!("{}.in = ", reg);
        main.groups
            .iter()
            .flat_map(|g| &g.assignments)
            .filter(|a| a.to_string().starts_with(&prefix))
            .count()
    };
    // The user's register is only written by its own let
    assert_eq!(writers("a_bank"), 1);
    // The rotation register is reset once and advanced once
    assert_eq!(writers("a_bank_1"), 2);
    let write = main.group("write0").unwrap();
    assert!(write
        .assignments
        .iter()
        .any(|a| a.to_string() == "out.write_data = a_bank.out;"));
}

#[test]
fn banks_hold_bank_factor_elements() {
    let netlist = compile_default("decl a: ubit<32>[8 bank 2]; let x = a[5];");
    let main = root(&netlist);
    assert_eq!(netlist.memories["a"], vec!["a_b0", "a_b1", "a_b2", "a_b3"]);
    for bank in &netlist.memories["a"] {
        assert_eq!(
            main.cell(bank).unwrap().prototype.to_string(),
            "seq_mem_d1(32, 2, 1)"
        );
    }
    let read = main.group("read0").unwrap();
    let lines: Vec<String> = read.assignments.iter().map(|a| a.to_string()).collect();
    assert!(lines.contains(&"a_b2.read_en = %0 ? 1'd1;".to_string()));
    assert!(lines.contains(&"x.in = %1 ? a_b2.read_data;".to_string()));
}

#[test]
fn mixed_fractional_widths_are_rejected() {
    let err = compile(
        "decl f: fix<16, 8>; decl g: fix<16, 4>; let h = f + g;",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }));
    assert_eq!(err.statement(), Some("let h = f + g;"));
}

#[test]
fn writes_to_rotated_arrays_are_rejected() {
    let err = compile(
        "decl a: ubit<32>[4 bank 2]; a[0] := 1; advance a;",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::RewriteCapability { .. }));
}

#[test]
fn conditionals_use_comb_groups() {
    let netlist = compile_default(
        "decl a: ubit<32>[4];
         let x: ubit<32> = 3;
         if (x < 4) { a[0] := x; } else { a[1] := 0; }",
    );
    let main = root(&netlist);
    assert_eq!(shape(&main.control), "seq[let0, if[write0][write1]]");
    let cond = main.group("cond0").unwrap();
    assert!(!cond.is_static());
    assert!(netlist.to_string().contains("if lt0.out with cond0 {"));
}

#[test]
fn configuration_controls_output() {
    let config = CompilerConfig::from_toml_str(
        r#"
        top_name = "kernel"
        emit_metadata = false
        "#,
    )
    .unwrap();
    let netlist = compile("let x = 0;", &config).unwrap();
    assert!(netlist.component("kernel").is_some());
    assert!(netlist.metadata.is_empty());
    assert!(!netlist.to_string().contains("metadata"));
    assert!(netlist.to_string().contains("@pos(1) let0;"));
}

#[test]
fn json_output_is_structured() {
    let netlist = compile_default("decl a: ubit<32>[2]; let v = a[1];");
    let json: serde_json::Value = serde_json::from_str(&netlist.to_json().unwrap()).unwrap();
    assert_eq!(json["components"][0]["name"], "main");
    assert_eq!(json["metadata"]["2"], "let v = a[1];");
}

#[test]
fn frontend_errors_propagate() {
    assert!(matches!(
        compile("let = 3;", &CompilerConfig::default()),
        Err(CompileError::ParseError { .. })
    ));
    assert!(matches!(
        compile("let x = 3 $ 4;", &CompilerConfig::default()),
        Err(CompileError::LexerError { .. })
    ));
}
