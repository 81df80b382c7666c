//! Example: Banked Reduction
//!
//! Demonstrates bank partitioning. `a` has a bank factor of 4, so it is
//! split into two physical memories of four elements each; the first loop
//! only touches the lower bank so its reads go straight to `a_b0`, while the
//! second loop spans both banks and reads through a multiplexer. A function
//! component doubles the lower bank through reference memories.
//!
//! Run with: cargo run --example banked_sum

use accelc::{compile, CompileError, CompilerConfig, OutputFormat};

fn main() {
    println!("=== Banked Reduction Example ===\n");

    let source = "
        decl a: ubit<32>[8 bank 4];
        decl out: ubit<32>[2];

        def double(m: ubit<32>[8 bank 4]) {
            for (let i = 0..4) {
                m[i] *= 2;
            }
        }

        double(a);
        let low: ubit<32> = 0;
        for (let i = 0..4) {
            low += a[i];
        }
        let all: ubit<32> = 0;
        for (let i = 0..8) {
            all += a[i];
        }
        out[0] := low;
        out[1] := all;
    ";

    let config = CompilerConfig::default();
    let netlist = compile(source, &config).unwrap();
    for component in &netlist.components {
        println!(
            "component {}: {} cells, {} groups",
            component.name,
            component.cells.len(),
            component.groups.len()
        );
    }
    println!();
    println!("{}", netlist);

    // The same netlist as JSON
    let json_config = CompilerConfig {
        format: OutputFormat::Json,
        emit_metadata: false,
        ..CompilerConfig::default()
    };
    let netlist = compile(source, &json_config).unwrap();
    println!("Physical banks of `a`: {:?}", netlist.memories["a"]);
    println!("JSON output: {} bytes\n", netlist.to_json().unwrap().len());

    // Writing through a bank that is only known at run time is rejected
    println!("Parallel write across banks:");
    let bad = "
        decl a: ubit<32>[8 bank 4];
        for (let i = 0..8) unroll 2 { a[i] := 0; }
    ";
    match compile(bad, &config) {
        Err(e @ CompileError::RewriteCapability { .. }) => println!("  rejected: {}", e),
        Err(e) => println!("  unexpected error: {}", e),
        Ok(_) => println!("  unexpectedly accepted"),
    }
}
