//! Example: Element-wise Copy
//!
//! Demonstrates compiling a loop that copies one external memory into
//! another, and shows the timing of the generated groups.
//!
//! Run with: cargo run --example copy

use accelc::{compile, CompilerConfig};

fn main() {
    println!("=== Element-wise Copy Example ===\n");

    let source = "
        decl src: ubit<32>[8];
        decl dest: ubit<32>[8];
        for (let i = 0..8) {
            let v = src[i];
            dest[i] := v;
        }
    ";
    println!("Source:{}", source);

    let config = CompilerConfig::default();
    let netlist = compile(source, &config).unwrap();

    let main = netlist.component(&config.top_name).unwrap();
    println!("Cells: {}", main.cells.len());
    for group in &main.groups {
        match group.latency {
            Some(cycles) => println!("  {:<8} {} cycle(s)", group.name, cycles),
            None => println!("  {:<8} combinational", group.name),
        }
    }
    println!("Schedule: {:?}\n", main.control.enables());

    println!("Generated IR:");
    println!("{}", netlist);
}
