//! Accelerator Language Compiler
//!
//! Compiles loop-and-array accelerator programs with banked memories into a
//! timed hardware control IR: components of cells, statically scheduled
//! groups and a control tree.
//!
//! The pipeline is parse, type check, bank rewriting, then code generation.
//! Each pass either succeeds completely or stops the pipeline with a
//! `CompileError`.
//!
//! # Example
//!
//! ```rust
//! use accelc::{compile, CompilerConfig};
//!
//! let source = "
//!     decl src: ubit<32>[4];
//!     decl dest: ubit<32>[4];
//!     for (let i = 0..4) {
//!         let v = src[i];
//!         dest[i] := v;
//!     }
//! ";
//! let netlist = compile(source, &CompilerConfig::default()).unwrap();
//! println!("{}", netlist);
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod env;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod rewrite;
pub mod typecheck;

use log::debug;

pub use ast::*;
pub use codegen::CodeGenerator;
pub use config::{CompilerConfig, OutputFormat};
pub use error::{CompileError, CompileResult};
pub use ir::Netlist;
pub use parser::Parser;
pub use rewrite::{RewrittenProg, Rewriter};
pub use typecheck::TypeChecker;

/// Compile source text into a netlist
pub fn compile(source: &str, config: &CompilerConfig) -> CompileResult<Netlist> {
    let prog = Parser::new(source).parse_program()?;
    debug!(
        "parsed {} declaration(s) and {} function(s)",
        prog.decls.len(),
        prog.defs.len()
    );
    compile_program(&prog, config)
}

/// Compile an already constructed program
pub fn compile_program(prog: &Prog, config: &CompilerConfig) -> CompileResult<Netlist> {
    let sources = SourceMap::from_prog(prog);

    let typed = TypeChecker::new().check(prog)?;
    let rewritten = Rewriter::new(&sources).rewrite(&typed)?;
    let netlist = CodeGenerator::new(config, &sources).generate(&rewritten)?;

    debug!(
        "compiled {} component(s) with {} annotated statement(s)",
        netlist.components.len(),
        netlist.metadata.len()
    );
    Ok(netlist)
}

/// Parse and type check only
pub fn check(source: &str) -> CompileResult<TypedProg> {
    let prog = Parser::new(source).parse_program()?;
    TypeChecker::new().check(&prog)
}
