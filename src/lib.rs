//! This is the compiler as a library.  See `src/bin` directory for the
//! executable programs using this library.

pub mod back;
pub mod common;
pub mod front;
pub mod middle;

use derive_more::{Display, From};

/// Any error the compilation pipeline can report to the user.
#[derive(Debug, Display, From)]
pub enum CompileError {
    Parse(front::ParseError),
    Lower(front::LowerError),
}

/// Compile Sy source text down to RV64 assembly.
pub fn compile(source: &str) -> Result<String, CompileError> {
    let ast = front::parse(source)?;
    let module = front::lower(&ast)?;
    Ok(back::code_gen(&module))
}
