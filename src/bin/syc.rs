//! the main compiler binary. takes a Sy source file and prints (or writes
//! with `-o`) the requested compilation artifact, assembly by default.
//!
//! run with `--help` for more info.

use std::process::exit;

use sy::front::*;

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// the output format
    #[arg(value_enum, long, default_value_t = Output::Asm)]
    out: Output,
    /// write the output to this file instead of stdout
    #[arg(short, long)]
    output: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the ast data structure
    Ast,
    /// the AtomIR module
    Ir,
    /// the resulting assembly code
    Asm,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    exit(1);
}

fn main() {
    use Output::*;
    pretty_env_logger::init();
    let args = Args::parse();

    let input = match std::fs::read_to_string(&args.file) {
        Ok(input) => input,
        Err(e) => fail(format!("{}: {e}", args.file)),
    };

    let text = match args.out {
        Tokens => {
            let mut lexer = lex::Lexer::new(&input);
            let mut out = String::new();
            loop {
                match lexer.next() {
                    Ok(Some(token)) => out.push_str(&format!("{token}\n")),
                    Ok(None) => break,
                    Err(e) => fail(e),
                }
            }
            out
        }
        Ast => match parse(&input) {
            Ok(ast) => format!("{ast:#?}\n"),
            Err(e) => fail(e),
        },
        Ir => {
            let ast = match parse(&input) {
                Ok(ast) => ast,
                Err(e) => fail(e),
            };
            match lower(&ast) {
                Ok(module) => format!("{module}"),
                Err(e) => fail(e),
            }
        }
        Asm => match sy::compile(&input) {
            Ok(asm) => asm,
            Err(e) => fail(e),
        },
    };

    match &args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                fail(format!("{path}: {e}"));
            }
        }
        None => print!("{text}"),
    }
}
