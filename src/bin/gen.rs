//! Decoder generator: renders an instruction table into Rust classifier source.

use calvados::codegen::{emit, Style};
use calvados::insn_set::InsnSet;
use calvados::partition::partition_insn_set;
use clap::{Parser, ValueEnum};
use std::error::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum EmitStyle {
    /// One mask test per encoding, in decode order.
    Flat,
    /// Decision-tree routing before the leaf mask tests.
    Partitioned,
}

/// Generate decoder source code from an instruction-set table.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Classifier shape to emit.
    #[arg(long, value_enum, default_value_t = EmitStyle::Partitioned)]
    style: EmitStyle,

    /// Print the partition decision tree to stdout.
    #[arg(long)]
    dump_partition: bool,

    /// Instruction table XML ("builtin" for the embedded Thumb-2 table).
    table: String,

    /// Output source file.
    output: String,
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let set = if args.table == "builtin" {
        InsnSet::builtin()
    } else {
        InsnSet::load_file(&args.table)?
    };
    if args.dump_partition {
        print!("{}", partition_insn_set(&set)?.dump());
    }
    let style = match args.style {
        EmitStyle::Flat => Style::Flat,
        EmitStyle::Partitioned => Style::Partitioned,
    };
    std::fs::write(&args.output, emit(&set, style)?)?;
    eprintln!("wrote {} ({} encodings)", args.output, set.len());
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
