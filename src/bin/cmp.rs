//! Trace comparison tool: walks two trace files in lock-step and reports the
//! first instruction whose effects diverge.

use calvados::trace::compare::{CompareError, TraceComparator};
use calvados::trace::reader::TraceReader;
use clap::Parser;

/// Compare two trace files; where they differ, show the instruction and
/// deviation details.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// First trace for comparison.
    trace1: String,

    /// Second trace for comparison.
    trace2: String,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let open = |path: &str| match TraceReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", path, e);
            std::process::exit(2);
        }
    };
    let trace1 = open(&args.trace1);
    let trace2 = open(&args.trace2);

    let comparator = match TraceComparator::new(trace1, trace2) {
        Ok(comparator) => comparator,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };
    match comparator.compare() {
        Ok(visited) => {
            println!("Traces are identical across {} aligned tracepoints.", visited);
        }
        Err(CompareError::Divergence { .. }) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    }
}
