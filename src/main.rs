//! Balance processor CLI
//!
//! Reads credit, debit and transfer operations from a CSV file, applies them
//! through the worker pool and prints the final balances to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- operations.csv > balances.csv
//! cargo run -- --workers 8 --queue-size 5000 operations.csv > balances.csv
//! cargo run -- --batch-size 100 --flush-interval-ms 50 operations.csv > balances.csv
//! cargo run -- --chunk-size 1 --log-level debug operations.csv > balances.csv
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (missing arguments, file not found, runtime failure, etc.)

use std::process;

use balance_processor::{cli, logging, pipeline};

fn main() {
    let args = cli::parse_args();

    if let Err(e) = logging::init(&args.log_level, args.log_json) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let config = args.to_pipeline_config();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    let mut output = std::io::stdout();
    let result = runtime.block_on(pipeline::run(&args.input_file, &config, &mut output));

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
