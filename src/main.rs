//! The mds-converge CLI.

mod app;
mod cli;

use std::io::Write;

use structopt::StructOpt;

use crate::cli::{MdsConverge, EXIT_CONTROL_PLANE};

#[tokio::main]
async fn main() {
    let code = match MdsConverge::from_args().run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:?}", err);
            EXIT_CONTROL_PLANE
        }
    };

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    std::process::exit(code);
}
