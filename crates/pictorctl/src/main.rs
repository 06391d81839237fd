//! Pictor command line.
//!
//! Loads images through the full request pipeline, with the same fetchers, decoder and memory
//! cache a long-running consumer would use, and reports what happened to every request.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

use pictor_service::logging;

mod cli;
mod load;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
