#![forbid(unsafe_code)]

use driftscan::cancel::{install_signal_handlers, CancellationToken};
use driftscan::cli;

fn main() {
    // Ctrl+C stops an active monitor wait first, then cancels
    let token = CancellationToken::new();
    if let Err(e) = install_signal_handlers(&token) {
        eprintln!("Warning: {:#}", e);
    }

    let code = cli::run(std::env::args_os(), &token);
    std::process::exit(code.as_i32());
}
