use std::process::ExitCode;

use clap::Parser;
use maskfe::cli::{self, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    maskfe::logger::init(args.verbose);
    maskfe::log_info!("MaskFE {} starting", env!("CARGO_PKG_VERSION"));
    cli::run(args)
}
