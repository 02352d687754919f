mod cli;
mod config;
mod db;
mod error;
mod hash;

use cli::Cli;
use log::error;

fn main() {
    // Log level comes from config.toml ([logging] hoard = "...") or
    // HOARD_LOGGING__HOARD, one of: error, warn, info, debug, trace
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
