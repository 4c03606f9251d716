use clap::Parser;
use tracing::error;

fn main() {
    aimager::cache::capture_start_time();
    // Keeps date and tool output parseable regardless of the host locale.
    std::env::set_var("LANG", "C");
    aimager::logging::init();

    let cli = aimager::cli::Cli::parse();
    if let Err(e) = cli.run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
