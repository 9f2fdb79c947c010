mod cli;

use clap::Parser;
use cli::Cli;
use tether_core::metrics;
use tether_core::telemetry::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.log_config()) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(2);
    }

    let print_metrics = cli.metrics;
    let outcome = cli::run(cli).await;
    if print_metrics {
        print!("{}", metrics::render());
    }
    if let Err(err) = outcome {
        eprintln!("tether: {err:#}");
        std::process::exit(1);
    }
}
