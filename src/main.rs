use clap::Parser;
use log::error;

use vecbench::Opts;
use vecbench::cli::SubCommandExtend;
use vecbench::config::SubCommand;

#[tokio::main]
async fn main() {
    env_logger::init();

    let opts = Opts::parse();
    let r = match &opts.subcmd {
        SubCommand::AnnBenchmark(config) => config.run(&opts).await,
        SubCommand::Inspect(config) => config.run(&opts).await,
        SubCommand::RandomVectors(config) => config.run(&opts).await,
    };

    if let Err(e) = r {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
