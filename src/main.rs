use clap::Parser;
use fastsearch::cli::Cli;
use fastsearch::config::Config;
use fastsearch::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    logging::init(config.daemon.log_level);

    fastsearch::cli::run(cli, config).await
}
