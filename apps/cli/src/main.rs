mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Before parsing, so dotenv values feed clap's `env` arguments too.
    let env_file = trendradar_shared::load_env_file();

    let cli = Cli::parse();
    commands::init_tracing(&cli);
    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "loaded env file");
    }

    commands::run(cli).await
}
