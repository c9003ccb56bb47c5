use clap::Parser;
use termbridge::config::{self, Cli, Command};
use termbridge::error::{ApiError, BridgeResult, ErrorCode};
use termbridge::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Config(args) => print_config(args)?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> BridgeResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    server::serve(config).await
}

fn print_config(args: config::ServeArgs) -> BridgeResult<()> {
    let mut config = config::Config::load(&args)?;
    if !config.auth.jwt_secret.is_empty() {
        config.auth.jwt_secret = "<redacted>".to_string();
    }
    let rendered = toml::to_string_pretty(&config).map_err(|err| {
        ApiError::new(ErrorCode::InvalidArgument, "Failed to render config")
            .with_details(err.to_string())
    })?;
    print!("{rendered}");
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
