mod sshtun;

use clap::{CommandFactory, Parser, error::ErrorKind};

#[derive(Debug, Parser)]
#[command(
    name = "sshtun",
    version,
    about = "sshtun - forward or reverse TCP tunnels over SSH"
)]
struct Cli {
    #[command(flatten)]
    args: sshtun::config::CliArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match sshtun::config::load(&cli.args) {
        Ok(cfg) => cfg,
        Err(err) => match err.downcast_ref::<sshtun::config::ConfigError>() {
            Some(cerr) => {
                let kind = match cerr {
                    sshtun::config::ConfigError::Missing(_) => ErrorKind::MissingRequiredArgument,
                    sshtun::config::ConfigError::Invalid { .. } => ErrorKind::ValueValidation,
                };
                Cli::command().error(kind, cerr).exit()
            }
            None => return Err(err),
        },
    };
    sshtun::run(cfg).await
}
