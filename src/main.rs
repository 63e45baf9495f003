use anyhow::Result;
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use marketcache::core::log::init_logging;
use rust_decimal::Decimal;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for marketcache::AppCommand {
    fn from(cmd: Commands) -> marketcache::AppCommand {
        match cmd {
            Commands::Serve => marketcache::AppCommand::Serve,
            Commands::Refresh {
                prices,
                dividends,
                rate,
            } => marketcache::AppCommand::Refresh(marketcache::RefreshTargets {
                prices,
                dividends,
                rate,
            }),
            Commands::Valuation { owner } => marketcache::AppCommand::Valuation { owner },
            Commands::Evolution {
                owner,
                start,
                end,
                synthetic,
            } => marketcache::AppCommand::Evolution {
                owner,
                start,
                end,
                synthetic: match synthetic.as_slice() {
                    [from, to] => Some((*from, *to)),
                    _ => None,
                },
            },
            Commands::Status => marketcache::AppCommand::Status,
            Commands::Setup { .. } => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the example configuration and report where the cache will live
    Setup {
        /// Replace an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Run the background refresh loops until interrupted
    Serve,
    /// Refresh cached data once (everything unless a flag narrows it)
    Refresh {
        #[arg(long)]
        prices: bool,
        #[arg(long)]
        dividends: bool,
        #[arg(long)]
        rate: bool,
    },
    /// Display the current value of a portfolio
    Valuation {
        /// Owner id; all configured owners when omitted
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Display the value of a portfolio over time
    Evolution {
        #[arg(short, long)]
        owner: String,
        /// First date (YYYY-MM-DD); 30 days before the end by default
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last date (YYYY-MM-DD); today by default
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Interpolate between two values instead of fetching prices
        #[arg(long, num_args = 2, value_names = ["START_VALUE", "END_VALUE"])]
        synthetic: Vec<Decimal>,
    },
    /// Display the exchange rate and cache health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, matches!(cli.command, Some(Commands::Serve)));

    let result = match cli.command {
        Some(Commands::Setup { force }) => marketcache::cli::setup::setup(force),
        Some(cmd) => marketcache::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
