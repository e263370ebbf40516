use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logsquash::cli::monitor::MonitorOptions;
use logsquash::monitor::DEFAULT_SHORT_NAME_REGEX;

#[derive(Parser)]
#[command(name = "logsquash", version)]
#[command(about = "Squash noisy IOC log streams into structured JSON summaries", long_about = None)]
struct Cli {
    /// Default tracing filter directive (overridden by RUST_LOG)
    #[arg(long, short = 'l', global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Squash log lines read from standard input
    Filter {
        /// Log buffering period in seconds
        #[arg(long, default_value_t = 10.0)]
        period: f64,
    },
    /// Tail a glob of log files and emit squashed JSON on stdout
    Monitor {
        /// Glob selecting the log files to tail
        file_glob: String,

        /// Regex whose `name` capture becomes the `ioc` output field
        #[arg(long, default_value = DEFAULT_SHORT_NAME_REGEX)]
        short_name_regex: String,

        /// Seconds between glob rescans
        #[arg(long, default_value_t = 1.0)]
        file_check_period: f64,

        /// Seconds between squash ticks
        #[arg(long, default_value_t = 10.0)]
        squash_period: f64,

        /// Seconds of inactivity before a file is closed
        #[arg(long, default_value_t = 30.0)]
        close_timeout: f64,

        /// Log aggregate statistics every N squashes
        #[arg(long, default_value_t = 10)]
        show_statistics_after: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the squashed JSON stream.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("logsquash={}", cli.log))
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Catch a malformed pattern table before tailing anything.
    logsquash::squash::patterns::validate()?;

    match cli.command {
        Commands::Filter { period } => {
            logsquash::cli::filter::run(period).await?;
        }
        Commands::Monitor {
            file_glob,
            short_name_regex,
            file_check_period,
            squash_period,
            close_timeout,
            show_statistics_after,
        } => {
            logsquash::cli::monitor::run(MonitorOptions {
                file_glob,
                short_name_regex,
                file_check_period,
                squash_period,
                close_timeout,
                show_statistics_after,
            })
            .await?;
        }
    }

    Ok(())
}
