//! Viralize CLI: command-line interface for composing and exporting reels.
//!
//! Usage:
//!   viralize render <INPUT> --caption <TEXT>   Export a reel MP4
//!   viralize preview [INPUT]                   Snapshot the live preview to PNG
//!   viralize info <INPUT>                      Show source information
//!   viralize profile <show|set|clear>          Manage the saved header profile
//!   viralize headline <prompt|parse>           Caption suggestion helpers
//!   viralize check                             Check system capabilities
//!   viralize selftest                          Run the pipeline on synthetic media

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use viralize_common::AppConfig;

mod commands;

use commands::{FramingArgs, IdentityArgs};

#[derive(Parser)]
#[command(
    name = "viralize",
    about = "Turn a video into a vertical reel with a social-post header",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/viralize/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a reel from a source video
    Render {
        /// Source video
        input: PathBuf,

        /// Caption drawn under the header
        #[arg(short, long)]
        caption: String,

        /// Output resolution: 720p or 1080p
        #[arg(short, long)]
        resolution: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        framing: FramingArgs,
    },

    /// Run the preview loop briefly and save its last frame
    Preview {
        /// Source video (a synthetic pattern when omitted)
        input: Option<PathBuf>,

        /// Caption drawn under the header
        #[arg(short, long)]
        caption: Option<String>,

        /// How long to run the preview
        #[arg(long, default_value = "1.0")]
        seconds: f64,

        /// PNG file to write
        #[arg(short, long, default_value = "preview.png")]
        output: PathBuf,

        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        framing: FramingArgs,
    },

    /// Show source video information
    Info {
        /// Source video
        input: PathBuf,
    },

    /// Manage the saved header profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Caption suggestion helpers
    Headline {
        #[command(subcommand)]
        action: HeadlineAction,
    },

    /// Check system capabilities
    Check,

    /// Export synthetic media end to end
    Selftest {
        /// Synthetic source length
        #[arg(long, default_value = "3.0")]
        seconds: f64,

        /// Output resolution: 720p or 1080p
        #[arg(short, long, default_value = "720p")]
        resolution: String,

        /// Keep the result in this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ProfileAction {
    /// Print the saved profile
    Show,

    /// Update fields of the saved profile
    Set {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        handle: Option<String>,

        /// Avatar image path
        #[arg(long)]
        avatar: Option<PathBuf>,
    },

    /// Forget the saved profile
    Clear,
}

#[derive(Subcommand)]
pub enum HeadlineAction {
    /// Print the prompt sent to the text-generation service
    Prompt {
        /// Extra context about the video
        #[arg(long)]
        context: Option<String>,
    },

    /// Parse a service response ("-" reads stdin)
    Parse {
        file: PathBuf,

        /// Print the headlines as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    viralize_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Render {
            input,
            caption,
            resolution,
            output,
            identity,
            framing,
        } => {
            commands::render::run(&config, input, caption, resolution, output, &identity, &framing)
                .await
        }
        Commands::Preview {
            input,
            caption,
            seconds,
            output,
            identity,
            framing,
        } => {
            commands::preview::run(&config, input, caption, seconds, output, &identity, &framing)
                .await
        }
        Commands::Info { input } => commands::info::run(&config, input),
        Commands::Profile { action } => commands::profile::run(&config, action),
        Commands::Headline { action } => commands::headline::run(action),
        Commands::Check => commands::check::run(&config),
        Commands::Selftest {
            seconds,
            resolution,
            output,
        } => commands::selftest::run(&config, seconds, resolution, output).await,
    }
}
