use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use pdr_update_prep::config::ConfigLoader;
use pdr_update_prep::distrib::DistribHttpClient;
use pdr_update_prep::domain::VersionSource;
use pdr_update_prep::error::PrepError;
use pdr_update_prep::output::{
    ExistsResult, HeadBagResult, JsonOutput, LatestVersionResult, MultibagResult, PrepareResult,
};
use pdr_update_prep::prepper::{UpdatePrepService, UpdatePrepper};
use pdr_update_prep::rmm::MetadataHttpClient;

#[derive(Parser)]
#[command(name = "pdr-prepupd")]
#[command(about = "Prepare working metadata bags for new versions of preserved datasets")]
#[command(version, author)]
struct Cli {
    /// JSON config file (default: ./prepupd.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Report the latest known version of a dataset")]
    LatestVersion(LatestVersionArgs),
    #[command(about = "Ensure the dataset's head bag is in the local cache")]
    CacheHeadbag(SessionArgs),
    #[command(about = "Create a working metadata bag for the next version")]
    Prepare(DestArgs),
    #[command(about = "Copy multibag info from the latest head bag into a bag")]
    Multibag(DestArgs),
    #[command(about = "Check whether the dataset has been published")]
    Exists(ExistsArgs),
}

#[derive(Args)]
struct SessionArgs {
    aipid: String,

    /// version to build from (default: latest)
    #[arg(long)]
    version: Option<String>,

    /// identifier the dataset was previously published under
    #[arg(long)]
    replaces: Option<String>,
}

#[derive(Args)]
struct DestArgs {
    #[command(flatten)]
    session: SessionArgs,

    dest: Utf8PathBuf,
}

#[derive(Args)]
struct LatestVersionArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// where to look, in order
    #[arg(long = "source", value_enum, default_values_t = [VersionSource::Repo])]
    sources: Vec<VersionSource>,
}

#[derive(Args)]
struct ExistsArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// also count a record published under the predecessor identifier
    #[arg(long)]
    deep: bool,
}

type HttpPrepper = UpdatePrepper<DistribHttpClient, MetadataHttpClient>;

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PrepError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PrepError) -> u8 {
    match error {
        PrepError::Config(_)
        | PrepError::ConfigRead(_)
        | PrepError::ConfigParse(_)
        | PrepError::InvalidAipId(_)
        | PrepError::UnknownVersionSource(_) => 2,
        PrepError::DistribHttp(_)
        | PrepError::DistribStatus { .. }
        | PrepError::MetadataHttp(_)
        | PrepError::MetadataStatus { .. } => 3,
        PrepError::CorruptedBag { .. } | PrepError::UnsupportedChecksum { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let service = UpdatePrepService::from_config(config)?;

    match cli.command {
        Commands::LatestVersion(args) => {
            let prepper = open_session(&service, &args.session)?;
            let version = prepper.latest_version(&args.sources)?;
            JsonOutput::print_latest_version(&LatestVersionResult {
                aipid: prepper.aipid().to_string(),
                sources: args.sources,
                version,
            })
            .into_diagnostic()
        }
        Commands::CacheHeadbag(args) => {
            let prepper = open_session(&service, &args)?;
            let headbag = prepper.cache_headbag()?;
            JsonOutput::print_headbag(&HeadBagResult {
                aipid: prepper.aipid().to_string(),
                headbag,
            })
            .into_diagnostic()
        }
        Commands::Prepare(args) => {
            let prepper = open_session(&service, &args.session)?;
            let outcome = prepper.create_new_update(&args.dest)?;
            JsonOutput::print_prepare(&PrepareResult::new(prepper.aipid(), outcome))
                .into_diagnostic()
        }
        Commands::Multibag(args) => {
            let prepper = open_session(&service, &args.session)?;
            let updated = prepper.set_multibag_info(&args.dest)?;
            JsonOutput::print_multibag(&MultibagResult {
                aipid: prepper.aipid().to_string(),
                destination: args.dest,
                updated,
            })
            .into_diagnostic()
        }
        Commands::Exists(args) => {
            let prepper = open_session(&service, &args.session)?;
            let exists = prepper.aip_exists(args.deep)?;
            JsonOutput::print_exists(&ExistsResult {
                aipid: prepper.aipid().to_string(),
                deep: args.deep,
                exists,
            })
            .into_diagnostic()
        }
    }
}

fn open_session(
    service: &UpdatePrepService<DistribHttpClient, MetadataHttpClient>,
    args: &SessionArgs,
) -> Result<HttpPrepper, PrepError> {
    service.prepper_for(
        &args.aipid,
        args.version.as_deref(),
        args.replaces.as_deref(),
        None,
    )
}
