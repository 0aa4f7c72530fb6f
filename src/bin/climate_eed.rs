use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use climate_eed::app::{App, ArchiveRequest, FetchSummary, ProgressSink};
use climate_eed::archive::{ArchiveLocation, FtpArchive};
use climate_eed::catalog::StacHttpClient;
use climate_eed::cds::CdsHttpClient;
use climate_eed::config::{Config, ConfigLoader};
use climate_eed::domain::{OutputFormat, ReturnFormat};
use climate_eed::error::ClimateError;
use climate_eed::normalize::{
    BboxInput, CollectionsInput, QueryInput, RawRequest, RequestNormalizer, parse_collections,
};
use climate_eed::opener::DocumentOpener;
use climate_eed::output::{JsonOutput, OutputMode, StderrProgress};
use climate_eed::store::Store;

type CliApp = App<StacHttpClient, DocumentOpener, FtpArchive>;

#[derive(Parser)]
#[command(name = "climate-eed")]
#[command(about = "Fetch and merge climate variables from catalog, archive and data-store repositories")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// JSON config file (defaults to ./climate-eed.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a variable and merge it across catalog items")]
    Fetch(FetchArgs),
    #[command(about = "List variables available in a repository")]
    Vars(VarsArgs),
    #[command(about = "List configured repositories")]
    Repos,
    #[command(about = "Fetch seasonal forecast files from the archive feed")]
    Archive(ArchiveArgs),
    #[command(about = "Retrieve a dataset from the climate data store")]
    Retrieve(RetrieveArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    varname: Option<String>,

    #[arg(long)]
    factor: Option<f64>,

    /// min_lon,min_lat,max_lon,max_lat
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<String>,

    /// dd-mm-yyyy
    #[arg(long)]
    start_date: Option<String>,

    /// dd-mm-yyyy
    #[arg(long)]
    end_date: Option<String>,

    #[arg(long)]
    repository: Option<String>,

    #[arg(long)]
    collections: Option<String>,

    /// JSON object or key=value pairs
    #[arg(long)]
    query: Option<String>,

    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    #[arg(long)]
    basin_id: Option<String>,

    #[arg(long, value_enum)]
    return_format: Option<ReturnFormat>,

    /// .csv, .json or .nc
    #[arg(long)]
    out: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct VarsArgs {
    #[arg(long)]
    repository: Option<String>,

    #[arg(long)]
    collections: Option<String>,
}

#[derive(Args)]
struct ArchiveArgs {
    #[arg(long)]
    site: String,

    #[arg(long)]
    category: Option<String>,

    /// Issue folder, e.g. 202404
    #[arg(long)]
    issue_date: String,

    #[arg(long)]
    varname: Option<String>,

    #[arg(long, default_value_t = 1.0)]
    factor: f64,

    #[arg(long)]
    basin_id: Option<String>,

    #[arg(long)]
    out: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct RetrieveArgs {
    #[arg(long)]
    dataset: String,

    /// Request body as JSON
    #[arg(long)]
    request: String,

    #[arg(long)]
    out: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ClimateError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ClimateError) -> u8 {
    match error {
        ClimateError::InvalidBbox(_)
        | ClimateError::InvalidDate(_)
        | ClimateError::InvalidQuery(_)
        | ClimateError::UnknownRepository(_)
        | ClimateError::InvalidOutputFormat(_)
        | ClimateError::Selection(_)
        | ClimateError::MissingCredentials(_) => 2,
        ClimateError::CatalogHttp(_)
        | ClimateError::CatalogStatus { .. }
        | ClimateError::ResourceHttp(_)
        | ClimateError::ResourceStatus { .. }
        | ClimateError::Archive(_)
        | ClimateError::CdsHttp(_)
        | ClimateError::CdsStatus { .. } => 3,
        ClimateError::EmptyResult => 4,
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
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = match &config.cache_dir {
        Some(dir) => Store::new_with_root(
            Utf8PathBuf::from_path_buf(dir.clone())
                .map_err(|_| ClimateError::Filesystem("cache_dir is not UTF-8".to_string()))?,
        ),
        None => Store::new()?,
    };
    let app = build_app(config, store)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &StderrProgress,
        OutputMode::NonInteractive => &JsonOutput,
    };

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &app, sink, output_mode),
        Commands::Vars(args) => run_vars(args, &app, sink, output_mode),
        Commands::Repos => run_repos(&app, output_mode),
        Commands::Archive(args) => run_archive(args, &app, sink, output_mode),
        Commands::Retrieve(args) => run_retrieve(args, &app, sink, output_mode),
    }
}

fn build_app(config: Config, store: Store) -> miette::Result<CliApp> {
    let catalog = StacHttpClient::new()?;
    let opener = DocumentOpener::new()?;
    let archive = FtpArchive::new(config.archive.clone());
    Ok(App::new(config, store, catalog, opener, archive))
}

fn run_fetch(
    args: FetchArgs,
    app: &CliApp,
    sink: &dyn ProgressSink,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut raw = RawRequest::from_config(app.config());
    if let Some(varname) = args.varname {
        raw.variable = varname;
    }
    if let Some(factor) = args.factor {
        raw.factor = factor;
    }
    if let Some(bbox) = args.bbox {
        raw.bbox = BboxInput::Text(bbox);
    }
    if let Some(start) = args.start_date {
        raw.start_date = start;
    }
    if let Some(end) = args.end_date {
        raw.end_date = end;
    }
    if let Some(repository) = args.repository {
        raw.repository = repository;
    }
    if let Some(collections) = args.collections {
        raw.collections = CollectionsInput::Text(collections);
    }
    if let Some(query) = args.query {
        raw.query = QueryInput::Text(query);
    }
    if let Some(return_format) = args.return_format {
        raw.return_format = return_format;
    }
    raw.models = args.models;
    raw.basin_id = args.basin_id;
    raw.output = args.out;

    if raw.variable.trim().is_empty() {
        return Err(ClimateError::InvalidQuery("--varname is required".to_string()).into());
    }
    let request = RequestNormalizer::new(app.config()).normalize(raw)?;
    let result = app.fetch(&request, sink)?;
    print_summary(&result.summary, output_mode)
}

fn run_vars(
    args: VarsArgs,
    app: &CliApp,
    sink: &dyn ProgressSink,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let defaults = &app.config().defaults;
    let repository = RequestNormalizer::new(app.config())
        .parse_repository(args.repository.as_deref().unwrap_or(&defaults.repository))?;
    let collections = parse_collections(&CollectionsInput::Text(
        args.collections.unwrap_or_else(|| defaults.collections.clone()),
    ));
    let result = app.list_variables(&repository, &collections, sink)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_variables(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("Variables in {} ({}):", result.repository, result.collections.join(", "));
            for variable in &result.variables {
                println!("  {variable}");
            }
            Ok(())
        }
    }
}

fn run_repos(app: &CliApp, output_mode: OutputMode) -> miette::Result<()> {
    let result = app.list_repositories();
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_repositories(&result).into_diagnostic(),
        OutputMode::Interactive => {
            for entry in &result.repositories {
                let marker = if entry.seasonal_forecast {
                    " (seasonal forecast)"
                } else {
                    ""
                };
                println!("{}\t{}{marker}", entry.name, entry.endpoint);
            }
            Ok(())
        }
    }
}

fn run_archive(
    args: ArchiveArgs,
    app: &CliApp,
    sink: &dyn ProgressSink,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let output = args
        .out
        .map(|path| OutputFormat::from_path(&path).map(|format| (path, format)))
        .transpose()?;
    let request = ArchiveRequest {
        location: ArchiveLocation {
            site: args.site,
            category: args
                .category
                .unwrap_or_else(|| app.config().archive.category.clone()),
            issue_date: args.issue_date,
        },
        variable: args.varname.unwrap_or_default(),
        factor: args.factor,
        basin_id: args.basin_id,
        return_format: ReturnFormat::Grid,
        output,
    };
    let result = app.fetch_archive(&request, sink)?;
    print_summary(&result.summary, output_mode)
}

fn run_retrieve(
    args: RetrieveArgs,
    app: &CliApp,
    sink: &dyn ProgressSink,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let request: serde_json::Value = serde_json::from_str(&args.request)
        .map_err(|err| ClimateError::InvalidQuery(format!("--request: {err}")))?;
    let client = CdsHttpClient::new(&app.config().cds)?;
    let result = app.retrieve(&client, &args.dataset, &request, args.out, sink)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_retrieve(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("{} -> {} ({} bytes)", result.dataset, result.path, result.bytes);
            Ok(())
        }
    }
}

fn print_summary(summary: &FetchSummary, output_mode: OutputMode) -> miette::Result<()> {
    if matches!(output_mode, OutputMode::NonInteractive) {
        return JsonOutput::print_fetch(summary).into_diagnostic();
    }

    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}climate-eed: {} from {} ({}){reset}", summary.variable, summary.source, summary.strategy);
    println!(
        "{green}fetched {} of {} items; dims {:?} shape {:?}{reset}",
        summary.fetched, summary.tasks, summary.dims, summary.shape
    );
    if !summary.missing.is_empty() {
        println!("{yellow}no asset: {}{reset}", summary.missing.join(", "));
    }
    for failure in &summary.failures {
        println!("{yellow}failed {}: {}{reset}", failure.item_id, failure.cause);
    }
    if let Some(path) = &summary.output_path {
        println!("{green}wrote {path}{reset}");
    }
    Ok(())
}
