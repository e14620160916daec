use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use view_ledger_api::{
    parse_timestamp, CategoryDirectory, HttpCategoryDirectory, UncheckedDirectory, ViewRequest,
    ViewsApi,
};
use view_ledger_core::SystemClock;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

type CliApi = ViewsApi<SystemClock, Box<dyn CategoryDirectory>>;

#[derive(Debug, Parser)]
#[command(name = "vl")]
#[command(about = "View Ledger CLI")]
struct Cli {
    #[arg(long, env = "VIEW_LEDGER_DB", default_value = "./view_ledger.sqlite3")]
    db: PathBuf,

    /// Base URL of the category service. Categories are not checked when unset.
    #[arg(long, env = "VIEW_LEDGER_CATEGORIES_URL")]
    categories_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    View {
        #[command(subcommand)]
        command: ViewCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ViewCommand {
    Create(ViewWriteArgs),
    Update(ViewUpdateArgs),
    Delete(ViewKeyArgs),
    Get(ViewKeyArgs),
    List(ViewListArgs),
    History(ViewKeyArgs),
    At(ViewAtArgs),
}

#[derive(Debug, Args)]
struct ViewWriteArgs {
    #[arg(long)]
    name: String,
    /// Category key; repeat for several categories.
    #[arg(long = "category", required = true)]
    categories: Vec<String>,
}

#[derive(Debug, Args)]
struct ViewUpdateArgs {
    key: String,
    #[command(flatten)]
    view: ViewWriteArgs,
}

#[derive(Debug, Args)]
struct ViewKeyArgs {
    key: String,
}

#[derive(Debug, Args)]
struct ViewListArgs {
    /// Case-insensitive name fragment.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct ViewAtArgs {
    key: String,
    /// RFC3339 instant to read the view at.
    #[arg(long)]
    created_at: String,
}

impl ViewWriteArgs {
    fn into_request(self) -> ViewRequest {
        ViewRequest { name: self.name, categories: self.categories }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn build_api(cli: &Cli) -> CliApi {
    let directory: Box<dyn CategoryDirectory> = match &cli.categories_url {
        Some(url) if !url.trim().is_empty() => Box::new(HttpCategoryDirectory::new(url.clone())),
        _ => Box::new(UncheckedDirectory),
    };
    ViewsApi::with_parts(cli.db.clone(), SystemClock, directory)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = build_api(&cli);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::View { command } => run_view(command, &api),
    }
}

fn run_db(command: DbCommand, api: &CliApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(&serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(&api.migrate(args.dry_run)?),
    }
}

fn run_view(command: ViewCommand, api: &CliApi) -> Result<()> {
    match command {
        ViewCommand::Create(args) => emit_json(&api.create(&args.into_request())?),
        ViewCommand::Update(args) => emit_json(&api.update(&args.key, &args.view.into_request())?),
        ViewCommand::Delete(args) => emit_json(&api.delete(&args.key)?),
        ViewCommand::Get(args) => emit_json(&api.get(&args.key)?),
        ViewCommand::List(args) => emit_json(&api.list(args.name.as_deref())?),
        ViewCommand::History(args) => emit_json(&api.history(&args.key)?),
        ViewCommand::At(args) => {
            let created_at = parse_timestamp(&args.created_at)?;
            emit_json(&api.revision_at(&args.key, created_at)?)
        }
    }
}
