#![allow(clippy::needless_return)]

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::io::AsyncWriteExt;

use realmgate::manifest::Manifest;
use realmgate_cli::{
  DefaultCommandLineArgs, GenerateArgs, ManifestGenerator, SubCommands, SyncConfig, ValidateArgs,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logger() {
  env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("info"))
    .format_timestamp_micros()
    .init();
}

async fn generate(args: GenerateArgs) -> Result<(), BoxError> {
  eprintln!("Loading configuration from {:?}...", args.config);
  let config = SyncConfig::load(&args.config)?;

  eprintln!("Connecting to database...");
  let pool = PgPoolOptions::new()
    .connect_with(config.database.connect_options())
    .await?;

  eprintln!("Generating manifest...");
  let manifest = ManifestGenerator::new(&config, &pool).generate().await?;
  pool.close().await;

  let json = render_json(&manifest, args.indent)?;
  if args.stdout {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
  } else {
    tokio::fs::write(&args.output, &json).await?;
    eprintln!("Manifest written to {:?}", args.output);
  }
  return Ok(());
}

fn render_json(manifest: &Manifest, indent: usize) -> Result<String, BoxError> {
  if indent == 0 {
    return Ok(serde_json::to_string(manifest)?);
  }

  let indent = " ".repeat(indent);
  let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
  let mut buffer = Vec::new();
  let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);

  use serde::Serialize;
  manifest.serialize(&mut serializer)?;
  return Ok(String::from_utf8(buffer)?);
}

fn validate(args: ValidateArgs) -> Result<(), BoxError> {
  println!("Validating {:?}...", args.config);
  let config = SyncConfig::load(&args.config)?;

  println!("✓ Configuration is valid!");
  println!("  Realm: {}", config.realm.name);
  println!("  Actions: {}", config.actions.len());
  println!("  Resource Types: {}", config.resource_types.len());

  if let Some(ref kc) = config.realm.keycloak_config {
    println!("  Keycloak: {}", kc.server_url);
  }
  if config.roles.is_some() {
    println!("  Roles: query configured");
  }
  if config.principals.is_some() {
    println!("  Principals: query configured");
  }
  return Ok(());
}

async fn async_main() -> Result<(), BoxError> {
  let args = DefaultCommandLineArgs::parse();

  return match args.cmd {
    SubCommands::Generate(args) => generate(args).await,
    SubCommands::Validate(args) => validate(args),
  };
}

#[tokio::main]
async fn main() {
  init_logger();

  if let Err(err) = async_main().await {
    eprintln!("Error: {err}");
    std::process::exit(1);
  }
}
