use clap::{Args, Parser, Subcommand};

/// Command line arguments for the manifest sync tool.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Generate realm manifests from external databases", long_about = None)]
pub struct DefaultCommandLineArgs {
  #[command(subcommand)]
  pub cmd: SubCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommands {
  /// Generate a manifest.json from a config and database sources.
  Generate(GenerateArgs),
  /// Validate a configuration file without connecting to a database.
  Validate(ValidateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct GenerateArgs {
  /// Path to the YAML configuration file.
  #[arg(short, long, env = "RGATE_CONFIG")]
  pub config: std::path::PathBuf,

  /// Output manifest file path.
  #[arg(short, long, default_value = "manifest.json")]
  pub output: std::path::PathBuf,

  /// Print the manifest to stdout instead of a file.
  #[arg(long)]
  pub stdout: bool,

  /// JSON indentation level, 0 for compact output.
  #[arg(long, default_value_t = 2)]
  pub indent: usize,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
  /// Path to the YAML configuration file.
  #[arg(short, long, env = "RGATE_CONFIG")]
  pub config: std::path::PathBuf,
}
