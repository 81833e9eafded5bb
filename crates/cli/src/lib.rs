#![allow(clippy::needless_return)]

mod args;
mod config;
mod generate;

pub use args::{DefaultCommandLineArgs, GenerateArgs, SubCommands, ValidateArgs};
pub use config::{
  AclEntry, ColumnMappings, ConfigError, DatabaseConfig, QueryConfig, RealmConfig,
  ResourceEntry, ResourceTypeConfig, SyncConfig,
};
pub use generate::{GenerateError, ManifestGenerator};
