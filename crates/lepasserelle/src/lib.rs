// lepasserelle - Gateway
//
// *La Passerelle* (The Bridge) - Command line, configuration, and HTTP source for LeRelais

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

//! Entry points wiring the job controller, the phased workflow, the SQLite
//! store and the HTTP source together.

/// Command-line interface.
pub mod cli;
/// `.lerelais/config.toml` loading and saving.
pub mod config;
/// Blocking HTTP fetcher.
pub mod http;

pub use cli::{block_on_with_grace, prepare_run, Cli, Commands, RunArgs, RunPlan, SHUTDOWN_GRACE};
pub use config::{RelaisConfig, DEFAULT_CONFIG_FILE};
pub use http::{render_url, HttpFetcher};
