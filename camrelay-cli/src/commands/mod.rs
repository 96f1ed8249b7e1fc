//! CLI command implementations

mod config;
mod openers;
mod run;

pub use config::{load_config, print_config};
pub use openers::list_openers;
pub use run::run;
