use gp_protocol::{ChainDescription, EngineConfig, UserProfile};
use std::collections::BTreeMap;

/// Everything loaded from `.geoproc/`.
///
/// ```rust,no_run
/// use gp_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!(
///     "{} users, {} named chains, {:?} queue",
///     config.users.len(),
///     config.chains.len(),
///     config.engine.queue.kind
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// `config.toml`, with relative paths resolved against the project root.
    pub engine: EngineConfig,

    /// `users/*.yaml`, keyed by user id.
    pub users: BTreeMap<String, UserProfile>,

    /// `chains/*.{yaml,json}`, keyed by file stem.
    pub chains: BTreeMap<String, ChainDescription>,
}
