//! Loader for the `.geoproc/` directory:
//!
//! ```text
//! .geoproc/
//! ├── config.toml       engine settings
//! ├── users/*.yaml      identities, quotas and permissions
//! └── chains/*.yaml     named process chains (or *.json)
//! ```
//!
//! Missing pieces fall back to defaults. Anything present but malformed is an
//! error naming the offending file.

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::AppConfig;
use gp_protocol::{ChainDescription, EngineConfig, StoreConfig, UserProfile};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CONFIG_DIR: &str = ".geoproc";

/// Load `.geoproc/` under `root`.
///
/// Relative paths in `config.toml` are resolved against `root`, so the
/// result does not depend on the process working directory.
pub async fn load_config(root: &Path) -> ConfigResult<AppConfig> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || load_blocking(&root))
        .await
        .map_err(|e| ConfigError::InvalidConfig {
            path: PathBuf::from(CONFIG_DIR),
            reason: format!("loader task failed: {e}"),
        })?
}

fn load_blocking(root: &Path) -> ConfigResult<AppConfig> {
    let config_dir = root.join(CONFIG_DIR);
    let mut config = AppConfig::default();

    if config_dir.exists() {
        config.engine = load_engine_config(&config_dir)?;
        config.users = load_users(&config_dir)?;
        config.chains = load_chains(&config_dir)?;
    }

    resolve_paths(&mut config.engine, root);
    Ok(config)
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

fn load_engine_config(config_dir: &Path) -> ConfigResult<EngineConfig> {
    let path = config_dir.join("config.toml");
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    toml::from_str(&read(&path)?).map_err(|source| ConfigError::TomlParse { path, source })
}

/// Regular files directly inside `dir` with one of `extensions`, sorted by
/// name. A missing directory yields nothing.
fn files_with_extension(dir: &Path, extensions: &[&str]) -> ConfigResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| ConfigError::DirectoryWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        let extension = entry.path().extension().and_then(|s| s.to_str());
        if entry.file_type().is_file() && extension.is_some_and(|ext| extensions.contains(&ext)) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn load_users(config_dir: &Path) -> ConfigResult<BTreeMap<String, UserProfile>> {
    let mut users = BTreeMap::new();
    for path in files_with_extension(&config_dir.join("users"), &["yaml", "yml"])? {
        let profile: UserProfile =
            serde_yaml::from_str(&read(&path)?).map_err(|source| ConfigError::YamlParse {
                path: path.clone(),
                source,
            })?;

        let user_id = profile.identity.user_id.clone();
        if users.insert(user_id.clone(), profile).is_some() {
            return Err(ConfigError::InvalidConfig {
                path,
                reason: format!("user '{user_id}' is defined more than once"),
            });
        }
    }
    Ok(users)
}

fn load_chains(config_dir: &Path) -> ConfigResult<BTreeMap<String, ChainDescription>> {
    let mut chains = BTreeMap::new();
    for path in files_with_extension(&config_dir.join("chains"), &["yaml", "yml", "json"])? {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let content = read(&path)?;

        let chain: ChainDescription = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|source| ConfigError::JsonParse {
                path: path.clone(),
                source,
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
                path: path.clone(),
                source,
            })?
        };

        if chains.insert(name.clone(), chain).is_some() {
            return Err(ConfigError::InvalidConfig {
                path,
                reason: format!("chain '{name}' is defined more than once"),
            });
        }
    }
    Ok(chains)
}

fn resolve_paths(engine: &mut EngineConfig, root: &Path) {
    let resolve = |path: &mut PathBuf| {
        if path.is_relative() {
            *path = root.join(&*path);
        }
    };

    resolve(&mut engine.workspace.database);
    if let Some(temp_dir) = engine.workspace.temp_dir.as_mut() {
        resolve(temp_dir);
    }
    if let Some(tool_path) = engine.workspace.tool_path.as_mut() {
        resolve(tool_path);
    }
    resolve(&mut engine.storage.root);
    if let StoreConfig::Filesystem { path } = &mut engine.queue.store {
        resolve(path);
    }
}
