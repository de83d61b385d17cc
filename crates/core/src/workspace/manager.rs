use super::error::{WorkspaceError, WorkspaceResult};
use super::region::Region;
use crate::chain::DatasetCatalog;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// The mapset every location carries; holds the default region.
pub const PERMANENT: &str = "PERMANENT";

const DEFAULT_REGION_FILE: &str = "DEFAULT_WIND";
const REGION_FILE: &str = "WIND";
/// Holds the user id that created a mapset through persistent processing.
const OWNER_FILE: &str = "OWNER";

/// Element directory -> dataset kind.
const ELEMENTS: [(&str, &str); 2] = [("cell", "raster"), ("vector", "vector")];

/// Coordinates and directories a tool runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEnv {
    pub database: PathBuf,
    pub location: String,
    pub mapset: String,
    /// Working directory of every step.
    pub mapset_dir: PathBuf,
    /// Where export steps write their files.
    pub export_dir: PathBuf,
}

impl WorkspaceEnv {
    /// Environment variables handed to every tool.
    pub fn variables(&self) -> Vec<(String, String)> {
        vec![
            (
                "GP_DATABASE".to_string(),
                self.database.display().to_string(),
            ),
            ("GP_LOCATION".to_string(), self.location.clone()),
            ("GP_MAPSET".to_string(), self.mapset.clone()),
        ]
    }
}

/// A materialized workspace. Temporary directories it owns are removed by
/// [`Workspace::cleanup`] or, failing that, when it is dropped.
#[derive(Debug)]
pub struct Workspace {
    pub env: WorkspaceEnv,
    temp_dirs: Vec<TempDir>,
}

impl Workspace {
    /// Remove owned temporary directories, reporting the first failure.
    pub async fn cleanup(self) -> WorkspaceResult<()> {
        let mut first_error = None;
        for dir in self.temp_dirs {
            let path = dir.path().to_path_buf();
            let removal = tokio::task::spawn_blocking(move || dir.close()).await;
            let result = match removal {
                Ok(result) => result,
                Err(join_error) => Err(std::io::Error::other(join_error)),
            };
            if let Err(source) = result {
                first_error.get_or_insert(WorkspaceError::Io { path, source });
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Access to the geodata database on disk.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    database: PathBuf,
    temp_root: Option<PathBuf>,
}

/// Location and mapset names are single path components.
pub fn check_name(name: &str) -> WorkspaceResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidName(name.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl WorkspaceManager {
    pub fn new(database: impl Into<PathBuf>, temp_root: Option<PathBuf>) -> Self {
        Self {
            database: database.into(),
            temp_root,
        }
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn location_dir(&self, location: &str) -> PathBuf {
        self.database.join(location)
    }

    pub fn mapset_dir(&self, location: &str, mapset: &str) -> PathBuf {
        self.location_dir(location).join(mapset)
    }

    pub fn mapset_exists(&self, location: &str, mapset: &str) -> bool {
        check_name(location).is_ok()
            && check_name(mapset).is_ok()
            && self.mapset_dir(location, mapset).is_dir()
    }

    /// User that created `mapset` through persistent processing, if recorded.
    pub fn mapset_owner(&self, location: &str, mapset: &str) -> Option<String> {
        if !self.mapset_exists(location, mapset) {
            return None;
        }
        std::fs::read_to_string(self.mapset_dir(location, mapset).join(OWNER_FILE))
            .ok()
            .map(|owner| owner.trim().to_string())
            .filter(|owner| !owner.is_empty())
    }

    fn default_region_file(&self, location: &str) -> PathBuf {
        self.mapset_dir(location, PERMANENT).join(DEFAULT_REGION_FILE)
    }

    /// Region of `mapset`, or the location default if the mapset has none
    /// (or no mapset is given).
    pub fn region(&self, location: &str, mapset: Option<&str>) -> WorkspaceResult<Region> {
        check_name(location)?;
        if let Some(mapset) = mapset {
            check_name(mapset)?;
            let own = self.mapset_dir(location, mapset).join(REGION_FILE);
            if own.is_file() {
                return Region::read(&own);
            }
        }

        let default = self.default_region_file(location);
        if default.is_file() {
            return Region::read(&default);
        }
        Err(WorkspaceError::MissingRegion {
            location: location.to_string(),
            mapset: mapset.unwrap_or(PERMANENT).to_string(),
        })
    }

    /// Maps of a mapset as `raster/<name>` and `vector/<name>`, sorted.
    pub fn list_maps(&self, location: &str, mapset: &str) -> WorkspaceResult<Vec<String>> {
        check_name(location)?;
        check_name(mapset)?;
        let mapset_dir = self.mapset_dir(location, mapset);

        let mut maps = Vec::new();
        for (element, kind) in ELEMENTS {
            let element_dir = mapset_dir.join(element);
            if !element_dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&element_dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|source| WorkspaceError::Scan {
                    path: element_dir.clone(),
                    source,
                })?;
                maps.push(format!("{kind}/{}", entry.file_name().to_string_lossy()));
            }
        }
        maps.sort();
        Ok(maps)
    }

    fn temp_dir(&self, prefix: &str) -> WorkspaceResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(io_error(root))?;
                builder.tempdir_in(root).map_err(io_error(root))
            }
            None => builder
                .tempdir()
                .map_err(io_error(&std::env::temp_dir())),
        }
    }

    /// Copy the location default region into a mapset without a region.
    fn seed_region(&self, location: &str, mapset_dir: &Path) -> WorkspaceResult<()> {
        let target = mapset_dir.join(REGION_FILE);
        let default = self.default_region_file(location);
        if !target.exists() && default.is_file() {
            std::fs::copy(&default, &target).map_err(io_error(&target))?;
        }
        Ok(())
    }

    /// Build a disposable database holding `PERMANENT`, the given source
    /// mapsets and a fresh temporary mapset to run in.
    ///
    /// Source mapsets are linked, not copied, on unix. Tools only ever write
    /// into the current mapset, which is always the temporary one.
    pub fn create_ephemeral(
        &self,
        location: &str,
        source_mapsets: &[String],
    ) -> WorkspaceResult<Workspace> {
        check_name(location)?;
        if !self.location_dir(location).is_dir() {
            return Err(WorkspaceError::UnknownLocation(location.to_string()));
        }

        let root = self.temp_dir("gp-ephemeral-")?;
        let database = root.path().join("db");
        let location_dir = database.join(location);
        std::fs::create_dir_all(&location_dir).map_err(io_error(&location_dir))?;

        let mut linked: BTreeSet<&str> = source_mapsets.iter().map(String::as_str).collect();
        linked.insert(PERMANENT);
        for mapset in linked {
            check_name(mapset)?;
            let source = self.mapset_dir(location, mapset);
            if source.is_dir() {
                link_mapset(&source, &location_dir.join(mapset))?;
            }
        }

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let mapset = format!("tmp_{}", &simple[..12]);
        let mapset_dir = location_dir.join(&mapset);
        std::fs::create_dir_all(&mapset_dir).map_err(io_error(&mapset_dir))?;
        self.seed_region(location, &mapset_dir)?;

        let export_dir = root.path().join("export");
        std::fs::create_dir_all(&export_dir).map_err(io_error(&export_dir))?;

        tracing::debug!(location, mapset = %mapset, path = %root.path().display(), "Ephemeral workspace created");

        Ok(Workspace {
            env: WorkspaceEnv {
                database,
                location: location.to_string(),
                mapset,
                mapset_dir,
                export_dir,
            },
            temp_dirs: vec![root],
        })
    }

    /// Open a mapset of the real database. A missing mapset is created and
    /// recorded as owned by `owner`.
    pub fn open_persistent(
        &self,
        location: &str,
        mapset: &str,
        owner: &str,
    ) -> WorkspaceResult<Workspace> {
        check_name(location)?;
        check_name(mapset)?;
        if !self.location_dir(location).is_dir() {
            return Err(WorkspaceError::UnknownLocation(location.to_string()));
        }

        let mapset_dir = self.mapset_dir(location, mapset);
        if !mapset_dir.is_dir() {
            std::fs::create_dir_all(&mapset_dir).map_err(io_error(&mapset_dir))?;
            let owner_file = mapset_dir.join(OWNER_FILE);
            std::fs::write(&owner_file, owner).map_err(io_error(&owner_file))?;
            tracing::info!(location, mapset, owner, "Created mapset");
        }
        self.seed_region(location, &mapset_dir)?;

        let scratch = self.temp_dir("gp-export-")?;
        let export_dir = scratch.path().to_path_buf();

        Ok(Workspace {
            env: WorkspaceEnv {
                database: self.database.clone(),
                location: location.to_string(),
                mapset: mapset.to_string(),
                mapset_dir,
                export_dir,
            },
            temp_dirs: vec![scratch],
        })
    }
}

#[cfg(unix)]
fn link_mapset(source: &Path, target: &Path) -> WorkspaceResult<()> {
    std::os::unix::fs::symlink(source, target).map_err(io_error(target))
}

#[cfg(not(unix))]
fn link_mapset(source: &Path, target: &Path) -> WorkspaceResult<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| WorkspaceError::Scan {
            path: source.to_path_buf(),
            source: e,
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination).map_err(io_error(&destination))?;
        } else {
            std::fs::copy(entry.path(), &destination).map_err(io_error(&destination))?;
        }
    }
    Ok(())
}

impl DatasetCatalog for WorkspaceManager {
    fn location_exists(&self, location: &str) -> bool {
        check_name(location).is_ok() && self.location_dir(location).is_dir()
    }

    fn mapset_exists(&self, location: &str, mapset: &str) -> bool {
        WorkspaceManager::mapset_exists(self, location, mapset)
    }

    fn mapset_owner(&self, location: &str, mapset: &str) -> Option<String> {
        WorkspaceManager::mapset_owner(self, location, mapset)
    }

    fn map_exists(&self, location: &str, mapset: &str, name: &str) -> bool {
        if !self.mapset_exists(location, mapset) || check_name(name).is_err() {
            return false;
        }
        let mapset_dir = self.mapset_dir(location, mapset);
        ELEMENTS
            .iter()
            .any(|(element, _)| mapset_dir.join(element).join(name).exists())
    }

    fn current_region(&self, location: &str, mapset: Option<&str>) -> WorkspaceResult<Region> {
        self.region(location, mapset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn database() -> TempDir {
        let dir = tempdir().expect("Failed to create temp dir");
        let permanent = dir.path().join("nc/PERMANENT");
        fs::create_dir_all(permanent.join("cell")).unwrap();
        fs::create_dir_all(permanent.join("vector/roads")).unwrap();
        fs::write(permanent.join("cell/elevation"), "").unwrap();
        fs::write(permanent.join(DEFAULT_REGION_FILE), "rows: 10\ncols: 20\n").unwrap();
        dir
    }

    #[test]
    fn test_list_maps_and_exists() {
        let db = database();
        let manager = WorkspaceManager::new(db.path(), None);

        assert_eq!(
            manager.list_maps("nc", PERMANENT).unwrap(),
            vec!["raster/elevation", "vector/roads"]
        );
        assert!(manager.map_exists("nc", PERMANENT, "elevation"));
        assert!(manager.map_exists("nc", PERMANENT, "roads"));
        assert!(!manager.map_exists("nc", PERMANENT, "missing"));
        assert!(!manager.map_exists("nc", "../nc", "elevation"));
    }

    #[test]
    fn test_region_falls_back_to_default() {
        let db = database();
        let manager = WorkspaceManager::new(db.path(), None);
        assert_eq!(manager.region("nc", Some("user1")).unwrap().cells(), 200);

        fs::create_dir_all(db.path().join("nc/user1")).unwrap();
        fs::write(db.path().join("nc/user1/WIND"), "rows: 3\ncols: 3\n").unwrap();
        assert_eq!(manager.region("nc", Some("user1")).unwrap().cells(), 9);
    }

    #[tokio::test]
    async fn test_ephemeral_workspace_is_removed() {
        let db = database();
        let temp_root = tempdir().unwrap();
        let manager = WorkspaceManager::new(db.path(), Some(temp_root.path().to_path_buf()));

        let workspace = manager.create_ephemeral("nc", &[]).unwrap();
        assert!(workspace.env.mapset.starts_with("tmp_"));
        assert!(workspace.env.mapset_dir.join(REGION_FILE).is_file());
        assert!(workspace
            .env
            .database
            .join("nc/PERMANENT/cell/elevation")
            .exists());

        workspace.cleanup().await.unwrap();
        assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 0);
        assert!(db.path().join("nc/PERMANENT/cell/elevation").exists());
    }

    #[tokio::test]
    async fn test_open_persistent_creates_mapset() {
        let db = database();
        let manager = WorkspaceManager::new(db.path(), None);

        let workspace = manager.open_persistent("nc", "user1", "alice").unwrap();
        assert!(db.path().join("nc/user1/WIND").is_file());
        assert_eq!(workspace.env.mapset_dir, db.path().join("nc/user1"));
        workspace.cleanup().await.unwrap();
        assert!(db.path().join("nc/user1").is_dir());
        assert_eq!(manager.mapset_owner("nc", "user1").as_deref(), Some("alice"));

        // Reopening keeps the original owner.
        let workspace = manager.open_persistent("nc", "user1", "bob").unwrap();
        workspace.cleanup().await.unwrap();
        assert_eq!(manager.mapset_owner("nc", "user1").as_deref(), Some("alice"));
        assert_eq!(manager.mapset_owner("nc", PERMANENT), None);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let db = database();
        let manager = WorkspaceManager::new(db.path(), None);
        assert!(matches!(
            manager.open_persistent("nc", "../escape", "alice"),
            Err(WorkspaceError::InvalidName(_))
        ));
    }
}
