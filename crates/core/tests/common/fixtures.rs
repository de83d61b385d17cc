//! Test fixtures: a small geodata database, users and a runtime around them.

use gp_core::config::AppConfig;
use gp_core::runner::ToolRunner;
use gp_core::runtime::Runtime;
use gp_core::service::SubmitRequest;
use gp_protocol::{
    ApiInfo, ChainDescription, EngineConfig, RequestPayload, StepDescription, UserIdentity,
    UserPermissions, UserProfile, UserQuota, UserRole,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const REGION: &str = "north: 228500\nsouth: 215000\neast: 645000\nwest: 630000\nrows: 100\ncols: 150\n";

/// Scratch directory holding a database with location `nc`:
///
/// - `PERMANENT`: `raster/elevation`, `vector/roads` and the default region
/// - `landsat`: `raster/lsat7_2002_10`
/// - `other_user`: `raster/secret`
pub struct TestEnv {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let location = dir.path().join("grassdb").join("nc");

        let permanent = location.join("PERMANENT");
        std::fs::create_dir_all(permanent.join("cell"))?;
        std::fs::create_dir_all(permanent.join("vector").join("roads"))?;
        std::fs::write(permanent.join("DEFAULT_WIND"), REGION)?;
        std::fs::write(permanent.join("WIND"), REGION)?;
        std::fs::write(permanent.join("cell").join("elevation"), "raster")?;

        for (mapset, map) in [("landsat", "lsat7_2002_10"), ("other_user", "secret")] {
            let cell = location.join(mapset).join("cell");
            std::fs::create_dir_all(&cell)?;
            std::fs::write(cell.join(map), "raster")?;
        }

        std::fs::create_dir_all(dir.path().join("tmp"))?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn database(&self) -> PathBuf {
        self.root().join("grassdb")
    }

    pub fn temp_root(&self) -> PathBuf {
        self.root().join("tmp")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.root().join("resources")
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        engine.workspace.database = self.database();
        engine.workspace.temp_dir = Some(self.temp_root());
        engine.storage.root = self.storage_root();
        engine.storage.base_url = "http://storage.test".to_string();
        engine.service.status_base_url = "http://engine.test/resources".to_string();
        engine.service.poll_interval_ms = 20;
        engine.service.job_timeout_secs = 30;
        engine.queue.poll_interval_ms = 20;
        engine.locks.ttl_secs = 60;
        engine
    }

    pub fn app_config(&self, users: Vec<UserProfile>) -> AppConfig {
        AppConfig {
            engine: self.engine_config(),
            users: users
                .into_iter()
                .map(|user| (user.identity.user_id.clone(), user))
                .collect(),
            chains: BTreeMap::new(),
        }
    }

    pub fn runtime(&self, runner: Arc<dyn ToolRunner>) -> Runtime {
        Runtime::build(self.app_config(vec![alice(), admin()]), runner)
            .expect("Failed to build runtime")
    }
}

/// Ordinary user with read access to `PERMANENT` and `landsat`.
#[allow(dead_code)]
pub fn alice() -> UserProfile {
    UserProfile {
        identity: UserIdentity {
            user_id: "alice".to_string(),
            role: UserRole::User,
            group: "lab".to_string(),
        },
        quota: UserQuota::default(),
        permissions: UserPermissions {
            accessible_datasets: BTreeMap::from([(
                "nc".to_string(),
                vec!["PERMANENT".to_string(), "landsat".to_string()],
            )]),
            accessible_modules: ["r.info", "r.slope.aspect", "r.mapcalc", "g.list", "v.info", "sh"]
                .into_iter()
                .map(String::from)
                .collect(),
        },
    }
}

#[allow(dead_code)]
pub fn admin() -> UserProfile {
    let mut profile = alice();
    profile.identity.user_id = "root".to_string();
    profile.identity.role = UserRole::Admin;
    profile
}

#[allow(dead_code)]
pub fn r_info(map: &str) -> StepDescription {
    StepDescription::module("r.info")
        .with_input("map", map)
        .with_flags("g")
}

#[allow(dead_code)]
pub fn chain(steps: Vec<StepDescription>) -> RequestPayload {
    RequestPayload::ProcessChain(ChainDescription::from_steps(steps))
}

#[allow(dead_code)]
pub fn request(user_id: &str, mapset: Option<&str>, payload: RequestPayload) -> SubmitRequest {
    SubmitRequest {
        user_id: user_id.to_string(),
        location: "nc".to_string(),
        mapset: mapset.map(str::to_string),
        export: false,
        payload,
        api_info: ApiInfo {
            endpoint: "process_chain".to_string(),
            method: "POST".to_string(),
            path: "/api/v1/locations/nc/processing".to_string(),
            request_url: "http://engine.test/api/v1/locations/nc/processing".to_string(),
        },
    }
}
