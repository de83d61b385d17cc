//! Process chains: description compiler, validator and templates.

pub mod description;
pub mod error;
pub mod templates;
pub mod validator;

pub use description::compile;
pub use error::ValidationError;
pub use templates::{ChainTemplate, TemplateRegistry};
pub use validator::{
    referenced_mapsets, DatasetCatalog, ProcessChainValidator, ValidationOptions,
};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use gp_protocol::*;
    use std::collections::BTreeMap;

    /// An ordinary user allowed to read `nc/PERMANENT` and `nc/landsat`.
    pub fn context() -> ExecutionContext {
        ExecutionContext {
            resource_id: "resource_id-test".to_string(),
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
                accessible_modules: ["r.info", "r.slope.aspect", "g.list", "v.info"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
            workspace: WorkspaceTarget::ephemeral("nc"),
            payload: RequestPayload::ProcessChain(ChainDescription::from_steps(vec![])),
            storage: StorageHandle {
                backend: StorageBackend::Filesystem,
                namespace: "alice".to_string(),
            },
            api_info: ApiInfo::default(),
            settings: EngineSettings {
                lock_ttl_secs: 60,
                status_base_url: "http://localhost/resources".to_string(),
                export: ExportSettings::default(),
            },
            accepted_at: Utc::now(),
        }
    }
}
