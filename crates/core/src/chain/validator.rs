//! Process Chain Validator.
//!
//! Turns a chain description into a [`ProcessChain`] the identity in the
//! execution context is allowed to run. Only mapset-qualified values
//! (`name@mapset`) in tool parameters are treated as dataset references;
//! unqualified values are resolved by the tool's own search path at run time
//! and are only checked against outputs of later steps.

use super::description::compile;
use super::error::ValidationError;
use crate::workspace::{check_name, Region, WorkspaceError, PERMANENT};
use gp_protocol::{
    ChainDescription, Executable, ExecutionContext, ExportKind, ProcessChain, ProcessModel,
    UserRole,
};
use std::collections::{BTreeMap, BTreeSet};

/// Read access to the geodata database the validator needs.
pub trait DatasetCatalog: Send + Sync {
    fn location_exists(&self, location: &str) -> bool;

    fn mapset_exists(&self, location: &str, mapset: &str) -> bool;

    /// User that created `mapset` through persistent processing.
    fn mapset_owner(&self, location: &str, mapset: &str) -> Option<String>;

    fn map_exists(&self, location: &str, mapset: &str, name: &str) -> bool;

    /// Region of `mapset`, falling back to the location default.
    fn current_region(&self, location: &str, mapset: Option<&str>) -> Result<Region, WorkspaceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Skip the tool allow-list. Only for chains the engine synthesizes
    /// itself; dataset access is still enforced.
    pub skip_permission_check: bool,
}

pub struct ProcessChainValidator<'a> {
    catalog: &'a dyn DatasetCatalog,
}

/// A `name@mapset` token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DatasetRef<'v> {
    name: &'v str,
    mapset: Option<&'v str>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@')
}

/// Name-like tokens of a parameter value, so `"a@PERMANENT * 2,b"` yields
/// `a@PERMANENT`, `2` and `b`.
fn tokens(value: &str) -> impl Iterator<Item = DatasetRef<'_>> {
    value
        .split(|c: char| !is_name_char(c))
        .filter(|token| !token.is_empty())
        .filter_map(|token| match token.rsplit_once('@') {
            Some((name, mapset)) if !name.is_empty() && !mapset.is_empty() => Some(DatasetRef {
                name,
                mapset: Some(mapset),
            }),
            Some(_) => None,
            None => Some(DatasetRef {
                name: token,
                mapset: None,
            }),
        })
}

/// Mapsets named by qualified references in tool inputs.
pub fn referenced_mapsets(chain: &ProcessChain) -> Vec<String> {
    let mapsets: BTreeSet<String> = chain
        .steps
        .iter()
        .filter(|step| !matches!(step.executable, Executable::Exe(_)))
        .flat_map(|step| step.inputs.iter())
        .flat_map(|param| tokens(&param.value))
        .filter_map(|token| token.mapset.map(str::to_string))
        .collect();
    mapsets.into_iter().collect()
}

fn writes_raster(step: &ProcessModel) -> bool {
    step.executable.writes_raster()
        || step
            .exported_outputs()
            .any(|(_, spec)| spec.kind == ExportKind::Raster)
}

impl<'a> ProcessChainValidator<'a> {
    pub fn new(catalog: &'a dyn DatasetCatalog) -> Self {
        Self { catalog }
    }

    /// Compile and check a client chain description.
    pub fn validate(
        &self,
        description: &ChainDescription,
        context: &ExecutionContext,
        options: ValidationOptions,
    ) -> Result<ProcessChain, ValidationError> {
        let steps = compile(description)?;
        self.validate_steps(steps, context, options)
    }

    /// Check already compiled steps against the identity in `context`.
    pub fn validate_steps(
        &self,
        steps: Vec<ProcessModel>,
        context: &ExecutionContext,
        options: ValidationOptions,
    ) -> Result<ProcessChain, ValidationError> {
        if steps.is_empty() {
            return Err(ValidationError::EmptyChain);
        }

        self.check_workspace(context)?;

        let limit = context.quota.process_num_limit;
        if steps.len() > limit {
            return Err(ValidationError::ProcessLimitExceeded {
                count: steps.len(),
                limit,
            });
        }

        if !options.skip_permission_check {
            for step in &steps {
                let tool = step.executable.name();
                if !context.permissions.can_run(tool) {
                    return Err(ValidationError::ModuleNotPermitted {
                        step: step.id.clone(),
                        tool: tool.to_string(),
                    });
                }
            }
        }

        self.check_exports(&steps, context)?;
        self.check_datasets(&steps, context)?;
        self.check_cells(&steps, context)?;

        Ok(ProcessChain { steps })
    }

    fn check_workspace(&self, context: &ExecutionContext) -> Result<(), ValidationError> {
        let location = &context.workspace.location;
        if check_name(location).is_err()
            || !context.permissions.can_access_location(location)
            || !self.catalog.location_exists(location)
        {
            return Err(ValidationError::LocationNotAccessible(location.clone()));
        }

        if let Some(mapset) = &context.workspace.mapset {
            if check_name(mapset).is_err() {
                return Err(ValidationError::PermissionDenied(format!(
                    "'{mapset}' is not a valid mapset name"
                )));
            }
            let role = context.identity.role;
            if role == UserRole::Guest {
                return Err(ValidationError::PermissionDenied(
                    "guest users cannot run persistent processing".to_string(),
                ));
            }
            if mapset == PERMANENT && role < UserRole::Admin {
                return Err(ValidationError::PermissionDenied(format!(
                    "only administrators may modify the {PERMANENT} mapset"
                )));
            }
            self.check_target_mapset(context)?;
        }
        Ok(())
    }

    /// A persistent target must be new, listed in the identity's accessible
    /// datasets, or created earlier by the same user.
    pub fn check_target_mapset(&self, context: &ExecutionContext) -> Result<(), ValidationError> {
        let Some(mapset) = context.workspace.mapset.as_deref() else {
            return Ok(());
        };
        let location = context.workspace.location.as_str();
        if !self.catalog.mapset_exists(location, mapset)
            || context.permissions.can_access_mapset(location, mapset)
        {
            return Ok(());
        }

        let user_id = context.user_id();
        match self.catalog.mapset_owner(location, mapset) {
            Some(owner) if owner == user_id => Ok(()),
            _ => Err(ValidationError::MapsetNotAccessible {
                location: location.to_string(),
                mapset: mapset.to_string(),
            }),
        }
    }

    /// Exported outputs name files of the current mapset: a plain name,
    /// qualified at most with the target mapset.
    fn check_exports(
        &self,
        steps: &[ProcessModel],
        context: &ExecutionContext,
    ) -> Result<(), ValidationError> {
        let target = context.workspace.mapset.as_deref();
        for step in steps {
            for (param, spec) in step.exported_outputs() {
                let (name, mapset) = match param.value.split_once('@') {
                    Some((name, mapset)) if spec.kind != ExportKind::File => (name, Some(mapset)),
                    _ => (param.value.as_str(), None),
                };
                let foreign = mapset.is_some_and(|m| Some(m) != target);
                if check_name(name).is_err() || foreign {
                    return Err(ValidationError::InvalidExport {
                        step: step.id.clone(),
                        value: param.value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_datasets(
        &self,
        steps: &[ProcessModel],
        context: &ExecutionContext,
    ) -> Result<(), ValidationError> {
        let location = context.workspace.location.as_str();
        let target = context.workspace.mapset.as_deref();

        // Output name -> index of the first step producing it.
        let mut producers: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, step) in steps.iter().enumerate() {
            for param in &step.outputs {
                if let Some(token) = tokens(&param.value).next() {
                    if token.mapset.is_none() || token.mapset == target {
                        producers.entry(token.name).or_insert(index);
                    }
                }
            }
        }

        for (index, step) in steps.iter().enumerate() {
            if matches!(step.executable, Executable::Exe(_)) {
                continue;
            }

            for param in &step.inputs {
                for token in tokens(&param.value) {
                    let producer = producers.get(token.name).copied();
                    let produced_earlier = producer.is_some_and(|p| p < index);
                    let forward = |producer: usize| ValidationError::ForwardReference {
                        step: step.id.clone(),
                        dataset: param.value.clone(),
                        producer: steps[producer].id.clone(),
                    };

                    let Some(mapset) = token.mapset else {
                        if let Some(p) = producer.filter(|p| *p > index) {
                            return Err(forward(p));
                        }
                        continue;
                    };

                    let dataset = format!("{}@{mapset}", token.name);
                    // The target already passed check_target_mapset.
                    let own_mapset = Some(mapset) == target;
                    if !own_mapset && !context.permissions.can_access_mapset(location, mapset) {
                        return Err(ValidationError::DatasetNotAccessible {
                            step: step.id.clone(),
                            dataset,
                        });
                    }

                    if self.catalog.map_exists(location, mapset, token.name)
                        || (own_mapset && produced_earlier)
                    {
                        continue;
                    }
                    if let Some(p) = producer.filter(|p| own_mapset && *p >= index) {
                        return Err(forward(p));
                    }
                    return Err(ValidationError::UnknownDataset {
                        step: step.id.clone(),
                        dataset,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_cells(
        &self,
        steps: &[ProcessModel],
        context: &ExecutionContext,
    ) -> Result<(), ValidationError> {
        let Some(first) = steps
            .iter()
            .find(|step| writes_raster(step) && !step.native_region)
        else {
            return Ok(());
        };

        let region = self
            .catalog
            .current_region(
                &context.workspace.location,
                context.workspace.mapset.as_deref(),
            )
            .map_err(|e| ValidationError::RegionUnavailable(e.to_string()))?;

        let cells = region.cells();
        let limit = context.quota.cell_limit;
        if cells > limit {
            return Err(ValidationError::CellLimitExceeded {
                step: first.id.clone(),
                cells,
                limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_support::context;
    use gp_protocol::{ExportSpec, ProcessParam, StepDescription, WorkspaceTarget};
    use std::path::Path;

    struct FakeCatalog {
        maps: Vec<(&'static str, &'static str)>,
        owners: Vec<(&'static str, &'static str)>,
        cells: (u64, u64),
    }

    impl DatasetCatalog for FakeCatalog {
        fn location_exists(&self, location: &str) -> bool {
            location == "nc"
        }

        fn mapset_exists(&self, _location: &str, mapset: &str) -> bool {
            self.maps.iter().any(|(_, m)| *m == mapset)
                || self.owners.iter().any(|(m, _)| *m == mapset)
        }

        fn mapset_owner(&self, _location: &str, mapset: &str) -> Option<String> {
            self.owners
                .iter()
                .find(|(m, _)| *m == mapset)
                .map(|(_, owner)| owner.to_string())
        }

        fn map_exists(&self, _location: &str, mapset: &str, name: &str) -> bool {
            self.maps.contains(&(name, mapset))
        }

        fn current_region(
            &self,
            _location: &str,
            _mapset: Option<&str>,
        ) -> Result<Region, WorkspaceError> {
            Region::parse(
                &format!("rows: {}\ncols: {}\n", self.cells.0, self.cells.1),
                Path::new("WIND"),
            )
        }
    }

    fn catalog() -> FakeCatalog {
        FakeCatalog {
            maps: vec![("elevation", "PERMANENT"), ("secret", "other_user")],
            owners: vec![("other_user", "bob"), ("alice_work", "alice")],
            cells: (100, 100),
        }
    }

    fn chain(steps: Vec<StepDescription>) -> ChainDescription {
        ChainDescription::from_steps(steps)
    }

    fn r_info(map: &str) -> StepDescription {
        StepDescription::module("r.info")
            .with_input("map", map)
            .with_flags("g")
    }

    #[test]
    fn test_accepts_accessible_dataset() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let result = validator
            .validate(
                &chain(vec![r_info("elevation@PERMANENT")]),
                &context(),
                ValidationOptions::default(),
            )
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.steps[0].id, "1");
    }

    #[test]
    fn test_rejects_tool_outside_allow_list() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let description = chain(vec![StepDescription::module("r.mapcalc")]);

        let err = validator
            .validate(&description, &context(), ValidationOptions::default())
            .unwrap_err();
        assert!(matches!(err, ValidationError::ModuleNotPermitted { ref tool, .. } if tool == "r.mapcalc"));

        let skipped = validator.validate(
            &description,
            &context(),
            ValidationOptions {
                skip_permission_check: true,
            },
        );
        assert!(skipped.is_ok());
    }

    #[test]
    fn test_rejects_inaccessible_mapset() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let err = validator
            .validate(
                &chain(vec![r_info("secret@other_user")]),
                &context(),
                ValidationOptions::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DatasetNotAccessible {
                step: "1".to_string(),
                dataset: "secret@other_user".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_missing_dataset() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let err = validator
            .validate(
                &chain(vec![r_info("nothing@PERMANENT")]),
                &context(),
                ValidationOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownDataset { .. }));
    }

    #[test]
    fn test_backward_reference_allowed_forward_rejected() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();
        ctx.workspace = WorkspaceTarget::persistent("nc", "user1");

        let slope = StepDescription::module("r.slope.aspect")
            .with_input("elevation", "elevation@PERMANENT")
            .with_output(ProcessParam::new("slope", "slope"));
        let info = r_info("slope@user1");

        validator
            .validate(
                &chain(vec![slope.clone(), info.clone()]),
                &ctx,
                ValidationOptions::default(),
            )
            .unwrap();

        let err = validator
            .validate(&chain(vec![info, slope]), &ctx, ValidationOptions::default())
            .unwrap_err();
        assert!(matches!(err, ValidationError::ForwardReference { ref producer, .. } if producer == "2"));

        let unqualified = r_info("slope");
        let err = validator
            .validate(
                &chain(vec![
                    unqualified,
                    StepDescription::module("r.slope.aspect")
                        .with_input("elevation", "elevation@PERMANENT")
                        .with_output(ProcessParam::new("slope", "slope")),
                ]),
                &context(),
                ValidationOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::ForwardReference { .. }));
    }

    #[test]
    fn test_process_limit() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();
        ctx.quota.process_num_limit = 1;

        let err = validator
            .validate(
                &chain(vec![r_info("elevation@PERMANENT"), r_info("elevation@PERMANENT")]),
                &ctx,
                ValidationOptions::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::ProcessLimitExceeded { count: 2, limit: 1 }
        );
    }

    #[test]
    fn test_cell_limit_applies_to_raster_writers_only() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();
        ctx.quota.cell_limit = 5_000;
        ctx.permissions.accessible_modules.push("v.info".to_string());

        let err = validator
            .validate(
                &chain(vec![r_info("elevation@PERMANENT")]),
                &ctx,
                ValidationOptions::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CellLimitExceeded {
                step: "1".to_string(),
                cells: 10_000,
                limit: 5_000
            }
        );

        let mut native = r_info("elevation@PERMANENT");
        native.native_region = true;
        validator
            .validate(&chain(vec![native]), &ctx, ValidationOptions::default())
            .unwrap();

        validator
            .validate(
                &chain(vec![StepDescription::module("v.info").with_input("map", "roads")]),
                &ctx,
                ValidationOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_persistent_role_rules() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let description = chain(vec![r_info("elevation@PERMANENT")]);

        let mut ctx = context();
        ctx.workspace = WorkspaceTarget::persistent("nc", PERMANENT);
        assert!(matches!(
            validator.validate(&description, &ctx, ValidationOptions::default()),
            Err(ValidationError::PermissionDenied(_))
        ));

        ctx.identity.role = UserRole::Admin;
        assert!(validator
            .validate(&description, &ctx, ValidationOptions::default())
            .is_ok());

        ctx.identity.role = UserRole::Guest;
        ctx.workspace = WorkspaceTarget::persistent("nc", "guest_ms");
        assert!(matches!(
            validator.validate(&description, &ctx, ValidationOptions::default()),
            Err(ValidationError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_export_outputs_stay_in_current_mapset() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();

        let exporting = |value: &str, kind: ExportKind| {
            let mut output = ProcessParam::new("slope", value);
            output.export = Some(ExportSpec {
                format: String::new(),
                kind,
            });
            chain(vec![StepDescription::module("r.slope.aspect")
                .with_input("elevation", "elevation@PERMANENT")
                .with_output(output)])
        };

        for (value, kind) in [
            ("/data/grassdb/nc/other_user/cell/secret", ExportKind::File),
            ("../other_user/cell/secret", ExportKind::File),
            (".hidden", ExportKind::File),
            ("report@PERMANENT", ExportKind::File),
            ("../../secret", ExportKind::Raster),
            ("secret@other_user", ExportKind::Raster),
        ] {
            let err = validator
                .validate(&exporting(value, kind), &ctx, ValidationOptions::default())
                .unwrap_err();
            assert_eq!(
                err,
                ValidationError::InvalidExport {
                    step: "1".to_string(),
                    value: value.to_string(),
                }
            );
        }

        assert!(validator
            .validate(
                &exporting("report.csv", ExportKind::File),
                &ctx,
                ValidationOptions::default()
            )
            .is_ok());

        ctx.workspace = WorkspaceTarget::persistent("nc", "alice_work");
        assert!(validator
            .validate(
                &exporting("slope@alice_work", ExportKind::Raster),
                &ctx,
                ValidationOptions::default()
            )
            .is_ok());
    }

    #[test]
    fn test_persistent_target_must_be_accessible() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();

        ctx.workspace = WorkspaceTarget::persistent("nc", "other_user");
        let expected = ValidationError::MapsetNotAccessible {
            location: "nc".to_string(),
            mapset: "other_user".to_string(),
        };
        assert_eq!(
            validator
                .validate(
                    &chain(vec![r_info("secret@other_user")]),
                    &ctx,
                    ValidationOptions::default()
                )
                .unwrap_err(),
            expected
        );
        assert_eq!(
            validator
                .validate(
                    &chain(vec![r_info("elevation@PERMANENT")]),
                    &ctx,
                    ValidationOptions::default()
                )
                .unwrap_err(),
            expected
        );

        for mapset in ["alice_work", "brand_new", "landsat"] {
            ctx.workspace = WorkspaceTarget::persistent("nc", mapset);
            assert!(
                validator
                    .validate(
                        &chain(vec![r_info("elevation@PERMANENT")]),
                        &ctx,
                        ValidationOptions::default()
                    )
                    .is_ok(),
                "{mapset} should be writable"
            );
        }
    }

    #[test]
    fn test_inaccessible_location() {
        let catalog = catalog();
        let validator = ProcessChainValidator::new(&catalog);
        let mut ctx = context();
        ctx.workspace = WorkspaceTarget::ephemeral("utm");
        assert_eq!(
            validator
                .validate(
                    &chain(vec![r_info("elevation@PERMANENT")]),
                    &ctx,
                    ValidationOptions::default()
                )
                .unwrap_err(),
            ValidationError::LocationNotAccessible("utm".to_string())
        );
    }

    #[test]
    fn test_referenced_mapsets() {
        let steps = compile(&chain(vec![
            r_info("elevation@PERMANENT"),
            StepDescription::module("r.mapcalc")
                .with_input("expression", "out = a@landsat * 2 + b@PERMANENT"),
        ]))
        .unwrap();
        assert_eq!(
            referenced_mapsets(&ProcessChain { steps }),
            vec!["PERMANENT", "landsat"]
        );
    }
}
