//! Built-in chain templates.
//!
//! A template turns opaque request data into a chain description. The
//! resulting chains are validated without the tool allow-list, so templates
//! must only ever emit the fixed tools they are written for.

use super::error::ValidationError;
use gp_protocol::{ChainDescription, StepDescription};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub trait ChainTemplate: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, data: &Value) -> Result<ChainDescription, ValidationError>;
}

fn parse_data<T: DeserializeOwned>(template: &str, data: &Value) -> Result<T, ValidationError> {
    T::deserialize(data).map_err(|e| ValidationError::InvalidTemplateData {
        template: template.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Deserialize)]
struct MapData {
    map: String,
}

/// `r.info -g map=<map>`: raster metadata as `key=value` lines.
pub struct RasterInfo;

impl ChainTemplate for RasterInfo {
    fn name(&self) -> &'static str {
        "raster_info"
    }

    fn build(&self, data: &Value) -> Result<ChainDescription, ValidationError> {
        let data: MapData = parse_data(self.name(), data)?;
        Ok(ChainDescription::from_steps(vec![StepDescription::module(
            "r.info",
        )
        .with_input("map", &data.map)
        .with_flags("g")]))
    }
}

/// `v.info -g map=<map>`: vector extent as `key=value` lines.
pub struct VectorInfo;

impl ChainTemplate for VectorInfo {
    fn name(&self) -> &'static str {
        "vector_info"
    }

    fn build(&self, data: &Value) -> Result<ChainDescription, ValidationError> {
        let data: MapData = parse_data(self.name(), data)?;
        Ok(ChainDescription::from_steps(vec![StepDescription::module(
            "v.info",
        )
        .with_input("map", &data.map)
        .with_flags("g")]))
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListData {
    #[serde(rename = "type")]
    kind: Option<String>,
    pattern: Option<String>,
}

/// `g.list type=<raster|vector> [pattern=<glob>]` in the target mapset.
pub struct ListMaps;

impl ChainTemplate for ListMaps {
    fn name(&self) -> &'static str {
        "list_maps"
    }

    fn build(&self, data: &Value) -> Result<ChainDescription, ValidationError> {
        let data: ListData = if data.is_null() {
            ListData::default()
        } else {
            parse_data(self.name(), data)?
        };

        let kind = data.kind.unwrap_or_else(|| "raster,vector".to_string());
        if kind
            .split(',')
            .any(|k| !matches!(k.trim(), "raster" | "vector"))
        {
            return Err(ValidationError::InvalidTemplateData {
                template: self.name().to_string(),
                reason: format!("unsupported type '{kind}'"),
            });
        }

        let mut step = StepDescription::module("g.list").with_input("type", &kind);
        if let Some(pattern) = &data.pattern {
            step = step.with_input("pattern", pattern);
        }
        Ok(ChainDescription::from_steps(vec![step]))
    }
}

/// Templates by name.
pub struct TemplateRegistry {
    templates: BTreeMap<&'static str, Box<dyn ChainTemplate>>,
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self {
            templates: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RasterInfo));
        registry.register(Box::new(VectorInfo));
        registry.register(Box::new(ListMaps));
        registry
    }

    pub fn register(&mut self, template: Box<dyn ChainTemplate>) {
        self.templates.insert(template.name(), template);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.templates.keys().copied().collect()
    }

    pub fn build(&self, name: &str, data: &Value) -> Result<ChainDescription, ValidationError> {
        self.templates
            .get(name)
            .ok_or_else(|| ValidationError::UnknownTemplate(name.to_string()))?
            .build(data)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::description::compile;
    use serde_json::json;

    #[test]
    fn test_raster_info_template() {
        let registry = TemplateRegistry::builtin();
        let chain = registry
            .build("raster_info", &json!({"map": "elevation@PERMANENT"}))
            .unwrap();
        let steps = compile(&chain).unwrap();
        assert_eq!(steps[0].arguments(), vec!["map=elevation@PERMANENT", "-g"]);
    }

    #[test]
    fn test_missing_template_data() {
        let registry = TemplateRegistry::builtin();
        let err = registry.build("vector_info", &json!({})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTemplateData { .. }));
    }

    #[test]
    fn test_list_maps_rejects_unknown_type() {
        let registry = TemplateRegistry::builtin();
        assert!(registry.build("list_maps", &Value::Null).is_ok());
        assert!(registry
            .build("list_maps", &json!({"type": "raster3d"}))
            .is_err());
    }

    #[test]
    fn test_unknown_template() {
        assert_eq!(
            TemplateRegistry::builtin()
                .build("render_png", &Value::Null)
                .unwrap_err(),
            ValidationError::UnknownTemplate("render_png".to_string())
        );
    }
}
