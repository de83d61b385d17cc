//! Client supplied process chain descriptions.
//!
//! Two formats are accepted and distinguished structurally:
//!
//! ```json
//! {"version": "1", "list": [{"id": "info", "module": "r.info",
//!   "inputs": [{"param": "map", "value": "elevation@PERMANENT"}], "flags": "g"}]}
//! ```
//!
//! and the legacy keyed form, whose numeric keys give the execution order:
//!
//! ```json
//! {"1": {"module": "r.info", "inputs": {"map": "elevation@PERMANENT"}, "flags": "g"}}
//! ```

use crate::process_models::ProcessParam;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

/// Inputs or outputs of a step, as a list of params or a `param -> value` map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(untagged)]
pub enum IoDescription {
    List(Vec<ProcessParam>),
    Map(BTreeMap<String, String>),
}

impl Default for IoDescription {
    fn default() -> Self {
        IoDescription::List(Vec::new())
    }
}

impl IoDescription {
    /// Normalize into an ordered list of params.
    pub fn into_params(self) -> Vec<ProcessParam> {
        match self {
            IoDescription::List(params) => params,
            IoDescription::Map(map) => map
                .into_iter()
                .map(|(param, value)| ProcessParam::new(param, value))
                .collect(),
        }
    }
}

/// One step as submitted by a client. Exactly one of `module`/`exe` must be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct StepDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,

    #[serde(default)]
    pub inputs: IoDescription,

    #[serde(default)]
    pub outputs: IoDescription,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,

    /// `"<step>::stdout"` or `"<step>::stderr"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,

    #[serde(default)]
    pub native_region: bool,
}

impl StepDescription {
    /// Convenience constructor for a tool step.
    pub fn module(name: impl Into<String>) -> Self {
        Self {
            module: Some(name.into()),
            ..Self::default()
        }
    }

    /// Convenience constructor for a raw executable step.
    pub fn exe(name: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            exe: Some(name.into()),
            params,
            ..Self::default()
        }
    }

    pub fn with_input(mut self, param: &str, value: &str) -> Self {
        push_param(&mut self.inputs, ProcessParam::new(param, value));
        self
    }

    pub fn with_output(mut self, output: ProcessParam) -> Self {
        push_param(&mut self.outputs, output);
        self
    }

    pub fn with_flags(mut self, flags: &str) -> Self {
        self.flags = Some(flags.to_string());
        self
    }
}

fn push_param(io: &mut IoDescription, param: ProcessParam) {
    let mut params = std::mem::take(io).into_params();
    params.push(param);
    *io = IoDescription::List(params);
}

/// The `{"version": ..., "list": [...]}` format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct VersionedChain {
    pub version: String,
    pub list: Vec<StepDescription>,
}

/// A process chain description in either accepted format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(untagged)]
pub enum ChainDescription {
    Versioned(VersionedChain),
    Keyed(BTreeMap<String, StepDescription>),
}

impl ChainDescription {
    /// Build a versioned description from a list of steps.
    pub fn from_steps(steps: Vec<StepDescription>) -> Self {
        ChainDescription::Versioned(VersionedChain {
            version: "1".to_string(),
            list: steps,
        })
    }

    /// Number of submitted steps.
    pub fn len(&self) -> usize {
        match self {
            ChainDescription::Versioned(chain) => chain.list.len(),
            ChainDescription::Keyed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
