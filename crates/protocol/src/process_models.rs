//! Compiled process models.
//!
//! A [`ProcessModel`] is one external-tool invocation produced by the chain
//! validator. A [`ProcessChain`] is the ordered list of them that a worker
//! executes. Both are plain data so they can cross the queue boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// What gets executed for a step.
///
/// Named tools are looked up in the configured tool directory first and then
/// on `PATH`; raw executables are always looked up on `PATH`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Executable {
    /// A geoprocessing tool such as `r.info`, invoked as `param=value` pairs.
    Module(String),

    /// A raw system executable invoked with positional parameters.
    Exe(String),
}

impl Executable {
    /// The tool or executable name.
    pub fn name(&self) -> &str {
        match self {
            Executable::Module(name) | Executable::Exe(name) => name,
        }
    }

    /// Whether this tool writes raster datasets by naming convention
    /// (`r.*` and imagery `i.*` tools).
    pub fn writes_raster(&self) -> bool {
        match self {
            Executable::Module(name) => name.starts_with("r.") || name.starts_with("i."),
            Executable::Exe(_) => false,
        }
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of dataset an output export produces.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Raster,
    Vector,
    /// A plain file written by the tool into its working directory.
    File,
}

/// Export declaration attached to an output parameter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ExportSpec {
    /// Output format handed to the export tool (e.g. `GTiff`, `GPKG`).
    pub format: String,

    #[serde(rename = "type")]
    pub kind: ExportKind,
}

/// One `param=value` input or output of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ProcessParam {
    pub param: String,
    pub value: String,

    /// Present on outputs that should be exported after the chain finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportSpec>,
}

impl ProcessParam {
    pub fn new(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            value: value.into(),
            export: None,
        }
    }
}

/// Which captured stream of an earlier step feeds a step's stdin.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Standard input source for a step. Only backward references are allowed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct StdinSource {
    /// Numeric id of the earlier step.
    pub step_id: String,
    pub stream: OutputStream,
}

/// One validated external-tool invocation. Immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct ProcessModel {
    /// Stable 1-based step id in submission order (`"1"`, `"2"`, ...).
    pub id: String,

    /// The client supplied id, if any. Used to resolve `stdin` references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub executable: Executable,

    #[serde(default)]
    pub inputs: Vec<ProcessParam>,

    #[serde(default)]
    pub outputs: Vec<ProcessParam>,

    /// Short option string, e.g. `"g"` becomes `-g`.
    #[serde(default)]
    pub flags: String,

    /// Positional parameters, only used by raw executables.
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<StdinSource>,

    /// The step runs in the native region of its input instead of the
    /// mapset region; the default-region cell quota check is skipped.
    #[serde(default)]
    pub native_region: bool,

    /// Step synthesized by the engine itself (exports).
    #[serde(default)]
    pub internal: bool,
}

impl ProcessModel {
    /// Command line arguments for this step.
    ///
    /// Tools get `param=value` pairs for inputs and outputs followed by the
    /// flags; raw executables get their positional parameters verbatim.
    pub fn arguments(&self) -> Vec<String> {
        match self.executable {
            Executable::Module(_) => {
                let mut args: Vec<String> = self
                    .inputs
                    .iter()
                    .chain(self.outputs.iter())
                    .map(|p| format!("{}={}", p.param, p.value))
                    .collect();
                if !self.flags.is_empty() {
                    args.push(format!("-{}", self.flags));
                }
                args
            }
            Executable::Exe(_) => self.params.clone(),
        }
    }

    /// Outputs carrying an export declaration.
    pub fn exported_outputs(&self) -> impl Iterator<Item = (&ProcessParam, &ExportSpec)> {
        self.outputs
            .iter()
            .filter_map(|p| p.export.as_ref().map(|spec| (p, spec)))
    }
}

/// Ordered, validated sequence of steps. Steps execute strictly in order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, TS)]
pub struct ProcessChain {
    pub steps: Vec<ProcessModel>,
}

impl ProcessChain {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&ProcessModel> {
        self.steps.iter().find(|s| s.id == id)
    }
}
