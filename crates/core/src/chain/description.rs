//! Compiles client chain descriptions into ordered process models.
//!
//! This is the structural half of validation: it fixes the step order,
//! assigns step ids and resolves `stdin` references. Permissions, datasets
//! and quotas are checked afterwards by the validator.

use super::error::ValidationError;
use gp_protocol::{
    ChainDescription, Executable, OutputStream, ProcessModel, StdinSource, StepDescription,
};

/// Steps in execution order. Keyed steps keep their key as label.
fn ordered_steps(description: &ChainDescription) -> Result<Vec<StepDescription>, ValidationError> {
    match description {
        ChainDescription::Versioned(chain) => Ok(chain.list.clone()),
        ChainDescription::Keyed(map) => {
            let mut keyed = Vec::with_capacity(map.len());
            for (key, step) in map {
                let position: u64 = key
                    .trim()
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ValidationError::InvalidStepKey(key.clone()))?;
                keyed.push((position, key, step));
            }
            keyed.sort_by_key(|(position, _, _)| *position);
            if let Some(pair) = keyed.windows(2).find(|pair| pair[0].0 == pair[1].0) {
                return Err(ValidationError::InvalidStepKey(pair[1].1.clone()));
            }
            Ok(keyed
                .into_iter()
                .map(|(_, key, step)| StepDescription {
                    id: step.id.clone().or_else(|| Some(key.clone())),
                    ..step.clone()
                })
                .collect())
        }
    }
}

fn parse_stdin(
    reference: &str,
    step_id: &str,
    earlier: &[ProcessModel],
) -> Result<StdinSource, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidStdin {
        step: step_id.to_string(),
        reason,
    };

    let (target, stream) = reference
        .rsplit_once("::")
        .ok_or_else(|| invalid(format!("'{reference}' is not '<step>::stdout|stderr'")))?;
    let stream = match stream {
        "stdout" => OutputStream::Stdout,
        "stderr" => OutputStream::Stderr,
        other => return Err(invalid(format!("unknown stream '{other}'"))),
    };

    earlier
        .iter()
        .rev()
        .find(|step| step.id == target || step.label.as_deref() == Some(target))
        .map(|step| StdinSource {
            step_id: step.id.clone(),
            stream,
        })
        .ok_or_else(|| invalid(format!("'{target}' is not an earlier step")))
}

/// Turn a description into process models with ids `"1"..="N"`.
pub fn compile(description: &ChainDescription) -> Result<Vec<ProcessModel>, ValidationError> {
    let steps = ordered_steps(description)?;
    if steps.is_empty() {
        return Err(ValidationError::EmptyChain);
    }

    let mut compiled: Vec<ProcessModel> = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let id = (index + 1).to_string();
        let label = step.id.clone();
        let name = label.clone().unwrap_or_else(|| id.clone());

        let executable = match (step.module, step.exe) {
            (Some(module), None) if !module.trim().is_empty() => Executable::Module(module),
            (None, Some(exe)) if !exe.trim().is_empty() => Executable::Exe(exe),
            (Some(_), Some(_)) => {
                return Err(ValidationError::InvalidStep {
                    step: name,
                    reason: "both 'module' and 'exe' are set".to_string(),
                })
            }
            _ => {
                return Err(ValidationError::InvalidStep {
                    step: name,
                    reason: "one of 'module' or 'exe' is required".to_string(),
                })
            }
        };

        let inputs = step.inputs.into_params();
        let outputs = step.outputs.into_params();
        if let Some(empty) = inputs.iter().chain(outputs.iter()).find(|p| p.param.is_empty()) {
            return Err(ValidationError::InvalidStep {
                step: name,
                reason: format!("parameter without a name (value '{}')", empty.value),
            });
        }

        let stdin = step
            .stdin
            .as_deref()
            .map(|reference| parse_stdin(reference, &id, &compiled))
            .transpose()?;

        compiled.push(ProcessModel {
            id,
            label,
            executable,
            inputs,
            outputs,
            flags: step.flags.unwrap_or_default(),
            params: step.params,
            stdin,
            native_region: step.native_region,
            internal: false,
        });
    }

    Ok(compiled)
}
