use crate::config::{ProcessSpec, option_signal_name};
use crate::error::UnitdError;
use crate::readiness::ReadinessDetector;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::path::Path;

/// One pool member: launch parameters plus how to tell it is ready
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberDefinition {
    #[serde(flatten)]
    pub spec: ProcessSpec,
    #[serde(default)]
    pub readiness: ReadinessDetector,
}

/// A whole pipeline, members listed in start order
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolDefinition {
    /// Address reported to the invoker once every member is running
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "option_signal_name::deserialize")]
    pub quit_signal: Option<Signal>,
    pub processes: Vec<MemberDefinition>,
}

impl PoolDefinition {
    pub fn from_json(json: &str) -> Result<Self, UnitdError> {
        let definition: PoolDefinition = serde_json::from_str(json)
            .map_err(|e| UnitdError::configuration(format!("invalid pool definition: {e}")))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_path(path: &Path) -> Result<Self, UnitdError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            UnitdError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), UnitdError> {
        if self.processes.is_empty() {
            return Err(UnitdError::configuration("pool has no processes"));
        }
        for member in &self.processes {
            member.spec.validate()?;
        }
        Ok(())
    }
}
