//! Saved programs, one per target guid
//!
//! The state is a flat ordered list and serializes to a single JSON array.
//! Unknown fields are ignored and missing fields default, so older and newer
//! state files load without a schema version.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgramStateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid program state JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The script stored for one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(rename = "Guid", default)]
    pub guid: String,
    /// Opaque serialized script
    #[serde(rename = "Code", default)]
    pub code: Option<String>,
    /// Opaque serialized variable mapping
    #[serde(rename = "VarMap", default)]
    pub var_map: Option<String>,
}

impl Program {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            code: None,
            var_map: None,
        }
    }
}

/// Ordered list of programs with at most one entry per guid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProgramState {
    programs: Vec<Program>,
}

/// Later duplicates of a guid are dropped
impl From<Vec<Program>> for ProgramState {
    fn from(programs: Vec<Program>) -> Self {
        let mut state = ProgramState::new();
        for program in programs {
            if state.find(&program.guid).is_none() {
                state.programs.push(program);
            }
        }
        state
    }
}

impl<'de> Deserialize<'de> for ProgramState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Program>::deserialize(deserializer).map(ProgramState::from)
    }
}

impl ProgramState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the program for `guid`, appending an empty one if none exists
    pub fn get_program(&mut self, guid: &str) -> &mut Program {
        let index = match self.programs.iter().position(|p| p.guid == guid) {
            Some(index) => index,
            None => {
                self.programs.push(Program::new(guid));
                self.programs.len() - 1
            }
        };
        &mut self.programs[index]
    }

    /// Lookup without creating
    pub fn find(&self, guid: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.guid == guid)
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ProgramStateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a state document. Later duplicates of a guid are dropped.
    pub fn from_json(json: &str) -> Result<Self, ProgramStateError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProgramStateError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Write the state, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProgramStateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
