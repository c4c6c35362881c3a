//! Algorithm declarations, as far as data exchange needs them
//!
//! Only the typing information is read: which format every input and output
//! carries, and the result fields of analyzers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::json;

/// Type annotation of an input, output or result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    /// Data format name
    #[serde(rename = "type")]
    pub type_name: String,
}

/// One synchronization group of an algorithm
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDeclaration {
    /// Group name, if given
    #[serde(default)]
    pub name: Option<String>,

    /// Inputs of this group
    #[serde(default)]
    pub inputs: BTreeMap<String, Endpoint>,

    /// Outputs of this group
    #[serde(default)]
    pub outputs: BTreeMap<String, Endpoint>,
}

#[derive(Debug, Deserialize)]
struct RawDeclaration {
    #[serde(default)]
    groups: Vec<GroupDeclaration>,
    #[serde(default)]
    results: Option<BTreeMap<String, Endpoint>>,
}

/// Parsed algorithm declaration
#[derive(Debug, Clone)]
pub struct AlgorithmDeclaration {
    name: String,
    groups: Vec<GroupDeclaration>,
    results: Option<BTreeMap<String, Endpoint>>,
}

impl AlgorithmDeclaration {
    /// Path of an algorithm's declaration below `prefix`
    pub fn declaration_path(prefix: &Path, name: &str) -> PathBuf {
        prefix.join("algorithms").join(format!("{name}.json"))
    }

    /// Load the declaration of `name` from `<prefix>/algorithms/<name>.json`
    pub fn load(prefix: &Path, name: &str) -> Result<Self> {
        let path = Self::declaration_path(prefix, name);
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "algorithm declaration `{}'",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(name, &text)
    }

    /// Parse a declaration from its JSON text
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let value = json::parse_strict(text)?;
        let raw: RawDeclaration = serde_json::from_value(value)?;
        Ok(Self {
            name: name.to_owned(),
            groups: raw.groups,
            results: raw.results,
        })
    }

    /// Full algorithm name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared groups, in declaration order
    pub fn groups(&self) -> &[GroupDeclaration] {
        &self.groups
    }

    /// Whether this algorithm produces analysis results
    pub fn is_analyzer(&self) -> bool {
        self.results.is_some()
    }

    /// Result fields and their types, for analyzers
    pub fn results(&self) -> Option<Vec<(String, String)>> {
        self.results.as_ref().map(|results| {
            results
                .iter()
                .map(|(k, v)| (k.clone(), v.type_name.clone()))
                .collect()
        })
    }

    /// Format of a named input
    pub fn input_type(&self, input: &str) -> Option<&str> {
        self.groups
            .iter()
            .find_map(|g| g.inputs.get(input))
            .map(|e| e.type_name.as_str())
    }

    /// Format of a named output
    pub fn output_type(&self, output: &str) -> Option<&str> {
        self.groups
            .iter()
            .find_map(|g| g.outputs.get(output))
            .map(|e| e.type_name.as_str())
    }
}
