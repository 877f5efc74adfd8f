//! Compiled contract artifacts.
//!
//! The resolver only needs an ABI and creation bytecode per contract name.
//! Artifacts are read from a build output directory (Hardhat or Foundry JSON)
//! or registered in memory by tests.
//!
//! Build trees often hold several `<Name>.json` files for one name (interfaces,
//! dependencies). The copy compiled from `<Name>.sol` wins; any other tie is
//! an error rather than a guess.

use crate::error::{HarnessError, Result};
use ethers::abi::Abi;
use ethers::types::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// ABI and creation bytecode of one contract
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Contract name
    pub name: String,
    /// Contract interface
    pub abi: Abi,
    /// Creation bytecode (constructor arguments are appended at deploy time)
    pub bytecode: Bytes,
}

/// Source of compiled artifacts
pub trait ArtifactSource: Send + Sync {
    /// Look up the artifact for `name`
    fn artifact(&self, name: &str) -> Result<Artifact>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BytecodeField {
    /// Hardhat: `"bytecode": "0x..."`
    Hex(Bytes),
    /// Foundry: `"bytecode": { "object": "0x..." }`
    Object { object: Bytes },
}

#[derive(Deserialize)]
struct ArtifactFile {
    abi: Abi,
    bytecode: BytecodeField,
}

impl ArtifactFile {
    fn into_artifact(self, name: &str) -> Artifact {
        let bytecode = match self.bytecode {
            BytecodeField::Hex(code) => code,
            BytecodeField::Object { object } => object,
        };
        Artifact {
            name: name.to_string(),
            abi: self.abi,
            bytecode,
        }
    }
}

/// Parse a Hardhat or Foundry artifact JSON document
pub fn parse_artifact(name: &str, json: &str) -> Result<Artifact> {
    let file: ArtifactFile = serde_json::from_str(json)?;
    let artifact = file.into_artifact(name);
    if artifact.bytecode.is_empty() {
        return Err(HarnessError::ArtifactNotFound(format!(
            "{} has no creation bytecode (abstract contract or interface?)",
            name
        )));
    }
    Ok(artifact)
}

/// Artifacts read from a build output directory, searched recursively for `<Name>.json`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every `<name>.json` below the root, in file-name order
    fn candidates(&self, name: &str) -> Result<Vec<PathBuf>> {
        let file_name = format!("{}.json", name);
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() && entry.file_name().to_str() == Some(file_name.as_str()) {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }

    fn find(&self, name: &str) -> Result<PathBuf> {
        let mut found = self.candidates(name)?;

        let source_dir = format!("{}.sol", name);
        if found.iter().any(|path| compiled_from(path, &source_dir)) {
            found.retain(|path| compiled_from(path, &source_dir));
        }

        match found.len() {
            0 => Err(HarnessError::ArtifactNotFound(name.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(HarnessError::AmbiguousArtifact {
                name: name.to_string(),
                paths: found.iter().map(|p| p.display().to_string()).collect(),
            }),
        }
    }
}

fn compiled_from(path: &Path, source_dir: &str) -> bool {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|dir| dir.to_str())
        == Some(source_dir)
}

impl ArtifactSource for FsArtifactStore {
    fn artifact(&self, name: &str) -> Result<Artifact> {
        let path = self.find(name)?;

        debug!("Loading artifact {} from {}", name, path.display());
        let content = std::fs::read_to_string(&path)?;
        parse_artifact(name, &content)
    }
}

/// Artifacts held in memory
#[derive(Default)]
pub struct InMemoryArtifacts {
    artifacts: HashMap<String, Artifact>,
}

impl InMemoryArtifacts {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact under `name`
    pub fn with_artifact(mut self, name: impl Into<String>, abi: Abi, bytecode: Bytes) -> Self {
        let name = name.into();
        self.artifacts.insert(
            name.clone(),
            Artifact {
                name,
                abi,
                bytecode,
            },
        );
        self
    }
}

impl ArtifactSource for InMemoryArtifacts {
    fn artifact(&self, name: &str) -> Result<Artifact> {
        self.artifacts
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::ArtifactNotFound(name.to_string()))
    }
}
