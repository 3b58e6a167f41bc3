//! Deterministic search for the engine binary or native library.

use crate::config::EngineConfig;
use crate::constants::env as env_names;
use crate::engine::ErrorContext;
use crate::error::EngineResult;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX, EXE_SUFFIX};
use std::path::{Path, PathBuf};
use tracing::debug;

const ENGINE_CACHE_DIR: &str = "/tmp/prisma-engines";
const GENERATED_CLIENT_DIR: &str = ".prisma/client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Binary,
    Library,
}

impl ArtifactKind {
    pub fn file_name(&self, platform: &str) -> String {
        match self {
            Self::Binary => format!("query-engine-{platform}{EXE_SUFFIX}"),
            Self::Library => format!("{DLL_PREFIX}query_engine-{platform}{DLL_SUFFIX}"),
        }
    }

    fn override_env(&self) -> &'static str {
        match self {
            Self::Binary => env_names::BINARY_PATH,
            Self::Library => env_names::LIBRARY_PATH,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Library => "library",
        }
    }
}

/// Explicit artifact path from the environment or configuration
fn override_path(config: &EngineConfig, kind: ArtifactKind) -> Option<PathBuf> {
    std::env::var_os(kind.override_env())
        .map(PathBuf::from)
        .or_else(|| config.prisma_path.clone())
}

/// Directories searched, in order, when no override is set
pub fn search_directories(config: &EngineConfig) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(output) = config.generator.as_ref().and_then(|g| g.output.clone()) {
        dirs.push(output);
    }
    dirs.push(config.cwd.join("node_modules").join(GENERATED_CLIENT_DIR));
    if let Some(dirname) = &config.dirname {
        dirs.push(dirname.clone());
        if let Some(parent) = dirname.parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    if let Some(datamodel_dir) = config.datamodel_dir() {
        if !datamodel_dir.as_os_str().is_empty() {
            dirs.push(datamodel_dir);
        }
    }
    dirs.push(config.cwd.clone());
    dirs.push(PathBuf::from(ENGINE_CACHE_DIR));

    let mut seen = Vec::with_capacity(dirs.len());
    dirs.retain(|dir| {
        if seen.contains(dir) {
            false
        } else {
            seen.push(dir.clone());
            true
        }
    });
    dirs
}

/// Locate the engine artifact for the configured platform
pub fn locate_engine(
    config: &EngineConfig,
    kind: ArtifactKind,
    context: &ErrorContext,
) -> EngineResult<PathBuf> {
    if let Some(path) = override_path(config, kind) {
        if path.is_file() {
            debug!(path = %path.display(), "using engine {} override", kind.label());
            return Ok(path);
        }
        return Err(context.initialization(not_found_message(config, kind, &[path]), None));
    }

    let file_name = kind.file_name(&config.platform);
    let candidates: Vec<PathBuf> = search_directories(config)
        .into_iter()
        .map(|dir| dir.join(&file_name))
        .collect();

    match candidates.iter().find(|candidate| candidate.is_file()) {
        Some(found) => {
            debug!(path = %found.display(), "found engine {}", kind.label());
            Ok(found.clone())
        }
        None => Err(context.initialization(not_found_message(config, kind, &candidates), None)),
    }
}

fn not_found_message(config: &EngineConfig, kind: ArtifactKind, searched: &[PathBuf]) -> String {
    let platform = &config.platform;
    let mut message = format!(
        "Query engine {} for current platform \"{platform}\" could not be found.\n\
         This probably happens because the client was generated for a different platform.\n\n\
         Searched Locations:\n\n",
        kind.label()
    );
    for location in searched {
        message.push_str(&format!("  {}\n", display(location)));
    }
    message.push('\n');
    message.push_str(&binary_targets_hint(config));
    message
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn binary_targets_hint(config: &EngineConfig) -> String {
    let platform = &config.platform;
    let targets = config.binary_targets();

    if targets.iter().any(|t| t == platform || t == "native") {
        return format!(
            "You already added the platform \"{platform}\" to the \"binaryTargets\" of the \
             generator, but the engine was not found. Regenerate the client and make sure the \
             engine files are deployed alongside it.\n"
        );
    }

    let provider = config
        .generator
        .as_ref()
        .map(|g| g.provider.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("prisma-client-js");
    let mut suggested: Vec<String> = if targets.is_empty() {
        vec!["\"native\"".to_string()]
    } else {
        targets.iter().map(|t| format!("\"{t}\"")).collect()
    };
    suggested.push(format!("\"{platform}\""));

    format!(
        "To solve this problem, add the platform \"{platform}\" to the \"binaryTargets\" \
         attribute in the \"generator\" block in the \"schema.prisma\" file:\n\
         generator client {{\n  provider      = \"{provider}\"\n  binaryTargets = [{}]\n}}\n\n\
         Then regenerate the client so the engine for that platform is included.\n",
        suggested.join(", ")
    )
}
