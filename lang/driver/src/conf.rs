use serde::{Deserialize, Serialize};
use std::path::Path;
use tabula_imp::Backend;
use tabula_utils::prelude::*;

/// Driver configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    /// One of "llvm", "llvm-mc", "llvm-cuda", "interp".
    pub backend: String,
    /// Emit `PassInfo` outputs for every pass.
    pub log_passes: bool,
}

impl Default for Conf {
    fn default() -> Self {
        Conf { backend: "llvm".to_string(), log_passes: false }
    }
}

impl Conf {
    pub fn load(path: &Path) -> Result<Conf> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::new(ErrKind::DataIOErr, e.to_string()))?;
        toml::from_str(&raw).map_err(|e| Error::new(ErrKind::DataIOErr, e.to_string()))
    }

    pub fn backend(&self) -> Result<Backend> {
        match self.backend.as_str() {
            | "llvm" => Ok(Backend::Llvm),
            | "llvm-mc" => Ok(Backend::LlvmMc),
            | "llvm-cuda" => Ok(Backend::LlvmCuda),
            | "interp" => Ok(Backend::Interp),
            | other => Err(Error::new(
                ErrKind::MiscErr,
                format!("unknown backend: {}", other),
            )),
        }
    }
}
