//! Compiler configuration
//!
//! Loaded from TOML; every field is optional and falls back to its default:
//!
//! ```toml
//! top_name = "main"
//! emit_metadata = true
//! emit_positions = true
//! format = "json"
//! output = "build/design.futil"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CompileError, CompileResult};

/// How the netlist is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Name of the root component
    pub top_name: String,
    /// Emit the metadata table mapping positions to source statements
    pub emit_metadata: bool,
    /// Annotate leaf control nodes with `@pos`
    pub emit_positions: bool,
    pub format: OutputFormat,
    /// Stop after type checking
    pub check_only: bool,
    /// Output path; standard output when absent
    pub output: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            top_name: "main".to_string(),
            emit_metadata: true,
            emit_positions: true,
            format: OutputFormat::Text,
            check_only: false,
            output: None,
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(source: &str) -> CompileResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| CompileError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CompileResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            CompileError::config(format!("cannot read `{}`: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> CompileResult<()> {
        let valid = self
            .top_name
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && self
                .top_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(CompileError::config(format!(
                "`{}` is not a valid component name",
                self.top_name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::from_toml_str("").unwrap();
        assert_eq!(config, CompilerConfig::default());
        assert_eq!(config.top_name, "main");
        assert!(config.emit_metadata);
    }

    #[test]
    fn test_partial_override() {
        let config = CompilerConfig::from_toml_str(
            r#"
            top_name = "kernel"
            emit_metadata = false
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.top_name, "kernel");
        assert!(!config.emit_metadata);
        assert!(config.emit_positions);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            CompilerConfig::from_toml_str("top_nme = \"x\""),
            Err(CompileError::Config { .. })
        ));
        assert!(matches!(
            CompilerConfig::from_toml_str("top_name = \"1bad\""),
            Err(CompileError::Config { .. })
        ));
        assert!(matches!(
            CompilerConfig::from_toml_str("format = \"verilog\""),
            Err(CompileError::Config { .. })
        ));
    }
}
