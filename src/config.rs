//! Static configuration, loaded once at process start.

use crate::{
    catalog::TaskCatalog,
    enums::SortBy,
    error::{PipelineError, Result},
    runner::CommandSpec,
    volume_builder::DEFAULT_VOLUME_FILE_NAME,
};

use serde::Deserialize;
use std::{fs, path::Path};
use tracing::info;

/// How to launch one segmentation tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    /// Arguments placed before the generated ones, e.g. for a wrapper script.
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).args(&self.prefix_args)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub skellytour: ToolCommand,
    pub totalsegmentator: ToolCommand,
    pub volume_file_name: String,
    pub sort_by: SortBy,
    pub catalog: TaskCatalog,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skellytour: ToolCommand::new("skellytour"),
            totalsegmentator: ToolCommand::new("TotalSegmentator"),
            volume_file_name: DEFAULT_VOLUME_FILE_NAME.to_string(),
            sort_by: SortBy::default(),
            catalog: TaskCatalog::default(),
        }
    }
}

/// A tool table as written in the file. Keys left out keep the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ToolTable {
    program: Option<String>,
    prefix_args: Option<Vec<String>>,
}

impl ToolTable {
    fn apply(self, tool: &mut ToolCommand) {
        if let Some(program) = self.program {
            tool.program = program;
        }
        if let Some(prefix_args) = self.prefix_args {
            tool.prefix_args = prefix_args;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    skellytour: ToolTable,
    totalsegmentator: ToolTable,
    volume_file_name: Option<String>,
    sort_by: Option<SortBy>,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;

        let mut config = Self::default();
        file.skellytour.apply(&mut config.skellytour);
        file.totalsegmentator.apply(&mut config.totalsegmentator);
        if let Some(volume_file_name) = file.volume_file_name {
            config.volume_file_name = volume_file_name;
        }
        if let Some(sort_by) = file.sort_by {
            config.sort_by = sort_by;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.skellytour.program.trim().is_empty() {
            return Err(PipelineError::Config("skellytour.program is empty".into()));
        }
        if self.totalsegmentator.program.trim().is_empty() {
            return Err(PipelineError::Config("totalsegmentator.program is empty".into()));
        }
        let name = Path::new(&self.volume_file_name);
        if name.file_name().map(|n| n != name.as_os_str()).unwrap_or(true) {
            return Err(PipelineError::Config(format!(
                "volume_file_name must be a bare file name, got '{}'",
                self.volume_file_name
            )));
        }
        Ok(())
    }
}
