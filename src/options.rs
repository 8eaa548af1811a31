use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CompileResult;

/// Where data-parallel execution may be requested by lowered code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ParallelizationOption {
    None,
    InInitializingArray,
    #[default]
    InParallelSpecifiedCode,
    All,
}

impl ParallelizationOption {
    /// `parallel for` / `parallel each` fan out.
    pub fn parallel_code(&self) -> bool {
        matches!(
            self,
            ParallelizationOption::InParallelSpecifiedCode | ParallelizationOption::All
        )
    }

    /// Nested array elements are allocated in parallel.
    pub fn parallel_array_initialization(&self) -> bool {
        matches!(
            self,
            ParallelizationOption::InInitializingArray | ParallelizationOption::All
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CompileOptions {
    pub add_unique_no_to_variable: bool,
    pub use_builtin_methods: bool,
    pub prohibit_overloading_of_variable: bool,
    pub parallelization_option: ParallelizationOption,
    pub optimize: bool,
    pub cache_stages: bool,
    pub cache_parameters: bool,
    pub name_space_name: String,
    pub class_name: String,
    pub generate_in_memory: bool,
    pub output_assembly: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            add_unique_no_to_variable: true,
            use_builtin_methods: true,
            prohibit_overloading_of_variable: false,
            parallelization_option: ParallelizationOption::default(),
            optimize: true,
            cache_stages: true,
            cache_parameters: true,
            name_space_name: "__N1".to_string(),
            class_name: "__C1".to_string(),
            generate_in_memory: true,
            output_assembly: None,
        }
    }
}

impl CompileOptions {
    pub fn from_json_str(json: &str) -> CompileResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CompileResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Output file for the lowered listing, if the options ask for one.
    pub fn output_path(&self) -> Option<&Path> {
        if self.generate_in_memory {
            None
        } else {
            self.output_assembly.as_deref()
        }
    }

    /// Fully qualified name of the lowered program.
    pub fn program_name(&self) -> String {
        format!("{}.{}", self.name_space_name, self.class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert!(options.add_unique_no_to_variable);
        assert!(options.use_builtin_methods);
        assert!(!options.prohibit_overloading_of_variable);
        assert_eq!(
            options.parallelization_option,
            ParallelizationOption::InParallelSpecifiedCode
        );
        assert!(options.cache_stages && options.cache_parameters && options.optimize);
        assert_eq!(options.program_name(), "__N1.__C1");
        assert!(options.output_path().is_none());
    }

    #[test]
    fn test_parallelization_flags() {
        assert!(!ParallelizationOption::None.parallel_code());
        assert!(!ParallelizationOption::None.parallel_array_initialization());
        assert!(ParallelizationOption::InInitializingArray.parallel_array_initialization());
        assert!(!ParallelizationOption::InInitializingArray.parallel_code());
        assert!(ParallelizationOption::All.parallel_code());
        assert!(ParallelizationOption::All.parallel_array_initialization());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options = CompileOptions::from_json_str(
            r#"{ "CacheStages": false, "ParallelizationOption": "None", "ClassName": "Sim" }"#,
        )
        .unwrap();
        assert!(!options.cache_stages);
        assert_eq!(options.parallelization_option, ParallelizationOption::None);
        assert_eq!(options.class_name, "Sim");
        assert!(options.cache_parameters);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let result = CompileOptions::from_json_str("{ \"Optimize\": 3 }");
        assert!(matches!(result, Err(CompileError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "GenerateInMemory": false, "OutputAssembly": "out.txt" }}"#
        )
        .unwrap();
        let options = CompileOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.output_path(), Some(Path::new("out.txt")));
    }
}
