//! Language definitions for compilation and execution

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::sandbox::sanitize::sanitize_str;

/// Substitution point for compiler options in `compile_command`
pub const OPTIONS_PLACEHOLDER: &str = "%s";

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageSpec {
    /// Registry key (e.g., "cpp")
    pub id: String,
    /// Display name (e.g., "C++ (GCC 12)")
    pub name: String,
    /// Name of the source file inside the box (e.g., "main.cpp")
    pub source_file: String,
    /// Bash script body with one `%s` for compiler options; `None` for
    /// interpreted languages
    pub compile_command: Option<String>,
    /// Bash script body that starts the program
    pub run_command: String,
}

impl LanguageSpec {
    /// Render `compile.sh` with sanitized options substituted exactly once.
    pub fn compile_script(&self, compiler_options: &str) -> Option<String> {
        let template = self.compile_command.as_ref()?;
        let options = sanitize_str(compiler_options);
        Some(template.replacen(OPTIONS_PLACEHOLDER, &options, 1))
    }

    /// Render `run.sh`, appending sanitized command-line arguments.
    pub fn run_script(&self, command_line_arguments: &str) -> String {
        let args = sanitize_str(command_line_arguments);
        if args.is_empty() {
            self.run_command.clone()
        } else {
            format!("{} {}", self.run_command.trim_end(), args)
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    #[serde(default)]
    name: Option<String>,
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Read-only lookup table of language definitions
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageSpec>>,
}

impl LanguageRegistry {
    /// Languages shipped with the engine
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;
        let mut languages = HashMap::new();

        for (id, raw) in raw_configs {
            if let Some(cmd) = &raw.compile_command {
                let points = cmd.matches(OPTIONS_PLACEHOLDER).count();
                if points != 1 {
                    anyhow::bail!(
                        "compile_command for {} must contain exactly one {}, found {}",
                        id,
                        OPTIONS_PLACEHOLDER,
                        points
                    );
                }
            }
            if raw.source_file.contains('/') || raw.source_file.is_empty() {
                anyhow::bail!("Invalid source_file for {}: {:?}", id, raw.source_file);
            }

            let spec = Arc::new(LanguageSpec {
                name: raw.name.unwrap_or_else(|| id.clone()),
                id: id.to_lowercase(),
                source_file: raw.source_file,
                compile_command: raw.compile_command,
                run_command: raw.run_command,
            });

            languages.insert(id.to_lowercase(), Arc::clone(&spec));
            for alias in raw.aliases {
                languages.insert(alias.to_lowercase(), Arc::clone(&spec));
            }
        }

        Ok(Self { languages })
    }

    /// Get language configuration by name or alias
    pub fn get(&self, language: &str) -> Option<Arc<LanguageSpec>> {
        self.languages.get(&language.to_lowercase()).cloned()
    }

    /// Get all supported language names, aliases included
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.languages.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[c]
name = "C (GCC)"
source_file = "main.c"
compile_command = "gcc %s -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
run_command = "python3 main.py"
aliases = ["py", "python3"]
"#;

    #[test]
    fn test_load_languages() {
        let registry = LanguageRegistry::from_toml_str(CONFIG).unwrap();

        let c = registry.get("C").unwrap();
        assert_eq!(c.source_file, "main.c");
        assert_eq!(c.name, "C (GCC)");

        let py = registry.get("py").unwrap();
        assert_eq!(py.id, "python");
        assert!(py.compile_command.is_none());
        assert!(registry.get("cobol").is_none());
    }

    #[test]
    fn test_compile_script_substitutes_sanitized_options_once() {
        let registry = LanguageRegistry::from_toml_str(CONFIG).unwrap();
        let c = registry.get("c").unwrap();

        assert_eq!(
            c.compile_script("-Wall -O2").as_deref(),
            Some("gcc -Wall -O2 -o main main.c")
        );
        assert_eq!(
            c.compile_script("-O2; rm -rf /").as_deref(),
            Some("gcc -O2 rm -rf / -o main main.c")
        );
        assert_eq!(
            c.compile_script("%s").as_deref(),
            Some("gcc %s -o main main.c")
        );
    }

    #[test]
    fn test_run_script_appends_sanitized_arguments() {
        let registry = LanguageRegistry::from_toml_str(CONFIG).unwrap();
        let py = registry.get("python").unwrap();

        assert_eq!(py.run_script(""), "python3 main.py");
        assert_eq!(py.run_script("--fast `reboot`"), "python3 main.py --fast reboot");
        assert!(py.compile_script("-O2").is_none());
    }

    #[test]
    fn test_template_needs_one_placeholder() {
        let bad = r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"
"#;
        assert!(LanguageRegistry::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_builtin_languages_parse() {
        let registry = LanguageRegistry::builtin().unwrap();
        for id in ["c", "cpp", "python", "java", "rust", "go"] {
            assert!(registry.get(id).is_some(), "{} missing", id);
        }
    }
}
