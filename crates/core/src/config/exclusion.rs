//! Excluded module/function patterns
//!
//! Patterns are globs (`*` matches any run, `?` one character), matched
//! case-insensitively against the whole name.

use regex::RegexSet;

use crate::hooks::TargetDescriptor;

use super::{ConfigError, ConfigResult, OrchestratorConfig};

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("(?i)^");
    let mut literal = String::new();
    for c in glob.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

fn compile(patterns: &[String]) -> ConfigResult<RegexSet> {
    RegexSet::new(patterns.iter().map(|p| glob_to_regex(p.trim()))).map_err(ConfigError::Pattern)
}

/// Compiled exclusion patterns
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    modules: RegexSet,
    functions: RegexSet,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self {
            modules: RegexSet::empty(),
            functions: RegexSet::empty(),
        }
    }
}

impl ExclusionSet {
    pub fn new(modules: &[String], functions: &[String]) -> ConfigResult<Self> {
        Ok(Self {
            modules: compile(modules)?,
            functions: compile(functions)?,
        })
    }

    pub fn from_config(config: &OrchestratorConfig) -> ConfigResult<Self> {
        Self::new(&config.excluded_modules, &config.excluded_functions)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.functions.is_empty()
    }

    /// Whether registering a hook on `target` is refused
    ///
    /// Address targets carry no names and are never excluded.
    pub fn excludes(&self, target: &TargetDescriptor) -> bool {
        match target {
            TargetDescriptor::Symbol { module, function } => {
                self.modules.is_match(module) || self.functions.is_match(function)
            }
            TargetDescriptor::Address { .. } => false,
        }
    }
}
