use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "host",
    "math",
    "json",
    "random",
    "itertools",
    "functools",
    "collections",
    "statistics",
    "time",
    "datetime",
    "re",
];

pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    r"__import__",
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bcompile\s*\(",
    r"\bopen\s*\(",
    r"\bsubprocess\b",
    r"\bimportlib\b",
];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid denied pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid policy file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("import of '{0}' is not allowed")]
    ModuleNotAllowed(String),
    #[error("code matches denied pattern {0:?}")]
    DeniedPattern(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    allowed_modules: Option<Vec<String>>,
    denied_patterns: Option<Vec<String>>,
}

/// Lexical gate applied to `execute` payloads before they are queued.
///
/// This is a best-effort filter over source text. It catches the obvious
/// cases and nothing more; it is not an isolation mechanism.
#[derive(Debug, Clone)]
pub struct WhitelistPolicy {
    allowed_modules: BTreeSet<String>,
    denied: Vec<(String, Regex)>,
}

impl WhitelistPolicy {
    pub fn new<M, P>(allowed_modules: M, denied_patterns: P) -> Result<Self, PolicyError>
    where
        M: IntoIterator,
        M::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let denied = denied_patterns
            .into_iter()
            .map(Into::into)
            .map(|pattern: String| match Regex::new(&pattern) {
                Ok(regex) => Ok((pattern, regex)),
                Err(source) => Err(PolicyError::Pattern { pattern, source }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed_modules: allowed_modules.into_iter().map(Into::into).collect(),
            denied,
        })
    }

    pub fn standard() -> Result<Self, PolicyError> {
        Self::new(
            DEFAULT_ALLOWED_MODULES.iter().copied(),
            DEFAULT_DENIED_PATTERNS.iter().copied(),
        )
    }

    /// No import restrictions and no denied patterns.
    pub fn permissive() -> Self {
        Self {
            allowed_modules: BTreeSet::new(),
            denied: Vec::new(),
        }
    }

    /// Fields left out of the file keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = toml::from_str(text)?;
        let allowed = file.allowed_modules.unwrap_or_else(|| {
            DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|module| (*module).to_owned())
                .collect()
        });
        let denied = file.denied_patterns.unwrap_or_else(|| {
            DEFAULT_DENIED_PATTERNS
                .iter()
                .map(|pattern| (*pattern).to_owned())
                .collect()
        });
        Self::new(allowed, denied)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }

    pub fn denied_patterns(&self) -> impl Iterator<Item = &str> {
        self.denied.iter().map(|(pattern, _)| pattern.as_str())
    }

    pub fn check(&self, code: &str) -> Result<(), Violation> {
        if let Some((pattern, _)) = self.denied.iter().find(|(_, regex)| regex.is_match(code)) {
            return Err(Violation::DeniedPattern(pattern.clone()));
        }
        if self.allowed_modules.is_empty() {
            return Ok(());
        }
        for module in imported_modules(code) {
            let root = module.split('.').next().unwrap_or_default();
            if root.is_empty() || !self.allowed_modules.contains(root) {
                return Err(Violation::ModuleNotAllowed(module));
            }
        }
        Ok(())
    }
}

fn imported_modules(code: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in code.lines() {
        let line = line.split('#').next().unwrap_or_default();
        for statement in line.split(';').map(str::trim) {
            if let Some(rest) = statement.strip_prefix("import ") {
                for name in rest.split(',') {
                    let name = name.split(" as ").next().unwrap_or_default().trim();
                    if !name.is_empty() {
                        modules.push(name.to_owned());
                    }
                }
            } else if let Some(rest) = statement.strip_prefix("from ") {
                let module = rest.split_whitespace().next().unwrap_or_default();
                if !module.is_empty() {
                    modules.push(module.to_owned());
                }
            }
        }
    }
    modules
}
