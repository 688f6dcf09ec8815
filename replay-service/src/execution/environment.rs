// Environment Composition
// Derives the per-cell environment overlay and runtime command prefix

use crate::config::models::Cell;
use crate::runners::runtime::{RuntimeResolver, RuntimeSwitch};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Variable pointing the dependency manager at a cell's manifest
pub const MANIFEST_VAR: &str = "BUNDLE_GEMFILE";

/// Variables set on top of, or removed from, the inherited process environment
///
/// Overlays are handed to each command invocation; the process environment
/// itself is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    vars: BTreeMap<String, String>,
    removed: BTreeSet<String>,
}

impl EnvironmentOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.removed.remove(&name);
        self.vars.insert(name, value.into());
    }

    /// Set `name` unless the overlay already defines it
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.vars.contains_key(&name) {
            self.set(name, value);
        }
    }

    /// Hide an inherited variable from the command
    pub fn unset(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.vars.remove(&name);
        self.removed.insert(name);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    /// Shell assignments for the variables this overlay sets, e.g. `A=1 B='x y'`
    pub fn to_assignments(&self) -> String {
        self.vars
            .iter()
            .map(|(name, value)| format!("{}={}", name, shell_words::quote(value)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Environment a cell runs with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedEnvironment {
    pub overlay: EnvironmentOverlay,
    /// Prepended to every command, e.g. `rvm 2.0.0 do `
    pub command_prefix: Option<String>,
}

impl ComposedEnvironment {
    pub fn prefix(&self) -> &str {
        self.command_prefix.as_deref().unwrap_or("")
    }
}

/// Result of composing a cell's environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    Ready(ComposedEnvironment),
    /// The requested runtime version cannot be activated
    MissingRuntime { version: String },
}

/// Parse `NAME=value` assignments from an environment string
///
/// Words are split like a shell would, so `FOO='bar baz'` keeps its space.
/// Words that are not assignments are skipped. Unbalanced quoting falls back
/// to splitting on whitespace.
pub fn parse_assignments(env: &str) -> Vec<(String, String)> {
    let words = shell_words::split(env).unwrap_or_else(|e| {
        tracing::warn!(env, error = %e, "unbalanced quoting in env, splitting on whitespace");
        env.split_whitespace().map(str::to_string).collect()
    });

    words
        .into_iter()
        .filter_map(|word| match word.split_once('=') {
            Some((name, value)) if !name.is_empty() => Some((name.to_string(), value.to_string())),
            _ => {
                tracing::warn!(word = %word, "skipping env entry that is not an assignment");
                None
            }
        })
        .collect()
}

/// Composer for per-cell environments
#[derive(Clone)]
pub struct EnvironmentComposer {
    resolver: Arc<dyn RuntimeResolver>,
    working_dir: PathBuf,
    rerun: bool,
}

impl EnvironmentComposer {
    pub fn new(resolver: Arc<dyn RuntimeResolver>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            resolver,
            working_dir: working_dir.into(),
            rerun: false,
        }
    }

    /// Compose for a copy-pasteable rerun line: manifest paths become absolute
    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    /// Compose the environment for one cell
    ///
    /// Assignments from the `env` string come first, the manifest pointer
    /// overrides them, and variables from runtime activation only fill names
    /// that are still unset.
    pub async fn compose(&self, cell: &Cell) -> Composition {
        let mut composed = ComposedEnvironment::default();

        if let Some(env) = cell.env() {
            for (name, value) in parse_assignments(&env) {
                composed.overlay.set(name, value);
            }
        }

        if let Some(gemfile) = cell.gemfile() {
            let gemfile = if self.rerun {
                self.working_dir.join(&gemfile).display().to_string()
            } else {
                gemfile
            };
            composed.overlay.set(MANIFEST_VAR, gemfile);
        }

        let version = cell.rvm();
        match self.resolver.resolve(version.as_deref()).await {
            RuntimeSwitch::Unset => {}
            RuntimeSwitch::CommandPrefix(prefix) => composed.command_prefix = Some(prefix),
            RuntimeSwitch::EnvOverlay(vars) => {
                for (name, value) in vars {
                    composed.overlay.set_default(name, value);
                }
            }
            RuntimeSwitch::Unavailable => {
                return Composition::MissingRuntime {
                    version: version.unwrap_or_default(),
                };
            }
        }

        Composition::Ready(composed)
    }
}
