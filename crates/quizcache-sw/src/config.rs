//! Worker configuration

use std::path::Path;

use quizcache_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::{Origin, Url};

/// Offline cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Current cache generation. Bumping it makes the next activation
    /// delete every older generation.
    pub cache_name: String,

    /// Base URL relative assets are resolved against.
    pub scope: String,

    /// Page served to document navigations when the network is down.
    pub shell_page: String,

    /// Assets to precache, in order.
    pub assets: Vec<String>,

    /// Origins whose assets are precached best-effort.
    pub best_effort_origins: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: "drone-quiz-v1".to_string(),
            scope: "http://localhost/".to_string(),
            shell_page: "./drone_quiz.html".to_string(),
            assets: vec![
                "./drone_quiz.html".to_string(),
                "./manifest.json".to_string(),
                "./icon-192.png".to_string(),
                "./icon-512.png".to_string(),
                "https://fonts.googleapis.com/css2?family=Noto+Sans+JP:wght@300;400;500;700;900&family=Space+Mono:wght@400;700&display=swap".to_string(),
            ],
            best_effort_origins: vec!["https://fonts.googleapis.com".to_string()],
        }
    }
}

/// Resolved precache plan.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetPlan {
    /// Must all be stored for install to succeed.
    pub required: Vec<Url>,
    /// Attempted one by one; failures are ignored.
    pub best_effort: Vec<Url>,
    /// Offline fallback for navigations.
    pub shell: Url,
}

impl WorkerConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config_with_source("invalid worker config", e))
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json(&raw)
    }

    /// Same config with `scope` replaced.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Parsed scope URL.
    pub fn scope_url(&self) -> Result<Url> {
        let scope = Url::parse(&self.scope)
            .map_err(|e| Error::config_with_source(format!("invalid scope '{}'", self.scope), e))?;
        if !matches!(scope.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "scope must be http(s), got '{}'",
                scope.scheme()
            )));
        }
        Ok(scope)
    }

    /// Resolve an asset locator against the scope.
    pub fn resolve(&self, locator: &str) -> Result<Url> {
        self.scope_url()?
            .join(locator)
            .map_err(|e| Error::config_with_source(format!("invalid asset '{locator}'"), e))
    }

    fn best_effort_origins(&self) -> Result<Vec<Origin>> {
        self.best_effort_origins
            .iter()
            .map(|o| {
                Url::parse(o)
                    .map(|u| u.origin())
                    .map_err(|e| Error::config_with_source(format!("invalid origin '{o}'"), e))
            })
            .collect()
    }

    /// Validate the config and partition the assets.
    pub fn plan(&self) -> Result<AssetPlan> {
        if self.cache_name.trim().is_empty() {
            return Err(Error::config("cache_name must not be empty"));
        }

        let origins = self.best_effort_origins()?;
        let shell = self.resolve(&self.shell_page)?;

        let mut plan = AssetPlan {
            required: Vec::new(),
            best_effort: Vec::new(),
            shell,
        };

        for locator in &self.assets {
            let url = self.resolve(locator)?;
            if origins.contains(&url.origin()) {
                plan.best_effort.push(url);
            } else {
                plan.required.push(url);
            }
        }

        if !plan.required.contains(&plan.shell) {
            warn!(shell = %plan.shell, "Shell page is not a required asset; offline navigations may fail");
        }

        Ok(plan)
    }
}
