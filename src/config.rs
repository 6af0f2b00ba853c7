//! Service configuration.
//!
//! Values are fixed once the service starts. The CLI fills them from flags and
//! `CLANGAROO_*` environment variables; everything else uses the defaults here.

use anyhow::{bail, Result};
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hierarchy::TraversalLimits;
use crate::workspace::{content_hash, find_compile_commands, normalize_path};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_AI_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_AI_COST_LIMIT: f64 = 10.0;
pub const DEFAULT_WARMUP_LIMIT: usize = 20;
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const MAX_RESTART_LIMIT: u32 = 10;
const AI_TTL_RANGE_DAYS: std::ops::RangeInclusive<u64> = 7..=14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    #[default]
    Summary,
    Detailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContextDepth {
    Minimal,
    #[default]
    Local,
    Full,
}

impl AnalysisDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisDepth::Summary => "summary",
            AnalysisDepth::Detailed => "detailed",
        }
    }
}

impl ContextDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextDepth::Minimal => "minimal",
            ContextDepth::Local => "local",
            ContextDepth::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub enabled: bool,
    pub cost_limit_monthly: f64,
    pub cache_ttl: Duration,
    pub analysis_depth: AnalysisDepth,
    pub context_depth: ContextDepth,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cost_limit_monthly: DEFAULT_AI_COST_LIMIT,
            cache_ttl: DEFAULT_AI_CACHE_TTL,
            analysis_depth: AnalysisDepth::default(),
            context_depth: ContextDepth::default(),
        }
    }
}

/// Engine background-index handling at startup.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Open a few central files right after the handshake.
    pub warmup: bool,
    pub warmup_limit: usize,
    /// Hold `start` until the first indexing run ends or `timeout` passes.
    pub wait: bool,
    pub timeout: Duration,
    /// Where clangd keeps its index (`XDG_CACHE_HOME` of the engine process).
    pub dir: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            warmup: false,
            warmup_limit: DEFAULT_WARMUP_LIMIT,
            wait: false,
            timeout: DEFAULT_INDEX_TIMEOUT,
            dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    /// Engine binary; a bare name is resolved on `PATH` at spawn time.
    pub clangd_path: PathBuf,
    /// Directory holding `compile_commands.json`, if one was found.
    pub compile_commands_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub shutdown_grace: Duration,
    pub hierarchy: TraversalLimits,
    pub max_open_documents: usize,
    pub references_limit: usize,
    /// Candidate files scanned by the structural search and the textual tier.
    pub max_scan_files: usize,
    pub watch_files: bool,
    pub index: IndexConfig,
    pub ai: AiConfig,
}

impl Config {
    /// Defaults for a project, with the build configuration discovered on disk.
    pub fn for_project(root: &Path) -> Self {
        let project_root = root.to_path_buf();
        Self {
            compile_commands_dir: find_compile_commands(&project_root),
            cache_dir: default_cache_dir(&project_root),
            project_root,
            clangd_path: PathBuf::from("clangd"),
            cache_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            hierarchy: TraversalLimits::default(),
            max_open_documents: 50,
            references_limit: 150,
            max_scan_files: 500,
            watch_files: true,
            index: IndexConfig::default(),
            ai: AiConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.project_root.is_dir() {
            bail!(
                "project root {} is not a directory",
                self.project_root.display()
            );
        }
        if self.request_timeout.is_zero() || self.startup_timeout.is_zero() {
            bail!("request and startup timeouts must be positive");
        }
        if self.max_restarts > MAX_RESTART_LIMIT {
            bail!(
                "restart limit {} exceeds the maximum of {MAX_RESTART_LIMIT}",
                self.max_restarts
            );
        }
        if self.max_open_documents == 0 {
            bail!("max open documents must be at least 1");
        }
        if self.index.warmup_limit == 0 {
            bail!("warmup file limit must be at least 1");
        }
        if self.index.timeout.is_zero() {
            bail!("index timeout must be positive");
        }
        if let Some(dir) = self.index.dir.as_deref().filter(|dir| dir.exists()) {
            if !dir.is_dir() {
                bail!("index path {} is not a directory", dir.display());
            }
        }
        if self.ai.cost_limit_monthly < 0.0 || !self.ai.cost_limit_monthly.is_finite() {
            bail!("AI cost limit must be a non-negative amount");
        }
        self.hierarchy.validate()?;

        let ai_days = self.ai.cache_ttl.as_secs() / (24 * 60 * 60);
        if self.ai.enabled && !AI_TTL_RANGE_DAYS.contains(&ai_days) {
            warn!("AI cache TTL of {ai_days} days is outside the usual 7-14 day range");
        }
        if self.hierarchy.max_nodes > 500 {
            warn!(
                "hierarchy node cap {} is large and may slow down queries",
                self.hierarchy.max_nodes
            );
        }
        Ok(())
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_dir.join("cache.db")
    }
}

/// `~/.cache/clangaroo/<project-hash>`, one directory per project root.
pub fn default_cache_dir(root: &Path) -> PathBuf {
    let key = content_hash(normalize_path(root).as_bytes());
    dirs::cache_dir()
        .unwrap_or_else(|| root.join(".cache"))
        .join("clangaroo")
        .join(&key[..16])
}
