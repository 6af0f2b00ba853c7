//! CLI argument definitions using clap.
//!
//! Every service option can also be set through a `CLANGAROO_*` variable.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clangaroo::config::{AnalysisDepth, Config, ContextDepth};
use clangaroo::location::SymbolLocation;
use clangaroo::tiers::{AnalysisRequest, Operation, QueryOptions};
use clangaroo::workspace::{canonicalize_or_absolute, resolve_project};

#[derive(Parser, Debug)]
#[command(
    name = "clangaroo",
    version,
    about = "C/C++ code intelligence for AI assistants, fronting clangd"
)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Project root (auto-detected from compile_commands.json, CMakeLists.txt, .git/ etc. if not specified)
    #[arg(long, short = 'p', global = true, env = "CLANGAROO_PROJECT")]
    pub project: Option<PathBuf>,

    #[command(flatten)]
    pub options: ServiceArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the analysis tools over stdio (MCP)
    Serve,
    /// Inspect or clear the query cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Run a single query and print the JSON answer
    Query {
        /// Operation: definition, references, hover, incoming_calls, outgoing_calls,
        /// prepare_type_hierarchy, supertypes, subtypes, list_files, search_symbols,
        /// outline, signature
        #[arg(value_parser = parse_operation)]
        operation: Operation,
        /// Target file, with :line:column (1-based) for position queries, e.g. src/hello.cpp:5:10
        target: Option<PathBuf>,
        /// Symbol name to search for (search_symbols)
        #[arg(long)]
        query: Option<String>,
        /// Glob pattern for list_files and search_symbols, e.g. "src/**/*.cpp"
        #[arg(long)]
        pattern: Option<String>,
        /// Hierarchy depth (1-10)
        #[arg(long)]
        depth: Option<u32>,
        /// Leave the declaration out of references
        #[arg(long)]
        no_declaration: bool,
        /// Attach an AI summary when enrichment is configured
        #[arg(long)]
        summarize: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show entry counts, database size and hit rates
    Stats,
    /// Delete all cached answers and summaries
    Clear,
}

#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// clangd binary (looked up on PATH when not a path)
    #[arg(long, global = true, env = "CLANGAROO_CLANGD")]
    pub clangd: Option<PathBuf>,

    /// Directory holding compile_commands.json (auto-detected if not specified)
    #[arg(long, global = true, env = "CLANGAROO_COMPILE_COMMANDS_DIR")]
    pub compile_commands_dir: Option<PathBuf>,

    /// Cache directory (default: ~/.cache/clangaroo/<project-hash>)
    #[arg(long, global = true, env = "CLANGAROO_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Run without the persistent cache
    #[arg(long, global = true, env = "CLANGAROO_NO_CACHE")]
    pub no_cache: bool,

    /// Query cache lifetime in hours
    #[arg(long, global = true, env = "CLANGAROO_CACHE_TTL_HOURS")]
    pub cache_ttl_hours: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "CLANGAROO_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Engine startup and handshake timeout in seconds
    #[arg(long, global = true, env = "CLANGAROO_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<u64>,

    /// Engine restarts allowed before semantic analysis is disabled
    #[arg(long, global = true, env = "CLANGAROO_MAX_RESTARTS")]
    pub max_restarts: Option<u32>,

    /// Default call/type hierarchy depth
    #[arg(long, global = true, env = "CLANGAROO_HIERARCHY_DEPTH")]
    pub hierarchy_depth: Option<u32>,

    /// Maximum nodes in one hierarchy result
    #[arg(long, global = true, env = "CLANGAROO_HIERARCHY_MAX_NODES")]
    pub hierarchy_max_nodes: Option<usize>,

    /// Maximum expansions per hierarchy level
    #[arg(long, global = true, env = "CLANGAROO_HIERARCHY_MAX_PER_LEVEL")]
    pub hierarchy_max_per_level: Option<usize>,

    /// Maximum files the engine keeps open
    #[arg(long, global = true, env = "CLANGAROO_MAX_OPEN_DOCUMENTS")]
    pub max_open_documents: Option<usize>,

    /// Do not watch the project for changes
    #[arg(long, global = true, env = "CLANGAROO_NO_WATCH")]
    pub no_watch: bool,

    /// Open key project files right after clangd starts
    #[arg(long, global = true, env = "CLANGAROO_WARMUP")]
    pub warmup: bool,

    /// Files opened by --warmup
    #[arg(long, global = true, env = "CLANGAROO_WARMUP_LIMIT")]
    pub warmup_limit: Option<usize>,

    /// Wait for clangd's background index before answering
    #[arg(long, global = true, env = "CLANGAROO_WAIT_FOR_INDEX")]
    pub wait_for_index: bool,

    /// Longest wait for --wait-for-index, in seconds
    #[arg(long, global = true, env = "CLANGAROO_INDEX_TIMEOUT")]
    pub index_timeout: Option<u64>,

    /// Directory for clangd's index (created if missing)
    #[arg(long, global = true, env = "CLANGAROO_INDEX_PATH")]
    pub index_path: Option<PathBuf>,

    /// Enable AI summaries (requires an embedder-registered provider)
    #[arg(long, global = true, env = "CLANGAROO_AI_ENABLED")]
    pub ai_enabled: bool,

    /// Monthly AI spending limit in USD
    #[arg(long, global = true, env = "CLANGAROO_AI_COST_LIMIT")]
    pub ai_cost_limit: Option<f64>,

    /// AI summary cache lifetime in days
    #[arg(long, global = true, env = "CLANGAROO_AI_CACHE_TTL_DAYS")]
    pub ai_cache_ttl_days: Option<u64>,

    #[arg(long, global = true, value_enum, env = "CLANGAROO_AI_ANALYSIS_DEPTH")]
    pub ai_analysis_depth: Option<AnalysisDepth>,

    #[arg(long, global = true, value_enum, env = "CLANGAROO_AI_CONTEXT_DEPTH")]
    pub ai_context_depth: Option<ContextDepth>,
}

impl Cli {
    /// Resolve the project and build a validated configuration.
    pub fn config(&self) -> Result<Config> {
        let root = resolve_project(self.project.as_deref())?;
        let mut config = Config::for_project(&root);
        self.options.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

impl ServiceArgs {
    fn apply(&self, config: &mut Config) {
        let secs = Duration::from_secs;
        if let Some(clangd) = &self.clangd {
            config.clangd_path = clangd.clone();
        }
        if let Some(dir) = &self.compile_commands_dir {
            config.compile_commands_dir = Some(canonicalize_or_absolute(dir));
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        config.cache_enabled = !self.no_cache;
        config.watch_files = !self.no_watch;
        if let Some(hours) = self.cache_ttl_hours {
            config.cache_ttl = secs(hours * 60 * 60);
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = secs(timeout);
        }
        if let Some(timeout) = self.startup_timeout {
            config.startup_timeout = secs(timeout);
        }
        if let Some(restarts) = self.max_restarts {
            config.max_restarts = restarts;
        }
        if let Some(depth) = self.hierarchy_depth {
            config.hierarchy.max_depth = depth;
        }
        if let Some(nodes) = self.hierarchy_max_nodes {
            config.hierarchy.max_nodes = nodes;
        }
        if let Some(per_level) = self.hierarchy_max_per_level {
            config.hierarchy.max_per_level = per_level;
        }
        if let Some(open) = self.max_open_documents {
            config.max_open_documents = open;
        }
        config.index.warmup = self.warmup;
        if let Some(limit) = self.warmup_limit {
            config.index.warmup_limit = limit;
        }
        config.index.wait = self.wait_for_index;
        if let Some(timeout) = self.index_timeout {
            config.index.timeout = secs(timeout);
        }
        if let Some(dir) = &self.index_path {
            config.index.dir = Some(canonicalize_or_absolute(dir));
        }
        config.ai.enabled = self.ai_enabled;
        if let Some(limit) = self.ai_cost_limit {
            config.ai.cost_limit_monthly = limit;
        }
        if let Some(days) = self.ai_cache_ttl_days {
            config.ai.cache_ttl = secs(days * 24 * 60 * 60);
        }
        if let Some(depth) = self.ai_analysis_depth {
            config.ai.analysis_depth = depth;
        }
        if let Some(depth) = self.ai_context_depth {
            config.ai.context_depth = depth;
        }
    }
}

fn parse_operation(name: &str) -> Result<Operation, String> {
    Operation::from_name(&name.replace('-', "_")).ok_or_else(|| {
        let known: Vec<&str> = Operation::ALL.iter().map(|op| op.name()).collect();
        format!("unknown operation '{name}' (expected one of: {})", known.join(", "))
    })
}

/// Split `path:line:column` into the path and the 1-based position.
pub fn split_file_and_embedded_position(file: &Path) -> (PathBuf, Option<(u32, u32)>) {
    let raw = file.to_string_lossy();
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() >= 3 {
        if let (Ok(line), Ok(column)) = (
            parts[parts.len() - 2].parse::<u32>(),
            parts[parts.len() - 1].parse::<u32>(),
        ) {
            let base = parts[..parts.len() - 2].join(":");
            return (PathBuf::from(base), Some((line, column)));
        }
    }
    (file.to_path_buf(), None)
}

/// Turn `query` arguments into a request. Relative files resolve against the
/// current directory.
pub fn build_request(
    operation: Operation,
    target: Option<&Path>,
    query: Option<String>,
    pattern: Option<String>,
    options: QueryOptions,
) -> Result<AnalysisRequest> {
    let request = match operation {
        Operation::ListFiles => AnalysisRequest::list_files(pattern),
        Operation::SearchSymbols => {
            let Some(query) = query else {
                bail!("search_symbols needs --query");
            };
            AnalysisRequest::search(query, pattern)
        }
        Operation::Outline => {
            let Some(target) = target else {
                bail!("outline needs a file");
            };
            let (file, _) = split_file_and_embedded_position(target);
            AnalysisRequest::outline(canonicalize_or_absolute(&file))
        }
        _ => {
            let Some(target) = target else {
                bail!("{} needs file:line:column", operation.name());
            };
            let (file, position) = split_file_and_embedded_position(target);
            let Some((line, column)) = position else {
                bail!(
                    "{} needs a position, e.g. {}:12:5",
                    operation.name(),
                    file.display()
                );
            };
            let location = SymbolLocation::new(canonicalize_or_absolute(&file), line, column)?;
            AnalysisRequest::at(operation, location)
        }
    };
    Ok(request.with_options(options))
}
