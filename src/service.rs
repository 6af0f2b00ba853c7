//! The service context: one per project, owning the engine, the cache and the
//! router for the whole session.

use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ai::{Enricher, SummaryProvider};
use crate::cache::{CacheStats, QueryCache};
use crate::config::Config;
use crate::error::Result;
use crate::location::SymbolLocation;
use crate::protocol::{ChannelState, ClientOptions, DocumentTracker, IndexingStatus, ProtocolClient};
use crate::router::{QueryAnswer, QueryRouter};
use crate::supervisor::{EngineCommand, EngineIo, ProcessHandle, ProcessState, ProcessSupervisor, RestartPolicy};
use crate::tiers::semantic::EngineSession;
use crate::tiers::{
    AnalysisRequest, Operation, QueryOptions, SemanticTier, StructuralTier, TextualTier,
};
use crate::warmup::{self, WARMUP_PAUSE};
use crate::watcher::CacheWatcher;
use crate::workspace::COMPILE_COMMANDS;

/// Engine-side half of the context.
struct Engine {
    session: EngineSession,
    supervisor: Option<ProcessSupervisor>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub project_root: PathBuf,
    /// Why the semantic tier is off for this session, if it is.
    pub project_config_error: Option<String>,
    pub process: Option<ProcessHandle>,
    pub channel: Option<ChannelState>,
    pub indexing: Option<IndexingStatus>,
    pub open_documents: usize,
    pub cache: CacheStats,
    pub ai_enabled: bool,
    pub ai_budget_remaining_usd: Option<f64>,
}

pub struct ServiceContext {
    config: Config,
    cache: Arc<QueryCache>,
    router: QueryRouter,
    enricher: Enricher,
    engine: Option<Engine>,
    project_config_error: Option<String>,
    _watcher: Option<CacheWatcher>,
}

impl ServiceContext {
    /// Open the cache, spawn and supervise the engine, and wire up the tiers.
    ///
    /// A missing build configuration keeps the engine off for the session;
    /// an engine binary that cannot be spawned is fatal.
    pub async fn start(config: Config) -> Result<Self> {
        let cache = Arc::new(open_cache(&config));
        let Some(cc_dir) = config.compile_commands_dir.clone() else {
            let reason = format!(
                "no {COMPILE_COMMANDS} found under {}",
                config.project_root.display()
            );
            return Ok(Self::assemble(config, cache, None, Some(reason)));
        };

        let mut command =
            EngineCommand::clangd(&config.clangd_path, &config.project_root, &cc_dir);
        if let Some(dir) = &config.index.dir {
            match std::fs::create_dir_all(dir) {
                Ok(()) => command = command.with_index_dir(dir),
                Err(err) => warn!(
                    "index path {} unusable, clangd keeps its default: {err}",
                    dir.display()
                ),
            }
        }
        let policy = RestartPolicy {
            max_restarts: config.max_restarts,
            backoff: config.restart_backoff,
            shutdown_grace: config.shutdown_grace,
        };
        let (supervisor, io, restarts) = ProcessSupervisor::start(command, policy)?;

        let session = new_session(&config);
        let mut tasks = vec![
            spawn_attach(session.clone(), io),
            tokio::spawn(follow_restarts(session.clone(), restarts)),
        ];
        tasks.push(tokio::spawn(follow_process_state(
            session.clone(),
            supervisor.subscribe(),
        )));
        tasks.extend(prepare_index(&config, &session).await);
        let engine = Engine {
            session,
            supervisor: Some(supervisor),
            tasks,
        };
        Ok(Self::assemble(config, cache, Some(engine), None))
    }

    /// Like [`ServiceContext::start`], but talk to an engine over the given
    /// pipes instead of spawning one. Nothing restarts it.
    pub async fn connect<R, W>(config: Config, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let cache = Arc::new(open_cache(&config));
        let session = new_session(&config);
        session.client.attach(reader, writer).await?;
        let tasks = prepare_index(&config, &session).await.into_iter().collect();
        let engine = Engine {
            session,
            supervisor: None,
            tasks,
        };
        Ok(Self::assemble(config, cache, Some(engine), None))
    }

    fn assemble(
        config: Config,
        cache: Arc<QueryCache>,
        engine: Option<Engine>,
        project_config_error: Option<String>,
    ) -> Self {
        let root = config.project_root.clone();
        let semantic = match (&engine, &project_config_error) {
            (Some(engine), _) => SemanticTier::new(
                &root,
                engine.session.clone(),
                config.references_limit,
                config.hierarchy.clone(),
            ),
            (None, reason) => SemanticTier::unconfigured(
                &root,
                reason.clone().unwrap_or_else(|| "no engine".to_string()),
            ),
        };
        let router = QueryRouter::new(
            cache.clone(),
            Arc::new(StructuralTier::new(&root, config.max_scan_files)),
            Arc::new(semantic),
            Arc::new(TextualTier::new(
                &root,
                config.max_scan_files,
                config.references_limit,
                config.hierarchy.clone(),
            )),
        );
        if let Some(reason) = &project_config_error {
            router.report_project_config(reason);
        }

        let watcher = if config.watch_files && cache.is_enabled() {
            CacheWatcher::spawn(&root, cache.clone())
                .map_err(|err| warn!("file watching disabled: {err:#}"))
                .ok()
        } else {
            None
        };
        let enricher = Enricher::new(
            config.ai.clone(),
            &root,
            cache.clone(),
            config.request_timeout,
        );
        info!("clangaroo ready for {}", root.display());
        Self {
            config,
            cache,
            router,
            enricher,
            engine,
            project_config_error,
            _watcher: watcher,
        }
    }

    /// Register the outbound AI service used for `summarize` requests.
    pub fn with_summary_provider(mut self, provider: Arc<dyn SummaryProvider>) -> Self {
        self.enricher = self.enricher.with_provider(provider);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Route one request and attach an AI summary if one was asked for.
    pub async fn query(&self, request: AnalysisRequest) -> Result<QueryAnswer> {
        let mut answer = self.router.route(&request).await?;
        self.enricher.enrich(&request, &mut answer).await;
        Ok(answer)
    }

    pub async fn definition(&self, location: SymbolLocation) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::at(Operation::Definition, location))
            .await
    }

    pub async fn references(
        &self,
        location: SymbolLocation,
        include_declaration: bool,
    ) -> Result<QueryAnswer> {
        self.query(
            AnalysisRequest::at(Operation::References, location).with_options(QueryOptions {
                include_declaration,
                ..QueryOptions::default()
            }),
        )
        .await
    }

    pub async fn hover(&self, location: SymbolLocation, summarize: bool) -> Result<QueryAnswer> {
        self.query(
            AnalysisRequest::at(Operation::Hover, location).with_options(QueryOptions {
                summarize,
                ..QueryOptions::default()
            }),
        )
        .await
    }

    pub async fn incoming_calls(
        &self,
        location: SymbolLocation,
        depth: Option<u32>,
        summarize: bool,
    ) -> Result<QueryAnswer> {
        self.hierarchy(Operation::IncomingCalls, location, depth, summarize)
            .await
    }

    pub async fn outgoing_calls(
        &self,
        location: SymbolLocation,
        depth: Option<u32>,
        summarize: bool,
    ) -> Result<QueryAnswer> {
        self.hierarchy(Operation::OutgoingCalls, location, depth, summarize)
            .await
    }

    pub async fn prepare_type_hierarchy(&self, location: SymbolLocation) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::at(Operation::PrepareTypeHierarchy, location))
            .await
    }

    pub async fn supertypes(
        &self,
        location: SymbolLocation,
        depth: Option<u32>,
    ) -> Result<QueryAnswer> {
        self.hierarchy(Operation::Supertypes, location, depth, false)
            .await
    }

    pub async fn subtypes(&self, location: SymbolLocation, depth: Option<u32>) -> Result<QueryAnswer> {
        self.hierarchy(Operation::Subtypes, location, depth, false)
            .await
    }

    async fn hierarchy(
        &self,
        operation: Operation,
        location: SymbolLocation,
        depth: Option<u32>,
        summarize: bool,
    ) -> Result<QueryAnswer> {
        self.query(
            AnalysisRequest::at(operation, location).with_options(QueryOptions {
                depth,
                summarize,
                ..QueryOptions::default()
            }),
        )
        .await
    }

    pub async fn list_files(&self, pattern: Option<String>) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::list_files(pattern)).await
    }

    pub async fn search_symbols(
        &self,
        query: impl Into<String>,
        file_pattern: Option<String>,
    ) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::search(query, file_pattern))
            .await
    }

    pub async fn outline(&self, file: impl Into<PathBuf>) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::outline(file)).await
    }

    pub async fn signature(&self, location: SymbolLocation) -> Result<QueryAnswer> {
        self.query(AnalysisRequest::at(Operation::Signature, location))
            .await
    }

    pub async fn status(&self) -> ServiceStatus {
        let (process, channel, indexing, open_documents) = match &self.engine {
            Some(engine) => (
                engine.supervisor.as_ref().map(ProcessSupervisor::handle),
                Some(engine.session.client.state()),
                Some(engine.session.client.indexing()),
                engine.session.documents.len().await,
            ),
            None => (None, None, None, 0),
        };
        ServiceStatus {
            project_root: self.config.project_root.clone(),
            project_config_error: self.project_config_error.clone(),
            process,
            channel,
            indexing,
            open_documents,
            cache: self.cache.stats(),
            ai_enabled: self.enricher.is_active(),
            ai_budget_remaining_usd: self
                .enricher
                .is_active()
                .then(|| self.enricher.budget().remaining()),
        }
    }

    /// Drop cached answers derived from `file` if it changed.
    pub fn invalidate(&self, file: &Path) -> usize {
        self.cache.invalidate_file(file)
    }

    /// Tear down in reverse order of [`ServiceContext::start`].
    pub async fn shutdown(&self) {
        if let Some(engine) = &self.engine {
            let client = &engine.session.client;
            if client.state() == ChannelState::Ready {
                engine.session.documents.close_all(client).await;
            }
            client.shutdown().await;
            if let Some(supervisor) = &engine.supervisor {
                supervisor.shutdown().await;
            }
            for task in &engine.tasks {
                task.abort();
            }
        }
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!("purged {purged} expired cache entries");
        }
        info!("clangaroo stopped");
    }
}

fn open_cache(config: &Config) -> QueryCache {
    if !config.cache_enabled {
        return QueryCache::disabled();
    }
    let cache = QueryCache::open(&config.cache_db_path(), config.cache_ttl, config.ai.cache_ttl);
    let purged = cache.purge_expired();
    if purged > 0 {
        debug!("purged {purged} expired cache entries");
    }
    cache
}

fn new_session(config: &Config) -> EngineSession {
    EngineSession {
        client: ProtocolClient::new(ClientOptions {
            root: config.project_root.clone(),
            request_timeout: config.request_timeout,
            startup_timeout: config.startup_timeout,
        }),
        documents: Arc::new(DocumentTracker::new(config.max_open_documents)),
    }
}

fn spawn_attach(session: EngineSession, io: EngineIo) -> JoinHandle<()> {
    tokio::spawn(async move {
        session.documents.reset().await;
        if let Err(err) = session.client.attach(io.stdout, io.stdin).await {
            warn!("engine (pid {:?}) did not complete the handshake: {err}", io.pid);
        }
    })
}

/// Start the warmup task if enabled, then wait for the first index run if
/// asked to.
async fn prepare_index(config: &Config, session: &EngineSession) -> Option<JoinHandle<()>> {
    let warmup = config.index.warmup.then(|| {
        let root = config.project_root.clone();
        let database = config
            .compile_commands_dir
            .as_ref()
            .map(|dir| dir.join(COMPILE_COMMANDS));
        let limit = config.index.warmup_limit;
        let session = session.clone();
        tokio::spawn(async move {
            let files = warmup::key_files(&root, database.as_deref(), limit);
            warmup::warm_up(&session, &files, WARMUP_PAUSE).await;
        })
    });
    if config.index.wait {
        session.client.wait_for_indexing(config.index.timeout).await;
    }
    warmup
}

/// Re-attach the client to every restarted process.
async fn follow_restarts(session: EngineSession, mut restarts: mpsc::UnboundedReceiver<EngineIo>) {
    while let Some(io) = restarts.recv().await {
        info!("re-attaching to restarted engine");
        session.documents.reset().await;
        if let Err(err) = session.client.attach(io.stdout, io.stdin).await {
            warn!("handshake with restarted engine failed: {err}");
        }
    }
}

async fn follow_process_state(
    session: EngineSession,
    mut states: tokio::sync::watch::Receiver<ProcessState>,
) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        match state {
            // Crashed is usually overwritten by Restarting before this task wakes.
            ProcessState::Crashed | ProcessState::Restarting => {
                if session.client.state() != ChannelState::Detached {
                    session.client.detach("engine crashed");
                }
            }
            ProcessState::Degraded => {
                session
                    .client
                    .mark_unavailable("engine restart limit reached");
                return;
            }
            ProcessState::Stopped => return,
            _ => {}
        }
    }
}
