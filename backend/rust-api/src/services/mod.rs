use std::sync::Arc;

use crate::config::Config;
use crate::sandbox::SandboxDispatcher;
use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use activity_lock::{ActivityLock, LocalActivityLock, RedisActivityLock};
use mongo_store::{MongoPeerService, MongoSessionStore};
use notifier::{LoggingNotifier, PlayerNotifier};
use peer_service::{InMemoryPeerService, PeerService};
use resource_compiler::{HttpResourceCompiler, ResourceCompiler};
use session_store::{InMemorySessionStore, SessionStore};

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<dyn SessionStore>,
    pub peers: Arc<dyn PeerService>,
    pub compiler: Arc<dyn ResourceCompiler>,
    pub sandboxes: Arc<SandboxDispatcher>,
    pub locks: Arc<dyn ActivityLock>,
    pub notifier: Arc<dyn PlayerNotifier>,
}

impl AppState {
    /// Production wiring: MongoDB for sessions and contests, Redis for locks.
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let database = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let sessions = MongoSessionStore::new(mongo_client.clone(), &config.mongo_database);
        let peers = MongoPeerService::new(&database);
        let compiler = HttpResourceCompiler::new(&config.resources_url);
        let sandboxes = SandboxDispatcher::from_config(&config)?;

        Ok(Self::from_parts(
            config,
            Arc::new(sessions),
            Arc::new(peers),
            Arc::new(compiler),
            Arc::new(sandboxes),
            Arc::new(RedisActivityLock::new(redis)),
            Arc::new(LoggingNotifier),
        ))
    }

    /// Single-process wiring: everything but the sandboxes and the compiler
    /// lives in memory.
    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        let compiler = HttpResourceCompiler::new(&config.resources_url);
        let sandboxes = SandboxDispatcher::from_config(&config)?;

        Ok(Self::from_parts(
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryPeerService::new()),
            Arc::new(compiler),
            Arc::new(sandboxes),
            Arc::new(LocalActivityLock::new()),
            Arc::new(LoggingNotifier),
        ))
    }

    pub fn from_parts(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        peers: Arc<dyn PeerService>,
        compiler: Arc<dyn ResourceCompiler>,
        sandboxes: Arc<SandboxDispatcher>,
        locks: Arc<dyn ActivityLock>,
        notifier: Arc<dyn PlayerNotifier>,
    ) -> Self {
        Self {
            config,
            sessions,
            peers,
            compiler,
            sandboxes,
            locks,
            notifier,
        }
    }
}

pub mod activity_lock;
pub mod evaluation_service;
pub mod mongo_store;
pub mod navigation_service;
pub mod notifier;
pub mod peer_resolver;
pub mod peer_service;
pub mod preview_service;
pub mod resource_compiler;
pub mod session_builder;
pub mod session_store;
