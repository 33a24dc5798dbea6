use reqwest::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::auth::{LoginFlow, OAuthTokenClient, TokenClient};
use crate::api::drive::{
    build_http_client, build_source_client, DriveItems, GraphClient, PathResolver,
    TransferEngine, UploadPolicy,
};
use crate::config::{Config, EnvSecret, SecretProvider};
use crate::db::Database;
use crate::error::DriveResult;
use crate::session::{spawn_refresher, SessionManager, SqliteSessionStore};
use crate::upload_manager::{SqliteTransferStore, UploadQueue};

/// Every component wired from one [`Config`]. Components share a single
/// HTTP client, database handle and session manager; URL sources are fetched
/// with a separate client that has no total deadline.
#[derive(Clone)]
pub struct Gateway {
    config: Config,
    http: Client,
    database: Database,
    tokens: Arc<dyn TokenClient>,
    sessions: Arc<SessionManager>,
    items: DriveItems,
    paths: PathResolver,
    transfers: TransferEngine,
}

impl Gateway {
    /// Wires the gateway, reading the client secret from the environment on
    /// each token request and falling back to the configured value.
    pub fn from_config(config: Config) -> DriveResult<Self> {
        let secrets = Arc::new(EnvSecret::client_secret_from_env(
            config.auth.client_secret.clone(),
        ));
        Self::with_secrets(config, secrets)
    }

    pub fn with_secrets(config: Config, secrets: Arc<dyn SecretProvider>) -> DriveResult<Self> {
        config.validate()?;
        let http = build_http_client(config.graph.request_timeout())?;
        let tokens: Arc<dyn TokenClient> =
            Arc::new(OAuthTokenClient::new(http.clone(), &config.auth, secrets));
        Self::with_token_client(config, http, tokens)
    }

    /// Wiring with a caller-supplied token client.
    pub fn with_token_client(
        config: Config,
        http: Client,
        tokens: Arc<dyn TokenClient>,
    ) -> DriveResult<Self> {
        let database = Database::open_default(config.storage.database_path.as_deref())?;
        let store = Arc::new(SqliteSessionStore::new(database.clone()));
        let sessions = Arc::new(SessionManager::new(
            store,
            tokens.clone(),
            config.session.refresh_threshold(),
        ));
        let client = GraphClient::new(http.clone(), &config.graph, sessions.clone());
        let items = DriveItems::new(client.clone());
        let paths = PathResolver::new(items.clone());
        let source_http =
            build_source_client(config.graph.request_timeout(), config.graph.upload_timeout())?;
        let transfers = TransferEngine::new(client, source_http, UploadPolicy::from(&config.upload));
        Ok(Self {
            config,
            http,
            database,
            tokens,
            sessions,
            items,
            paths,
            transfers,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn items(&self) -> &DriveItems {
        &self.items
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn login_flow(&self) -> LoginFlow {
        LoginFlow::new(
            self.config.auth.clone(),
            &self.config.graph,
            self.http.clone(),
            self.tokens.clone(),
            self.sessions.clone(),
        )
    }

    /// Upload queue backed by the gateway database. Unfinished entries from
    /// a previous run are reloaded but not started.
    pub fn upload_queue(&self) -> UploadQueue {
        UploadQueue::new(
            self.transfers.clone(),
            Arc::new(SqliteTransferStore::new(self.database.clone())),
            self.config.upload.max_concurrent,
        )
    }

    /// Starts the periodic refresher with the configured interval and window.
    pub fn spawn_refresher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_refresher(
            self.sessions.clone(),
            self.config.session.background_interval(),
            self.config.session.background_threshold(),
            shutdown,
        )
    }
}
