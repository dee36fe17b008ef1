//! # REST Data Engine
//!
//! Entry points for reads and writes against classes. Each call builds a
//! per-request executor (`RestQuery` or `RestWrite`) that is consumed by
//! the call and never shared.
//!
//! ## Read path
//!
//! grants → redirect class → class-creation check → constraint compile →
//! include-all → find → count → includes → after-find trigger
//!
//! ## Write path
//!
//! See `pipeline::WriteStage::ORDER`.

pub mod client_sdk;
mod include;
mod installation;
pub mod options;
mod pipeline;
mod query;
mod response;
mod write;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::auth::{AuthContext, AuthDataManager, AuthService, StorageAuthService};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::controllers::{
    CacheController, EmailSender, FilesController, InMemoryCache, InMemoryLiveQuery,
    LiveQueryController, LogEmailSender, UrlFilesController, UserController,
};
use crate::document::{is_system_class, Document};
use crate::errors::{EngineError, EngineResult};
use crate::storage::{FindOp, Storage};
use crate::tasks::BackgroundTasks;
use crate::triggers::{TriggerGateway, TriggerRegistry, TriggerType};

pub use client_sdk::ClientSdk;
pub use installation::{InstallationAction, InstallationIdentity};
pub use options::{QueryOptions, RestOptions};
pub use pipeline::{Flow, PendingAction, PendingActions, WriteStage};
pub use response::{QueryResponse, WriteResponse};

use query::RestQuery;
use write::RestWrite;

/// The data engine: collaborators plus configuration
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) triggers: Arc<dyn TriggerGateway>,
    pub(crate) auth_service: Arc<dyn AuthService>,
    pub(crate) auth_data: Arc<AuthDataManager>,
    pub(crate) cache: Arc<dyn CacheController>,
    pub(crate) files: Arc<dyn FilesController>,
    pub(crate) live_query: Arc<dyn LiveQueryController>,
    pub(crate) users: UserController,
    pub(crate) tasks: Arc<BackgroundTasks>,
}

/// Builder for `Engine`; unset collaborators get in-process defaults
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    triggers: Option<Arc<dyn TriggerGateway>>,
    auth_service: Option<Arc<dyn AuthService>>,
    auth_data: Option<Arc<AuthDataManager>>,
    cache: Option<Arc<dyn CacheController>>,
    files: Option<Arc<dyn FilesController>>,
    live_query: Option<Arc<dyn LiveQueryController>>,
    email: Option<Arc<dyn EmailSender>>,
    tasks: Option<Arc<BackgroundTasks>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            triggers: None,
            auth_service: None,
            auth_data: None,
            cache: None,
            files: None,
            live_query: None,
            email: None,
            tasks: None,
        }
    }

    pub fn triggers(mut self, triggers: Arc<dyn TriggerGateway>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn auth_service(mut self, auth_service: Arc<dyn AuthService>) -> Self {
        self.auth_service = Some(auth_service);
        self
    }

    pub fn auth_data(mut self, auth_data: Arc<AuthDataManager>) -> Self {
        self.auth_data = Some(auth_data);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheController>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn files(mut self, files: Arc<dyn FilesController>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn live_query(mut self, live_query: Arc<dyn LiveQueryController>) -> Self {
        self.live_query = Some(live_query);
        self
    }

    pub fn email_sender(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn tasks(mut self, tasks: Arc<BackgroundTasks>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn build(self) -> Engine {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryCache::new()) as Arc<dyn CacheController>);
        let auth_service = self.auth_service.unwrap_or_else(|| {
            Arc::new(StorageAuthService::new(self.storage.clone(), cache.clone()))
        });
        let triggers = self.triggers.unwrap_or_else(|| {
            Arc::new(TriggerRegistry::new(self.config.application_id.clone()))
        });
        let email = self
            .email
            .unwrap_or_else(|| Arc::new(LogEmailSender) as Arc<dyn EmailSender>);
        info!(
            application_id = %self.config.application_id,
            mount = %self.config.mount,
            "data engine ready"
        );
        Engine {
            users: UserController::new(self.config.clone(), email),
            config: Arc::new(self.config),
            storage: self.storage,
            triggers,
            auth_service,
            auth_data: self.auth_data.unwrap_or_default(),
            cache,
            files: self.files.unwrap_or_else(|| Arc::new(UrlFilesController)),
            live_query: self
                .live_query
                .unwrap_or_else(|| Arc::new(InMemoryLiveQuery::new())),
            tasks: self.tasks.unwrap_or_default(),
        }
    }
}

impl Engine {
    /// Engine with default collaborators
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> Self {
        EngineBuilder::new(config, storage).build()
    }

    pub fn builder(config: EngineConfig, storage: Arc<dyn Storage>) -> EngineBuilder {
        EngineBuilder::new(config, storage)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Detached work spawned by writes
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Query `class_name`
    pub async fn find(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
        where_: Document,
        options: RestOptions,
    ) -> EngineResult<QueryResponse> {
        self.read(ctx, auth, class_name, where_, options, FindOp::Find)
            .await
    }

    /// Fetch one object by id
    pub async fn get(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
        object_id: &str,
        options: RestOptions,
    ) -> EngineResult<QueryResponse> {
        let mut where_ = Document::new();
        where_.insert("objectId".into(), json!(object_id));
        self.read(ctx, auth, class_name, where_, options, FindOp::Get)
            .await
    }

    async fn read(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
        mut where_: Document,
        mut options: RestOptions,
        op: FindOp,
    ) -> EngineResult<QueryResponse> {
        debug!(request_id = %ctx.request_id, class_name, "read");
        if self.has_trigger(class_name, TriggerType::BeforeFind) {
            let hooked = ctx
                .guard(self.triggers.run_query(
                    TriggerType::BeforeFind,
                    class_name,
                    where_,
                    options,
                    &self.config,
                    auth,
                    op == FindOp::Get,
                ))
                .await?;
            where_ = hooked.where_;
            options = hooked.options;
        }
        let outcome = RestQuery::new(self, ctx, auth, class_name, where_, options)
            .with_op(op)
            .execute()
            .await?;
        Ok(outcome.response)
    }

    /// Create an object
    pub async fn create(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
        data: Document,
        client_sdk: Option<ClientSdk>,
    ) -> EngineResult<WriteResponse> {
        debug!(request_id = %ctx.request_id, class_name, "create");
        RestWrite::new(self, ctx, auth, class_name, None, data, None, client_sdk)?
            .execute()
            .await
    }

    /// Update the object `object_id`
    ///
    /// The stored object is loaded first when hooks or subscribers need
    /// the pre-image.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
        object_id: &str,
        data: Document,
        client_sdk: Option<ClientSdk>,
    ) -> EngineResult<WriteResponse> {
        debug!(request_id = %ctx.request_id, class_name, object_id, "update");
        if auth.is_read_only {
            return Err(read_only_error());
        }
        let mut query = Document::new();
        query.insert("objectId".into(), json!(object_id));

        let needs_original = self.has_trigger(class_name, TriggerType::BeforeSave)
            || self.has_trigger(class_name, TriggerType::AfterSave)
            || self.live_query.has_live_query(class_name);
        let original = if needs_original {
            let master = AuthContext::master();
            let outcome = RestQuery::new(
                self,
                ctx,
                &master,
                class_name,
                query.clone(),
                RestOptions::default(),
            )
            .execute()
            .await?;
            let stored = outcome.response.objects().next().cloned();
            stored
        } else {
            None
        };

        RestWrite::new(
            self,
            ctx,
            auth,
            class_name,
            Some(query),
            data,
            original,
            client_sdk,
        )?
        .execute()
        .await
    }

    pub(crate) fn has_trigger(&self, class_name: &str, trigger_type: TriggerType) -> bool {
        self.triggers
            .exists(class_name, trigger_type, &self.config.application_id)
    }

    /// Reject access to undeclared classes when clients may not create them
    pub(crate) async fn validate_client_class_creation(
        &self,
        ctx: &RequestContext,
        auth: &AuthContext,
        class_name: &str,
    ) -> EngineResult<()> {
        if self.config.allow_client_class_creation
            || auth.is_master
            || is_system_class(class_name)
        {
            return Ok(());
        }
        let schema = ctx.guard(self.storage.load_schema()).await?;
        if schema.has_class(class_name) {
            return Ok(());
        }
        Err(EngineError::forbidden(format!(
            "This user is not allowed to access non-existent class: {}",
            class_name
        )))
    }
}

pub(crate) fn read_only_error() -> EngineError {
    EngineError::forbidden("Cannot perform a write operation when using readOnlyMasterKey")
}
