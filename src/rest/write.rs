//! Write executor
//!
//! A `RestWrite` performs one create (no query) or update (query on
//! `objectId`). Stages run in `WriteStage::ORDER`; once a stage produces
//! the response the remaining mutating stages are skipped.

use std::collections::BTreeSet;
use std::mem;

use chrono::{SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::client_sdk::ClientSdk;
use super::installation::{InstallationAction, InstallationIdentity};
use super::pipeline::{Flow, PendingAction, PendingActions, WriteStage};
use super::query::RestQuery;
use super::response::WriteResponse;
use super::{read_only_error, Engine};
use crate::acl::{resolve_grants, Acl};
use crate::auth::auth_data::{can_handle_auth_data, users_with_auth_data_query};
use crate::auth::crypto::{hash_password, new_object_id, random_string};
use crate::auth::{AuthContext, CreatedWith, SessionSpec, CLOUD_INSTALLATION_ID};
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::document::{
    clean_auth_data, object_id, pointer, update_op, Document, Pointer, INSTALLATION_CLASS,
    INTERNAL_USER_FIELDS, PRODUCT_CLASS, ROLE_CLASS, SESSION_CLASS, USER_CLASS,
};
use crate::errors::{EngineError, EngineResult};
use crate::storage::{apply_update, FindOptions, StorageError, WriteOptions};
use crate::triggers::TriggerType;

/// Fields the server owns; a before-save hook cannot change them
const SERVER_FIELDS: &[&str] = &["objectId", "createdAt", "updatedAt", "className"];

/// Update operators whose stored result is echoed to the client
const ECHOED_OPS: &[&str] = &["Add", "AddUnique", "Remove", "Increment"];

pub(crate) struct RestWrite<'a> {
    engine: &'a Engine,
    ctx: &'a RequestContext,
    auth: &'a AuthContext,
    class_name: String,
    query: Option<Document>,
    data: Document,
    original_data: Option<Document>,
    client_sdk: Option<ClientSdk>,
    write_options: WriteOptions,
    response: Option<WriteResponse>,
    pending: PendingActions,
    fields_changed_by_trigger: Vec<String>,
    /// Comma-joined providers of a signup or login through auth data
    auth_provider: Option<String>,
    response_should_have_username: bool,
    /// The response came from persisting `data`
    persisted: bool,
    updated_at: String,
}

impl<'a> RestWrite<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &'a Engine,
        ctx: &'a RequestContext,
        auth: &'a AuthContext,
        class_name: &str,
        query: Option<Document>,
        data: Document,
        original_data: Option<Document>,
        client_sdk: Option<ClientSdk>,
    ) -> EngineResult<Self> {
        if auth.is_read_only {
            return Err(read_only_error());
        }
        if query.is_none() && data.contains_key("objectId") {
            return Err(EngineError::invalid_key("objectId is an invalid field name."));
        }
        Ok(Self {
            engine,
            ctx,
            auth,
            class_name: class_name.to_string(),
            query,
            data,
            original_data,
            client_sdk,
            write_options: WriteOptions::default(),
            response: None,
            pending: PendingActions::default(),
            fields_changed_by_trigger: Vec::new(),
            auth_provider: None,
            response_should_have_username: false,
            persisted: false,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    pub fn execute(mut self) -> BoxFuture<'a, EngineResult<WriteResponse>> {
        async move {
            let mut short_circuited = false;
            for stage in WriteStage::ORDER {
                if short_circuited && stage.is_mutating() {
                    continue;
                }
                if self.run_stage(stage).await? == Flow::ShortCircuit {
                    debug!(
                        request_id = %self.ctx.request_id,
                        class_name = %self.class_name,
                        stage = stage.name(),
                        "response set"
                    );
                    short_circuited = true;
                }
            }
            self.response
                .ok_or_else(|| EngineError::internal("write finished without a response"))
        }
        .boxed()
    }

    async fn run_stage(&mut self, stage: WriteStage) -> EngineResult<Flow> {
        match stage {
            WriteStage::ResolveGrants => self.resolve_grants().await,
            WriteStage::ValidateClassCreation => {
                self.engine
                    .validate_client_class_creation(self.ctx, self.auth, &self.class_name)
                    .await?;
                Ok(Flow::Continue)
            }
            WriteStage::HandleInstallation => self.handle_installation().await,
            WriteStage::HandleSession => self.handle_session().await,
            WriteStage::ValidateAuthData => self.validate_auth_data().await,
            WriteStage::BeforeWriteTrigger => self.run_before_trigger().await,
            WriteStage::ValidateSchema => {
                self.ctx
                    .guard(self.engine.storage.validate_object(
                        &self.class_name,
                        &self.data,
                        self.query.as_ref(),
                        &self.write_options,
                    ))
                    .await?;
                Ok(Flow::Continue)
            }
            WriteStage::DefaultFields => Ok(self.set_default_fields()),
            WriteStage::TransformUser => self.transform_user().await,
            WriteStage::ExpandFiles => Ok(self.expand_response_files()),
            WriteStage::DestroyDuplicateSessions => Ok(self.destroy_duplicate_sessions()),
            WriteStage::Persist => self.persist().await,
            WriteStage::IssueSessionToken => self.issue_session_token().await,
            WriteStage::FollowUp => self.follow_up().await,
            WriteStage::AfterWriteTrigger => Ok(self.run_after_trigger()),
            WriteStage::ReconcileResponse => Ok(self.reconcile_response()),
            WriteStage::SanitizeAuthData => {
                if self.class_name == USER_CLASS {
                    if let Some(response) = self.response.as_mut() {
                        clean_auth_data(&mut response.response);
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn query_object_id(&self) -> Option<&str> {
        self.query.as_ref().and_then(object_id)
    }

    /// Id of the written object: from the data, else from the query
    fn object_id(&self) -> Option<String> {
        object_id(&self.data)
            .or_else(|| self.query_object_id())
            .map(str::to_string)
    }

    fn location(&self) -> EngineResult<String> {
        let id = object_id(&self.data)
            .ok_or_else(|| EngineError::internal("written object has no objectId"))?;
        Ok(self.config().location(&self.class_name, id))
    }

    // ==================
    // Access
    // ==================

    async fn resolve_grants(&mut self) -> EngineResult<Flow> {
        let grants =
            resolve_grants(self.ctx, self.auth, self.engine.auth_service.as_ref()).await?;
        self.write_options.acl = grants.to_storage_acl();
        Ok(Flow::Continue)
    }

    // ==================
    // Installations
    // ==================

    async fn handle_installation(&mut self) -> EngineResult<Flow> {
        if self.class_name != INSTALLATION_CLASS {
            return Ok(Flow::Continue);
        }
        let query_id = self.query_object_id().map(str::to_string);
        let Some(identity) = InstallationIdentity::normalize(
            &mut self.data,
            self.auth,
            query_id.as_deref(),
            self.query.is_some(),
        )?
        else {
            return Ok(Flow::Continue);
        };

        let candidates = match identity.lookup_query() {
            Some(lookup) => {
                self.ctx
                    .guard(self.engine.storage.find(
                        INSTALLATION_CLASS,
                        &lookup,
                        &FindOptions::default(),
                    ))
                    .await?
            }
            None => Vec::new(),
        };
        let action = identity.decide(&candidates);
        debug!(candidates = candidates.len(), action = ?action, "installation resolved");
        action.check()?;

        match action {
            InstallationAction::CreateReplacing { stale } => {
                self.destroy_detached("destroy_stale_installations", INSTALLATION_CLASS, stale);
            }
            InstallationAction::Merge {
                object_id: target,
                destroy,
                stale,
            } => {
                if let Some(doomed) = destroy {
                    let mut query = Document::new();
                    query.insert("objectId".into(), json!(doomed));
                    self.destroy_awaited(INSTALLATION_CLASS, query).await?;
                }
                if let Some(stale) = stale {
                    self.destroy_detached(
                        "destroy_stale_installations",
                        INSTALLATION_CLASS,
                        stale,
                    );
                }
                let mut query = Document::new();
                query.insert("objectId".into(), json!(target));
                self.query = Some(query);
                self.data.remove("objectId");
                self.data.remove("createdAt");
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    // ==================
    // Sessions
    // ==================

    async fn handle_session(&mut self) -> EngineResult<Flow> {
        if self.class_name != SESSION_CLASS {
            return Ok(Flow::Continue);
        }
        let caller = self.auth.user_id().map(str::to_string);
        if caller.is_none() && !self.auth.is_master {
            return Err(EngineError::InvalidSessionToken(
                "Session token required.".into(),
            ));
        }
        if self.data.contains_key("ACL") {
            return Err(EngineError::invalid_key("Cannot set ACL on a Session."));
        }

        if self.query.is_some() && !self.auth.is_master {
            let new_owner = self
                .data
                .get("user")
                .and_then(Pointer::from_value)
                .map(|p| p.object_id);
            if new_owner.is_some() && new_owner != caller {
                return Err(EngineError::invalid_key("Cannot change the user of a Session."));
            }
            for field in ["installationId", "sessionToken"] {
                if self.data.contains_key(field) {
                    return Err(EngineError::invalid_key(format!(
                        "Cannot change the {} of a Session.",
                        field
                    )));
                }
            }
        }

        let Some(user_id) = caller.filter(|_| self.query.is_none() && !self.auth.is_master)
        else {
            return Ok(Flow::Continue);
        };
        let mut extra = self.data.clone();
        extra.remove("objectId");
        extra.remove("user");
        let session = self.engine.auth_service.create_session(
            self.config(),
            SessionSpec::new(user_id, CreatedWith::create())
                .with_installation_id(self.auth.installation_id.clone())
                .with_extra(extra),
        );
        let committed = self.commit_session(session.session_data.clone()).await?;
        let id = committed
            .get("objectId")
            .cloned()
            .ok_or_else(|| EngineError::internal("Error creating session."))?;
        let mut session_data = session.session_data;
        session_data.insert("objectId".into(), id);
        self.response = Some(WriteResponse {
            status: 201,
            response: session_data,
            location: committed.location,
        });
        Ok(Flow::ShortCircuit)
    }

    /// Persist a session record as a master write
    async fn commit_session(&self, session_data: Document) -> EngineResult<WriteResponse> {
        let master = AuthContext::master();
        RestWrite::new(
            self.engine,
            self.ctx,
            &master,
            SESSION_CLASS,
            None,
            session_data,
            None,
            None,
        )?
        .execute()
        .await
    }

    async fn create_session_token(&mut self) -> EngineResult<()> {
        if self.auth.installation_id.as_deref() == Some(CLOUD_INSTALLATION_ID) {
            return Ok(());
        }
        let user_id = self
            .object_id()
            .ok_or_else(|| EngineError::internal("session requested for a user without id"))?;
        let created_with = match &self.auth_provider {
            Some(provider) => CreatedWith::login(provider.clone()),
            None => CreatedWith::signup(),
        };
        let session = self.engine.auth_service.create_session(
            self.config(),
            SessionSpec::new(user_id, created_with)
                .with_installation_id(self.auth.installation_id.clone()),
        );
        if let (Some(response), Some(token)) = (self.response.as_mut(), session.token()) {
            response
                .response
                .insert("sessionToken".into(), json!(token));
        }
        self.commit_session(session.session_data).await?;
        Ok(())
    }

    fn destroy_duplicate_sessions(&mut self) -> Flow {
        if self.class_name != SESSION_CLASS || self.query.is_some() {
            return Flow::Continue;
        }
        let (Some(user), Some(installation_id)) =
            (self.data.get("user"), self.data.get("installationId"))
        else {
            return Flow::Continue;
        };
        if Pointer::from_value(user).is_none() {
            return Flow::Continue;
        }
        let mut query = Document::new();
        query.insert("user".into(), user.clone());
        query.insert("installationId".into(), installation_id.clone());
        query.insert(
            "sessionToken".into(),
            json!({ "$ne": self.data.get("sessionToken").cloned().unwrap_or(Value::Null) }),
        );
        self.destroy_detached("destroy_duplicate_sessions", SESSION_CLASS, query);
        Flow::Continue
    }

    async fn issue_session_token(&mut self) -> EngineResult<Flow> {
        if self.class_name != USER_CLASS || self.query.is_some() {
            return Ok(Flow::Continue);
        }
        let config = self.config();
        if self.auth_provider.is_none()
            && config.prevent_login_with_unverified_email
            && config.verify_user_emails
        {
            return Ok(Flow::Continue);
        }
        self.create_session_token().await?;
        Ok(Flow::Continue)
    }

    // ==================
    // Linked identities
    // ==================

    async fn validate_auth_data(&mut self) -> EngineResult<Flow> {
        if self.class_name != USER_CLASS {
            return Ok(Flow::Continue);
        }
        let auth_data = self.data.get("authData").and_then(Value::as_object).cloned();
        if self.query.is_none() && auth_data.is_none() {
            if !non_empty_string(self.data.get("username")) {
                return Err(EngineError::UsernameMissing);
            }
            if !non_empty_string(self.data.get("password")) {
                return Err(EngineError::PasswordMissing);
            }
        }
        let Some(auth_data) = auth_data.filter(|providers| !providers.is_empty()) else {
            return Ok(Flow::Continue);
        };
        if !can_handle_auth_data(&auth_data) {
            return Err(EngineError::UnsupportedService);
        }
        self.handle_auth_data(auth_data).await
    }

    async fn handle_auth_data(&mut self, auth_data: Document) -> EngineResult<Flow> {
        let mut linked = match users_with_auth_data_query(&auth_data) {
            Some(lookup) => {
                self.ctx
                    .guard(self.engine.storage.find(
                        USER_CLASS,
                        &lookup,
                        &FindOptions::default(),
                    ))
                    .await?
            }
            None => Vec::new(),
        };
        if !self.auth.is_master {
            // a user hidden by an empty ACL cannot be logged into
            linked.retain(|user| match user.get("ACL") {
                None => true,
                Some(acl) => acl.as_object().is_some_and(|acl| !acl.is_empty()),
            });
        }
        if linked.len() > 1 {
            return Err(EngineError::AccountAlreadyLinked);
        }
        self.auth_provider = Some(
            auth_data
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        );

        let Some(mut user) = linked.pop() else {
            self.validate_providers(&auth_data).await?;
            return Ok(Flow::Continue);
        };
        let user_id = object_id(&user)
            .ok_or_else(|| EngineError::internal("linked user has no objectId"))?
            .to_string();
        let stored_auth_data = user
            .get("authData")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mutated: Document = auth_data
            .iter()
            .filter(|(provider, data)| stored_auth_data.get(*provider) != Some(*data))
            .map(|(provider, data)| (provider.clone(), data.clone()))
            .collect();

        let target = self
            .query_object_id()
            .or_else(|| self.auth.user_id())
            .map(str::to_string);
        if target.as_deref().is_some_and(|target| target != user_id) {
            return Err(EngineError::AccountAlreadyLinked);
        }

        // Login: the linked user is the one being written
        self.data.insert("objectId".into(), json!(user_id));
        let is_login = self.query_object_id().is_none();
        if is_login {
            user.remove("password");
            for field in INTERNAL_USER_FIELDS {
                user.remove(*field);
            }
            self.response = Some(WriteResponse {
                status: 200,
                response: user,
                location: Some(self.location()?),
            });
        }
        if mutated.is_empty() {
            return Ok(if is_login {
                Flow::ShortCircuit
            } else {
                Flow::Continue
            });
        }

        self.validate_providers(&mutated).await?;
        if let Some(response) = self.response.as_mut() {
            let mut refreshed = stored_auth_data;
            refreshed.extend(mutated);
            response
                .response
                .insert("authData".into(), Value::Object(refreshed.clone()));
            let mut query = Document::new();
            query.insert("objectId".into(), json!(user_id));
            let mut patch = Document::new();
            patch.insert("authData".into(), Value::Object(refreshed));
            self.ctx
                .guard(self.engine.storage.update(
                    USER_CLASS,
                    &query,
                    patch,
                    &WriteOptions::master(),
                ))
                .await?;
            return Ok(Flow::ShortCircuit);
        }
        Ok(Flow::Continue)
    }

    async fn validate_providers(&self, auth_data: &Document) -> EngineResult<()> {
        self.ctx
            .guard(self.engine.auth_data.validate_all(auth_data))
            .await
    }

    // ==================
    // Hooks
    // ==================

    /// The object as it will look after this write
    ///
    /// Dotted keys set one level of a sub-document; keys that are not
    /// plain field names are left out.
    fn build_updated_object(&self) -> EngineResult<Document> {
        let mut object = match self.query_object_id() {
            Some(id) => {
                let mut original = self.original_data.clone().unwrap_or_default();
                original.insert("objectId".into(), json!(id));
                original
            }
            None => Document::new(),
        };
        let mut patch = Document::new();
        for (key, value) in &self.data {
            if let Some((parent, child)) = key.split_once('.') {
                let entry = object.entry(parent).or_insert_with(|| json!({}));
                if !entry.is_object() {
                    *entry = json!({});
                }
                if let Some(fields) = entry.as_object_mut() {
                    fields.insert(child.to_string(), value.clone());
                }
            } else if is_client_key(key) {
                patch.insert(key.clone(), value.clone());
            }
        }
        apply_update(&mut object, patch)?;
        Ok(object)
    }

    async fn run_before_trigger(&mut self) -> EngineResult<Flow> {
        if !self
            .engine
            .has_trigger(&self.class_name, TriggerType::BeforeSave)
        {
            return Ok(Flow::Continue);
        }
        let candidate = self.build_updated_object()?;
        let original = self.query_object_id().map(|id| {
            let mut original = self.original_data.clone().unwrap_or_default();
            original.insert("objectId".into(), json!(id));
            original
        });
        let returned = self
            .ctx
            .guard(self.engine.triggers.run_write(
                TriggerType::BeforeSave,
                self.auth,
                &self.class_name,
                &candidate,
                original.as_ref(),
                self.config(),
            ))
            .await?;
        let Some(returned) = returned else {
            return Ok(Flow::Continue);
        };

        let next = data_from_trigger(&self.data, &candidate, original.as_ref(), returned);
        self.fields_changed_by_trigger = next
            .iter()
            .filter(|(key, value)| self.data.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect();
        debug!(
            class_name = %self.class_name,
            changed = ?self.fields_changed_by_trigger,
            "beforeSave replaced the object"
        );
        self.data = next;
        if self.query.is_some() {
            self.data.remove("objectId");
        }
        Ok(Flow::Continue)
    }

    /// Hand the written object to subscribers, then to the afterSave hook
    ///
    /// Runs detached; a hook failure is logged and never reaches the
    /// caller.
    fn run_after_trigger(&mut self) -> Flow {
        let Some(response) = &self.response else {
            return Flow::Continue;
        };
        let has_hook = self
            .engine
            .has_trigger(&self.class_name, TriggerType::AfterSave);
        let has_live_query = self.engine.live_query.has_live_query(&self.class_name);
        if !has_hook && !has_live_query {
            return Flow::Continue;
        }

        let mut updated = match self.build_updated_object() {
            Ok(updated) => updated,
            Err(err) => {
                warn!(class_name = %self.class_name, error = %err, "cannot build afterSave object");
                return Flow::Continue;
            }
        };
        for (key, value) in &response.response {
            if update_op(value).is_none() {
                updated.insert(key.clone(), value.clone());
            }
        }
        let original = self.query_object_id().map(|id| {
            let mut original = self.original_data.clone().unwrap_or_default();
            original.insert("objectId".into(), json!(id));
            original
        });

        let live_query = self.engine.live_query.clone();
        let triggers = self.engine.triggers.clone();
        let config = self.engine.config.clone();
        let auth = self.auth.clone();
        let class_name = self.class_name.clone();
        self.engine.tasks.spawn("after_save", async move {
            if has_live_query {
                live_query
                    .on_after_write(&class_name, &updated, original.as_ref())
                    .await;
            }
            if has_hook {
                triggers
                    .run_write(
                        TriggerType::AfterSave,
                        &auth,
                        &class_name,
                        &updated,
                        original.as_ref(),
                        &config,
                    )
                    .await?;
            }
            Ok(())
        });
        Flow::Continue
    }

    /// Echo fields the beforeSave hook changed
    ///
    /// Operators are not echoed, except `Delete` to clients that
    /// understand it.
    fn reconcile_response(&mut self) -> Flow {
        if !self.persisted || self.fields_changed_by_trigger.is_empty() {
            return Flow::Continue;
        }
        let Some(response) = self.response.as_mut() else {
            return Flow::Continue;
        };
        let forward_delete = self
            .client_sdk
            .as_ref()
            .is_some_and(ClientSdk::supports_forward_delete);
        for field in &self.fields_changed_by_trigger {
            let data_value = self.data.get(field);
            if !response.response.contains_key(field) {
                if let Some(value) = data_value {
                    response.response.insert(field.clone(), value.clone());
                }
            }
            let is_op = response
                .response
                .get(field)
                .is_some_and(|value| update_op(value).is_some());
            if is_op {
                response.response.remove(field);
                if let Some(value) = data_value.filter(|v| update_op(v) == Some("Delete")) {
                    if forward_delete {
                        response.response.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        Flow::Continue
    }

    // ==================
    // Defaults and users
    // ==================

    fn set_default_fields(&mut self) -> Flow {
        self.data
            .insert("updatedAt".into(), json!(self.updated_at));
        if self.query.is_none() {
            self.data
                .insert("createdAt".into(), json!(self.updated_at));
            if !self.data.contains_key("objectId") {
                let id = new_object_id(self.config().object_id_size);
                self.data.insert("objectId".into(), json!(id));
            }
        }
        Flow::Continue
    }

    async fn transform_user(&mut self) -> EngineResult<Flow> {
        if self.class_name != USER_CLASS {
            return Ok(Flow::Continue);
        }
        if !self.auth.is_master && self.data.contains_key("emailVerified") {
            return Err(EngineError::forbidden(
                "Clients aren't allowed to manually update email verification.",
            ));
        }
        if let Some(user_id) = self.query_object_id().map(str::to_string) {
            self.invalidate_cached_sessions(&user_id).await?;
        }

        if let Some(password) = self.data.get("password") {
            let password = password
                .as_str()
                .ok_or(EngineError::PasswordMissing)?
                .to_string();
            if self.query.is_some() {
                self.pending.insert(PendingAction::ClearSessions);
                if !self.auth.is_master {
                    self.pending.insert(PendingAction::GenerateNewSession);
                }
            }
            self.check_password_policy(&password).await?;
            let hashed = hash_password(&password)?;
            self.data
                .insert("_hashed_password".into(), json!(hashed));
            self.data.remove("password");
        }

        self.validate_username().await?;
        self.validate_email().await?;
        Ok(Flow::Continue)
    }

    async fn invalidate_cached_sessions(&self, user_id: &str) -> EngineResult<()> {
        let master = AuthContext::master();
        let mut where_ = Document::new();
        where_.insert("user".into(), pointer(USER_CLASS, user_id));
        let sessions = RestQuery::new(
            self.engine,
            self.ctx,
            &master,
            SESSION_CLASS,
            where_,
            Default::default(),
        )
        .execute()
        .await?;
        let tokens: BTreeSet<&str> = sessions
            .response
            .objects()
            .filter_map(|session| session.get("sessionToken").and_then(Value::as_str))
            .collect();
        for token in tokens {
            let cache = &self.engine.cache;
            self.ctx
                .guard(async {
                    cache.invalidate_user_session(token).await;
                    Ok::<_, EngineError>(())
                })
                .await?;
        }
        Ok(())
    }

    async fn check_password_policy(&self, password: &str) -> EngineResult<()> {
        let Some(policy) = self.config().password_policy.as_ref() else {
            return Ok(());
        };
        let username = match self.data.get("username").and_then(Value::as_str) {
            Some(username) => Some(username.to_string()),
            None if policy.do_not_allow_username => self
                .stored_user()
                .await?
                .and_then(|user| user.get("username").and_then(Value::as_str).map(str::to_string)),
            None => None,
        };
        policy.check_requirements(password, username.as_deref())?;

        if self.query.is_some() && policy.max_password_history > 0 {
            if let Some((history, current)) = self.stored_password_state().await? {
                let mut previous: Vec<String> = history
                    .into_iter()
                    .take(policy.max_password_history.saturating_sub(1))
                    .collect();
                previous.extend(current);
                policy.check_history(password, &previous)?;
            }
        }
        Ok(())
    }

    async fn stored_user(&self) -> EngineResult<Option<Document>> {
        let Some(id) = self.object_id() else {
            return Ok(None);
        };
        let mut query = Document::new();
        query.insert("objectId".into(), json!(id));
        let options = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        let mut found = self
            .ctx
            .guard(self.engine.storage.find(USER_CLASS, &query, &options))
            .await?;
        Ok(found.pop())
    }

    /// Stored password history and current hash of the user
    async fn stored_password_state(&self) -> EngineResult<Option<(Vec<String>, Option<String>)>> {
        Ok(self.stored_user().await?.map(|user| {
            let history = user
                .get("_password_history")
                .and_then(Value::as_array)
                .map(|hashes| {
                    hashes
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let current = user
                .get("_hashed_password")
                .and_then(Value::as_str)
                .map(str::to_string);
            (history, current)
        }))
    }

    async fn validate_username(&mut self) -> EngineResult<()> {
        if !non_empty_string(self.data.get("username")) {
            if self.query.is_none() {
                self.data
                    .insert("username".into(), json!(random_string(25)));
                self.response_should_have_username = true;
            }
            return Ok(());
        }
        if self.field_taken("username").await? {
            return Err(EngineError::UsernameTaken);
        }
        Ok(())
    }

    async fn validate_email(&mut self) -> EngineResult<()> {
        let Some(email) = self.data.get("email") else {
            return Ok(());
        };
        if email.is_null() || email.as_str() == Some("") || update_op(email) == Some("Delete") {
            return Ok(());
        }
        let well_formed = email.as_str().is_some_and(|email| {
            email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
        });
        if !well_formed {
            return Err(EngineError::InvalidEmailAddress);
        }
        if self.field_taken("email").await? {
            return Err(EngineError::EmailTaken);
        }
        let verifiable = match self.data.get("authData").and_then(Value::as_object) {
            None => true,
            Some(providers) => {
                providers.is_empty()
                    || (providers.len() == 1 && providers.contains_key("anonymous"))
            }
        };
        if verifiable {
            self.pending.insert(PendingAction::SendVerificationEmail);
            self.engine.users.set_email_verify_token(&mut self.data);
        }
        Ok(())
    }

    /// Whether another user already holds this value of `field`
    async fn field_taken(&self, field: &str) -> EngineResult<bool> {
        let Some(value) = self.data.get(field) else {
            return Ok(false);
        };
        let mut query = Document::new();
        query.insert(field.into(), value.clone());
        if let Some(id) = self.object_id() {
            query.insert("objectId".into(), json!({ "$ne": id }));
        }
        let options = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        let found = self
            .ctx
            .guard(self.engine.storage.find(USER_CLASS, &query, &options))
            .await?;
        Ok(!found.is_empty())
    }

    fn expand_response_files(&mut self) -> Flow {
        let Some(response) = self.response.as_mut() else {
            return Flow::Continue;
        };
        let mut objects = [Value::Object(mem::take(&mut response.response))];
        self.engine
            .files
            .expand_file_pointers(&self.engine.config, &mut objects);
        let [expanded] = objects;
        if let Value::Object(expanded) = expanded {
            response.response = expanded;
        }
        Flow::Continue
    }

    // ==================
    // Persistence
    // ==================

    async fn persist(&mut self) -> EngineResult<Flow> {
        if self.class_name == ROLE_CLASS {
            let cache = &self.engine.cache;
            self.ctx
                .guard(async {
                    cache.clear_role_cache().await;
                    Ok::<_, EngineError>(())
                })
                .await?;
        }
        if self.class_name == USER_CLASS && self.query.is_some() && self.auth.is_unauthenticated()
        {
            return Err(EngineError::SessionMissing(format!(
                "Cannot modify user {}.",
                self.query_object_id().unwrap_or_default()
            )));
        }
        if self
            .data
            .get("ACL")
            .and_then(Acl::from_value)
            .is_some_and(|acl| acl.has_unresolved())
        {
            return Err(EngineError::InvalidAcl);
        }

        if self.class_name == PRODUCT_CLASS {
            let download_name = self.data.get("download").and_then(|d| d.get("name")).cloned();
            if let Some(name) = download_name {
                self.data.insert("downloadName".into(), name);
            }
        }

        match self.query.clone() {
            Some(query) => self.persist_update(query).await,
            None => self.persist_create().await,
        }
    }

    fn password_changed_at(&mut self) {
        let expires = self
            .config()
            .password_policy
            .as_ref()
            .is_some_and(|policy| policy.max_password_age_days.is_some());
        if expires {
            self.data.insert(
                "_password_changed_at".into(),
                json!({"__type": "Date", "iso": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)}),
            );
        }
    }

    async fn persist_update(&mut self, query: Document) -> EngineResult<Flow> {
        let is_user = self.class_name == USER_CLASS;
        if is_user && !self.auth.is_master {
            if let (Some(acl), Some(id)) = (
                self.data.get("ACL").and_then(Acl::from_value),
                object_id(&query),
            ) {
                let mut acl = acl;
                acl.set(id, true, true);
                self.data.insert("ACL".into(), acl.to_value());
            }
        }
        let password_changed = is_user && self.data.contains_key("_hashed_password");
        if password_changed {
            self.password_changed_at();
        }
        self.data.remove("createdAt");

        let history_size = self
            .config()
            .password_policy
            .as_ref()
            .map_or(0, |policy| policy.max_password_history);
        if password_changed && history_size > 0 {
            if let Some((history, current)) = self.stored_password_state().await? {
                if let Some(policy) = self.config().password_policy.as_ref() {
                    let next = policy.next_history(&history, current.as_deref());
                    self.data
                        .insert("_password_history".into(), json!(next));
                }
            }
        }

        let stored = self
            .ctx
            .guard(self.engine.storage.update(
                &self.class_name,
                &query,
                self.data.clone(),
                &self.write_options,
            ))
            .await?;
        let mut response = echoed_op_results(&self.data, &stored);
        response.insert("updatedAt".into(), json!(self.updated_at));
        self.response = Some(WriteResponse::ok(response));
        self.persisted = true;
        Ok(Flow::ShortCircuit)
    }

    async fn persist_create(&mut self) -> EngineResult<Flow> {
        if self.class_name == USER_CLASS {
            let id = self
                .object_id()
                .ok_or_else(|| EngineError::internal("user create without objectId"))?;
            let mut acl = self
                .data
                .get("ACL")
                .and_then(Acl::from_value)
                .unwrap_or_else(|| {
                    let mut public_read = Acl::new();
                    public_read.set("*", true, false);
                    public_read
                });
            acl.set(&id, true, true);
            self.data.insert("ACL".into(), acl.to_value());
            self.password_changed_at();
        }

        let storage = &self.engine.storage;
        let created = self
            .ctx
            .guard(async {
                Ok::<_, EngineError>(
                    storage
                        .create(&self.class_name, self.data.clone(), &self.write_options)
                        .await,
                )
            })
            .await?;
        let stored = match created {
            Ok(stored) => stored,
            Err(StorageError::DuplicateValue { field }) if self.class_name == USER_CLASS => {
                return Err(self.diagnose_duplicate(field.as_deref()).await?);
            }
            Err(err) => return Err(err.into()),
        };

        let mut response = echoed_op_results(&self.data, &stored);
        for key in ["objectId", "createdAt"] {
            if let Some(value) = self.data.get(key) {
                response.insert(key.into(), value.clone());
            }
        }
        if self.response_should_have_username {
            if let Some(username) = self.data.get("username") {
                response.insert("username".into(), username.clone());
            }
        }
        self.response = Some(WriteResponse::created(response, self.location()?));
        self.persisted = true;
        Ok(Flow::ShortCircuit)
    }

    /// Name the unique field a racing create took first
    async fn diagnose_duplicate(&self, field: Option<&str>) -> EngineResult<EngineError> {
        match field {
            Some("username") => return Ok(EngineError::UsernameTaken),
            Some("email") => return Ok(EngineError::EmailTaken),
            _ => {}
        }
        if self.field_taken("username").await? {
            return Ok(EngineError::UsernameTaken);
        }
        if self.field_taken("email").await? {
            return Ok(EngineError::EmailTaken);
        }
        Ok(EngineError::DuplicateValue)
    }

    // ==================
    // Follow-up
    // ==================

    async fn follow_up(&mut self) -> EngineResult<Flow> {
        while let Some(action) = self.pending.next() {
            debug!(action = ?action, class_name = %self.class_name, "follow-up");
            match action {
                PendingAction::ClearSessions => {
                    if !self.config().revoke_session_on_password_reset {
                        continue;
                    }
                    let Some(user_id) = self.object_id() else {
                        continue;
                    };
                    let mut query = Document::new();
                    query.insert("user".into(), pointer(USER_CLASS, &user_id));
                    self.destroy_awaited(SESSION_CLASS, query).await?;
                }
                PendingAction::GenerateNewSession => self.create_session_token().await?,
                PendingAction::SendVerificationEmail => {
                    let users = self.engine.users.clone();
                    let user = self.data.clone();
                    self.engine
                        .tasks
                        .spawn("send_verification_email", async move {
                            users.send_verification_email(user).await
                        });
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn destroy_awaited(&self, class_name: &str, query: Document) -> EngineResult<()> {
        let storage = &self.engine.storage;
        let outcome = self
            .ctx
            .guard(async {
                Ok::<_, EngineError>(
                    storage
                        .destroy(class_name, &query, &WriteOptions::master())
                        .await,
                )
            })
            .await?;
        match outcome {
            Ok(()) | Err(StorageError::ObjectNotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn destroy_detached(&self, task: &'static str, class_name: &'static str, query: Document) {
        let storage = self.engine.storage.clone();
        self.engine.tasks.spawn(task, async move {
            match storage
                .destroy(class_name, &query, &WriteOptions::master())
                .await
            {
                Ok(()) | Err(StorageError::ObjectNotFound) => Ok(()),
                Err(err) => Err(err.into()),
            }
        });
    }
}

fn non_empty_string(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
}

/// Plain field name a client may write: `^[A-Za-z][0-9A-Za-z_]*$`
fn is_client_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Stored results of the operators that produce one
fn echoed_op_results(patch: &Document, stored: &Document) -> Document {
    patch
        .iter()
        .filter(|(_, value)| update_op(value).is_some_and(|op| ECHOED_OPS.contains(&op)))
        .filter_map(|(key, _)| stored.get(key).map(|result| (key.clone(), result.clone())))
        .collect()
}

/// Patch equivalent to the object a beforeSave hook returned
///
/// Fields the hook left as they were keep their original patch value,
/// operators included. Fields it changed take the returned value; fields
/// it removed from the stored object become `Delete` operators. Dotted
/// keys survive unless the hook rewrote or removed their parent field.
fn data_from_trigger(
    data: &Document,
    candidate: &Document,
    original: Option<&Document>,
    returned: Document,
) -> Document {
    let mut next = Document::new();
    for (key, value) in &returned {
        if SERVER_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if candidate.get(key) == Some(value) {
            if let Some(existing) = data.get(key) {
                next.insert(key.clone(), existing.clone());
            }
        } else {
            next.insert(key.clone(), value.clone());
        }
    }
    for key in candidate.keys() {
        let removed = !returned.contains_key(key)
            && !SERVER_FIELDS.contains(&key.as_str())
            && original.is_some_and(|original| original.contains_key(key));
        if removed {
            next.insert(key.clone(), json!({"__op": "Delete"}));
        }
    }
    for (key, value) in data {
        if let Some((parent, _)) = key.split_once('.') {
            if !next.contains_key(parent) {
                next.insert(key.clone(), value.clone());
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_client_keys() {
        assert!(is_client_key("title"));
        assert!(is_client_key("a_1"));
        assert!(!is_client_key("_hashed_password"));
        assert!(!is_client_key("a.b"));
        assert!(!is_client_key("1a"));
        assert!(!is_client_key(""));
    }

    #[test]
    fn test_echoed_op_results() {
        let patch = doc(json!({
            "score": {"__op": "Increment", "amount": 1},
            "tags": {"__op": "AddUnique", "objects": ["a"]},
            "gone": {"__op": "Delete"},
            "title": "x",
        }));
        let stored = doc(json!({"score": 4, "tags": ["a", "b"], "title": "x"}));
        assert_eq!(
            echoed_op_results(&patch, &stored),
            doc(json!({"score": 4, "tags": ["a", "b"]}))
        );
    }

    #[test]
    fn test_trigger_result_keeps_untouched_operators() {
        let data = doc(json!({"score": {"__op": "Increment", "amount": 1}, "title": "a"}));
        let original = doc(json!({"objectId": "o1", "score": 1, "title": "old", "note": "n"}));
        let candidate = doc(json!({"objectId": "o1", "score": 2, "title": "a", "note": "n"}));
        let returned = doc(json!({"objectId": "o1", "score": 2, "title": "A", "extra": true}));

        let next = data_from_trigger(&data, &candidate, Some(&original), returned);
        assert_eq!(
            next,
            doc(json!({
                "score": {"__op": "Increment", "amount": 1},
                "title": "A",
                "extra": true,
                "note": {"__op": "Delete"},
            }))
        );
    }

    #[test]
    fn test_trigger_result_on_create() {
        let data = doc(json!({"title": "a"}));
        let candidate = data.clone();
        let returned = doc(json!({"title": "a", "slug": "a"}));
        let next = data_from_trigger(&data, &candidate, None, returned);
        assert_eq!(next, doc(json!({"title": "a", "slug": "a"})));
    }

    #[test]
    fn test_trigger_result_keeps_dotted_keys() {
        let data = doc(json!({"profile.city": "Oslo", "title": "a"}));
        let original = doc(json!({"objectId": "o1", "profile": {"city": "Rome"}, "title": "old"}));
        let candidate = doc(json!({"objectId": "o1", "profile": {"city": "Oslo"}, "title": "a"}));

        let next = data_from_trigger(&data, &candidate, Some(&original), candidate.clone());
        assert_eq!(next, doc(json!({"profile.city": "Oslo", "title": "a"})));

        // A rewritten parent wins over the dotted key
        let returned = doc(json!({"objectId": "o1", "profile": {"city": "Bergen"}, "title": "a"}));
        let next = data_from_trigger(&data, &candidate, Some(&original), returned);
        assert_eq!(next, doc(json!({"profile": {"city": "Bergen"}, "title": "a"})));
    }

    #[test]
    fn test_non_empty_string() {
        assert!(non_empty_string(Some(&json!("a"))));
        assert!(!non_empty_string(Some(&json!(""))));
        assert!(!non_empty_string(Some(&json!(1))));
        assert!(!non_empty_string(None));
    }
}
