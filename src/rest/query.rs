//! Read executor
//!
//! A `RestQuery` is built for one read and consumed by `execute`. Nested
//! reads (subqueries, include fetches, write-time lookups) build their own
//! `RestQuery`, which is why `execute` returns a boxed future.

use std::collections::HashMap;
use std::mem;

use async_trait::async_trait;
use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

use super::include::{find_pointers, replace_pointers, tag_included, Replacements};
use super::options::{QueryOptions, RestOptions};
use super::response::QueryResponse;
use super::Engine;
use crate::acl::resolve_grants;
use crate::auth::AuthContext;
use crate::config::EngineConfig;
use crate::constraint::{ConstraintCompiler, SubqueryResult, SubqueryRunner};
use crate::context::RequestContext;
use crate::document::{
    clean_auth_data, object_id, pointer, Document, Pointer, INTERNAL_USER_FIELDS, SESSION_CLASS,
    USER_CLASS,
};
use crate::errors::{EngineError, EngineResult};
use crate::storage::{FindOp, FindOptions};
use crate::triggers::TriggerType;

/// A finished read
#[derive(Debug)]
pub(crate) struct QueryOutcome {
    /// Class the read ran against, after any redirect
    pub class_name: String,
    pub response: QueryResponse,
}

pub(crate) struct RestQuery<'a> {
    engine: &'a Engine,
    ctx: &'a RequestContext,
    auth: &'a AuthContext,
    class_name: String,
    where_: Document,
    rest_options: RestOptions,
    options: QueryOptions,
    op: FindOp,
    /// Subquery nesting level
    depth: usize,
    /// Storage read grants; `None` for master
    acl: Option<Vec<String>>,
    redirect_class: Option<String>,
    response: QueryResponse,
}

impl<'a> RestQuery<'a> {
    pub fn new(
        engine: &'a Engine,
        ctx: &'a RequestContext,
        auth: &'a AuthContext,
        class_name: &str,
        where_: Document,
        rest_options: RestOptions,
    ) -> Self {
        let options = QueryOptions::parse(&rest_options);
        Self {
            engine,
            ctx,
            auth,
            class_name: class_name.to_string(),
            where_,
            rest_options,
            options,
            op: FindOp::Find,
            depth: 0,
            acl: None,
            redirect_class: None,
            response: QueryResponse::default(),
        }
    }

    pub fn with_op(mut self, op: FindOp) -> Self {
        self.op = op;
        self
    }

    fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn execute(mut self) -> BoxFuture<'a, EngineResult<QueryOutcome>> {
        async move {
            self.resolve_grants().await?;
            self.resolve_redirect_class().await?;
            self.engine
                .validate_client_class_creation(self.ctx, self.auth, &self.class_name)
                .await?;
            self.compile_constraints().await?;
            self.expand_include_all().await?;
            self.run_find().await?;
            self.run_count().await?;
            self.expand_includes().await?;
            self.run_after_find().await?;
            debug!(
                request_id = %self.ctx.request_id,
                class_name = %self.class_name,
                results = self.response.results.len(),
                depth = self.depth,
                "query finished"
            );
            Ok(QueryOutcome {
                class_name: self.class_name,
                response: self.response,
            })
        }
        .boxed()
    }

    fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    async fn resolve_grants(&mut self) -> EngineResult<()> {
        let grants = resolve_grants(self.ctx, self.auth, self.engine.auth_service.as_ref()).await?;
        self.acl = grants.to_storage_acl();
        Ok(())
    }

    async fn resolve_redirect_class(&mut self) -> EngineResult<()> {
        let Some(key) = self.options.redirect_key.clone() else {
            return Ok(());
        };
        let schema = self.ctx.guard(self.engine.storage.load_schema()).await?;
        let target = schema.redirect_class_name_for_key(&self.class_name, &key);
        debug!(from = %self.class_name, to = %target, key = %key, "redirecting query");
        self.class_name = target.clone();
        self.redirect_class = Some(target);
        Ok(())
    }

    async fn compile_constraints(&mut self) -> EngineResult<()> {
        if self.class_name == SESSION_CLASS && !self.auth.is_master {
            let Some(user_id) = self.auth.user_id() else {
                return Err(EngineError::InvalidSessionToken(
                    "Invalid session token".into(),
                ));
            };
            let scoped = json!({
                "$and": [
                    Value::Object(mem::take(&mut self.where_)),
                    {"user": pointer(USER_CLASS, user_id)},
                ]
            });
            if let Value::Object(scoped) = scoped {
                self.where_ = scoped;
            }
        }

        let runner = NestedQueries {
            engine: self.engine,
            ctx: self.ctx,
            auth: self.auth,
            depth: self.depth + 1,
        };
        ConstraintCompiler::new(self.depth, self.config().max_subquery_depth)
            .compile(&mut self.where_, &self.rest_options, &runner)
            .await
    }

    async fn expand_include_all(&mut self) -> EngineResult<()> {
        if !self.options.include_all {
            return Ok(());
        }
        let schema = self.ctx.guard(self.engine.storage.load_schema()).await?;
        let fields: Vec<String> = schema
            .get_one_schema(&self.class_name)
            .pointer_fields()
            .map(str::to_string)
            .collect();
        self.options
            .add_includes(fields.iter().map(|field| vec![field.clone()]));
        if let Some(keys) = self.options.keys.as_mut() {
            for field in fields {
                if !keys.contains(&field) {
                    keys.push(field);
                }
            }
        }
        Ok(())
    }

    async fn run_find(&mut self) -> EngineResult<()> {
        if self.options.limit == Some(0) {
            self.response.results = Vec::new();
            return Ok(());
        }
        let options = FindOptions {
            skip: self.options.skip,
            limit: self.options.limit,
            sort: self.options.order.clone(),
            keys: self.options.storage_keys(),
            acl: self.acl.clone(),
            read_preference: self.options.read_preference.clone(),
            op: self.op,
        };
        let storage = &self.engine.storage;
        let mut results = if let Some(pipeline) = &self.options.pipeline {
            self.ctx
                .guard(storage.aggregate(&self.class_name, pipeline, &options))
                .await?
        } else if let Some(field) = &self.options.distinct {
            self.ctx
                .guard(storage.distinct(&self.class_name, &self.where_, field, &options))
                .await?
        } else {
            self.ctx
                .guard(storage.find(&self.class_name, &self.where_, &options))
                .await?
                .into_iter()
                .map(Value::Object)
                .collect()
        };

        if self.class_name == USER_CLASS {
            for user in results.iter_mut().filter_map(Value::as_object_mut) {
                clean_user_result(user, self.config(), self.auth);
            }
        }
        self.engine
            .files
            .expand_file_pointers(self.config(), &mut results);
        if let Some(class_name) = &self.redirect_class {
            relabel(&mut results, class_name);
        }
        self.response.results = results;
        Ok(())
    }

    async fn run_count(&mut self) -> EngineResult<()> {
        if !self.options.count {
            return Ok(());
        }
        let options = FindOptions {
            acl: self.acl.clone(),
            read_preference: self.options.read_preference.clone(),
            ..Default::default()
        };
        let count = self
            .ctx
            .guard(self.engine.storage.count(&self.class_name, &self.where_, &options))
            .await?;
        self.response.count = Some(count);
        Ok(())
    }

    async fn expand_includes(&mut self) -> EngineResult<()> {
        let max_depth = self.config().max_include_depth;
        if let Some(path) = self.options.include.iter().find(|p| p.len() > max_depth) {
            return Err(EngineError::invalid_query(format!(
                "include path {} exceeds the maximum depth of {}",
                path.join("."),
                max_depth
            )));
        }
        for path in self.options.include.clone() {
            if self.response.results.is_empty() {
                break;
            }
            self.include_path(&path).await?;
        }
        Ok(())
    }

    async fn include_path(&mut self, path: &[String]) -> EngineResult<()> {
        let groups = find_pointers(&self.response.results, path);
        if groups.is_empty() {
            return Ok(());
        }
        let options = self.rest_options.for_include(path);
        let (engine, ctx, auth) = (self.engine, self.ctx, self.auth);
        let fetches = groups.into_iter().map(|(class_name, ids)| {
            let mut ids: Vec<String> = ids.into_iter().collect();
            let mut where_ = Document::new();
            if ids.len() == 1 {
                where_.insert("objectId".into(), json!(ids.remove(0)));
            } else {
                where_.insert("objectId".into(), json!({ "$in": ids }));
            }
            let query = RestQuery::new(engine, ctx, auth, &class_name, where_, options.clone())
                .with_op(FindOp::Get);
            async move {
                let outcome = query.execute().await?;
                Ok::<_, EngineError>((class_name, outcome.response.results))
            }
        });
        let fetched = try_join_all(fetches).await?;

        let mut replacements = Replacements::new();
        for (class_name, objects) in fetched {
            for mut object in objects {
                let Some(fields) = object.as_object_mut() else {
                    continue;
                };
                tag_included(fields, &class_name, auth.is_master);
                let Some(id) = object_id(fields).map(str::to_string) else {
                    continue;
                };
                replacements.insert(
                    Pointer {
                        class_name: class_name.clone(),
                        object_id: id,
                    },
                    object,
                );
            }
        }
        debug!(path = %path.join("."), fetched = replacements.len(), "inflating pointers");
        replace_pointers(&mut self.response.results, path, &replacements);
        Ok(())
    }

    async fn run_after_find(&mut self) -> EngineResult<()> {
        if !self
            .engine
            .has_trigger(&self.class_name, TriggerType::AfterFind)
        {
            return Ok(());
        }
        if self.options.pipeline.is_some() || self.options.distinct.is_some() {
            return Ok(());
        }
        let objects = mem::take(&mut self.response.results);
        let mut objects = self
            .ctx
            .guard(self.engine.triggers.run_after_find(
                TriggerType::AfterFind,
                self.auth,
                &self.class_name,
                objects,
                self.config(),
            ))
            .await?;
        if let Some(class_name) = &self.redirect_class {
            relabel(&mut objects, class_name);
        }
        self.response.results = objects;
        Ok(())
    }
}

/// Strip secrets from a `_User` read result
///
/// The password and storage-only fields always go; the configured
/// sensitive fields go unless the caller is master or the user itself.
fn clean_user_result(user: &mut Document, config: &EngineConfig, auth: &AuthContext) {
    user.remove("password");
    for field in INTERNAL_USER_FIELDS {
        user.remove(*field);
    }
    let is_self = auth.user_id().is_some() && auth.user_id() == object_id(user);
    if !auth.is_master && !is_self {
        for field in &config.user_sensitive_fields {
            user.remove(field);
        }
    }
    clean_auth_data(user);
}

fn relabel(results: &mut [Value], class_name: &str) {
    for object in results.iter_mut().filter_map(Value::as_object_mut) {
        object.insert("className".into(), json!(class_name));
    }
}

/// Runs subqueries as nested reads one level deeper
struct NestedQueries<'a> {
    engine: &'a Engine,
    ctx: &'a RequestContext,
    auth: &'a AuthContext,
    depth: usize,
}

#[async_trait]
impl SubqueryRunner for NestedQueries<'_> {
    async fn run_subquery(
        &self,
        class_name: &str,
        where_: Document,
        options: RestOptions,
    ) -> EngineResult<SubqueryResult> {
        let outcome = RestQuery::new(self.engine, self.ctx, self.auth, class_name, where_, options)
            .at_depth(self.depth)
            .execute()
            .await?;
        let objects = outcome
            .response
            .results
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(object) => Some(object),
                _ => None,
            })
            .collect();
        Ok(SubqueryResult {
            class_name: outcome.class_name,
            objects,
        })
    }
}
