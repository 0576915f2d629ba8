use crate::checkers::{Checker, JoinSpec, JoinStep, WhereSpec};
use crate::error::{AuthzError, Result};
use crate::query::Select;
use crate::traverse::Traverser;
use sea_query::{Alias, Condition, Expr, Query};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use warden_cache::{CacheLayer, KvStore, MemoryStore};
use warden_database::{Executor, GrantRepository};
use warden_models::{Context, ContextSet, NewGroup};
use warden_schema::{Direction, PropagationSchema, SchemaRegistry};

const CTX_ROLES_KEY: &str = "auth:ctxroles";
const PERM_ROLES_KEY: &str = "auth:perm_roles";
const PERM_IDS_KEY: &str = "auth:perm_ids";
const GLOBAL_PERMS_KEY: &str = "auth:global";

/// Whom a grant is addressed to. A grant to a user materializes the user's
/// personal group and grants to that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    User(i64),
    Group(i64),
}

/// Whose contexts to look up: a user (resolved through memberships) or an
/// explicit set of group ids.
#[derive(Debug, Clone)]
pub enum Principal {
    User(i64),
    Groups(HashSet<i64>),
}

impl From<i64> for Principal {
    fn from(user_id: i64) -> Self {
        Principal::User(user_id)
    }
}

impl From<HashSet<i64>> for Principal {
    fn from(groups: HashSet<i64>) -> Self {
        Principal::Groups(groups)
    }
}

/// The authorization facade: checks, query rewriting and grant management
/// over the schema registry, grant store, traversal engine and cache.
#[derive(Clone)]
pub struct Engine {
    schema: Arc<SchemaRegistry>,
    db: Arc<dyn Executor>,
    cache: CacheLayer,
    store: GrantRepository,
    inverted: PropagationSchema,
    actions: Arc<RwLock<HashMap<(String, String), Arc<Checker>>>>,
}

pub struct EngineBuilder {
    schema: SchemaRegistry,
    db: Arc<dyn Executor>,
    kv: Option<Arc<dyn KvStore>>,
    propagation: PropagationSchema,
    actions: Vec<(String, String, Checker)>,
}

impl EngineBuilder {
    pub fn new(schema: SchemaRegistry, db: Arc<dyn Executor>) -> Self {
        Self {
            schema,
            db,
            kv: None,
            propagation: PropagationSchema::new(),
            actions: Vec::new(),
        }
    }

    /// Shared cache store; defaults to a process-local one.
    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Declare relationships of `model` along which authorization propagates.
    pub fn propagate<I, S>(mut self, model: &str, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.propagation
            .entry(model.to_string())
            .or_default()
            .extend(relations.into_iter().map(Into::into));
        self
    }

    /// Register the checker deciding `action` on `model`.
    pub fn action(mut self, model: &str, action: &str, checker: Checker) -> Self {
        self.actions
            .push((model.to_string(), action.to_string(), checker));
        self
    }

    pub fn build(self) -> Result<Engine> {
        let inverted = self.schema.invert_propagation(&self.propagation)?;

        let mut actions: HashMap<(String, String), Arc<Checker>> = HashMap::new();
        for (model, action, checker) in self.actions {
            let canonical = self.schema.model(&model)?.name.clone();
            actions.insert((canonical, action), Arc::new(checker));
        }

        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KvStore>);
        let store = GrantRepository::new(Arc::clone(&self.db));

        Ok(Engine {
            schema: Arc::new(self.schema),
            db: self.db,
            cache: CacheLayer::new(kv),
            store,
            inverted,
            actions: Arc::new(RwLock::new(actions)),
        })
    }
}

impl Engine {
    pub fn builder(schema: SchemaRegistry, db: Arc<dyn Executor>) -> EngineBuilder {
        EngineBuilder::new(schema, db)
    }

    /// A handle with a fresh request-level cache; shared state (schema,
    /// store, action table, shared cache) stays common.
    pub fn scoped(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            db: Arc::clone(&self.db),
            cache: self.cache.scoped(),
            store: self.store.clone(),
            inverted: self.inverted.clone(),
            actions: Arc::clone(&self.actions),
        }
    }

    /// Create the engine's own tables when missing.
    pub async fn install(&self) -> Result<()> {
        self.store.install().await?;
        Ok(())
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn store(&self) -> &GrantRepository {
        &self.store
    }

    pub fn traverser(&self) -> Traverser<'_> {
        Traverser::new(&self.schema, &self.db, &self.cache)
    }

    // -- cached reads -------------------------------------------------------

    pub async fn user_groups(&self, user_id: i64) -> Result<HashSet<i64>> {
        Ok(self.store.user_groups(user_id).await?)
    }

    /// Role ids granted to `group_id` in exactly `context`.
    pub async fn contextual_roles(
        &self,
        group_id: i64,
        context: &Context,
    ) -> Result<HashSet<i64>> {
        let field = format!("{}:{}:{}", group_id, context.table, context.id);
        if let Some(blob) = self.cache.get(CTX_ROLES_KEY, &field).await? {
            let roles: Vec<i64> = serde_json::from_slice(&blob)?;
            return Ok(roles.into_iter().collect());
        }
        let roles = self.store.contextual_roles(group_id, context).await?;
        let mut sorted: Vec<i64> = roles.iter().copied().collect();
        sorted.sort_unstable();
        self.cache
            .put(CTX_ROLES_KEY, &field, serde_json::to_vec(&sorted)?)
            .await?;
        Ok(roles)
    }

    pub async fn perms_to_roles(&self) -> Result<BTreeMap<String, BTreeSet<i64>>> {
        if let Some(blob) = self.cache.get(PERM_ROLES_KEY, "all").await? {
            return Ok(serde_json::from_slice(&blob)?);
        }
        let map = self.store.perms_to_roles().await?;
        self.cache
            .put(PERM_ROLES_KEY, "all", serde_json::to_vec(&map)?)
            .await?;
        Ok(map)
    }

    pub async fn permission_name_ids(&self) -> Result<BTreeMap<String, i64>> {
        if let Some(blob) = self.cache.get(PERM_IDS_KEY, "all").await? {
            return Ok(serde_json::from_slice(&blob)?);
        }
        let map = self.store.permission_name_ids().await?;
        self.cache
            .put(PERM_IDS_KEY, "all", serde_json::to_vec(&map)?)
            .await?;
        Ok(map)
    }

    pub async fn global_permissions(&self) -> Result<BTreeSet<String>> {
        if let Some(blob) = self.cache.get(GLOBAL_PERMS_KEY, "all").await? {
            return Ok(serde_json::from_slice(&blob)?);
        }
        let names = self.store.global_permissions().await?;
        self.cache
            .put(GLOBAL_PERMS_KEY, "all", serde_json::to_vec(&names)?)
            .await?;
        Ok(names)
    }

    /// All role ids bearing `permission`; empty when the permission is
    /// unknown.
    pub async fn roles_for_permission(&self, permission: &str) -> Result<HashSet<i64>> {
        Ok(self
            .perms_to_roles()
            .await?
            .get(permission)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Permitted row ids per model for `permission`, from the non-global
    /// grants of `group_ids`. Grants on tables outside the schema registry
    /// cannot affect this schema's queries and are skipped.
    pub(crate) async fn permitted_contexts(
        &self,
        group_ids: &HashSet<i64>,
        permission: &str,
    ) -> Result<BTreeMap<String, Vec<i64>>> {
        let roles = self.roles_for_permission(permission).await?;
        let pairs = self.store.granted_contexts(group_ids, &roles).await?;
        let mut map: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (table, id) in pairs {
            match self.schema.model(&table) {
                Ok(model) => map.entry(model.name.clone()).or_default().push(id),
                Err(_) => {
                    tracing::debug!(table = %table, "granted context outside the schema; skipped");
                }
            }
        }
        for ids in map.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        Ok(map)
    }

    // -- decisions ----------------------------------------------------------

    /// Whether `user_id` may perform `action` on `record`. Denies when an
    /// internal lookup fails.
    pub async fn can(&self, user_id: i64, action: &str, record: &Context) -> Result<bool> {
        match self.can_inner(user_id, action, record).await {
            Ok(allowed) => Ok(allowed),
            Err(err) if err.is_lookup_failure() => {
                tracing::warn!(error = %err, user_id, action, "check failed; denying");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn can_inner(&self, user_id: i64, action: &str, record: &Context) -> Result<bool> {
        let model_name = self.schema.model(&record.table)?.name.clone();
        let checker = self.action_checker(&model_name, action).await?;
        let group_ids = self.user_groups(user_id).await?;
        let role_ids = self.roles_for_permission(action).await?;
        checker
            .evaluate(self, user_id, &group_ids, &role_ids, record)
            .await
    }

    /// Direct grant check: the user holds a role bearing `permission` in
    /// exactly `context`. Denies when an internal lookup fails.
    pub async fn has_permission(
        &self,
        user_id: i64,
        permission: &str,
        context: &Context,
    ) -> Result<bool> {
        let outcome: Result<bool> = async {
            let role_ids = self.roles_for_permission(permission).await?;
            if role_ids.is_empty() {
                return Ok(false);
            }
            for group_id in self.user_groups(user_id).await? {
                let granted = self.contextual_roles(group_id, context).await?;
                if granted.iter().any(|role| role_ids.contains(role)) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        .await;
        match outcome {
            Ok(allowed) => Ok(allowed),
            Err(err) if err.is_lookup_failure() => {
                tracing::warn!(error = %err, user_id, permission, "check failed; denying");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Every non-global context where the principal holds a role bearing
    /// `permission`, batched per table.
    pub async fn contexts_by_permission(
        &self,
        principal: impl Into<Principal>,
        permission: &str,
    ) -> Result<Vec<ContextSet>> {
        let group_ids = match principal.into() {
            Principal::User(user_id) => self.user_groups(user_id).await?,
            Principal::Groups(groups) => groups,
        };
        let role_ids = self.roles_for_permission(permission).await?;
        if group_ids.is_empty() || role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pairs = self.store.granted_contexts(&group_ids, &role_ids).await?;
        let mut by_table: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (table, id) in pairs {
            by_table.entry(table).or_default().push(id);
        }
        Ok(by_table
            .into_iter()
            .filter_map(|(table, ids)| ContextSet::new(table, ids))
            .collect())
    }

    // -- checker registry ---------------------------------------------------

    /// The checker registered for `(model, action)`; synthesized from the
    /// inverted propagation schema on first use and memoized.
    pub async fn action_checker(&self, model: &str, action: &str) -> Result<Arc<Checker>> {
        let key = (model.to_string(), action.to_string());
        if let Some(checker) = self.actions.read().await.get(&key) {
            return Ok(Arc::clone(checker));
        }
        let paths = self.schema.explode_paths(&self.inverted, model)?;
        let synthesized = Checker::global(action) | Checker::path(action, paths);
        let mut registry = self.actions.write().await;
        let entry = registry.entry(key).or_insert_with(|| Arc::new(synthesized));
        Ok(Arc::clone(entry))
    }

    // -- query rewriting ----------------------------------------------------

    /// Rewrite `query` so it returns only rows on which `user_id` may
    /// perform `action`. Appends joins and a WHERE; never touches the
    /// caller's projection, joins or ordering.
    pub async fn accessible_query(
        &self,
        user_id: i64,
        query: Select,
        action: &str,
    ) -> Result<Select> {
        let target_table = query.target()?.to_string();
        let model_name = self.schema.model(&target_table)?.name.clone();
        let checker = self.action_checker(&model_name, action).await?;
        let group_ids = self.user_groups(user_id).await?;

        let planned = async {
            let joins = checker.joins(self, &group_ids, &model_name).await?;
            let filter = checker
                .where_spec(self, user_id, &group_ids, &model_name)
                .await?;
            Ok::<_, AuthzError>((joins, filter))
        }
        .await;

        let (joins, filter) = match planned {
            Ok(parts) => parts,
            Err(AuthzError::NotRewritable) => {
                return self
                    .per_row_rewrite(user_id, query, action, &checker, &group_ids)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let mut query = query;
        match joins {
            JoinSpec::AlwaysTrue => return Ok(query),
            JoinSpec::Impossible => {
                query.append_false();
                return Ok(query);
            }
            JoinSpec::Relations(steps) => {
                for step in &steps {
                    self.apply_join(&mut query, step)?;
                }
            }
        }
        match filter {
            WhereSpec::True => {}
            WhereSpec::False => query.append_false(),
            WhereSpec::Pred(condition) => query.append_condition(condition),
        }
        Ok(query)
    }

    fn apply_join(&self, query: &mut Select, step: &JoinStep) -> Result<()> {
        let rel = self.schema.relationship(&step.source, &step.relation)?;
        let source = self.schema.model(&step.source)?;
        let target = self.schema.model(&rel.target)?;
        match rel.direction {
            Direction::ToOne => {
                if query.has_join(&target.table) {
                    return Ok(());
                }
                let fk = rel.fk_column.as_deref().unwrap_or(&target.primary_key);
                let on = Expr::col((Alias::new(&target.table), Alias::new(&target.primary_key)))
                    .equals((Alias::new(&source.table), Alias::new(fk)));
                query.append_left_join(&target.table, on);
            }
            Direction::ToMany => {
                if query.has_join(&target.table) {
                    return Ok(());
                }
                let fk = rel.fk_column.as_deref().unwrap_or(&source.primary_key);
                let on = Expr::col((Alias::new(&target.table), Alias::new(fk)))
                    .equals((Alias::new(&source.table), Alias::new(&source.primary_key)));
                query.append_left_join(&target.table, on);
            }
            Direction::ManyToMany => {
                let Some(secondary) = rel.secondary.as_ref() else {
                    return Ok(());
                };
                if !query.has_join(&secondary.table) {
                    let on = Expr::col((
                        Alias::new(&secondary.table),
                        Alias::new(&secondary.local_fk),
                    ))
                    .equals((Alias::new(&source.table), Alias::new(&source.primary_key)));
                    query.append_left_join(&secondary.table, on);
                }
                if !query.has_join(&target.table) {
                    let on = Expr::col((Alias::new(&target.table), Alias::new(&target.primary_key)))
                        .equals((
                            Alias::new(&secondary.table),
                            Alias::new(&secondary.remote_fk),
                        ));
                    query.append_left_join(&target.table, on);
                }
            }
        }
        Ok(())
    }

    /// Fallback for checkers whose rewrite is undefined: evaluate row by row
    /// and restrict the query to the allowed id list.
    async fn per_row_rewrite(
        &self,
        user_id: i64,
        query: Select,
        action: &str,
        checker: &Checker,
        group_ids: &HashSet<i64>,
    ) -> Result<Select> {
        let target_table = query.target()?.to_string();
        let model = self.schema.model(&target_table)?;
        let stmt = Query::select()
            .column(Alias::new(&model.primary_key))
            .from(Alias::new(&model.table))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        let role_ids = self.roles_for_permission(action).await?;

        let mut allowed: Vec<i64> = Vec::new();
        for row in rows {
            let id = row.i64(0)?;
            let record = Context::new(model.table.clone(), id);
            if checker
                .evaluate(self, user_id, group_ids, &role_ids, &record)
                .await?
            {
                allowed.push(id);
            }
        }
        tracing::debug!(
            target = %target_table,
            allowed = allowed.len(),
            "rewrite fell back to per-row evaluation"
        );

        let mut query = query;
        if allowed.is_empty() {
            query.append_false();
        } else {
            query.append_condition(Condition::all().add(
                Expr::col((Alias::new(&model.table), Alias::new(&model.primary_key)))
                    .is_in(allowed),
            ));
        }
        Ok(query)
    }

    // -- mutations ----------------------------------------------------------

    /// Grant `role_name` to a group (or to a user's personal group) in
    /// `context`. Idempotent: returns `false` when the grant already exists.
    pub async fn grant(
        &self,
        subject: Subject,
        role_name: &str,
        context: &Context,
    ) -> Result<bool> {
        let role = self
            .store
            .role_by_name(role_name)
            .await?
            .ok_or_else(|| {
                AuthzError::GrantRejected(format!("role {} does not exist", role_name))
            })?;
        if !role.allows_table(&context.table) {
            return Err(AuthzError::GrantRejected(format!(
                "role {} cannot be granted on table {}",
                role_name, context.table
            )));
        }

        let group_id = match subject {
            Subject::Group(group_id) => group_id,
            Subject::User(user_id) => self.personal_group_for(user_id).await?,
        };

        if self.store.grant_exists(group_id, role.id, context).await? {
            return Ok(false);
        }
        self.store.insert_grant(group_id, role.id, context).await?;
        self.invalidate_contextual_roles(group_id, context).await?;
        tracing::info!(group_id, role = %role.name, context = %context, "role granted");
        Ok(true)
    }

    /// Revoke a grant; revoking an unknown role or absent grant is a no-op.
    pub async fn revoke(&self, group_id: i64, role_name: &str, context: &Context) -> Result<()> {
        let Some(role) = self.store.role_by_name(role_name).await? else {
            return Ok(());
        };
        let removed = self.store.delete_grant(group_id, role.id, context).await?;
        if removed > 0 {
            self.invalidate_contextual_roles(group_id, context).await?;
            tracing::info!(group_id, role = %role.name, context = %context, "role revoked");
        }
        Ok(())
    }

    /// Assign permissions to a role, creating either side on demand.
    /// Idempotent: returns `false` when every assignment already existed.
    pub async fn assign(&self, role_name: &str, permissions: &[&str]) -> Result<bool> {
        let role = self.store.get_or_create_role(role_name).await?;
        let mut changed = false;
        for name in permissions {
            let permission = self.store.get_or_create_permission(name).await?;
            changed |= self
                .store
                .link_role_permission(role.id, permission.id)
                .await?;
        }
        if changed {
            self.cache.invalidate_all(PERM_ROLES_KEY).await?;
            self.cache.invalidate_all(PERM_IDS_KEY).await?;
            tracing::info!(role = %role.name, ?permissions, "permissions assigned");
        }
        Ok(changed)
    }

    /// Remove permissions from a role: permission ids are collected first,
    /// then the assignments are deleted in one statement. Returns the number
    /// of assignments removed.
    pub async fn unassign(&self, role_name: &str, permissions: &[&str]) -> Result<u64> {
        let Some(role) = self.store.role_by_name(role_name).await? else {
            return Ok(0);
        };
        let known = self.permission_name_ids().await?;
        let ids: Vec<i64> = permissions
            .iter()
            .filter_map(|name| known.get(*name).copied())
            .collect();
        let removed = self.store.unlink_role_permissions(role.id, &ids).await?;
        if removed > 0 {
            self.cache.invalidate_all(PERM_ROLES_KEY).await?;
            tracing::info!(role = %role.name, removed, "permissions unassigned");
        }
        Ok(removed)
    }

    /// Flag permissions as global (or not), creating missing ones.
    /// Idempotent: returns `false` when nothing changed.
    pub async fn set_permission_global(
        &self,
        is_global: bool,
        permissions: &[&str],
    ) -> Result<bool> {
        let mut created = false;
        let mut delta: Vec<i64> = Vec::new();
        for name in permissions {
            let permission = match self.store.permission_by_name(name).await? {
                Some(existing) => existing,
                None => {
                    created = true;
                    self.store.get_or_create_permission(name).await?
                }
            };
            if permission.is_global != is_global {
                delta.push(permission.id);
            }
        }
        if created {
            self.cache.invalidate_all(PERM_IDS_KEY).await?;
        }
        if delta.is_empty() {
            return Ok(false);
        }
        self.store.set_permissions_global(&delta, is_global).await?;
        self.cache.invalidate_all(GLOBAL_PERMS_KEY).await?;
        tracing::info!(?permissions, is_global, "global flag updated");
        Ok(true)
    }

    /// The user's personal group, materialized on first use.
    async fn personal_group_for(&self, user_id: i64) -> Result<i64> {
        if let Some(group) = self.store.personal_group(user_id).await? {
            return Ok(group.id);
        }
        let group_id = self.store.create_group(&NewGroup::personal(user_id)).await?;
        self.store.add_membership(user_id, group_id).await?;
        tracing::info!(user_id, group_id, "personal group created");
        Ok(group_id)
    }

    async fn invalidate_contextual_roles(&self, group_id: i64, context: &Context) -> Result<()> {
        let field = format!("{}:{}:{}", group_id, context.table, context.id);
        self.cache.invalidate(CTX_ROLES_KEY, &[field]).await?;
        Ok(())
    }
}
