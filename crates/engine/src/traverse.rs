use crate::error::Result;
use sea_query::{Alias, Expr, Query};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use warden_cache::CacheLayer;
use warden_database::{Executor, SqlValue};
use warden_models::{Context, ContextSet};
use warden_schema::{Direction, ModelDef, RelationshipDef, SchemaError, SchemaRegistry};

/// Compacted tree of dotted attribute paths. Keys may themselves be dotted
/// when a chain has no branch points.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathTree(BTreeMap<String, PathTree>);

impl PathTree {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathTree)> {
        self.0.iter()
    }
}

/// Fold paths sharing a common prefix into a [`PathTree`]. Chains without
/// branches collapse into a single dotted key; a path that is a strict prefix
/// of another is absorbed (its nodes are still visited during the walk).
pub fn treefy_paths<I, S>(paths: I) -> PathTree
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut split: Vec<Vec<String>> = paths
        .into_iter()
        .map(|path| {
            path.as_ref()
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|segments| !segments.is_empty())
        .collect();
    split.sort();
    common_path(&split)
}

fn common_path(paths: &[Vec<String>]) -> PathTree {
    let mut tree = BTreeMap::new();
    let mut idx = 0;
    while idx < paths.len() {
        let head = paths[idx][0].clone();
        let mut tails: Vec<Vec<String>> = Vec::new();
        while idx < paths.len() && paths[idx][0] == head {
            let tail = paths[idx][1..].to_vec();
            if !tail.is_empty() {
                tails.push(tail);
            }
            idx += 1;
        }
        let mut key = head;
        let mut sub = common_path(&tails);
        while sub.0.len() == 1 {
            if let Some((child, grandchildren)) = sub.0.pop_first() {
                key = format!("{}.{}", key, child);
                sub = grandchildren;
            }
        }
        tree.insert(key, sub);
    }
    PathTree(tree)
}

/// Value reached by resolving one attribute for one source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Scalar(SqlValue),
    One(Context),
    Many(ContextSet),
}

/// Aggregate value of one traversal step over a whole frontier.
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    Scalars(Vec<SqlValue>),
    Contexts(ContextSet),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub depth: usize,
    pub value: StepValue,
}

/// Cache shape of a resolved edge entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Footprint {
    None,
    Id(i64),
    Ids(Vec<i64>),
    Int(i64),
    Text(String),
    Bool(bool),
}

impl Footprint {
    fn from_resolved(value: Option<&Resolved>) -> Footprint {
        match value {
            None => Footprint::None,
            Some(Resolved::One(context)) => Footprint::Id(context.id),
            Some(Resolved::Many(set)) => Footprint::Ids(set.ids().to_vec()),
            Some(Resolved::Scalar(SqlValue::Int(v))) => Footprint::Int(*v),
            Some(Resolved::Scalar(SqlValue::Text(v))) => Footprint::Text(v.clone()),
            Some(Resolved::Scalar(SqlValue::Bool(v))) => Footprint::Bool(*v),
            Some(Resolved::Scalar(SqlValue::Null)) => Footprint::None,
        }
    }

    fn into_resolved(self, target_table: Option<&str>) -> Option<Resolved> {
        match (self, target_table) {
            (Footprint::None, _) => None,
            (Footprint::Id(id), Some(table)) => Some(Resolved::One(Context::new(table, id))),
            (Footprint::Ids(ids), Some(table)) => {
                ContextSet::new(table, ids).map(Resolved::Many)
            }
            (Footprint::Int(v), _) => Some(Resolved::Scalar(SqlValue::Int(v))),
            (Footprint::Text(v), _) => Some(Resolved::Scalar(SqlValue::Text(v))),
            (Footprint::Bool(v), _) => Some(Resolved::Scalar(SqlValue::Bool(v))),
            (Footprint::Id(_) | Footprint::Ids(_), None) => None,
        }
    }
}

enum EdgeKind<'a> {
    Column,
    Relation(&'a RelationshipDef),
}

/// Cached, batched resolution of attribute paths over the relational schema.
pub struct Traverser<'a> {
    schema: &'a SchemaRegistry,
    db: &'a Arc<dyn Executor>,
    cache: &'a CacheLayer,
}

impl<'a> Traverser<'a> {
    pub fn new(
        schema: &'a SchemaRegistry,
        db: &'a Arc<dyn Executor>,
        cache: &'a CacheLayer,
    ) -> Self {
        Self { schema, db, cache }
    }

    fn edge_kind<'m>(&self, model: &'m ModelDef, attribute: &str) -> Result<EdgeKind<'m>> {
        if let Some(rel) = model.relationship(attribute) {
            return Ok(EdgeKind::Relation(rel));
        }
        if model.has_column(attribute) {
            return Ok(EdgeKind::Column);
        }
        Err(SchemaError::UnknownAttribute {
            model: model.name.clone(),
            attribute: attribute.to_string(),
        }
        .into())
    }

    /// Resolve `attribute` for every member of `set`, one batched query per
    /// cache miss. Rows that resolve to nothing are cached as such and left
    /// out of the result.
    pub async fn resolve_edge(
        &self,
        set: &ContextSet,
        attribute: &str,
    ) -> Result<HashMap<i64, Resolved>> {
        let model = self.schema.model(set.table())?;
        let kind = self.edge_kind(model, attribute)?;
        let target_table = match &kind {
            EdgeKind::Column => None,
            EdgeKind::Relation(rel) => Some(self.schema.model(&rel.target)?.table.clone()),
        };

        let key = format!("traverse:{}.{}", model.table, attribute);
        let fields: Vec<String> = set.ids().iter().map(i64::to_string).collect();
        let cached = self.cache.get_many(&key, &fields).await?;

        let mut resolved: HashMap<i64, Resolved> = HashMap::new();
        let mut missing: Vec<i64> = Vec::new();
        for (id, blob) in set.ids().iter().zip(cached) {
            match blob {
                Some(bytes) => {
                    let footprint: Footprint = serde_json::from_slice(&bytes)?;
                    if let Some(value) = footprint.into_resolved(target_table.as_deref()) {
                        resolved.insert(*id, value);
                    }
                }
                None => missing.push(*id),
            }
        }

        if !missing.is_empty() {
            let computed = match kind {
                EdgeKind::Column => self.query_column(model, attribute, &missing).await?,
                EdgeKind::Relation(rel) => self.query_relation(model, rel, &missing).await?,
            };
            let entries: Vec<(String, Vec<u8>)> = missing
                .iter()
                .map(|id| {
                    let footprint = Footprint::from_resolved(computed.get(id));
                    Ok((id.to_string(), serde_json::to_vec(&footprint)?))
                })
                .collect::<Result<_>>()?;
            self.cache.put_many(&key, &entries).await?;
            resolved.extend(computed);
        }
        Ok(resolved)
    }

    async fn query_column(
        &self,
        model: &ModelDef,
        column: &str,
        ids: &[i64],
    ) -> Result<HashMap<i64, Resolved>> {
        let stmt = Query::select()
            .columns([Alias::new(&model.primary_key), Alias::new(column)])
            .from(Alias::new(&model.table))
            .and_where(Expr::col(Alias::new(&model.primary_key)).is_in(ids.iter().copied()))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        let mut out = HashMap::new();
        for row in rows {
            let value = row.get(1).clone();
            if !value.is_null() {
                out.insert(row.i64(0)?, Resolved::Scalar(value));
            }
        }
        Ok(out)
    }

    async fn query_relation(
        &self,
        model: &ModelDef,
        rel: &RelationshipDef,
        ids: &[i64],
    ) -> Result<HashMap<i64, Resolved>> {
        let target = self.schema.model(&rel.target)?;
        let mut out = HashMap::new();
        match rel.direction {
            Direction::ToOne => {
                let fk = rel.fk_column.as_deref().ok_or_else(|| invalid(rel))?;
                let stmt = Query::select()
                    .columns([Alias::new(&model.primary_key), Alias::new(fk)])
                    .from(Alias::new(&model.table))
                    .and_where(
                        Expr::col(Alias::new(&model.primary_key)).is_in(ids.iter().copied()),
                    )
                    .to_owned();
                for row in self.db.fetch_all(&stmt).await? {
                    if let Some(fk_value) = row.opt_i64(1)? {
                        out.insert(
                            row.i64(0)?,
                            Resolved::One(Context::new(target.table.clone(), fk_value)),
                        );
                    }
                }
            }
            Direction::ToMany => {
                let fk = rel.fk_column.as_deref().ok_or_else(|| invalid(rel))?;
                let stmt = Query::select()
                    .columns([Alias::new(fk), Alias::new(&target.primary_key)])
                    .from(Alias::new(&target.table))
                    .and_where(Expr::col(Alias::new(fk)).is_in(ids.iter().copied()))
                    .to_owned();
                out = group_pairs(self.db.fetch_all(&stmt).await?, &target.table)?;
            }
            Direction::ManyToMany => {
                let secondary = rel.secondary.as_ref().ok_or_else(|| invalid(rel))?;
                let stmt = Query::select()
                    .columns([
                        Alias::new(&secondary.local_fk),
                        Alias::new(&secondary.remote_fk),
                    ])
                    .from(Alias::new(&secondary.table))
                    .and_where(
                        Expr::col(Alias::new(&secondary.local_fk)).is_in(ids.iter().copied()),
                    )
                    .to_owned();
                out = group_pairs(self.db.fetch_all(&stmt).await?, &target.table)?;
            }
        }
        Ok(out)
    }

    /// Transitive expansion of a self-recursive edge: repeat the step until
    /// it yields no new ids. The starting ids are not part of the result.
    pub async fn expand_recursive(
        &self,
        set: &ContextSet,
        attribute: &str,
    ) -> Result<Option<ContextSet>> {
        let mut seen: BTreeSet<i64> = set.ids().iter().copied().collect();
        let mut frontier = set.clone();
        let mut collected: Option<ContextSet> = None;
        loop {
            let resolved = self.resolve_edge(&frontier, attribute).await?;
            let mut table = None;
            let mut fresh: Vec<i64> = Vec::new();
            for value in resolved.values() {
                match value {
                    Resolved::One(context) => {
                        table = Some(context.table.clone());
                        if seen.insert(context.id) {
                            fresh.push(context.id);
                        }
                    }
                    Resolved::Many(members) => {
                        table = Some(members.table().to_string());
                        for id in members.ids() {
                            if seen.insert(*id) {
                                fresh.push(*id);
                            }
                        }
                    }
                    Resolved::Scalar(_) => {}
                }
            }
            let Some(table) = table else { break };
            let Some(next) = ContextSet::new(table, fresh) else {
                break;
            };
            collected = Some(match collected {
                Some(acc) => acc.union(&next)?,
                None => next.clone(),
            });
            frontier = next;
        }
        Ok(collected)
    }

    /// Walk `path` from `start`, yielding the aggregate value at each depth
    /// of at least `skip` (depths are 1-based). A self-recursive segment
    /// contributes its whole fixpoint as a single step.
    pub async fn traverse(
        &self,
        start: &ContextSet,
        path: &str,
        skip: usize,
    ) -> Result<Vec<Step>> {
        let mut steps = Vec::new();
        let mut frontier = start.clone();
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        for (idx, segment) in segments.iter().enumerate() {
            let depth = idx + 1;
            let model = self.schema.model(frontier.table())?;
            let recursive = model
                .relationship(segment)
                .map(|rel| self.schema.is_recursive(rel))
                .unwrap_or(false);

            let value = if recursive {
                self.expand_recursive(&frontier, segment)
                    .await?
                    .map(StepValue::Contexts)
            } else {
                let resolved = self.resolve_edge(&frontier, segment).await?;
                aggregate(resolved)?
            };

            match value {
                None => break,
                Some(StepValue::Scalars(values)) => {
                    if depth >= skip {
                        steps.push(Step {
                            depth,
                            value: StepValue::Scalars(values),
                        });
                    }
                    break;
                }
                Some(StepValue::Contexts(set)) => {
                    if depth >= skip {
                        steps.push(Step {
                            depth,
                            value: StepValue::Contexts(set.clone()),
                        });
                    }
                    frontier = set;
                }
            }
        }
        Ok(steps)
    }

    /// Drive a compacted path tree from `root`, yielding the root itself and
    /// every aggregate value reached along any branch.
    pub async fn tree_traverse(
        &self,
        root: &ContextSet,
        tree: &PathTree,
    ) -> Result<Vec<StepValue>> {
        let mut out = vec![StepValue::Contexts(root.clone())];
        self.tree_walk(root, tree, 0, &mut out).await?;
        Ok(out)
    }

    fn tree_walk<'s>(
        &'s self,
        node: &'s ContextSet,
        tree: &'s PathTree,
        skip: usize,
        out: &'s mut Vec<StepValue>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 's>> {
        Box::pin(async move {
            for (segment, subtree) in tree.iter() {
                let seg_len = segment.matches('.').count() + 1;
                let steps = self.traverse(node, segment, 0).await?;
                let mut terminal: Option<ContextSet> = None;
                for step in steps {
                    if step.depth == seg_len {
                        if let StepValue::Contexts(set) = &step.value {
                            terminal = Some(set.clone());
                        }
                    }
                    if step.depth >= skip {
                        out.push(step.value);
                    }
                }
                if let Some(set) = terminal {
                    if !subtree.is_empty() {
                        self.tree_walk(&set, subtree, skip.saturating_sub(seg_len), out)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }
}

fn invalid(rel: &RelationshipDef) -> crate::error::AuthzError {
    SchemaError::InvalidRelation {
        model: rel.source.clone(),
        relation: rel.name.clone(),
    }
    .into()
}

fn group_pairs(
    rows: Vec<warden_database::SqlRow>,
    target_table: &str,
) -> Result<HashMap<i64, Resolved>> {
    let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.i64(0)?).or_default().push(row.i64(1)?);
    }
    Ok(grouped
        .into_iter()
        .filter_map(|(key, ids)| {
            ContextSet::new(target_table, ids).map(|set| (key, Resolved::Many(set)))
        })
        .collect())
}

fn aggregate(resolved: HashMap<i64, Resolved>) -> Result<Option<StepValue>> {
    let mut scalars: Vec<SqlValue> = Vec::new();
    let mut sets: Vec<ContextSet> = Vec::new();
    for value in resolved.into_values() {
        match value {
            Resolved::Scalar(v) => scalars.push(v),
            Resolved::One(context) => sets.push(context.into()),
            Resolved::Many(set) => sets.push(set),
        }
    }
    if !scalars.is_empty() {
        return Ok(Some(StepValue::Scalars(scalars)));
    }
    Ok(ContextSet::join(sets)?.map(StepValue::Contexts))
}
