use crate::engine::Engine;
use crate::error::{AuthzError, Result};
use crate::traverse::{treefy_paths, PathTree, Resolved, Step, StepValue};
use sea_query::{Alias, Condition, Expr};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use warden_database::SqlValue;
use warden_models::{Context, ContextSet};
use warden_schema::{ModelDef, RelationshipDef, SchemaError};

/// One relation to outer-join while rewriting a query, identified by the
/// model it hangs off of and the relationship name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinStep {
    pub source: String,
    pub relation: String,
}

/// Join requirements of a checker against a target model.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinSpec {
    /// Every row qualifies; the query needs no restriction at all.
    AlwaysTrue,
    /// No row can qualify.
    Impossible,
    /// Outer-join these relations, deduplicated, in declaration order.
    Relations(Vec<JoinStep>),
}

/// Filter requirements of a checker against a target model.
#[derive(Debug, Clone)]
pub enum WhereSpec {
    True,
    False,
    Pred(Condition),
}

/// Node of the permission-checker algebra.
///
/// Every variant answers the same two questions: is this concrete record
/// permitted (`evaluate`), and which join/where fragments restrict a query
/// to permitted rows (`joins`/`where_spec`). The engine handle is passed
/// explicitly to each operation.
#[derive(Debug, Clone)]
pub enum Checker {
    Path {
        permission: String,
        paths: Vec<String>,
        tree: PathTree,
    },
    Owner {
        on: String,
    },
    Group {
        on: String,
    },
    Global {
        permission: String,
    },
    And(Vec<Checker>),
    Or(Vec<Checker>),
    Not(Box<Checker>),
}

impl Checker {
    /// Succeeds when any context reached along any of `paths` (or the record
    /// itself) carries a suitable role grant.
    pub fn path<I, S>(permission: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        let tree = treefy_paths(&paths);
        Checker::Path {
            permission: permission.into(),
            paths,
            tree,
        }
    }

    /// Succeeds when the attribute at the end of `on` equals the user's id.
    pub fn owner(on: impl Into<String>) -> Self {
        Checker::Owner { on: on.into() }
    }

    /// Succeeds when the attribute at the end of `on` is one of the user's
    /// group ids.
    pub fn group(on: impl Into<String>) -> Self {
        Checker::Group { on: on.into() }
    }

    /// Succeeds on globally-flagged permissions or global-context grants,
    /// independent of the record.
    pub fn global(permission: impl Into<String>) -> Self {
        Checker::Global {
            permission: permission.into(),
        }
    }

    pub fn evaluate<'a>(
        &'a self,
        engine: &'a Engine,
        user_id: i64,
        group_ids: &'a HashSet<i64>,
        role_ids: &'a HashSet<i64>,
        record: &'a Context,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Checker::Path { tree, .. } => {
                    let start: ContextSet = record.clone().into();
                    let yields = engine.traverser().tree_traverse(&start, tree).await?;
                    for value in yields {
                        let StepValue::Contexts(set) = value else {
                            continue;
                        };
                        for context in set.iter() {
                            for group_id in group_ids {
                                let granted =
                                    engine.contextual_roles(*group_id, &context).await?;
                                if granted.iter().any(|role| role_ids.contains(role)) {
                                    return Ok(true);
                                }
                            }
                        }
                    }
                    Ok(false)
                }
                Checker::Owner { on } => {
                    let values = terminal_values(engine, record, on).await?;
                    Ok(values.contains(&SqlValue::Int(user_id)))
                }
                Checker::Group { on } => {
                    let values = terminal_values(engine, record, on).await?;
                    Ok(values
                        .iter()
                        .filter_map(SqlValue::as_i64)
                        .any(|id| group_ids.contains(&id)))
                }
                Checker::Global { permission } => {
                    if engine.global_permissions().await?.contains(permission) {
                        return Ok(engine.store().has_any_role(group_ids, role_ids).await?);
                    }
                    let global = Context::global();
                    for group_id in group_ids {
                        let granted = engine.contextual_roles(*group_id, &global).await?;
                        if granted.iter().any(|role| role_ids.contains(role)) {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Checker::And(children) => {
                    for child in children {
                        if !child
                            .evaluate(engine, user_id, group_ids, role_ids, record)
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Checker::Or(children) => {
                    for child in children {
                        if child
                            .evaluate(engine, user_id, group_ids, role_ids, record)
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Checker::Not(child) => Ok(!child
                    .evaluate(engine, user_id, group_ids, role_ids, record)
                    .await?),
            }
        })
    }

    pub async fn joins(
        &self,
        engine: &Engine,
        group_ids: &HashSet<i64>,
        target: &str,
    ) -> Result<JoinSpec> {
        self.joins_inner(engine, group_ids, target, false).await
    }

    fn joins_inner<'a>(
        &'a self,
        engine: &'a Engine,
        group_ids: &'a HashSet<i64>,
        target: &'a str,
        negated: bool,
    ) -> Pin<Box<dyn Future<Output = Result<JoinSpec>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Checker::Path {
                    permission, paths, ..
                } => {
                    if negated {
                        return Err(AuthzError::NotRewritable);
                    }
                    let (joins, _) = path_plan(engine, permission, paths, group_ids, target).await?;
                    Ok(joins)
                }
                Checker::Owner { on } => {
                    let (steps, _, _) = terminal_ref(engine, target, on)?;
                    Ok(JoinSpec::Relations(steps))
                }
                Checker::Group { on } => {
                    if group_ids.is_empty() {
                        return Ok(if negated {
                            JoinSpec::AlwaysTrue
                        } else {
                            JoinSpec::Impossible
                        });
                    }
                    let (steps, _, _) = terminal_ref(engine, target, on)?;
                    Ok(JoinSpec::Relations(steps))
                }
                Checker::Global { permission } => {
                    let verdict = global_verdict(engine, permission, group_ids).await?;
                    Ok(if verdict != negated {
                        JoinSpec::AlwaysTrue
                    } else {
                        JoinSpec::Impossible
                    })
                }
                Checker::And(children) => {
                    let mut specs = Vec::with_capacity(children.len());
                    for child in children {
                        specs.push(child.joins_inner(engine, group_ids, target, negated).await?);
                    }
                    Ok(combine_joins(specs, negated))
                }
                Checker::Or(children) => {
                    let mut specs = Vec::with_capacity(children.len());
                    for child in children {
                        specs.push(child.joins_inner(engine, group_ids, target, negated).await?);
                    }
                    Ok(combine_joins(specs, !negated))
                }
                Checker::Not(child) => {
                    child.joins_inner(engine, group_ids, target, !negated).await
                }
            }
        })
    }

    pub async fn where_spec(
        &self,
        engine: &Engine,
        user_id: i64,
        group_ids: &HashSet<i64>,
        target: &str,
    ) -> Result<WhereSpec> {
        self.where_inner(engine, user_id, group_ids, target, false)
            .await
    }

    fn where_inner<'a>(
        &'a self,
        engine: &'a Engine,
        user_id: i64,
        group_ids: &'a HashSet<i64>,
        target: &'a str,
        negated: bool,
    ) -> Pin<Box<dyn Future<Output = Result<WhereSpec>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Checker::Path {
                    permission, paths, ..
                } => {
                    if negated {
                        return Err(AuthzError::NotRewritable);
                    }
                    let (_, pred) = path_plan(engine, permission, paths, group_ids, target).await?;
                    Ok(pred)
                }
                Checker::Owner { on } => {
                    let (_, table, column) = terminal_ref(engine, target, on)?;
                    let col = (Alias::new(table), Alias::new(column));
                    Ok(WhereSpec::Pred(if negated {
                        Condition::any()
                            .add(Expr::col(col.clone()).is_null())
                            .add(Expr::col(col).ne(user_id))
                    } else {
                        Condition::all().add(Expr::col(col).eq(user_id))
                    }))
                }
                Checker::Group { on } => {
                    if group_ids.is_empty() {
                        return Ok(if negated {
                            WhereSpec::True
                        } else {
                            WhereSpec::False
                        });
                    }
                    let groups: BTreeSet<i64> = group_ids.iter().copied().collect();
                    let (_, table, column) = terminal_ref(engine, target, on)?;
                    let col = (Alias::new(table), Alias::new(column));
                    Ok(WhereSpec::Pred(if negated {
                        Condition::any()
                            .add(Expr::col(col.clone()).is_null())
                            .add(Expr::col(col).is_not_in(groups))
                    } else {
                        Condition::all().add(Expr::col(col).is_in(groups))
                    }))
                }
                Checker::Global { permission } => {
                    let verdict = global_verdict(engine, permission, group_ids).await?;
                    Ok(if verdict != negated {
                        WhereSpec::True
                    } else {
                        WhereSpec::False
                    })
                }
                Checker::And(children) => {
                    let mut specs = Vec::with_capacity(children.len());
                    for child in children {
                        specs.push(
                            child
                                .where_inner(engine, user_id, group_ids, target, negated)
                                .await?,
                        );
                    }
                    Ok(combine_where(specs, negated))
                }
                Checker::Or(children) => {
                    let mut specs = Vec::with_capacity(children.len());
                    for child in children {
                        specs.push(
                            child
                                .where_inner(engine, user_id, group_ids, target, negated)
                                .await?,
                        );
                    }
                    Ok(combine_where(specs, !negated))
                }
                Checker::Not(child) => {
                    child
                        .where_inner(engine, user_id, group_ids, target, !negated)
                        .await
                }
            }
        })
    }
}

impl std::ops::BitOr for Checker {
    type Output = Checker;

    fn bitor(self, rhs: Checker) -> Checker {
        match (self, rhs) {
            (Checker::Or(mut left), Checker::Or(right)) => {
                left.extend(right);
                Checker::Or(left)
            }
            (Checker::Or(mut left), right) => {
                left.push(right);
                Checker::Or(left)
            }
            (left, Checker::Or(mut right)) => {
                right.insert(0, left);
                Checker::Or(right)
            }
            (left, right) => Checker::Or(vec![left, right]),
        }
    }
}

impl std::ops::BitAnd for Checker {
    type Output = Checker;

    fn bitand(self, rhs: Checker) -> Checker {
        match (self, rhs) {
            (Checker::And(mut left), Checker::And(right)) => {
                left.extend(right);
                Checker::And(left)
            }
            (Checker::And(mut left), right) => {
                left.push(right);
                Checker::And(left)
            }
            (left, Checker::And(mut right)) => {
                right.insert(0, left);
                Checker::And(right)
            }
            (left, right) => Checker::And(vec![left, right]),
        }
    }
}

impl std::ops::Not for Checker {
    type Output = Checker;

    fn not(self) -> Checker {
        match self {
            Checker::Not(inner) => *inner,
            other => Checker::Not(Box::new(other)),
        }
    }
}

/// Values of the terminal attribute reached by walking `on` from `record`.
async fn terminal_values(engine: &Engine, record: &Context, on: &str) -> Result<Vec<SqlValue>> {
    let segments: Vec<&str> = on.split('.').filter(|s| !s.is_empty()).collect();
    let Some((column, rels)) = segments.split_last() else {
        return Ok(Vec::new());
    };

    let mut set: ContextSet = record.clone().into();
    if !rels.is_empty() {
        let path = rels.join(".");
        let steps = engine
            .traverser()
            .traverse(&set, &path, rels.len())
            .await?;
        let terminal = steps.into_iter().find_map(|step| match step {
            Step {
                depth,
                value: StepValue::Contexts(contexts),
            } if depth == rels.len() => Some(contexts),
            _ => None,
        });
        match terminal {
            Some(contexts) => set = contexts,
            None => return Ok(Vec::new()),
        }
    }

    let resolved = engine.traverser().resolve_edge(&set, column).await?;
    Ok(resolved
        .into_values()
        .filter_map(|value| match value {
            Resolved::Scalar(scalar) => Some(scalar),
            _ => None,
        })
        .collect())
}

/// Resolve the leading relations and terminal column of an ownership path
/// against the schema; errors name the offending attribute.
fn terminal_ref(
    engine: &Engine,
    target: &str,
    on: &str,
) -> Result<(Vec<JoinStep>, String, String)> {
    let segments: Vec<&str> = on.split('.').filter(|s| !s.is_empty()).collect();
    let Some((column, rels)) = segments.split_last() else {
        return Err(SchemaError::UnknownAttribute {
            model: target.to_string(),
            attribute: on.to_string(),
        }
        .into());
    };

    let schema = engine.schema();
    let mut current = schema.model(target)?;
    let mut steps = Vec::with_capacity(rels.len());
    for segment in rels {
        let rel = schema.relationship(&current.name, segment)?;
        steps.push(JoinStep {
            source: current.name.clone(),
            relation: (*segment).to_string(),
        });
        current = schema.model(&rel.target)?;
    }
    if !current.has_column(column) {
        return Err(SchemaError::UnknownAttribute {
            model: current.name.clone(),
            attribute: (*column).to_string(),
        }
        .into());
    }
    Ok((steps, current.table.clone(), (*column).to_string()))
}

/// Target-independent outcome of a `Global` checker for this user.
async fn global_verdict(
    engine: &Engine,
    permission: &str,
    group_ids: &HashSet<i64>,
) -> Result<bool> {
    let role_ids = engine.roles_for_permission(permission).await?;
    if engine.global_permissions().await?.contains(permission) {
        return Ok(engine.store().has_any_role(group_ids, &role_ids).await?);
    }
    let global = Context::global();
    for group_id in group_ids {
        let granted = engine.contextual_roles(*group_id, &global).await?;
        if granted.iter().any(|role| role_ids.contains(role)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Join/where fragments of a `Path` checker: walk every declared path from
/// the target, emitting an id filter wherever a step's model has permitted
/// contexts. A match inside a self-recursive segment truncates the join chain
/// at the recursion entry and projects the permitted set back through the
/// inverted recursive edge into a finite id list.
async fn path_plan(
    engine: &Engine,
    permission: &str,
    paths: &[String],
    group_ids: &HashSet<i64>,
    target: &str,
) -> Result<(JoinSpec, WhereSpec)> {
    let permitted = engine.permitted_contexts(group_ids, permission).await?;
    let schema = engine.schema();
    let target_model = schema.model(target)?;

    let mut joins: Vec<JoinStep> = Vec::new();
    let mut preds: Vec<(String, Vec<i64>)> = Vec::new();

    if let Some(ids) = permitted.get(&target_model.name) {
        push_pred(&mut preds, target_model.table.clone(), ids.clone());
    }

    for path in paths {
        let mut current = target_model;
        let mut chain: Vec<(JoinStep, &RelationshipDef, &ModelDef)> = Vec::new();
        let mut recursion_entry: Option<usize> = None;

        for segment in path.split('.').filter(|s| !s.is_empty()) {
            let rel = schema.relationship(&current.name, segment)?;
            let next = schema.model(&rel.target)?;
            if recursion_entry.is_none() && schema.is_recursive(rel) {
                recursion_entry = Some(chain.len());
            }
            chain.push((
                JoinStep {
                    source: current.name.clone(),
                    relation: segment.to_string(),
                },
                rel,
                next,
            ));
            let k = chain.len() - 1;

            if let Some(ids) = permitted.get(&next.name) {
                match recursion_entry {
                    None => {
                        for (step, _, _) in &chain[..=k] {
                            push_join(&mut joins, step);
                        }
                        push_pred(&mut preds, next.table.clone(), ids.clone());
                    }
                    Some(entry) => {
                        if let Some(closure) =
                            recursive_closure(engine, &chain, entry, k, &next.table, ids).await?
                        {
                            for (step, _, _) in &chain[..entry] {
                                push_join(&mut joins, step);
                            }
                            let join_table = schema.model(&chain[entry].1.source)?.table.clone();
                            push_pred(&mut preds, join_table, closure.ids().to_vec());
                        }
                    }
                }
            }
            current = next;
        }
    }

    if preds.is_empty() {
        return Ok((JoinSpec::Impossible, WhereSpec::False));
    }
    let mut condition = Condition::any();
    for (table, ids) in preds {
        condition = condition
            .add(Expr::col((Alias::new(table), Alias::new("id"))).is_in(ids));
    }
    Ok((JoinSpec::Relations(joins), WhereSpec::Pred(condition)))
}

/// Project permitted ids at step `k` back to the recursion entry, then take
/// the fixpoint of the inverted recursive edge. The result is the strict
/// descendant set: rows matching the seeds directly are already emitted by
/// the shallower match in the plan.
async fn recursive_closure(
    engine: &Engine,
    chain: &[(JoinStep, &RelationshipDef, &ModelDef)],
    entry: usize,
    k: usize,
    seed_table: &str,
    seed_ids: &[i64],
) -> Result<Option<ContextSet>> {
    let schema = engine.schema();
    let Some(mut set) = ContextSet::new(seed_table, seed_ids.iter().copied()) else {
        return Ok(None);
    };

    // Pull the permitted set back through the segments after the recursion.
    for j in ((entry + 1)..=k).rev() {
        let inverse = schema.inverse_of(chain[j].1)?;
        let resolved = engine.traverser().resolve_edge(&set, &inverse.name).await?;
        let mut sets: Vec<ContextSet> = Vec::new();
        for value in resolved.into_values() {
            match value {
                Resolved::One(context) => sets.push(context.into()),
                Resolved::Many(members) => sets.push(members),
                Resolved::Scalar(_) => {}
            }
        }
        match ContextSet::join(sets)? {
            Some(joined) => set = joined,
            None => return Ok(None),
        }
    }

    let inverse = schema.inverse_of(chain[entry].1)?;
    Ok(engine
        .traverser()
        .expand_recursive(&set, &inverse.name)
        .await?)
}

fn push_join(joins: &mut Vec<JoinStep>, step: &JoinStep) {
    if !joins.contains(step) {
        joins.push(step.clone());
    }
}

fn push_pred(preds: &mut Vec<(String, Vec<i64>)>, table: String, ids: Vec<i64>) {
    if !preds.iter().any(|(t, i)| *t == table && *i == ids) {
        preds.push((table, ids));
    }
}

fn combine_joins(specs: Vec<JoinSpec>, union_mode: bool) -> JoinSpec {
    if union_mode {
        if specs.iter().any(|s| matches!(s, JoinSpec::AlwaysTrue)) {
            return JoinSpec::AlwaysTrue;
        }
        let mut joins: Vec<JoinStep> = Vec::new();
        let mut all_impossible = true;
        for spec in specs {
            if let JoinSpec::Relations(steps) = spec {
                all_impossible = false;
                for step in &steps {
                    push_join(&mut joins, step);
                }
            }
        }
        if all_impossible {
            JoinSpec::Impossible
        } else {
            JoinSpec::Relations(joins)
        }
    } else {
        if specs.iter().any(|s| matches!(s, JoinSpec::Impossible)) {
            return JoinSpec::Impossible;
        }
        let mut joins: Vec<JoinStep> = Vec::new();
        let mut all_true = true;
        for spec in specs {
            if let JoinSpec::Relations(steps) = spec {
                all_true = false;
                for step in &steps {
                    push_join(&mut joins, step);
                }
            }
        }
        if all_true {
            JoinSpec::AlwaysTrue
        } else {
            JoinSpec::Relations(joins)
        }
    }
}

fn combine_where(specs: Vec<WhereSpec>, union_mode: bool) -> WhereSpec {
    if union_mode {
        if specs.iter().any(|s| matches!(s, WhereSpec::True)) {
            return WhereSpec::True;
        }
        let mut condition = Condition::any();
        let mut any_pred = false;
        for spec in specs {
            if let WhereSpec::Pred(pred) = spec {
                any_pred = true;
                condition = condition.add(pred);
            }
        }
        if any_pred {
            WhereSpec::Pred(condition)
        } else {
            WhereSpec::False
        }
    } else {
        if specs.iter().any(|s| matches!(s, WhereSpec::False)) {
            return WhereSpec::False;
        }
        let mut condition = Condition::all();
        let mut any_pred = false;
        for spec in specs {
            if let WhereSpec::Pred(pred) = spec {
                any_pred = true;
                condition = condition.add(pred);
            }
        }
        if any_pred {
            WhereSpec::Pred(condition)
        } else {
            WhereSpec::True
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitor_flattens() {
        let checker = Checker::global("read") | Checker::owner("mayor_id") | Checker::path("read", ["city"]);
        match checker {
            Checker::Or(children) => assert_eq!(children.len(), 3),
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn double_negation_unwraps() {
        let checker = !!Checker::owner("mayor_id");
        assert!(matches!(checker, Checker::Owner { .. }));
    }

    #[test]
    fn combine_joins_identities() {
        assert_eq!(
            combine_joins(vec![JoinSpec::AlwaysTrue, JoinSpec::Impossible], true),
            JoinSpec::AlwaysTrue
        );
        assert_eq!(
            combine_joins(vec![JoinSpec::Impossible, JoinSpec::Impossible], true),
            JoinSpec::Impossible
        );
        assert_eq!(
            combine_joins(vec![JoinSpec::AlwaysTrue, JoinSpec::Impossible], false),
            JoinSpec::Impossible
        );
        assert_eq!(
            combine_joins(vec![JoinSpec::AlwaysTrue, JoinSpec::AlwaysTrue], false),
            JoinSpec::AlwaysTrue
        );

        let step = JoinStep {
            source: "person".into(),
            relation: "city".into(),
        };
        let merged = combine_joins(
            vec![
                JoinSpec::Relations(vec![step.clone()]),
                JoinSpec::Impossible,
                JoinSpec::Relations(vec![step.clone()]),
            ],
            true,
        );
        assert_eq!(merged, JoinSpec::Relations(vec![step]));
    }

    #[test]
    fn combine_where_identities() {
        assert!(matches!(
            combine_where(vec![WhereSpec::True, WhereSpec::False], true),
            WhereSpec::True
        ));
        assert!(matches!(
            combine_where(vec![WhereSpec::False, WhereSpec::False], true),
            WhereSpec::False
        ));
        assert!(matches!(
            combine_where(vec![WhereSpec::True, WhereSpec::False], false),
            WhereSpec::False
        ));
        assert!(matches!(
            combine_where(vec![WhereSpec::True, WhereSpec::True], false),
            WhereSpec::True
        ));
    }
}
