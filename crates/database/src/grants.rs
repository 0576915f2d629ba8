use crate::error::Result;
use crate::executor::{Executor, WriteStatement};
use sea_query::{Alias, ColumnDef, Expr, Index, JoinType, Query, Table, TableCreateStatement};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use validator::Validate;
use warden_models::{tables, Context, Group, NewGroup, NewPermission, NewRole, Permission, Role};

fn col(name: &str) -> Alias {
    Alias::new(name)
}

/// Persistence for the engine's own state: users, groups, roles,
/// permissions, memberships, assignments and contextual grants.
///
/// All read paths are raw; memoization sits a layer above.
#[derive(Clone)]
pub struct GrantRepository {
    db: Arc<dyn Executor>,
}

impl GrantRepository {
    pub fn new(db: Arc<dyn Executor>) -> Self {
        Self { db }
    }

    /// Create the engine's tables when missing.
    pub async fn install(&self) -> Result<()> {
        for stmt in table_definitions() {
            self.db.create_table(&stmt).await?;
        }
        Ok(())
    }

    // -- users & groups ----------------------------------------------------

    pub async fn create_user(&self, name: &str) -> Result<i64> {
        let stmt = Query::insert()
            .into_table(col(tables::USERS))
            .columns([col("name")])
            .values([name.into()])?
            .to_owned();
        self.db.insert_returning_id(&stmt).await
    }

    pub async fn create_group(&self, group: &NewGroup) -> Result<i64> {
        group.validate()?;
        let stmt = Query::insert()
            .into_table(col(tables::GROUPS))
            .columns([col("name"), col("is_personal"), col("owner_id")])
            .values([
                group.name.clone().into(),
                group.is_personal.into(),
                group.owner_id.into(),
            ])?
            .to_owned();
        self.db.insert_returning_id(&stmt).await
    }

    /// Idempotent; returns whether a new row was written.
    pub async fn add_membership(&self, user_id: i64, group_id: i64) -> Result<bool> {
        let existing = Query::select()
            .expr(Expr::value(1))
            .from(col(tables::MEMBERSHIPS))
            .and_where(Expr::col(col("user_id")).eq(user_id))
            .and_where(Expr::col(col("group_id")).eq(group_id))
            .to_owned();
        if !self.db.fetch_all(&existing).await?.is_empty() {
            return Ok(false);
        }
        let stmt = Query::insert()
            .into_table(col(tables::MEMBERSHIPS))
            .columns([col("user_id"), col("group_id")])
            .values([user_id.into(), group_id.into()])?
            .to_owned();
        self.db.execute(&stmt.into()).await?;
        Ok(true)
    }

    pub async fn user_groups(&self, user_id: i64) -> Result<HashSet<i64>> {
        let stmt = Query::select()
            .column(col("group_id"))
            .from(col(tables::MEMBERSHIPS))
            .and_where(Expr::col(col("user_id")).eq(user_id))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.iter().map(|row| row.i64(0)).collect()
    }

    /// The user's personal group, if one was ever materialized.
    pub async fn personal_group(&self, user_id: i64) -> Result<Option<Group>> {
        let stmt = Query::select()
            .columns([col("id"), col("name"), col("is_personal"), col("owner_id")])
            .from(col(tables::GROUPS))
            .and_where(Expr::col(col("owner_id")).eq(user_id))
            .and_where(Expr::col(col("is_personal")).eq(true))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.first()
            .map(|row| {
                Ok(Group {
                    id: row.i64(0)?,
                    name: row.text(1)?,
                    is_personal: row.bool(2)?,
                    owner_id: row.opt_i64(3)?,
                })
            })
            .transpose()
    }

    // -- roles & permissions -----------------------------------------------

    pub async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let stmt = Query::select()
            .columns([col("id"), col("name"), col("tables")])
            .from(col(tables::ROLES))
            .and_where(Expr::col(col("name")).eq(name))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.first()
            .map(|row| {
                Ok(Role {
                    id: row.i64(0)?,
                    name: row.text(1)?,
                    tables: row.opt_text(2)?,
                })
            })
            .transpose()
    }

    pub async fn get_or_create_role(&self, name: &str) -> Result<Role> {
        if let Some(role) = self.role_by_name(name).await? {
            return Ok(role);
        }
        let new_role = NewRole::named(name);
        new_role.validate()?;
        let stmt = Query::insert()
            .into_table(col(tables::ROLES))
            .columns([col("name")])
            .values([new_role.name.clone().into()])?
            .to_owned();
        let id = self.db.insert_returning_id(&stmt).await?;
        Ok(Role {
            id,
            name: new_role.name,
            tables: None,
        })
    }

    pub async fn permission_by_name(&self, name: &str) -> Result<Option<Permission>> {
        let stmt = Query::select()
            .columns([col("id"), col("name"), col("is_global")])
            .from(col(tables::PERMISSIONS))
            .and_where(Expr::col(col("name")).eq(name))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.first()
            .map(|row| {
                Ok(Permission {
                    id: row.i64(0)?,
                    name: row.text(1)?,
                    is_global: row.bool(2)?,
                })
            })
            .transpose()
    }

    pub async fn get_or_create_permission(&self, name: &str) -> Result<Permission> {
        if let Some(permission) = self.permission_by_name(name).await? {
            return Ok(permission);
        }
        let new_permission = NewPermission::named(name);
        new_permission.validate()?;
        let stmt = Query::insert()
            .into_table(col(tables::PERMISSIONS))
            .columns([col("name"), col("is_global")])
            .values([new_permission.name.clone().into(), false.into()])?
            .to_owned();
        let id = self.db.insert_returning_id(&stmt).await?;
        Ok(Permission {
            id,
            name: new_permission.name,
            is_global: false,
        })
    }

    pub async fn set_permissions_global(&self, ids: &[i64], is_global: bool) -> Result<u64> {
        let stmt = Query::update()
            .table(col(tables::PERMISSIONS))
            .value(col("is_global"), is_global)
            .and_where(Expr::col(col("id")).is_in(ids.iter().copied()))
            .to_owned();
        self.db.execute(&stmt.into()).await
    }

    /// Idempotent; returns whether a new assignment was written.
    pub async fn link_role_permission(&self, role_id: i64, permission_id: i64) -> Result<bool> {
        let existing = Query::select()
            .expr(Expr::value(1))
            .from(col(tables::ROLE_PERMISSIONS))
            .and_where(Expr::col(col("role_id")).eq(role_id))
            .and_where(Expr::col(col("permission_id")).eq(permission_id))
            .to_owned();
        if !self.db.fetch_all(&existing).await?.is_empty() {
            return Ok(false);
        }
        let stmt = Query::insert()
            .into_table(col(tables::ROLE_PERMISSIONS))
            .columns([col("role_id"), col("permission_id")])
            .values([role_id.into(), permission_id.into()])?
            .to_owned();
        self.db.execute(&stmt.into()).await?;
        Ok(true)
    }

    pub async fn unlink_role_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64> {
        if permission_ids.is_empty() {
            return Ok(0);
        }
        let stmt = Query::delete()
            .from_table(col(tables::ROLE_PERMISSIONS))
            .and_where(Expr::col(col("role_id")).eq(role_id))
            .and_where(Expr::col(col("permission_id")).is_in(permission_ids.iter().copied()))
            .to_owned();
        self.db.execute(&stmt.into()).await
    }

    /// `permission name -> role ids` over the whole assignment table.
    pub async fn perms_to_roles(&self) -> Result<BTreeMap<String, BTreeSet<i64>>> {
        let permissions = col(tables::PERMISSIONS);
        let assignments = col(tables::ROLE_PERMISSIONS);
        let stmt = Query::select()
            .column((permissions.clone(), col("name")))
            .column((assignments.clone(), col("role_id")))
            .from(permissions.clone())
            .join(
                JoinType::Join,
                assignments.clone(),
                Expr::col((permissions, col("id")))
                    .equals((assignments, col("permission_id"))),
            )
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        let mut map: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        for row in rows {
            map.entry(row.text(0)?).or_default().insert(row.i64(1)?);
        }
        Ok(map)
    }

    pub async fn permission_name_ids(&self) -> Result<BTreeMap<String, i64>> {
        let stmt = Query::select()
            .columns([col("name"), col("id")])
            .from(col(tables::PERMISSIONS))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.iter()
            .map(|row| Ok((row.text(0)?, row.i64(1)?)))
            .collect()
    }

    pub async fn global_permissions(&self) -> Result<BTreeSet<String>> {
        let stmt = Query::select()
            .column(col("name"))
            .from(col(tables::PERMISSIONS))
            .and_where(Expr::col(col("is_global")).eq(true))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.iter().map(|row| row.text(0)).collect()
    }

    // -- grants --------------------------------------------------------------

    /// Role ids granted to `group_id` in exactly `context`.
    pub async fn contextual_roles(&self, group_id: i64, context: &Context) -> Result<HashSet<i64>> {
        let stmt = Query::select()
            .column(col("role_id"))
            .from(col(tables::ROLE_GRANTS))
            .and_where(Expr::col(col("group_id")).eq(group_id))
            .and_where(Expr::col(col("context_table")).eq(context.table.as_str()))
            .and_where(Expr::col(col("context_id")).eq(context.id))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.iter().map(|row| row.i64(0)).collect()
    }

    /// Whether any of the groups holds any of the roles, in any context.
    pub async fn has_any_role(
        &self,
        group_ids: &HashSet<i64>,
        role_ids: &HashSet<i64>,
    ) -> Result<bool> {
        if group_ids.is_empty() || role_ids.is_empty() {
            return Ok(false);
        }
        let stmt = Query::select()
            .expr(Expr::value(1))
            .from(col(tables::ROLE_GRANTS))
            .and_where(Expr::col(col("group_id")).is_in(group_ids.iter().copied()))
            .and_where(Expr::col(col("role_id")).is_in(role_ids.iter().copied()))
            .limit(1)
            .to_owned();
        Ok(!self.db.fetch_all(&stmt).await?.is_empty())
    }

    pub async fn grant_exists(
        &self,
        group_id: i64,
        role_id: i64,
        context: &Context,
    ) -> Result<bool> {
        let stmt = Query::select()
            .expr(Expr::value(1))
            .from(col(tables::ROLE_GRANTS))
            .and_where(Expr::col(col("group_id")).eq(group_id))
            .and_where(Expr::col(col("role_id")).eq(role_id))
            .and_where(Expr::col(col("context_table")).eq(context.table.as_str()))
            .and_where(Expr::col(col("context_id")).eq(context.id))
            .to_owned();
        Ok(!self.db.fetch_all(&stmt).await?.is_empty())
    }

    pub async fn insert_grant(
        &self,
        group_id: i64,
        role_id: i64,
        context: &Context,
    ) -> Result<()> {
        let stmt = Query::insert()
            .into_table(col(tables::ROLE_GRANTS))
            .columns([
                col("group_id"),
                col("role_id"),
                col("context_table"),
                col("context_id"),
            ])
            .values([
                group_id.into(),
                role_id.into(),
                context.table.as_str().into(),
                context.id.into(),
            ])?
            .to_owned();
        self.db.execute_batch(&[stmt.into()]).await?;
        Ok(())
    }

    pub async fn delete_grant(
        &self,
        group_id: i64,
        role_id: i64,
        context: &Context,
    ) -> Result<u64> {
        let stmt = Query::delete()
            .from_table(col(tables::ROLE_GRANTS))
            .and_where(Expr::col(col("group_id")).eq(group_id))
            .and_where(Expr::col(col("role_id")).eq(role_id))
            .and_where(Expr::col(col("context_table")).eq(context.table.as_str()))
            .and_where(Expr::col(col("context_id")).eq(context.id))
            .to_owned();
        self.db.execute_batch(&[stmt.into()]).await
    }

    /// Non-global `(context_table, context_id)` pairs where any of the groups
    /// holds any of the roles.
    pub async fn granted_contexts(
        &self,
        group_ids: &HashSet<i64>,
        role_ids: &HashSet<i64>,
    ) -> Result<Vec<(String, i64)>> {
        if group_ids.is_empty() || role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let stmt = Query::select()
            .columns([col("context_table"), col("context_id")])
            .from(col(tables::ROLE_GRANTS))
            .and_where(Expr::col(col("group_id")).is_in(group_ids.iter().copied()))
            .and_where(Expr::col(col("role_id")).is_in(role_ids.iter().copied()))
            .and_where(Expr::col(col("context_table")).ne(warden_models::GLOBAL_TABLE))
            .to_owned();
        let rows = self.db.fetch_all(&stmt).await?;
        rows.iter()
            .map(|row| Ok((row.text(0)?, row.i64(1)?)))
            .collect()
    }
}

fn named_table(table: &str, extra: &[&str]) -> TableCreateStatement {
    let mut stmt = Table::create();
    stmt.table(col(table)).if_not_exists().col(
        ColumnDef::new(col("id"))
            .integer()
            .not_null()
            .auto_increment()
            .primary_key(),
    );
    stmt.col(
        ColumnDef::new(col("name"))
            .string_len(150)
            .not_null()
            .unique_key(),
    );
    for column in extra {
        match *column {
            "is_personal" | "is_global" => {
                stmt.col(
                    ColumnDef::new(col(column))
                        .boolean()
                        .not_null()
                        .default(false),
                );
            }
            "owner_id" => {
                stmt.col(ColumnDef::new(col("owner_id")).integer());
            }
            "tables" => {
                stmt.col(ColumnDef::new(col("tables")).string_len(255));
            }
            _ => {}
        }
    }
    stmt.to_owned()
}

fn table_definitions() -> Vec<TableCreateStatement> {
    let memberships = Table::create()
        .table(col(tables::MEMBERSHIPS))
        .if_not_exists()
        .col(ColumnDef::new(col("user_id")).integer().not_null())
        .col(ColumnDef::new(col("group_id")).integer().not_null())
        .primary_key(Index::create().col(col("user_id")).col(col("group_id")))
        .to_owned();

    let role_permissions = Table::create()
        .table(col(tables::ROLE_PERMISSIONS))
        .if_not_exists()
        .col(ColumnDef::new(col("role_id")).integer().not_null())
        .col(ColumnDef::new(col("permission_id")).integer().not_null())
        .primary_key(
            Index::create()
                .col(col("role_id"))
                .col(col("permission_id")),
        )
        .to_owned();

    let role_grants = Table::create()
        .table(col(tables::ROLE_GRANTS))
        .if_not_exists()
        .col(ColumnDef::new(col("group_id")).integer().not_null())
        .col(ColumnDef::new(col("role_id")).integer().not_null())
        .col(
            ColumnDef::new(col("context_table"))
                .string_len(150)
                .not_null(),
        )
        .col(ColumnDef::new(col("context_id")).integer().not_null())
        .primary_key(
            Index::create()
                .col(col("group_id"))
                .col(col("role_id"))
                .col(col("context_table"))
                .col(col("context_id")),
        )
        .to_owned();

    vec![
        named_table(tables::USERS, &[]),
        named_table(tables::GROUPS, &["is_personal", "owner_id"]),
        named_table(tables::ROLES, &["tables"]),
        named_table(tables::PERMISSIONS, &["is_global"]),
        memberships,
        role_permissions,
        role_grants,
    ]
}
