use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};

/// Table name of the sentinel global context.
pub const GLOBAL_TABLE: &str = "global";

/// Row id of the sentinel global context.
pub const GLOBAL_CONTEXT_ID: i64 = 0;

/// Reference to a single database row: `(table, primary key)`.
///
/// Roles are granted against contexts, never against the rows themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub table: String,
    pub id: i64,
}

impl Context {
    pub fn new(table: impl Into<String>, id: i64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }

    /// The sentinel context meaning "every row of every model".
    pub fn global() -> Self {
        Self::new(GLOBAL_TABLE, GLOBAL_CONTEXT_ID)
    }

    pub fn is_global(&self) -> bool {
        self.table == GLOBAL_TABLE && self.id == GLOBAL_CONTEXT_ID
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

/// A same-model batch of contexts.
///
/// Ids are kept sorted and unique; the empty batch is unrepresentable
/// (constructors return `None` instead).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextSet {
    table: String,
    ids: Vec<i64>,
}

impl ContextSet {
    pub fn new(table: impl Into<String>, ids: impl IntoIterator<Item = i64>) -> Option<Self> {
        let mut ids: Vec<i64> = ids.into_iter().collect();
        if ids.is_empty() {
            return None;
        }
        ids.sort_unstable();
        ids.dedup();
        Some(Self {
            table: table.into(),
            ids,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, context: &Context) -> bool {
        context.table == self.table && self.ids.binary_search(&context.id).is_ok()
    }

    /// Union with another set of the same model.
    pub fn union(&self, other: &ContextSet) -> Result<ContextSet> {
        if self.table != other.table {
            return Err(ContextError::ModelMismatch {
                left: self.table.clone(),
                right: other.table.clone(),
            });
        }
        let mut ids = self.ids.clone();
        ids.extend_from_slice(&other.ids);
        ids.sort_unstable();
        ids.dedup();
        Ok(ContextSet {
            table: self.table.clone(),
            ids,
        })
    }

    /// Union of an arbitrary number of same-model sets; `None` when the
    /// iterator is empty.
    pub fn join(sets: impl IntoIterator<Item = ContextSet>) -> Result<Option<ContextSet>> {
        let mut merged: Option<ContextSet> = None;
        for set in sets {
            merged = Some(match merged {
                Some(acc) => acc.union(&set)?,
                None => set,
            });
        }
        Ok(merged)
    }

    /// Iterate the members as `Context` values.
    pub fn iter(&self) -> impl Iterator<Item = Context> + '_ {
        self.ids.iter().map(|id| Context::new(self.table.clone(), *id))
    }
}

impl From<Context> for ContextSet {
    fn from(context: Context) -> Self {
        ContextSet {
            table: context.table,
            ids: vec![context.id],
        }
    }
}
