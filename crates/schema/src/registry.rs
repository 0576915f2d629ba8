use crate::error::{Result, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Edges along which authorization propagates, `model -> relationship names`.
pub type PropagationSchema = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ToOne,
    ToMany,
    ManyToMany,
}

/// Association table of a many-to-many edge. `local_fk` references the
/// source model's primary key, `remote_fk` the target's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryTable {
    pub table: String,
    pub local_fk: String,
    pub remote_fk: String,
}

/// One declared relationship edge.
///
/// For `ToOne` edges `fk_column` lives on the source table; for `ToMany` it
/// lives on the target table and references the source primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub name: String,
    pub source: String,
    pub target: String,
    pub direction: Direction,
    pub fk_column: Option<String>,
    pub secondary: Option<SecondaryTable>,
    pub back_ref: Option<String>,
}

/// Metadata of one mapped model. The integer primary key column is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<String>,
    pub relationships: Vec<RelationshipDef>,
}

impl ModelDef {
    pub fn relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == self.primary_key || self.columns.iter().any(|c| c == name)
    }
}

/// Immutable indexed view of the relational metadata, built once and shared.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    models: Vec<ModelDef>,
    by_name: HashMap<String, usize>,
    by_table: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Resolve a model by name, falling back to its table name.
    pub fn model(&self, name: &str) -> Result<&ModelDef> {
        self.by_name
            .get(name)
            .or_else(|| self.by_table.get(name))
            .map(|idx| &self.models[*idx])
            .ok_or_else(|| SchemaError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.iter()
    }

    pub fn relationship(&self, model: &str, relation: &str) -> Result<&RelationshipDef> {
        let model = self.model(model)?;
        model
            .relationship(relation)
            .ok_or_else(|| SchemaError::UnknownRelation {
                model: model.name.clone(),
                relation: relation.to_string(),
            })
    }

    /// A relationship is self-recursive when its target table is the table
    /// it hangs off of.
    pub fn is_recursive(&self, def: &RelationshipDef) -> bool {
        match (self.model(&def.source), self.model(&def.target)) {
            (Ok(source), Ok(target)) => source.table == target.table,
            _ => false,
        }
    }

    /// Find the edge running the opposite way: the declared back-reference
    /// when present, otherwise the relation on the target model whose columns
    /// mirror this one's.
    pub fn inverse_of(&self, def: &RelationshipDef) -> Result<&RelationshipDef> {
        let target = self.model(&def.target)?;
        if let Some(back_ref) = &def.back_ref {
            return target
                .relationship(back_ref)
                .ok_or_else(|| SchemaError::NoInverse {
                    model: def.source.clone(),
                    relation: def.name.clone(),
                });
        }
        target
            .relationships
            .iter()
            .find(|candidate| {
                candidate.target == def.source
                    && match (&def.secondary, &candidate.secondary) {
                        (Some(a), Some(b)) => {
                            a.table == b.table
                                && a.local_fk == b.remote_fk
                                && a.remote_fk == b.local_fk
                        }
                        (None, None) => candidate.fk_column == def.fk_column,
                        _ => false,
                    }
            })
            .ok_or_else(|| SchemaError::NoInverse {
                model: def.source.clone(),
                relation: def.name.clone(),
            })
    }

    /// Invert a propagation schema: `model -> {relations}` becomes
    /// `target-model -> {inverse relation names}`.
    pub fn invert_propagation(&self, schema: &PropagationSchema) -> Result<PropagationSchema> {
        let mut inverted = PropagationSchema::new();
        for (model, relations) in schema {
            for relation in relations {
                let def = self.relationship(model, relation)?;
                let inverse = self.inverse_of(def)?;
                inverted
                    .entry(self.model(&def.target)?.name.clone())
                    .or_default()
                    .insert(inverse.name.clone());
            }
        }
        Ok(inverted)
    }

    /// All dotted paths reachable from `model` by following `schema` edges.
    /// A model already on the current branch is not descended into again, so
    /// self-recursive edges contribute a single segment.
    pub fn explode_paths(&self, schema: &PropagationSchema, model: &str) -> Result<Vec<String>> {
        fn explore(
            registry: &SchemaRegistry,
            schema: &PropagationSchema,
            node: &str,
            branch: &mut HashSet<String>,
        ) -> Result<Vec<String>> {
            let Some(relations) = schema.get(node) else {
                return Ok(Vec::new());
            };
            let mut paths = Vec::new();
            for relation in relations {
                let def = registry.relationship(node, relation)?;
                paths.push(relation.clone());
                let child = registry.model(&def.target)?.name.clone();
                if branch.insert(child.clone()) {
                    for sub in explore(registry, schema, &child, branch)? {
                        paths.push(format!("{}.{}", relation, sub));
                    }
                    branch.remove(&child);
                }
            }
            Ok(paths)
        }

        let name = self.model(model)?.name.clone();
        let mut branch = HashSet::from([name.clone()]);
        let mut paths = explore(self, schema, &name, &mut branch)?;
        paths.sort();
        Ok(paths)
    }
}

/// Declarative construction of the registry; back-references synthesize the
/// inverse edge on the target model.
#[derive(Default)]
pub struct SchemaBuilder {
    models: Vec<ModelBuilder>,
}

pub struct ModelBuilder {
    name: String,
    table: String,
    columns: Vec<String>,
    relationships: Vec<RelationshipDef>,
}

impl ModelBuilder {
    /// A model whose table name equals its model name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(name.into());
        self
    }

    /// A to-one edge over a foreign key column on this model. When `back_ref`
    /// is given, the matching to-many edge appears on the target model.
    pub fn belongs_to(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
        back_ref: Option<&str>,
    ) -> Self {
        self.relationships.push(RelationshipDef {
            name: name.into(),
            source: self.name.clone(),
            target: target.into(),
            direction: Direction::ToOne,
            fk_column: Some(fk_column.into()),
            secondary: None,
            back_ref: back_ref.map(str::to_string),
        });
        self
    }

    /// A many-to-many edge through `secondary`.
    pub fn many_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        secondary: SecondaryTable,
        back_ref: Option<&str>,
    ) -> Self {
        self.relationships.push(RelationshipDef {
            name: name.into(),
            source: self.name.clone(),
            target: target.into(),
            direction: Direction::ManyToMany,
            fk_column: None,
            secondary: Some(secondary),
            back_ref: back_ref.map(str::to_string),
        });
        self
    }
}

impl SchemaBuilder {
    pub fn model(mut self, model: ModelBuilder) -> Self {
        self.models.push(model);
        self
    }

    pub fn build(self) -> Result<SchemaRegistry> {
        let mut models: Vec<ModelDef> = self
            .models
            .into_iter()
            .map(|m| ModelDef {
                name: m.name,
                table: m.table,
                primary_key: "id".to_string(),
                columns: m.columns,
                relationships: m.relationships,
            })
            .collect();

        // Synthesize declared back-references on their target models.
        let mut synthesized: Vec<RelationshipDef> = Vec::new();
        for model in &models {
            for def in &model.relationships {
                let Some(back_ref) = &def.back_ref else {
                    continue;
                };
                let inverse = match def.direction {
                    Direction::ToOne => RelationshipDef {
                        name: back_ref.clone(),
                        source: def.target.clone(),
                        target: def.source.clone(),
                        direction: Direction::ToMany,
                        fk_column: def.fk_column.clone(),
                        secondary: None,
                        back_ref: Some(def.name.clone()),
                    },
                    Direction::ManyToMany => RelationshipDef {
                        name: back_ref.clone(),
                        source: def.target.clone(),
                        target: def.source.clone(),
                        direction: Direction::ManyToMany,
                        fk_column: None,
                        secondary: def.secondary.as_ref().map(|s| SecondaryTable {
                            table: s.table.clone(),
                            local_fk: s.remote_fk.clone(),
                            remote_fk: s.local_fk.clone(),
                        }),
                        back_ref: Some(def.name.clone()),
                    },
                    Direction::ToMany => RelationshipDef {
                        name: back_ref.clone(),
                        source: def.target.clone(),
                        target: def.source.clone(),
                        direction: Direction::ToOne,
                        fk_column: def.fk_column.clone(),
                        secondary: None,
                        back_ref: Some(def.name.clone()),
                    },
                };
                synthesized.push(inverse);
            }
        }
        for inverse in synthesized {
            let target = models
                .iter_mut()
                .find(|m| m.name == inverse.source)
                .ok_or_else(|| SchemaError::UnknownModel(inverse.source.clone()))?;
            if target.relationship(&inverse.name).is_none() {
                target.relationships.push(inverse);
            }
        }

        let mut by_name = HashMap::new();
        let mut by_table = HashMap::new();
        for (idx, model) in models.iter().enumerate() {
            if by_name.insert(model.name.clone(), idx).is_some() {
                return Err(SchemaError::DuplicateModel(model.name.clone()));
            }
            by_table.entry(model.table.clone()).or_insert(idx);
            let mut seen = HashSet::new();
            for attr in model
                .columns
                .iter()
                .chain(model.relationships.iter().map(|r| &r.name))
            {
                if !seen.insert(attr.clone()) {
                    return Err(SchemaError::DuplicateAttribute {
                        model: model.name.clone(),
                        attribute: attr.clone(),
                    });
                }
            }
        }

        let registry = SchemaRegistry {
            models,
            by_name,
            by_table,
        };

        // Every relationship target must resolve.
        for model in &registry.models {
            for def in &model.relationships {
                registry.model(&def.target)?;
            }
        }
        Ok(registry)
    }
}
