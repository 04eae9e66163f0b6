//! Static shape descriptors supplied by the upstream model resolver.
//!
//! An [`EntityShape`] describes one record type: its destination table, its
//! persisted properties in declaration order, its primary key and the owned
//! navigations leading to nested records. Shapes are built once and shared
//! through `Arc`; nothing in this crate computes them from a model.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{BulkError, Result};
use crate::sql::qualify;
use crate::value::SqlNullType;

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Table name without schema qualifier (also used for `#temp` tables).
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Session-scoped temp tables start with `#`.
    pub fn is_temporary(&self) -> bool {
        self.name.starts_with('#')
    }

    /// Bracket-quoted, schema-qualified name.
    pub fn qualified(&self) -> String {
        qualify(self.schema.as_deref(), &self.name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// How the destination produces a property's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueGeneration {
    #[default]
    None,
    /// Generated on insert (identity column).
    OnAdd,
}

/// A persisted property and the column it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub column: String,
    /// Column type as SQL Server spells it, e.g. `nvarchar(100)`.
    pub column_type: String,
    pub null_type: SqlNullType,
    pub nullable: bool,
    pub generation: ValueGeneration,
}

impl PropertyDefinition {
    /// Property whose column has the same name.
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        let name = name.into();
        let column_type = column_type.into();
        Self {
            column: name.clone(),
            null_type: SqlNullType::from_type_name(&column_type),
            name,
            column_type,
            nullable: true,
            generation: ValueGeneration::None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Identity column: generated by the destination on insert.
    pub fn generated_on_add(mut self) -> Self {
        self.generation = ValueGeneration::OnAdd;
        self.nullable = false;
        self
    }

    pub fn is_generated(&self) -> bool {
        self.generation == ValueGeneration::OnAdd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    One,
    Many,
}

/// Child property filled from a principal (parent) property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyColumn {
    /// Property on the child shape.
    pub property: String,
    /// Key property on the owning shape.
    pub principal: String,
}

/// Where an owned navigation's data lives.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationStorage {
    /// Table splitting: the owned columns live in the owner's row.
    Inline,
    /// Separate child table linked by a foreign key.
    Table { foreign_key: Vec<ForeignKeyColumn> },
}

/// Navigation from an owner to owned records.
#[derive(Debug, Clone)]
pub struct OwnedNavigation {
    pub name: String,
    pub target: Arc<EntityShape>,
    pub multiplicity: Multiplicity,
    pub storage: NavigationStorage,
}

impl OwnedNavigation {
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, NavigationStorage::Inline)
    }

    pub fn foreign_key(&self) -> &[ForeignKeyColumn] {
        match &self.storage {
            NavigationStorage::Inline => &[],
            NavigationStorage::Table { foreign_key } => foreign_key,
        }
    }
}

/// Resolved description of one record type.
#[derive(Debug, Clone)]
pub struct EntityShape {
    pub name: String,
    pub table: TableName,
    pub properties: Vec<PropertyDefinition>,
    pub primary_key: Vec<String>,
    pub navigations: Vec<OwnedNavigation>,
}

impl EntityShape {
    /// Start a shape stored in `table`. Inline-owned shapes pass the owner's
    /// table; it is never used for them.
    pub fn builder(name: impl Into<String>, table: TableName) -> EntityShapeBuilder {
        EntityShapeBuilder {
            shape: EntityShape {
                name: name.into(),
                table,
                properties: Vec::new(),
                primary_key: Vec::new(),
                navigations: Vec::new(),
            },
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn navigation(&self, name: &str) -> Option<&OwnedNavigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    pub fn is_key(&self, property: &str) -> bool {
        self.primary_key.iter().any(|k| k == property)
    }

    pub fn key_properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.primary_key
            .iter()
            .filter_map(move |k| self.property(k))
    }

    pub fn has_table_navigations(&self) -> bool {
        self.navigations.iter().any(|n| !n.is_inline())
    }
}

pub struct EntityShapeBuilder {
    shape: EntityShape,
}

impl EntityShapeBuilder {
    pub fn property(mut self, property: PropertyDefinition) -> Self {
        self.shape.properties.push(property);
        self
    }

    pub fn key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shape.primary_key = properties.into_iter().map(Into::into).collect();
        self
    }

    /// Single owned record stored in the owner's row.
    pub fn owns_one_inline(self, name: impl Into<String>, target: Arc<EntityShape>) -> Self {
        self.navigation(name, target, Multiplicity::One, NavigationStorage::Inline)
    }

    /// Single owned record stored in its own table.
    pub fn owns_one(
        self,
        name: impl Into<String>,
        target: Arc<EntityShape>,
        foreign_key: &[(&str, &str)],
    ) -> Self {
        let storage = table_storage(foreign_key);
        self.navigation(name, target, Multiplicity::One, storage)
    }

    /// Owned collection stored in its own table.
    pub fn owns_many(
        self,
        name: impl Into<String>,
        target: Arc<EntityShape>,
        foreign_key: &[(&str, &str)],
    ) -> Self {
        let storage = table_storage(foreign_key);
        self.navigation(name, target, Multiplicity::Many, storage)
    }

    fn navigation(
        mut self,
        name: impl Into<String>,
        target: Arc<EntityShape>,
        multiplicity: Multiplicity,
        storage: NavigationStorage,
    ) -> Self {
        self.shape.navigations.push(OwnedNavigation {
            name: name.into(),
            target,
            multiplicity,
            storage,
        });
        self
    }

    /// Validate and freeze the shape.
    pub fn build(self) -> Result<Arc<EntityShape>> {
        let shape = self.shape;
        let mut names = HashSet::new();
        let mut columns = HashSet::new();

        for p in &shape.properties {
            if !names.insert(p.name.as_str()) {
                return Err(BulkError::config(format!(
                    "The entity type '{}' declares property '{}' more than once.",
                    shape.name, p.name
                )));
            }
            if !columns.insert(p.column.as_str()) {
                return Err(BulkError::config(format!(
                    "The entity type '{}' maps more than one property to column '{}'.",
                    shape.name, p.column
                )));
            }
        }

        for key in &shape.primary_key {
            if shape.property(key).is_none() {
                return Err(BulkError::config(format!(
                    "The primary key property '{}.{}' does not exist.",
                    shape.name, key
                )));
            }
        }

        for nav in &shape.navigations {
            if !names.insert(nav.name.as_str()) {
                return Err(BulkError::config(format!(
                    "The navigation '{}.{}' collides with another member of the same name.",
                    shape.name, nav.name
                )));
            }
            match &nav.storage {
                NavigationStorage::Inline => {
                    if nav.multiplicity == Multiplicity::Many {
                        return Err(BulkError::config(format!(
                            "The owned collection '{}.{}' cannot be stored inline.",
                            shape.name, nav.name
                        )));
                    }
                    if nav.target.has_table_navigations() {
                        return Err(BulkError::config(format!(
                            "The inline owned type '{}.{}' cannot own table-stored navigations.",
                            shape.name, nav.name
                        )));
                    }
                }
                NavigationStorage::Table { foreign_key } => {
                    if foreign_key.is_empty() {
                        return Err(BulkError::config(format!(
                            "The owned navigation '{}.{}' has no foreign key.",
                            shape.name, nav.name
                        )));
                    }
                    for fk in foreign_key {
                        if nav.target.property(&fk.property).is_none() {
                            return Err(BulkError::config(format!(
                                "The foreign key property '{}.{}' does not exist.",
                                nav.target.name, fk.property
                            )));
                        }
                        if shape.property(&fk.principal).is_none() {
                            return Err(BulkError::config(format!(
                                "The principal property '{}.{}' does not exist.",
                                shape.name, fk.principal
                            )));
                        }
                    }
                }
            }
        }

        Ok(Arc::new(shape))
    }
}

fn table_storage(foreign_key: &[(&str, &str)]) -> NavigationStorage {
    NavigationStorage::Table {
        foreign_key: foreign_key
            .iter()
            .map(|(property, principal)| ForeignKeyColumn {
                property: (*property).to_string(),
                principal: (*principal).to_string(),
            })
            .collect(),
    }
}
