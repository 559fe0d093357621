//! Entity metadata registry.
//!
//! The registry is the compiled, in-memory representation of every modeled
//! entity's schema. It is built once from caller-supplied definitions,
//! validated eagerly, and read-only for the rest of the process lifetime.

use crate::dialect::Dialect;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Name of the implicit primary key column every entity table carries.
pub const ID_COLUMN: &str = "id";

/// Supported attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Text,
    Integer,
    #[serde(rename = "biginteger")]
    BigInteger,
    Float,
    Boolean,
    #[serde(rename = "datetime")]
    DateTime,
    Json,
}

/// Relation cardinality, from the owning side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
}

/// One attribute in an entity definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    /// Default value applied on create when the field is absent.
    #[serde(default)]
    pub default: Option<JsonValue>,
}

impl AttributeDefinition {
    /// Shorthand for a plain attribute of the given type.
    pub fn of_type(kind: AttributeType) -> Self {
        Self {
            kind,
            required: false,
            unique: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// One relation in an entity definition. The map key is the field name; the
/// owning side materializes as a `<field>_id` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub kind: RelationKind,
    /// UID of the target entity; must resolve to a registered definition.
    pub target: String,
}

/// Caller-supplied definition for one entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Explicit table name; derived from the UID when absent.
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDefinition>,
}

/// A column of the compiled entity table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub enum ColumnKind {
    PrimaryKey,
    Attribute(AttributeDefinition),
    /// Foreign key column; carries the target entity UID.
    Relation {
        target: String,
    },
}

/// Compiled metadata for one entity. Immutable after registry construction.
#[derive(Debug)]
pub struct Metadata {
    uid: String,
    table_name: String,
    columns: Vec<Column>,
    relations: Vec<(String, RelationDefinition)>,
}

impl Metadata {
    fn compile(uid: &str, definition: &EntityDefinition) -> Self {
        let table_name = definition
            .table_name
            .clone()
            .unwrap_or_else(|| derive_table_name(uid));

        let mut columns = vec![Column {
            name: ID_COLUMN.to_string(),
            kind: ColumnKind::PrimaryKey,
        }];
        for (name, attr) in &definition.attributes {
            columns.push(Column {
                name: name.clone(),
                kind: ColumnKind::Attribute(attr.clone()),
            });
        }
        let mut relations = Vec::new();
        for (field, relation) in &definition.relations {
            // Only the owning side carries a column; one-to-many is the
            // inverse side of a many-to-one on the target.
            if matches!(relation.kind, RelationKind::OneToOne | RelationKind::ManyToOne) {
                columns.push(Column {
                    name: format!("{field}_id"),
                    kind: ColumnKind::Relation {
                        target: relation.target.clone(),
                    },
                });
            }
            relations.push((field.clone(), relation.clone()));
        }

        Self {
            uid: uid.to_string(),
            table_name,
            columns,
            relations,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Ordered list of table columns, primary key first.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up an attribute definition by field name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.columns.iter().find_map(|c| match &c.kind {
            ColumnKind::Attribute(attr) if c.name == name => Some(attr),
            _ => None,
        })
    }

    pub fn relations(&self) -> &[(String, RelationDefinition)] {
        &self.relations
    }
}

/// Derive a table name from an entity UID, e.g. `api::article.article` ->
/// `api_article_article`.
fn derive_table_name(uid: &str) -> String {
    let mut out = String::with_capacity(uid.len());
    let mut last_sep = true;
    for c in uid.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Registry of compiled entity metadata. O(1) lookup by UID.
#[derive(Debug)]
pub struct MetadataRegistry {
    entries: HashMap<String, Arc<Metadata>>,
}

impl MetadataRegistry {
    /// Build and validate the registry from entity definitions.
    ///
    /// Validation failures (dangling relation target, unsupported attribute
    /// type for the configured dialect) surface as `DbError::Schema`.
    pub fn new(
        definitions: BTreeMap<String, EntityDefinition>,
        dialect: &Dialect,
    ) -> DbResult<Self> {
        for (uid, definition) in &definitions {
            for (name, attr) in &definition.attributes {
                if !dialect.supports_type(attr.kind) {
                    return Err(DbError::schema(
                        format!(
                            "attribute '{name}' on '{uid}' has a type unsupported by {}",
                            dialect.kind()
                        ),
                        uid.clone(),
                    ));
                }
                if name == ID_COLUMN {
                    return Err(DbError::schema(
                        format!("attribute name '{ID_COLUMN}' on '{uid}' is reserved"),
                        uid.clone(),
                    ));
                }
            }
            for (field, relation) in &definition.relations {
                if !definitions.contains_key(&relation.target) {
                    return Err(DbError::schema(
                        format!(
                            "relation '{field}' on '{uid}' targets unregistered entity '{}'",
                            relation.target
                        ),
                        uid.clone(),
                    ));
                }
            }
        }

        let entries = definitions
            .iter()
            .map(|(uid, definition)| (uid.clone(), Arc::new(Metadata::compile(uid, definition))))
            .collect();

        Ok(Self { entries })
    }

    /// Check whether a UID is registered.
    pub fn has(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    /// Get the metadata for a UID, failing with `UnknownModel` when absent.
    pub fn get(&self, uid: &str) -> DbResult<Arc<Metadata>> {
        self.entries
            .get(uid)
            .cloned()
            .ok_or_else(|| DbError::unknown_model(uid))
    }

    /// Iterate all registered entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Metadata>> {
        self.entries.values()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
