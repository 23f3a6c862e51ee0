//! Table schema: access groups and the column families they own.
//!
//! Schemas are stored as JSON documents in the coordinator under the table
//! file and cached per table; the update and scan paths consult them to route
//! column families to access groups.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One column family belonging to an access group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnFamilySpec {
    pub id: u8,
    pub name: String,
}

/// A column-family grouping whose cells share an on-disk file set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessGroupSpec {
    pub name: String,
    #[serde(default)]
    pub in_memory: bool,
    pub column_families: Vec<ColumnFamilySpec>,
}

/// Parsed table schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    pub generation: u32,
    pub access_groups: Vec<AccessGroupSpec>,
}

impl Schema {
    /// Parse and validate a schema document.
    pub fn parse(document: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(document)
            .map_err(|err| Error::SchemaParse(err.to_string()))?;

        if schema.access_groups.is_empty() {
            return Err(Error::SchemaParse("schema has no access groups".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ag in &schema.access_groups {
            for cf in &ag.column_families {
                if !seen.insert(cf.id) {
                    return Err(Error::SchemaParse(format!(
                        "duplicate column family id {}",
                        cf.id
                    )));
                }
            }
        }
        Ok(schema)
    }

    pub fn to_document(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Index of the access group owning `column_family`, if any.
    pub fn access_group_for(&self, column_family: u8) -> Option<usize> {
        self.access_groups
            .iter()
            .position(|ag| ag.column_families.iter().any(|cf| cf.id == column_family))
    }

    /// Column family id by name, used when composing METADATA cells.
    pub fn column_family_id(&self, name: &str) -> Option<u8> {
        self.access_groups
            .iter()
            .flat_map(|ag| ag.column_families.iter())
            .find(|cf| cf.name == name)
            .map(|cf| cf.id)
    }
}

/// Built-in schema of the METADATA table: a single `default` access group
/// holding the `Location` column family.
pub fn metadata_schema() -> Schema {
    Schema {
        generation: 1,
        access_groups: vec![AccessGroupSpec {
            name: "default".into(),
            in_memory: true,
            column_families: vec![ColumnFamilySpec {
                id: 1,
                name: "Location".into(),
            }],
        }],
    }
}
