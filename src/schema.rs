//! Schema Cache
//!
//! Point-in-time snapshot of the target schema's tables, columns and
//! foreign-key edges. Loaded once at startup and shared read-only afterwards.

use crate::db::Database;
use crate::error::{AgentError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const NO_RELATIONSHIPS: &str = "No foreign key relationships found.";

/// Directional foreign-key edge `table.column → referenced_table.referenced_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Raw column metadata row as returned by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// `"<schema>.<table>"` → columns in ordinal order, tables in load order.
    columns: IndexMap<String, Vec<ColumnInfo>>,
    relationships: Vec<ForeignKey>,
}

impl SchemaSnapshot {
    /// The snapshot used when metadata could not be loaded.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Group metadata rows into a snapshot. Rows must already be ordered by
    /// (schema, table, ordinal position); that order is preserved.
    pub fn from_rows(relationships: Vec<ForeignKey>, columns: Vec<ColumnRecord>) -> Self {
        let mut grouped: IndexMap<String, Vec<ColumnInfo>> = IndexMap::new();
        for record in columns {
            grouped
                .entry(format!("{}.{}", record.schema, record.table))
                .or_default()
                .push(ColumnInfo {
                    name: record.name,
                    data_type: record.data_type,
                });
        }

        Self {
            columns: grouped,
            relationships,
        }
    }

    pub fn columns(&self) -> &IndexMap<String, Vec<ColumnInfo>> {
        &self.columns
    }

    pub fn relationships(&self) -> &[ForeignKey] {
        &self.relationships
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.relationships.is_empty()
    }

    /// One `- table.column → ref_table.ref_column` line per edge, or a
    /// placeholder sentence when there are none.
    pub fn render_relationships(&self) -> String {
        if self.relationships.is_empty() {
            return NO_RELATIONSHIPS.to_string();
        }

        self.relationships
            .iter()
            .map(|fk| {
                format!(
                    "- {}.{} → {}.{}",
                    fk.table, fk.column, fk.referenced_table, fk.referenced_column
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render_columns(&self) -> String {
        self.columns
            .iter()
            .map(|(table, cols)| {
                let entries: Vec<String> = cols
                    .iter()
                    .map(|c| format!("{} ({})", c.name, c.data_type))
                    .collect();
                format!("\n{}:\n  {}", table, entries.join("\n  "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct SchemaCache;

impl SchemaCache {
    /// Load the snapshot for `schema`. Never fails: on error the problem is
    /// logged and the empty snapshot is returned so the service keeps running.
    pub async fn load(db: &dyn Database, schema: &str) -> SchemaSnapshot {
        match Self::try_load(db, schema).await {
            Ok(snapshot) => {
                info!(
                    "Schema loaded: {} tables, {} foreign keys",
                    snapshot.columns().len(),
                    snapshot.relationships().len()
                );
                snapshot
            }
            Err(e) => {
                error!("Failed to preload schema '{}': {}", schema, e);
                SchemaSnapshot::empty()
            }
        }
    }

    pub async fn try_load(db: &dyn Database, schema: &str) -> Result<SchemaSnapshot> {
        let mut conn = db.connect().await?;

        let loaded = async {
            let relationships = conn.foreign_keys(schema).await?;
            let columns = conn.columns(schema).await?;
            Ok::<_, AgentError>(SchemaSnapshot::from_rows(relationships, columns))
        }
        .await;

        conn.close().await?;
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(schema: &str, table: &str, name: &str, ty: &str) -> ColumnRecord {
        ColumnRecord {
            schema: schema.to_string(),
            table: table.to_string(),
            name: name.to_string(),
            data_type: ty.to_string(),
        }
    }

    #[test]
    fn test_grouping_preserves_ordinal_order() {
        let snapshot = SchemaSnapshot::from_rows(
            vec![],
            vec![
                col("shop", "customers", "id", "integer"),
                col("shop", "customers", "name", "text"),
                col("shop", "orders", "id", "integer"),
                col("shop", "orders", "customer_id", "integer"),
                col("shop", "orders", "total", "numeric"),
            ],
        );

        let tables: Vec<&String> = snapshot.columns().keys().collect();
        assert_eq!(tables, vec!["shop.customers", "shop.orders"]);

        let orders: Vec<&str> = snapshot.columns()["shop.orders"]
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(orders, vec!["id", "customer_id", "total"]);
        assert_eq!(snapshot.columns()["shop.customers"].len(), 2);
    }

    #[test]
    fn test_same_table_name_in_different_schemas_is_not_merged() {
        let snapshot = SchemaSnapshot::from_rows(
            vec![],
            vec![
                col("a", "items", "id", "integer"),
                col("b", "items", "sku", "text"),
            ],
        );
        assert_eq!(snapshot.columns()["a.items"].len(), 1);
        assert_eq!(snapshot.columns()["b.items"][0].name, "sku");
    }

    #[test]
    fn test_render_relationships_placeholder() {
        assert_eq!(SchemaSnapshot::empty().render_relationships(), NO_RELATIONSHIPS);
    }

    #[test]
    fn test_render() {
        let snapshot = SchemaSnapshot::from_rows(
            vec![ForeignKey {
                table: "orders".to_string(),
                column: "customer_id".to_string(),
                referenced_table: "customers".to_string(),
                referenced_column: "id".to_string(),
            }],
            vec![
                col("shop", "orders", "id", "integer"),
                col("shop", "orders", "customer_id", "integer"),
            ],
        );

        assert_eq!(
            snapshot.render_relationships(),
            "- orders.customer_id → customers.id"
        );
        assert_eq!(
            snapshot.render_columns(),
            "\nshop.orders:\n  id (integer)\n  customer_id (integer)"
        );
    }
}
