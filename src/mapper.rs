//! # Table mapper
//!
//! Remembers, per PostgreSQL relation id, which Kafka topic its changes are
//! published to and which registered schema ids frame its messages. Metadata
//! is created lazily on the first schema frame for a relation and refreshed
//! on subsequent schema frames, since table schemas may evolve while the
//! stream is running.
//!
//! ## Topic naming
//!
//! The topic name is derived from the row Avro schema. The schema namespace
//! generated by the output plugin embeds the Postgres schema name; for any
//! schema other than `public` the topic becomes `<pg schema>.<table>`,
//! otherwise just `<table>`. An optional operator-configured prefix is
//! prepended with a `.` separator, and the result is truncated to the
//! topic-name buffer bound.

use crate::error::{BridgeError, Result};
use crate::registry::SchemaRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Namespace prefix the output plugin uses for generated row schemas. The
/// segment after it is the Postgres schema the table lives in.
pub const GENERATED_SCHEMA_NAMESPACE: &str = "bottledwater.dbschema";

/// Longest topic name the bridge will produce, including the terminator
/// byte reserved by wire-compatible C consumers.
pub const TOPIC_NAME_BUFFER_LENGTH: usize = 128;

/// Per-relation metadata owned by the mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Relation id, stable across table renames
    pub relid: u32,
    /// Kafka topic this table's changes are published to
    pub topic: String,
    /// Registry-assigned id of the key schema, if the table is keyed
    pub key_schema_id: Option<u32>,
    /// Registry-assigned id of the row schema
    pub row_schema_id: Option<u32>,
}

/// Maps relation ids to topics and schema ids.
pub struct TableMapper {
    tables: HashMap<u32, TableMetadata>,
    registry: Arc<dyn SchemaRegistry>,
    topic_prefix: Option<String>,
}

impl TableMapper {
    pub fn new(registry: Arc<dyn SchemaRegistry>, topic_prefix: Option<String>) -> Self {
        Self {
            tables: HashMap::new(),
            registry,
            topic_prefix,
        }
    }

    /// Derive the topic name for a row schema, applying the configured prefix.
    pub fn derive_topic(&self, row_schema_json: &str) -> Result<String> {
        let (table_name, namespace) = schema_name_parts(row_schema_json)?;
        Ok(topic_name(
            namespace.as_deref(),
            &table_name,
            self.topic_prefix.as_deref(),
        ))
    }

    /// Create or refresh the metadata for `relid`.
    ///
    /// On first sight of a relation this registers its schemas with the
    /// registry and records the assigned ids; later calls re-register, since
    /// the schemas may have evolved, and refresh the ids.
    pub async fn update(
        &mut self,
        relid: u32,
        topic: String,
        key_schema_json: Option<&str>,
        row_schema_json: &str,
    ) -> Result<&TableMetadata> {
        validate_schema(row_schema_json)?;
        if let Some(key_json) = key_schema_json {
            validate_schema(key_json)?;
        }

        let key_schema_id = match key_schema_json {
            Some(key_json) => Some(
                self.registry
                    .register(&format!("{}-key", topic), key_json)
                    .await?,
            ),
            None => None,
        };
        let row_schema_id = Some(
            self.registry
                .register(&format!("{}-value", topic), row_schema_json)
                .await?,
        );

        let known = self.tables.contains_key(&relid);
        if known {
            debug!(relid, topic = %topic, "refreshed table metadata");
        } else {
            info!(relid, topic = %topic, "mapping table to topic");
        }

        let metadata = TableMetadata {
            relid,
            topic,
            key_schema_id,
            row_schema_id,
        };
        self.tables.insert(relid, metadata);
        Ok(&self.tables[&relid])
    }

    /// Look up the metadata for a relation, if a schema frame has been seen.
    pub fn lookup(&self, relid: u32) -> Option<&TableMetadata> {
        self.tables.get(&relid)
    }

    /// Number of relations currently mapped.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Parse a schema's `name` and optional `namespace`, validating the schema
/// itself along the way.
fn schema_name_parts(schema_json: &str) -> Result<(String, Option<String>)> {
    validate_schema(schema_json)?;

    let value: serde_json::Value = serde_json::from_str(schema_json)?;
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BridgeError::schema("row schema has no record name"))?
        .to_string();
    let namespace = value
        .get("namespace")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok((name, namespace))
}

fn validate_schema(schema_json: &str) -> Result<()> {
    apache_avro::Schema::parse_str(schema_json)
        .map(|_| ())
        .map_err(|e| BridgeError::schema(format!("invalid Avro schema: {}", e)))
}

/// Compute a topic name from a schema namespace, table name, and optional
/// prefix. Pure: the same inputs always produce the same topic.
pub fn topic_name(namespace: Option<&str>, table_name: &str, prefix: Option<&str>) -> String {
    let mut name = match namespace
        .and_then(|ns| ns.strip_prefix(GENERATED_SCHEMA_NAMESPACE))
        .and_then(|rest| rest.strip_prefix('.'))
    {
        Some(pg_schema) if !pg_schema.is_empty() && pg_schema != "public" => {
            format!("{}.{}", pg_schema, table_name)
        }
        _ => table_name.to_string(),
    };

    if let Some(prefix) = prefix {
        name = format!("{}.{}", prefix, name);
    }

    truncate_to_boundary(&name, TOPIC_NAME_BUFFER_LENGTH - 1)
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncate_to_boundary(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NullRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Registry stub that hands out sequential ids and records subjects.
    struct CountingRegistry {
        next: AtomicU32,
        subjects: parking_lot::Mutex<Vec<String>>,
    }

    impl CountingRegistry {
        fn new() -> Self {
            Self {
                next: AtomicU32::new(1),
                subjects: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SchemaRegistry for CountingRegistry {
        async fn register(&self, subject: &str, _schema_json: &str) -> Result<u32> {
            self.subjects.lock().push(subject.to_string());
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn row_schema(name: &str, namespace: &str) -> String {
        format!(
            r#"{{"type":"record","name":"{}","namespace":"{}","fields":[{{"name":"id","type":"long"}}]}}"#,
            name, namespace
        )
    }

    const KEY_SCHEMA: &str =
        r#"{"type":"record","name":"users_pkey","fields":[{"name":"id","type":"long"}]}"#;

    #[test]
    fn test_topic_name_public_schema() {
        let ns = format!("{}.public", GENERATED_SCHEMA_NAMESPACE);
        assert_eq!(topic_name(Some(&ns), "users", None), "users");
    }

    #[test]
    fn test_topic_name_other_schema() {
        let ns = format!("{}.billing", GENERATED_SCHEMA_NAMESPACE);
        assert_eq!(topic_name(Some(&ns), "invoices", None), "billing.invoices");
    }

    #[test]
    fn test_topic_name_foreign_namespace() {
        assert_eq!(topic_name(Some("com.example.app"), "users", None), "users");
        assert_eq!(topic_name(None, "users", None), "users");
    }

    #[test]
    fn test_topic_name_prefix() {
        let ns = format!("{}.public", GENERATED_SCHEMA_NAMESPACE);
        assert_eq!(
            topic_name(Some(&ns), "users", Some("postgres")),
            "postgres.users"
        );
        let ns = format!("{}.billing", GENERATED_SCHEMA_NAMESPACE);
        assert_eq!(
            topic_name(Some(&ns), "invoices", Some("pg")),
            "pg.billing.invoices"
        );
    }

    #[test]
    fn test_topic_name_truncated() {
        let long = "t".repeat(300);
        let name = topic_name(None, &long, None);
        assert_eq!(name.len(), TOPIC_NAME_BUFFER_LENGTH - 1);
    }

    #[test]
    fn test_topic_name_is_idempotent() {
        let ns = format!("{}.billing", GENERATED_SCHEMA_NAMESPACE);
        let first = topic_name(Some(&ns), "invoices", Some("pg"));
        let second = topic_name(Some(&ns), "invoices", Some("pg"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_update_registers_both_schemas() {
        let registry = Arc::new(CountingRegistry::new());
        let mut mapper = TableMapper::new(registry.clone(), None);

        let row = row_schema("users", &format!("{}.public", GENERATED_SCHEMA_NAMESPACE));
        let topic = mapper.derive_topic(&row).unwrap();
        assert_eq!(topic, "users");

        let meta = mapper
            .update(42, topic, Some(KEY_SCHEMA), &row)
            .await
            .unwrap()
            .clone();

        assert_eq!(meta.key_schema_id, Some(1));
        assert_eq!(meta.row_schema_id, Some(2));
        assert_eq!(
            *registry.subjects.lock(),
            vec!["users-key".to_string(), "users-value".to_string()]
        );
        assert_eq!(mapper.lookup(42), Some(&meta));
        assert_eq!(mapper.lookup(43), None);
    }

    #[tokio::test]
    async fn test_update_refreshes_ids_on_schema_evolution() {
        let registry = Arc::new(CountingRegistry::new());
        let mut mapper = TableMapper::new(registry, None);

        let row = row_schema("users", &format!("{}.public", GENERATED_SCHEMA_NAMESPACE));
        mapper
            .update(42, "users".to_string(), Some(KEY_SCHEMA), &row)
            .await
            .unwrap();
        let second = mapper
            .update(42, "users".to_string(), Some(KEY_SCHEMA), &row)
            .await
            .unwrap()
            .clone();

        // Re-registration handed out fresh ids.
        assert_eq!(second.key_schema_id, Some(3));
        assert_eq!(second.row_schema_id, Some(4));
        assert_eq!(mapper.len(), 1);
    }

    #[tokio::test]
    async fn test_unkeyed_table_has_no_key_schema_id() {
        let mut mapper = TableMapper::new(Arc::new(NullRegistry), None);
        let row = row_schema("logline", &format!("{}.public", GENERATED_SCHEMA_NAMESPACE));
        let meta = mapper
            .update(9, "logline".to_string(), None, &row)
            .await
            .unwrap();
        assert_eq!(meta.key_schema_id, None);
        assert_eq!(meta.row_schema_id, Some(0));
    }

    #[tokio::test]
    async fn test_invalid_schema_rejected() {
        let mut mapper = TableMapper::new(Arc::new(NullRegistry), None);
        let err = mapper
            .update(9, "t".to_string(), None, "{\"type\":\"nope\"}")
            .await;
        assert!(err.is_err());
        assert!(mapper.is_empty());
    }
}
