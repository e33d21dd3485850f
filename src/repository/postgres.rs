use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

use super::{FlagRepository, RepositoryError, RepositoryResult};
use crate::audit::{AuditAction, AuditEntry, AuditError, AuditStore};
use crate::evaluation::EvaluationContext;
use crate::flags::{FeatureFlag, FlagFilter, FlagType, Page};
use crate::rules::{Rule, RuleOperator};
use crate::segments::{SegmentBinding, SegmentError, SegmentResolver};

// Database row types
#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    key: String,
    name: String,
    description: Option<String>,
    flag_type: String,
    enabled: bool,
    default_value: Value,
    percentage_enabled: Option<f64>,
    environments: Json<HashMap<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    flag_id: Uuid,
    attribute: String,
    operator: String,
    value: Value,
    priority: i32,
    enabled: bool,
    return_value: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct SegmentRow {
    id: Uuid,
    flag_id: Uuid,
    segment_id: String,
    enabled: bool,
    return_value: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    flag_id: Uuid,
    action: String,
    actor_id: Option<String>,
    changes: Value,
    created_at: DateTime<Utc>,
}

const FLAG_COLUMNS: &str = "id, key, name, description, flag_type, enabled, default_value, \
     percentage_enabled, environments, created_at, updated_at";

fn decode_error(what: &str, detail: String) -> RepositoryError {
    error!(what, detail = %detail, "stored flag data could not be decoded");
    RepositoryError::Decode(format!("{}: {}", what, detail))
}

impl TryFrom<RuleRow> for Rule {
    type Error = RepositoryError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let operator: RuleOperator = row
            .operator
            .parse()
            .map_err(|e| decode_error("rule operator", format!("rule {}: {}", row.id, e)))?;

        Ok(Rule {
            id: row.id,
            attribute: row.attribute,
            operator,
            value: row.value,
            priority: row.priority,
            enabled: row.enabled,
            return_value: row.return_value,
        })
    }
}

impl From<SegmentRow> for SegmentBinding {
    fn from(row: SegmentRow) -> Self {
        SegmentBinding {
            id: row.id,
            segment_id: row.segment_id,
            enabled: row.enabled,
            return_value: row.return_value,
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db_error| db_error.code())
        .is_some_and(|code| code == "23505")
}

pub struct PgFlagRepository {
    pool: PgPool,
}

impl PgFlagRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach rules and segment bindings to a batch of flag rows in two queries.
    async fn hydrate(&self, rows: Vec<FlagRow>) -> RepositoryResult<Vec<FeatureFlag>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let flag_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let rules: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT id, flag_id, attribute, operator, value, priority, enabled, return_value
            FROM flag_rules
            WHERE flag_id = ANY($1)
            ORDER BY flag_id, position
            "#,
        )
        .bind(&flag_ids)
        .fetch_all(&self.pool)
        .await?;

        let segments: Vec<SegmentRow> = sqlx::query_as(
            r#"
            SELECT id, flag_id, segment_id, enabled, return_value
            FROM flag_segments
            WHERE flag_id = ANY($1)
            ORDER BY flag_id, position
            "#,
        )
        .bind(&flag_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut rules_by_flag: HashMap<Uuid, Vec<Rule>> = HashMap::new();
        for row in rules {
            let flag_id = row.flag_id;
            rules_by_flag.entry(flag_id).or_default().push(Rule::try_from(row)?);
        }

        let mut segments_by_flag: HashMap<Uuid, Vec<SegmentBinding>> = HashMap::new();
        for row in segments {
            segments_by_flag.entry(row.flag_id).or_default().push(row.into());
        }

        rows.into_iter()
            .map(|row| -> RepositoryResult<FeatureFlag> {
                let flag_type: FlagType = row
                    .flag_type
                    .parse()
                    .map_err(|e| decode_error("flag type", format!("flag {}: {}", row.key, e)))?;

                Ok(FeatureFlag {
                    rules: rules_by_flag.remove(&row.id).unwrap_or_default(),
                    segments: segments_by_flag.remove(&row.id).unwrap_or_default(),
                    id: row.id,
                    key: row.key,
                    name: row.name,
                    description: row.description,
                    flag_type,
                    enabled: row.enabled,
                    default_value: row.default_value,
                    percentage_enabled: row.percentage_enabled,
                    environments: row.environments.0,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }
}

// Replace the full rule and segment sets of a flag
async fn replace_children(conn: &mut PgConnection, flag: &FeatureFlag) -> RepositoryResult<()> {
    sqlx::query("DELETE FROM flag_rules WHERE flag_id = $1")
        .bind(flag.id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM flag_segments WHERE flag_id = $1")
        .bind(flag.id)
        .execute(&mut *conn)
        .await?;

    for (position, rule) in flag.rules.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO flag_rules (id, flag_id, position, attribute, operator, value, priority, enabled, return_value)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.id)
        .bind(flag.id)
        .bind(position as i32)
        .bind(&rule.attribute)
        .bind(rule.operator.as_str())
        .bind(&rule.value)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(&rule.return_value)
        .execute(&mut *conn)
        .await?;
    }

    for (position, binding) in flag.segments.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO flag_segments (id, flag_id, position, segment_id, enabled, return_value)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(binding.id)
        .bind(flag.id)
        .bind(position as i32)
        .bind(&binding.segment_id)
        .bind(binding.enabled)
        .bind(&binding.return_value)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl FlagRepository for PgFlagRepository {
    async fn find_by_key(&self, key: &str) -> RepositoryResult<Option<FeatureFlag>> {
        let row: Option<FlagRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feature_flags WHERE key = $1",
            FLAG_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &FlagFilter, page: Page) -> RepositoryResult<(Vec<FeatureFlag>, u64)> {
        let flag_type = filter.flag_type.map(|t| t.as_str());
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM feature_flags
            WHERE ($1::text IS NULL OR flag_type = $1)
              AND ($2::bool IS NULL OR enabled = $2)
              AND ($3::text IS NULL OR key ILIKE '%' || $3 || '%' OR name ILIKE '%' || $3 || '%')
            "#,
        )
        .bind(flag_type)
        .bind(filter.enabled)
        .bind(search)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<FlagRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM feature_flags
            WHERE ($1::text IS NULL OR flag_type = $1)
              AND ($2::bool IS NULL OR enabled = $2)
              AND ($3::text IS NULL OR key ILIKE '%' || $3 || '%' OR name ILIKE '%' || $3 || '%')
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
            FLAG_COLUMNS
        ))
        .bind(flag_type)
        .bind(filter.enabled)
        .bind(search)
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let flags = self.hydrate(rows).await?;
        Ok((flags, u64::try_from(total).unwrap_or(0)))
    }

    async fn insert(&self, flag: &FeatureFlag) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO feature_flags (id, key, name, description, flag_type, enabled, default_value, percentage_enabled, environments, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(flag.id)
        .bind(&flag.key)
        .bind(&flag.name)
        .bind(&flag.description)
        .bind(flag.flag_type.as_str())
        .bind(flag.enabled)
        .bind(&flag.default_value)
        .bind(flag.percentage_enabled)
        .bind(Json(&flag.environments))
        .bind(flag.created_at)
        .bind(flag.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(RepositoryError::Conflict(flag.key.clone()));
            }
            return Err(e.into());
        }

        replace_children(&mut *tx, flag).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, flag: &FeatureFlag) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE feature_flags
            SET
                name = $2,
                description = $3,
                flag_type = $4,
                enabled = $5,
                default_value = $6,
                percentage_enabled = $7,
                environments = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(flag.id)
        .bind(&flag.name)
        .bind(&flag.description)
        .bind(flag.flag_type.as_str())
        .bind(flag.enabled)
        .bind(&flag.default_value)
        .bind(flag.percentage_enabled)
        .bind(Json(&flag.environments))
        .bind(flag.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Unavailable(format!(
                "flag '{}' vanished during update",
                flag.key
            )));
        }

        replace_children(&mut *tx, flag).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<bool> {
        // rules and segment bindings go with the flag via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM feature_flags WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO flag_audit_log (id, flag_id, action, actor_id, changes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.flag_id)
        .bind(entry.action.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.changes)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_flag(&self, flag_id: Uuid, limit: u32) -> Result<Vec<AuditEntry>, AuditError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, flag_id, action, actor_id, changes, created_at
            FROM flag_audit_log
            WHERE flag_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(flag_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<AuditEntry, AuditError> {
                let action: AuditAction = row.action.parse().map_err(AuditError::Decode)?;
                Ok(AuditEntry {
                    id: row.id,
                    flag_id: row.flag_id,
                    action,
                    actor_id: row.actor_id,
                    changes: row.changes,
                    timestamp: row.created_at,
                })
            })
            .collect()
    }
}

/// Segment membership read from the `segment_memberships` table.
pub struct PgSegmentResolver {
    pool: PgPool,
}

impl PgSegmentResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SegmentResolver for PgSegmentResolver {
    async fn is_member(
        &self,
        segment_id: &str,
        context: &EvaluationContext,
    ) -> Result<bool, SegmentError> {
        let member = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM segment_memberships
                WHERE segment_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(segment_id)
        .bind(&context.user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(member)
    }
}
