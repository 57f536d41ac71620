//! Postgres-backed rule store.
//!
//! Every query carries `tenant_id` in its WHERE clause except unscoped
//! maintenance `find`s. The approval & temporal gate is pushed down into SQL
//! when a filter sets `active_at`, with the same inclusive-window semantics as
//! `halberd_policy::gate`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use halberd_core::{RuleId, TenantId};
use halberd_policy::PolicyRule;

use super::{RuleFilter, RuleStore, RuleStoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_policy_rules.sql");

const COLUMNS: &str = "id, tenant_id, service_name, ptype, v0, v1, v2, v3, v4, v5, \
     status, category, description, tags, metadata, usage_count, last_used_at, \
     require_approval, approval_status, approved_by, approved_at, \
     effective_from, effective_to, is_temporary, created_at, updated_at";

pub struct PostgresRuleStore {
    pool: Arc<PgPool>,
}

impl PostgresRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `policy_rules` table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), RuleStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> RuleStoreError {
    RuleStoreError::Storage(e.to_string())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_rule(row: &PgRow) -> Result<PolicyRule, RuleStoreError> {
    let id: i64 = row.try_get("id").map_err(storage)?;
    let corrupt = |reason: String| RuleStoreError::Corrupt { id, reason };

    let tenant_id: i64 = row.try_get("tenant_id").map_err(storage)?;
    let usage_count: i64 = row.try_get("usage_count").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let approval_status: String = row.try_get("approval_status").map_err(storage)?;

    Ok(PolicyRule {
        id: RuleId::new(u64::try_from(id).map_err(|e| corrupt(e.to_string()))?),
        tenant_id: TenantId::new(u64::try_from(tenant_id).map_err(|e| corrupt(e.to_string()))?),
        service_name: row.try_get("service_name").map_err(storage)?,
        ptype: row.try_get("ptype").map_err(storage)?,
        v0: row.try_get("v0").map_err(storage)?,
        v1: row.try_get("v1").map_err(storage)?,
        v2: row.try_get("v2").map_err(storage)?,
        v3: row.try_get("v3").map_err(storage)?,
        v4: row.try_get("v4").map_err(storage)?,
        v5: row.try_get("v5").map_err(storage)?,
        status: status.parse().map_err(|e: halberd_core::DomainError| corrupt(e.to_string()))?,
        category: row.try_get("category").map_err(storage)?,
        description: row.try_get("description").map_err(storage)?,
        tags: row.try_get("tags").map_err(storage)?,
        metadata: row.try_get("metadata").map_err(storage)?,
        usage_count: u64::try_from(usage_count).unwrap_or(0),
        last_used_at: row.try_get("last_used_at").map_err(storage)?,
        require_approval: row.try_get("require_approval").map_err(storage)?,
        approval_status: approval_status
            .parse()
            .map_err(|e: halberd_core::DomainError| corrupt(e.to_string()))?,
        approved_by: row.try_get("approved_by").map_err(storage)?,
        approved_at: row.try_get("approved_at").map_err(storage)?,
        effective_from: row.try_get("effective_from").map_err(storage)?,
        effective_to: row.try_get("effective_to").map_err(storage)?,
        is_temporary: row.try_get("is_temporary").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RuleFilter) {
    qb.push(" WHERE TRUE");
    if let Some(tenant_id) = filter.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(to_i64(tenant_id.get()));
    }
    if let Some(service) = &filter.service_name {
        qb.push(" AND service_name = ").push_bind(service.clone());
    }
    if let Some(ptype) = &filter.ptype {
        qb.push(" AND ptype = ").push_bind(ptype.clone());
    }
    if let Some(subject) = &filter.subject {
        qb.push(" AND v0 = ").push_bind(subject.clone());
    }
    if let Some(object) = &filter.object {
        qb.push(" AND v1 = ").push_bind(object.clone());
    }
    if let Some(action) = &filter.action {
        qb.push(" AND v2 = ").push_bind(action.clone());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(temporary) = filter.temporary {
        qb.push(" AND is_temporary = ").push_bind(temporary);
    }
    if let Some(now) = filter.active_at {
        qb.push(" AND status = 'enabled'")
            .push(" AND (require_approval = FALSE OR approval_status = 'approved')")
            .push(" AND (effective_from IS NULL OR effective_from <= ")
            .push_bind(now)
            .push(") AND (effective_to IS NULL OR effective_to >= ")
            .push_bind(now)
            .push(")");
    }
}

#[async_trait]
impl RuleStore for PostgresRuleStore {
    #[instrument(skip(self, rule), fields(tenant_id = %rule.tenant_id, ptype = %rule.ptype), err)]
    async fn insert(&self, rule: PolicyRule) -> Result<PolicyRule, RuleStoreError> {
        if rule.id.is_assigned() {
            return Err(RuleStoreError::AlreadyPersisted(rule.id));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO policy_rules (
                tenant_id, service_name, ptype, v0, v1, v2, v3, v4, v5,
                status, category, description, tags, metadata, usage_count, last_used_at,
                require_approval, approval_status, approved_by, approved_at,
                effective_from, effective_to, is_temporary, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(to_i64(rule.tenant_id.get()))
        .bind(&rule.service_name)
        .bind(&rule.ptype)
        .bind(&rule.v0)
        .bind(&rule.v1)
        .bind(&rule.v2)
        .bind(&rule.v3)
        .bind(&rule.v4)
        .bind(&rule.v5)
        .bind(rule.status.as_str())
        .bind(&rule.category)
        .bind(&rule.description)
        .bind(&rule.tags)
        .bind(&rule.metadata)
        .bind(to_i64(rule.usage_count))
        .bind(rule.last_used_at)
        .bind(rule.require_approval)
        .bind(rule.approval_status.as_str())
        .bind(&rule.approved_by)
        .bind(rule.approved_at)
        .bind(rule.effective_from)
        .bind(rule.effective_to)
        .bind(rule.is_temporary)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage)?;

        row_to_rule(&row)
    }

    async fn get(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM policy_rules WHERE id = $1"))
            .bind(to_i64(id.get()))
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => {
                let rule = row_to_rule(&row)?;
                if rule.tenant_id != tenant_id {
                    return Err(RuleStoreError::TenantIsolation);
                }
                Ok(Some(rule))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, rule), fields(tenant_id = %rule.tenant_id, rule_id = %rule.id), err)]
    async fn update(&self, rule: &PolicyRule) -> Result<(), RuleStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE policy_rules SET
                service_name = $3, ptype = $4, v0 = $5, v1 = $6, v2 = $7, v3 = $8, v4 = $9, v5 = $10,
                status = $11, category = $12, description = $13, tags = $14, metadata = $15,
                require_approval = $16, approval_status = $17, approved_by = $18, approved_at = $19,
                effective_from = $20, effective_to = $21, is_temporary = $22, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(to_i64(rule.tenant_id.get()))
        .bind(to_i64(rule.id.get()))
        .bind(&rule.service_name)
        .bind(&rule.ptype)
        .bind(&rule.v0)
        .bind(&rule.v1)
        .bind(&rule.v2)
        .bind(&rule.v3)
        .bind(&rule.v4)
        .bind(&rule.v5)
        .bind(rule.status.as_str())
        .bind(&rule.category)
        .bind(&rule.description)
        .bind(&rule.tags)
        .bind(&rule.metadata)
        .bind(rule.require_approval)
        .bind(rule.approval_status.as_str())
        .bind(&rule.approved_by)
        .bind(rule.approved_at)
        .bind(rule.effective_from)
        .bind(rule.effective_to)
        .bind(rule.is_temporary)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(RuleStoreError::NotFound(rule.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM policy_rules WHERE tenant_id = $1 AND id = $2 RETURNING {COLUMNS}"
        ))
        .bind(to_i64(tenant_id.get()))
        .bind(to_i64(id.get()))
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn find(&self, filter: &RuleFilter) -> Result<Vec<PolicyRule>, RuleStoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM policy_rules"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&*self.pool).await.map_err(storage)?;
        rows.iter().map(row_to_rule).collect()
    }

    async fn record_usage(
        &self,
        tenant_id: TenantId,
        ids: &[RuleId],
        at: DateTime<Utc>,
    ) -> Result<(), RuleStoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = ids.iter().map(|id| to_i64(id.get())).collect();
        sqlx::query(
            r#"
            UPDATE policy_rules
            SET usage_count = usage_count + 1, last_used_at = $3
            WHERE tenant_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(to_i64(tenant_id.get()))
        .bind(&ids)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}
