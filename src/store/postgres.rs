use anyhow::{bail, Context, Result};
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use std::time::Duration;

use crate::logic::CompactionOutcome;
use crate::model::{BranchHead, BranchLock, BranchState, CommitNode, IndexedCommit, LockAuditEntry};
use crate::store::traits::{AdvisoryMode, CommitStore, LockStore, LockTransaction};

/// SQLSTATE raised when `lock_timeout` expires
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Advisory key guarding the commit DAG. Inserts hold it shared and applying
/// a compaction holds it exclusively.
const COMMIT_DAG_KEY: &str = "commit_dag";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS branch_states (
        branch_name TEXT PRIMARY KEY,
        current_state TEXT NOT NULL,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lock_audit_log (
        id BIGSERIAL PRIMARY KEY,
        lock_id TEXT NOT NULL,
        branch_name TEXT NOT NULL,
        lock_type TEXT NOT NULL,
        lock_scope TEXT NOT NULL,
        locked_by TEXT NOT NULL,
        action TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS lock_audit_log_branch_idx ON lock_audit_log (branch_name, id)",
    r#"
    CREATE TABLE IF NOT EXISTS commit_nodes (
        commit_id TEXT PRIMARY KEY,
        parent_ids JSONB NOT NULL,
        branch_id TEXT NOT NULL,
        committed_at TIMESTAMPTZ NOT NULL,
        schema_hash TEXT NOT NULL,
        compacted_from JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS branch_heads (
        branch_name TEXT PRIMARY KEY,
        head_commit TEXT NOT NULL,
        parent_branch TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS compaction_index (
        original_commit_id TEXT PRIMARY KEY,
        compacted_into TEXT NOT NULL,
        committed_at TIMESTAMPTZ NOT NULL,
        schema_hash TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create tables if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run schema migration")?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn enum_label<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(label) => Ok(label),
        other => bail!("Expected a string label, got {}", other),
    }
}

fn is_lock_timeout(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

fn commit_from_row(row: &sqlx::postgres::PgRow) -> Result<CommitNode> {
    let Json(parent_ids): Json<Vec<String>> = row.try_get("parent_ids")?;
    let Json(compacted_from): Json<Vec<String>> = row.try_get("compacted_from")?;
    Ok(CommitNode {
        commit_id: row.try_get("commit_id")?,
        parent_ids,
        branch_id: row.try_get("branch_id")?,
        timestamp: row.try_get("committed_at")?,
        schema_hash: row.try_get("schema_hash")?,
        compacted_from,
    })
}

/// Transaction holding a transaction-scoped advisory lock; Postgres releases
/// the lock on commit or rollback, including when the connection dies.
struct PgLockTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl LockTransaction for PgLockTransaction {
    async fn get_branch_state(&mut self, branch_name: &str) -> Result<Option<BranchState>> {
        let row = sqlx::query("SELECT document FROM branch_states WHERE branch_name = $1 FOR UPDATE")
            .bind(branch_name)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to fetch branch state")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(state): Json<BranchState> = row.try_get("document")?;
        Ok(Some(state))
    }

    async fn put_branch_state(&mut self, state: &BranchState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branch_states (branch_name, current_state, document, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (branch_name) DO UPDATE SET
                current_state = EXCLUDED.current_state,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.branch_name)
        .bind(enum_label(&state.current_state)?)
        .bind(Json(state))
        .bind(state.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("Failed to upsert branch state")?;

        Ok(())
    }

    async fn append_audit(&mut self, entry: &LockAuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lock_audit_log
                (lock_id, branch_name, lock_type, lock_scope, locked_by, action, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.lock_id)
        .bind(&entry.branch_name)
        .bind(enum_label(&entry.lock_type)?)
        .bind(enum_label(&entry.lock_scope)?)
        .bind(&entry.locked_by)
        .bind(enum_label(&entry.action)?)
        .bind(entry.timestamp)
        .bind(Json(&entry.metadata))
        .execute(&mut *self.tx)
        .await
        .context("Failed to append lock audit entry")?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("Failed to commit lock transaction")
    }
}

#[async_trait::async_trait]
impl LockStore for PostgresStore {
    async fn begin_locked(
        &self,
        key: &str,
        mode: AdvisoryMode,
        timeout: Duration,
    ) -> Result<Option<Box<dyn LockTransaction>>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin lock transaction")?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .context("Failed to set lock timeout")?;

        let statement = match mode {
            AdvisoryMode::Exclusive => "SELECT pg_advisory_xact_lock(hashtext($1))",
            AdvisoryMode::Shared => "SELECT pg_advisory_xact_lock_shared(hashtext($1))",
        };

        match sqlx::query(statement).bind(key).execute(&mut *tx).await {
            Ok(_) => Ok(Some(Box::new(PgLockTransaction { tx }))),
            // The aborted transaction rolls back when `tx` drops
            Err(e) if is_lock_timeout(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to acquire advisory lock"),
        }
    }

    async fn get_branch_state(&self, branch_name: &str) -> Result<Option<BranchState>> {
        let row = sqlx::query("SELECT document FROM branch_states WHERE branch_name = $1")
            .bind(branch_name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch state")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(state): Json<BranchState> = row.try_get("document")?;
        Ok(Some(state))
    }

    async fn list_branch_states(&self) -> Result<Vec<BranchState>> {
        let rows = sqlx::query("SELECT document FROM branch_states ORDER BY branch_name")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list branch states")?;

        rows.iter()
            .map(|row| {
                let Json(state): Json<BranchState> = row.try_get("document")?;
                Ok(state)
            })
            .collect()
    }

    async fn find_lock(&self, lock_id: &str) -> Result<Option<BranchLock>> {
        let row = sqlx::query(
            r#"
            SELECT elem.value AS lock_document
            FROM branch_states, jsonb_array_elements(document->'active_locks') AS elem
            WHERE elem.value->>'id' = $1
            LIMIT 1
            "#,
        )
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up lock")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(lock): Json<BranchLock> = row.try_get("lock_document")?;
        Ok(Some(lock))
    }

    async fn audit_trail(&self, branch_name: &str) -> Result<Vec<LockAuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT lock_id, branch_name, lock_type, lock_scope, locked_by, action, created_at, metadata
            FROM lock_audit_log
            WHERE branch_name = $1
            ORDER BY id
            "#,
        )
        .bind(branch_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch lock audit trail")?;

        rows.iter()
            .map(|row| {
                let label = |column: &str| -> Result<serde_json::Value> {
                    Ok(serde_json::Value::String(row.try_get(column)?))
                };
                let Json(metadata): Json<serde_json::Value> = row.try_get("metadata")?;
                Ok(LockAuditEntry {
                    lock_id: row.try_get("lock_id")?,
                    branch_name: row.try_get("branch_name")?,
                    lock_type: serde_json::from_value(label("lock_type")?)?,
                    lock_scope: serde_json::from_value(label("lock_scope")?)?,
                    locked_by: row.try_get("locked_by")?,
                    action: serde_json::from_value(label("action")?)?,
                    timestamp: row.try_get("created_at")?,
                    metadata,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl CommitStore for PostgresStore {
    async fn list_commits(&self) -> Result<Vec<CommitNode>> {
        let rows = sqlx::query(
            r#"
            SELECT commit_id, parent_ids, branch_id, committed_at, schema_hash, compacted_from
            FROM commit_nodes
            ORDER BY committed_at, commit_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list commits")?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn insert_commit(&self, commit: CommitNode) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin commit transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock_shared(hashtext($1))")
            .bind(COMMIT_DAG_KEY)
            .execute(&mut *tx)
            .await
            .context("Failed to lock commit DAG")?;

        if !commit.parent_ids.is_empty() {
            let known: Vec<String> =
                sqlx::query_scalar("SELECT commit_id FROM commit_nodes WHERE commit_id = ANY($1)")
                    .bind(&commit.parent_ids)
                    .fetch_all(&mut *tx)
                    .await
                    .context("Failed to look up parent commits")?;
            if let Some(parent) = commit.parent_ids.iter().find(|p| !known.contains(p)) {
                bail!(
                    "Commit '{}' names unknown parent '{}'",
                    commit.commit_id,
                    parent
                );
            }
        }

        sqlx::query(
            r#"
            INSERT INTO commit_nodes (commit_id, parent_ids, branch_id, committed_at, schema_hash, compacted_from)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&commit.commit_id)
        .bind(Json(&commit.parent_ids))
        .bind(&commit.branch_id)
        .bind(commit.timestamp)
        .bind(&commit.schema_hash)
        .bind(Json(&commit.compacted_from))
        .execute(&mut *tx)
        .await
        .context("Failed to insert commit")?;

        tx.commit().await.context("Failed to commit insert")?;
        Ok(())
    }

    async fn get_branch_head(&self, branch_name: &str) -> Result<Option<BranchHead>> {
        let row = sqlx::query(
            "SELECT branch_name, head_commit, parent_branch FROM branch_heads WHERE branch_name = $1",
        )
        .bind(branch_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch branch head")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BranchHead {
            branch_name: row.try_get("branch_name")?,
            head_commit: row.try_get("head_commit")?,
            parent_branch: row.try_get("parent_branch")?,
        }))
    }

    async fn list_branch_heads(&self) -> Result<Vec<BranchHead>> {
        let rows = sqlx::query(
            "SELECT branch_name, head_commit, parent_branch FROM branch_heads ORDER BY branch_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branch heads")?;

        rows.iter()
            .map(|row| {
                Ok(BranchHead {
                    branch_name: row.try_get("branch_name")?,
                    head_commit: row.try_get("head_commit")?,
                    parent_branch: row.try_get("parent_branch")?,
                })
            })
            .collect()
    }

    async fn upsert_branch_head(&self, head: BranchHead) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branch_heads (branch_name, head_commit, parent_branch)
            VALUES ($1, $2, $3)
            ON CONFLICT (branch_name) DO UPDATE SET
                head_commit = EXCLUDED.head_commit,
                parent_branch = EXCLUDED.parent_branch
            "#,
        )
        .bind(&head.branch_name)
        .bind(&head.head_commit)
        .bind(&head.parent_branch)
        .execute(&self.pool)
        .await
        .context("Failed to upsert branch head")?;

        Ok(())
    }

    async fn apply_compaction(&self, outcome: &CompactionOutcome) -> Result<()> {
        if outcome.dry_run {
            bail!("Refusing to apply a dry-run compaction");
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin compaction transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(COMMIT_DAG_KEY)
            .execute(&mut *tx)
            .await
            .context("Failed to lock commit DAG")?;

        // Synthetic commits first so rewritten children never point at nothing
        for commit in &outcome.new_commits {
            sqlx::query(
                r#"
                INSERT INTO commit_nodes (commit_id, parent_ids, branch_id, committed_at, schema_hash, compacted_from)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (commit_id) DO UPDATE SET
                    parent_ids = EXCLUDED.parent_ids,
                    compacted_from = EXCLUDED.compacted_from
                "#,
            )
            .bind(&commit.commit_id)
            .bind(Json(&commit.parent_ids))
            .bind(&commit.branch_id)
            .bind(commit.timestamp)
            .bind(&commit.schema_hash)
            .bind(Json(&commit.compacted_from))
            .execute(&mut *tx)
            .await
            .context("Failed to write compacted commit")?;
        }

        let removed = sqlx::query("DELETE FROM commit_nodes WHERE commit_id = ANY($1)")
            .bind(&outcome.removed_commits)
            .execute(&mut *tx)
            .await
            .context("Failed to remove compacted commits")?;
        if removed.rows_affected() != outcome.removed_commits.len() as u64 {
            // Dropping `tx` rolls everything back
            bail!(
                "Compaction expected to remove {} commits but removed {}",
                outcome.removed_commits.len(),
                removed.rows_affected()
            );
        }

        // Commits written after the outcome was computed must not lose their parent
        let orphan = sqlx::query(
            r#"
            SELECT c.commit_id, p.parent_id
            FROM commit_nodes c
            CROSS JOIN LATERAL jsonb_array_elements_text(c.parent_ids) AS p(parent_id)
            WHERE p.parent_id = ANY($1)
            LIMIT 1
            "#,
        )
        .bind(&outcome.removed_commits)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to check for orphaned commits")?;
        if let Some(row) = orphan {
            let child: String = row.try_get("commit_id")?;
            let parent: String = row.try_get("parent_id")?;
            bail!(
                "Stale compaction: commit '{}' still references removed commit '{}'",
                child,
                parent
            );
        }

        for entry in outcome.index.entries() {
            sqlx::query(
                r#"
                INSERT INTO compaction_index (original_commit_id, compacted_into, committed_at, schema_hash)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (original_commit_id) DO UPDATE SET compacted_into = EXCLUDED.compacted_into
                "#,
            )
            .bind(&entry.original_commit_id)
            .bind(&entry.compacted_into)
            .bind(entry.timestamp)
            .bind(&entry.schema_hash)
            .execute(&mut *tx)
            .await
            .context("Failed to record compaction index")?;
        }

        tx.commit()
            .await
            .context("Failed to commit compaction")?;
        Ok(())
    }

    async fn resolve_commit(&self, commit_id: &str) -> Result<Option<IndexedCommit>> {
        let live = sqlx::query(
            "SELECT commit_id, committed_at, schema_hash FROM commit_nodes WHERE commit_id = $1",
        )
        .bind(commit_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch commit")?;

        if let Some(row) = live {
            let id: String = row.try_get("commit_id")?;
            return Ok(Some(IndexedCommit {
                original_commit_id: id.clone(),
                compacted_into: id,
                timestamp: row.try_get("committed_at")?,
                schema_hash: row.try_get("schema_hash")?,
            }));
        }

        // Follow successive compactions to the live commit
        let row = sqlx::query(
            r#"
            WITH RECURSIVE chain AS (
                SELECT original_commit_id, compacted_into, committed_at, schema_hash, 0 AS depth
                FROM compaction_index WHERE original_commit_id = $1
                UNION ALL
                SELECT c.original_commit_id, ci.compacted_into, c.committed_at, c.schema_hash, c.depth + 1
                FROM chain c JOIN compaction_index ci ON ci.original_commit_id = c.compacted_into
                WHERE c.depth < 64
            )
            SELECT original_commit_id, compacted_into, committed_at, schema_hash
            FROM chain ORDER BY depth DESC LIMIT 1
            "#,
        )
        .bind(commit_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to resolve compacted commit")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(IndexedCommit {
            original_commit_id: row.try_get("original_commit_id")?,
            compacted_into: row.try_get("compacted_into")?,
            timestamp: row.try_get("committed_at")?,
            schema_hash: row.try_get("schema_hash")?,
        }))
    }
}
