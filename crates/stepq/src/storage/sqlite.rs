//! SQLite implementation of Storage
//!
//! Production persistence using SQLite through sqlx:
//! - Lazy schema creation (`CREATE TABLE IF NOT EXISTS`)
//! - Atomic task reservation inside a transaction
//! - Structural event matching via `json_tree` / `json_extract`
//! - A partial unique index keeps `(queue, job, key)` unique among live
//!   tasks while letting terminal rows be recreated by later dispatches

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use serde_json::Value;

use super::store::*;
use crate::codec::to_canonical_string;
use crate::step::name as step_name;
use crate::time;

/// A step blocks its task iff it is mid-flight, parked on an unexpired
/// timer, or waiting with an unexpired timeout and no satisfying event.
/// Parameters: `?1` queue, `?2` now.
const RUNNABLE_COND: &str = r#"
    t.queue = ?1
    AND t.status IN ('pending','stalled')
    AND NOT EXISTS (
        SELECT 1 FROM steps s
        WHERE s.task_id = t.id
          AND (
            s.status = 'running'
            OR (s.status = 'stalled' AND s.sleep_until IS NOT NULL AND s.sleep_until > ?2)
            OR (
              s.status = 'waiting'
              AND (s.sleep_until IS NULL OR s.sleep_until > ?2)
              AND NOT EXISTS (
                SELECT 1 FROM events e
                WHERE e.queue = s.queue
                  AND e.key = s.wait_for
                  AND (COALESCE(s.wait_retroactive, 0) = 1 OR e.created_at >= s.created_at)
                  AND (s.wait_filter IS NULL OR NOT EXISTS (
                    SELECT 1 FROM json_tree(s.wait_filter) f
                    WHERE CASE f.type
                      WHEN 'null' THEN 0
                      WHEN 'object' THEN json_type(e.input, f.fullkey) IS NOT 'object'
                      WHEN 'array' THEN json_type(e.input, f.fullkey) IS NOT 'array'
                      ELSE json_extract(e.input, f.fullkey) IS NOT f.value
                    END
                  ))
              )
            )
          )
    )"#;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        queue TEXT NOT NULL,
        job TEXT NOT NULL,
        key TEXT NOT NULL,
        input TEXT NOT NULL,
        status TEXT NOT NULL,
        runs INTEGER NOT NULL DEFAULT 0,
        started INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 0,
        lifo INTEGER NOT NULL DEFAULT 0,
        created_at REAL NOT NULL,
        updated_at REAL NOT NULL,
        data TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS tasks_live_key
        ON tasks (queue, job, key)
        WHERE status IN ('pending','running','stalled');
    CREATE INDEX IF NOT EXISTS tasks_pick ON tasks (queue, status, priority);

    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        queue TEXT NOT NULL,
        job TEXT NOT NULL,
        key TEXT NOT NULL,
        step TEXT NOT NULL,
        status TEXT NOT NULL,
        runs INTEGER NOT NULL DEFAULT 0,
        created_at REAL NOT NULL,
        updated_at REAL NOT NULL,
        sleep_until REAL,
        wait_for TEXT,
        wait_filter TEXT,
        wait_retroactive INTEGER,
        data TEXT,
        UNIQUE (task_id, step)
    );
    CREATE INDEX IF NOT EXISTS steps_wake ON steps (queue, status, sleep_until);

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        key TEXT NOT NULL,
        created_at REAL NOT NULL,
        input TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS events_key ON events (queue, key, created_at);
"#;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_id(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn json_text(value: &Value) -> String {
    to_canonical_string(value)
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRow, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let input: String = row.try_get("input").map_err(db_err)?;
    let data: Option<String> = row.try_get("data").map_err(db_err)?;
    Ok(TaskRow {
        id: parse_id(&id)?,
        parent_id: parent_id.as_deref().map(parse_id).transpose()?,
        queue: row.try_get("queue").map_err(db_err)?,
        job: row.try_get("job").map_err(db_err)?,
        key: row.try_get("key").map_err(db_err)?,
        input: serde_json::from_str(&input).map_err(json_err)?,
        status: TaskStatus::parse(&status)?,
        runs: row.try_get::<i64, _>("runs").map_err(db_err)? as u32,
        started: row.try_get::<i64, _>("started").map_err(db_err)? != 0,
        priority: row.try_get("priority").map_err(db_err)?,
        lifo: row.try_get::<i64, _>("lifo").map_err(db_err)? != 0,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        data: data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRow, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let task_id: String = row.try_get("task_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let wait_filter: Option<String> = row.try_get("wait_filter").map_err(db_err)?;
    let wait_retroactive: Option<i64> = row.try_get("wait_retroactive").map_err(db_err)?;
    let data: Option<String> = row.try_get("data").map_err(db_err)?;
    Ok(StepRow {
        id: parse_id(&id)?,
        task_id: parse_id(&task_id)?,
        queue: row.try_get("queue").map_err(db_err)?,
        job: row.try_get("job").map_err(db_err)?,
        key: row.try_get("key").map_err(db_err)?,
        step: row.try_get("step").map_err(db_err)?,
        status: StepStatus::parse(&status)?,
        runs: row.try_get::<i64, _>("runs").map_err(db_err)? as u32,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        sleep_until: row.try_get("sleep_until").map_err(db_err)?,
        wait_for: row.try_get("wait_for").map_err(db_err)?,
        wait_filter: wait_filter
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
        wait_retroactive: wait_retroactive.map(|v| v != 0),
        data: data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRow, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let input: String = row.try_get("input").map_err(db_err)?;
    let data: String = row.try_get("data").map_err(db_err)?;
    Ok(EventRow {
        id: parse_id(&id)?,
        queue: row.try_get("queue").map_err(db_err)?,
        key: row.try_get("key").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        input: serde_json::from_str(&input).map_err(json_err)?,
        data: serde_json::from_str(&data).map_err(json_err)?,
    })
}

/// SQLite implementation of `Storage`
///
/// # Example
///
/// ```ignore
/// use stepq::SqliteStorage;
///
/// let store = SqliteStorage::connect("data/queue.db").await?;
/// ```
pub struct SqliteStorage {
    pool: SqlitePool,
    owned: bool,
}

impl SqliteStorage {
    /// Wrap an externally managed pool. The pool is not closed by
    /// [`Storage::close`].
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool, owned: false };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Open (creating if missing) a database file and own the connection.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool, owned: true };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// An owned private in-memory database.
    ///
    /// The pool is capped at one connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool, owned: true };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to create schema: {}", e);
                db_err(e)
            })?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self))]
    async fn get_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE queue = ?1 AND job = ?2 AND key = ?3
            ORDER BY (status IN ('completed','failed','cancelled')) ASC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(job)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<TaskRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, task), fields(queue = task.queue, job = task.job, key = task.key))]
    async fn add_task(&self, task: NewTask<'_>) -> Result<Option<TaskRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let id = Uuid::now_v7();
        let created = time::now();

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, parent_id, queue, job, key, input, status, runs, started,
                               priority, lifo, created_at, updated_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, 0, ?7, ?8, ?9, ?9, NULL)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(task.parent_id.map(|p| p.to_string()))
        .bind(task.queue)
        .bind(task.job)
        .bind(task.key)
        .bind(json_text(task.input))
        .bind(task.priority)
        .bind(task.lifo as i64)
        .bind(created)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        }

        let row = TaskRow {
            id,
            parent_id: task.parent_id,
            queue: task.queue.to_string(),
            job: task.job.to_string(),
            key: task.key.to_string(),
            input: task.input.clone(),
            status: TaskStatus::Pending,
            runs: 0,
            started: false,
            priority: task.priority,
            lifo: task.lifo,
            created_at: created,
            updated_at: created,
            data: None,
        };

        if let Some(delay) = task.delay {
            // Planted in the same transaction so the task cannot be
            // reserved before its debounce timer exists.
            sqlx::query(
                r#"
                INSERT INTO steps (id, task_id, queue, job, key, step, status, runs,
                                   created_at, updated_at, sleep_until)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'stalled', 0, ?7, ?7, ?8)
                "#,
            )
            .bind(Uuid::now_v7().to_string())
            .bind(id.to_string())
            .bind(task.queue)
            .bind(task.job)
            .bind(task.key)
            .bind(step_name::DEBOUNCE)
            .bind(created)
            .bind(created + delay)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(%id, "added task");
        Ok(Some(row))
    }

    #[instrument(skip(self))]
    async fn start_next_task(&self, queue: &str) -> Result<Option<PickedTask>, StoreError> {
        let now = time::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let pick_sql = format!(
            r#"
            SELECT t.id FROM tasks t
            WHERE {RUNNABLE_COND}
            ORDER BY t.priority DESC,
                     CASE WHEN t.lifo = 1 THEN -t.created_at ELSE t.created_at END ASC
            LIMIT 1
            "#
        );
        let picked = sqlx::query(&pick_sql)
            .bind(queue)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(picked) = picked else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let id: String = picked.try_get("id").map_err(db_err)?;

        let task_row = sqlx::query(
            r#"
            UPDATE tasks SET status = 'running', updated_at = ?2
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let task = task_from_row(&task_row)?;

        let step_rows = sqlx::query("SELECT * FROM steps WHERE task_id = ?1 ORDER BY created_at")
            .bind(&id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        let steps = step_rows
            .iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let more_sql = format!(
            "SELECT EXISTS (SELECT 1 FROM tasks t WHERE {RUNNABLE_COND}) AS more"
        );
        let more_row = sqlx::query(&more_sql)
            .bind(queue)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let has_more: i64 = more_row.try_get("more").map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(task_id = %task.id, job = %task.job, "reserved task");
        Ok(Some(PickedTask {
            task,
            steps,
            has_more: has_more != 0,
        }))
    }

    #[instrument(skip(self))]
    async fn next_future_task(&self, queue: &str) -> Result<Option<f64>, StoreError> {
        let now = time::now();
        let row = sqlx::query(
            r#"
            SELECT MIN(s.sleep_until) AS wake
            FROM steps s
            JOIN tasks t ON t.id = s.task_id
            WHERE t.queue = ?1
              AND t.status IN ('pending','stalled')
              AND s.status IN ('stalled','waiting')
              AND s.sleep_until IS NOT NULL
              AND s.sleep_until > ?2
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let wake: Option<f64> = row.try_get("wake").map_err(db_err)?;
        Ok(wake.map(|t| (t - now).max(0.0)))
    }

    #[instrument(skip(self))]
    async fn record_task_attempt(&self, task_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks SET runs = runs + 1, updated_at = ?2
            WHERE id = ?1
            RETURNING runs
            "#,
        )
        .bind(task_id.to_string())
        .bind(time::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::TaskNotFound(task_id))?;
        let runs: i64 = row.try_get("runs").map_err(db_err)?;
        Ok(runs as u32)
    }

    #[instrument(skip(self, data))]
    async fn resolve_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        data: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = ?2, data = ?3, updated_at = ?4
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(task_id.to_string())
        .bind(status.as_str())
        .bind(data.map(json_text))
        .bind(time::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET updated_at = ?2, status = CASE
                WHEN EXISTS (
                    SELECT 1 FROM steps s
                    WHERE s.task_id = tasks.id AND s.status = 'waiting'
                ) THEN 'pending'
                WHEN EXISTS (
                    SELECT 1 FROM steps s
                    WHERE s.task_id = tasks.id AND s.status = 'stalled' AND s.sleep_until > ?2
                ) THEN 'stalled'
                ELSE 'pending'
            END
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(task_id.to_string())
        .bind(time::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_task_started(&self, task_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET started = 1, updated_at = ?2 WHERE id = ?1")
            .bind(task_id.to_string())
            .bind(time::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, reason))]
    async fn cancel_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
        reason: &Value,
    ) -> Result<Option<TaskRow>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks SET status = 'cancelled', data = ?4, updated_at = ?5
            WHERE queue = ?1 AND job = ?2 AND key = ?3
              AND status IN ('pending','running','stalled')
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(job)
        .bind(key)
        .bind(json_text(reason))
        .bind(time::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, reason))]
    async fn cancel_unstarted_tasks(
        &self,
        queue: &str,
        jobs: &[String],
        before: f64,
        reason: &Value,
    ) -> Result<Vec<TaskRow>, StoreError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = (0..jobs.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE tasks SET status = 'cancelled', data = ?2, updated_at = ?3
            WHERE queue = ?1 AND started = 0 AND status IN ('pending','stalled')
              AND created_at < ?{before_idx} AND job IN ({placeholders})
            RETURNING *
            "#,
            before_idx = jobs.len() + 4,
        );
        let mut query = sqlx::query(&sql)
            .bind(queue)
            .bind(json_text(reason))
            .bind(time::now());
        for job in jobs {
            query = query.bind(job);
        }
        query = query.bind(before);
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn recover_running_tasks(&self, queue: &str) -> Result<u64, StoreError> {
        let now = time::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            UPDATE steps SET status = 'stalled', sleep_until = NULL, updated_at = ?2
            WHERE queue = ?1 AND status = 'running'
            "#,
        )
        .bind(queue)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'pending', updated_at = ?2
            WHERE queue = ?1 AND status = 'running'
            "#,
        )
        .bind(queue)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, step), fields(task_id = %step.task_id, step = step.step))]
    async fn record_step(&self, step: &StepRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, task_id, queue, job, key, step, status, runs,
                               created_at, updated_at, sleep_until, wait_for,
                               wait_filter, wait_retroactive, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT (task_id, step) DO UPDATE SET
                status = excluded.status,
                runs = excluded.runs,
                updated_at = excluded.updated_at,
                sleep_until = excluded.sleep_until,
                wait_for = excluded.wait_for,
                wait_filter = excluded.wait_filter,
                wait_retroactive = excluded.wait_retroactive,
                data = excluded.data
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.task_id.to_string())
        .bind(&step.queue)
        .bind(&step.job)
        .bind(&step.key)
        .bind(&step.step)
        .bind(step.status.as_str())
        .bind(step.runs as i64)
        .bind(step.created_at)
        .bind(step.updated_at)
        .bind(step.sleep_until)
        .bind(&step.wait_for)
        .bind(step.wait_filter.as_ref().map(json_text))
        .bind(step.wait_retroactive.map(|b| b as i64))
        .bind(step.data.as_ref().map(json_text))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_running_steps(&self, queue: &str, prefix: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM steps
            WHERE queue = ?1 AND status = 'running'
              AND substr(step, 1, length(?2)) = ?2
            "#,
        )
        .bind(queue)
        .bind(prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    #[instrument(skip(self, input, data))]
    async fn record_event(
        &self,
        queue: &str,
        key: &str,
        input: &Value,
        data: &Value,
    ) -> Result<EventRow, StoreError> {
        let row = EventRow {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            key: key.to_string(),
            created_at: time::now(),
            input: input.clone(),
            data: data.clone(),
        };
        sqlx::query(
            r#"
            INSERT INTO events (id, queue, key, created_at, input, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(row.id.to_string())
        .bind(queue)
        .bind(key)
        .bind(row.created_at)
        .bind(json_text(input))
        .bind(json_text(data))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row)
    }

    #[instrument(skip(self, step), fields(step = step.step))]
    async fn resolve_event(&self, step: &StepRow) -> Result<Option<Value>, StoreError> {
        let Some(wait_for) = step.wait_for.as_deref() else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT e.data FROM events e
            WHERE e.queue = ?1 AND e.key = ?2
              AND (?3 = 1 OR e.created_at >= ?4)
              AND (?5 IS NULL OR NOT EXISTS (
                SELECT 1 FROM json_tree(?5) f
                WHERE CASE f.type
                  WHEN 'null' THEN 0
                  WHEN 'object' THEN json_type(e.input, f.fullkey) IS NOT 'object'
                  WHEN 'array' THEN json_type(e.input, f.fullkey) IS NOT 'array'
                  ELSE json_extract(e.input, f.fullkey) IS NOT f.value
                END
              ))
            ORDER BY ABS(e.created_at - ?4) ASC
            LIMIT 1
            "#,
        )
        .bind(&step.queue)
        .bind(wait_for)
        .bind(step.wait_retroactive.unwrap_or(false) as i64)
        .bind(step.created_at)
        .bind(step.wait_filter.as_ref().map(json_text))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let data_text: String = row.try_get("data").map_err(db_err)?;
        let data: Value = serde_json::from_str(&data_text).map_err(json_err)?;

        sqlx::query(
            r#"
            UPDATE steps SET status = 'completed', data = ?2, updated_at = ?3
            WHERE task_id = ?1 AND step = ?4
            "#,
        )
        .bind(step.task_id.to_string())
        .bind(&data_text)
        .bind(time::now())
        .bind(&step.step)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(data))
    }

    #[instrument(skip(self))]
    async fn latest_event(&self, queue: &str, key: &str) -> Result<Option<EventRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM events WHERE queue = ?1 AND key = ?2
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT queue FROM tasks ORDER BY queue")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| r.try_get("queue").map_err(db_err))
            .collect()
    }

    async fn list_jobs(&self, queue: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT job FROM tasks WHERE queue = ?1 ORDER BY job")
            .bind(queue)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| r.try_get("job").map_err(db_err))
            .collect()
    }

    async fn list_tasks(&self, queue: Option<&str>, job: &str) -> Result<Vec<TaskRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE job = ?1 AND (?2 IS NULL OR queue = ?2)
            ORDER BY created_at
            "#,
        )
        .bind(job)
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE task_id = ?1 ORDER BY created_at")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn list_events_by_prefix(
        &self,
        queue: &str,
        prefix: &str,
    ) -> Result<Vec<EventRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE queue = ?1 AND substr(key, 1, length(?2)) = ?2
            ORDER BY created_at
            "#,
        )
        .bind(queue)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn close(&self) {
        if self.owned {
            self.pool.close().await;
        }
    }
}
