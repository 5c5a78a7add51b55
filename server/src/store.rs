//! SQLite-backed task/client store.
//!
//! Connection setup (WAL mode, busy timeout) follows the teacher's
//! `server/src/database.rs`; the query surface (`select_new`, `next`,
//! `select_failed`, `revert_interrupted`, `revert_orphaned`, the rate/ETC
//! aggregates) is grounded directly on `original_source/data/model.py`.
//! `--no-db` runs with `Store::in_memory`, which never touches sqlite.

use std::path::Path;

use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{TagMap, TagValue};
use shared::{Client, Task};
use tracing::{debug, info};

const REVERT_BATCH: usize = 100;

pub struct Store {
    conn: Option<Connection>,
}

impl Store {
    /// Open (creating if needed) the sqlite database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> shared::Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        let store = Store { conn: Some(conn) };
        info!(path = %path.as_ref().display(), "opened task store");
        Ok(store)
    }

    /// `--no-db` mode: no connection, every call is a no-op / empty result.
    pub fn in_memory() -> Self {
        Store { conn: None }
    }

    pub fn initdb(&self) -> shared::Result<()> {
        let Some(conn) = &self.conn else { return Ok(()) };
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task (
                id              TEXT PRIMARY KEY,
                args            TEXT NOT NULL,
                submit_id       TEXT NOT NULL,
                submit_host     TEXT NOT NULL,
                submit_time     TEXT NOT NULL,
                server_id       TEXT,
                server_host     TEXT,
                schedule_time   TEXT,
                client_id       TEXT,
                client_host     TEXT,
                command         TEXT,
                start_time      TEXT,
                completion_time TEXT,
                exit_status     INTEGER,
                outpath         TEXT,
                errpath         TEXT,
                attempt         INTEGER NOT NULL,
                retried         INTEGER NOT NULL,
                previous_id     TEXT UNIQUE,
                next_id         TEXT UNIQUE,
                waited          INTEGER,
                duration        INTEGER,
                tag             TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS task_scheduled_index ON task (schedule_time);
            CREATE INDEX IF NOT EXISTS task_retries_index ON task (exit_status, retried);

            CREATE TABLE IF NOT EXISTS client (
                id               TEXT PRIMARY KEY,
                host             TEXT NOT NULL,
                server_id        TEXT NOT NULL,
                server_host      TEXT NOT NULL,
                connected_at     TEXT,
                disconnected_at  TEXT,
                evicted          INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS client_disconnected_at ON client (disconnected_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> shared::Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| shared::Error::Store("store running in --no-db mode".into()).into())
    }

    /// Insert a freshly-submitted task (schedule_time still unset).
    pub fn insert_task(&self, task: &Task) -> shared::Result<()> {
        let Some(conn) = &self.conn else { return Ok(()) };
        conn.execute(
            r#"INSERT INTO task (
                id, args, submit_id, submit_host, submit_time,
                server_id, server_host, schedule_time, client_id, client_host,
                command, start_time, completion_time, exit_status, outpath, errpath,
                attempt, retried, previous_id, next_id, waited, duration, tag
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)"#,
            params![
                task.id,
                task.args,
                task.submit_id,
                task.submit_host,
                render_time(task.submit_time),
                task.server_id,
                task.server_host,
                task.schedule_time.map(render_time),
                task.client_id,
                task.client_host,
                task.command,
                task.start_time.map(render_time),
                task.completion_time.map(render_time),
                task.exit_status,
                task.outpath,
                task.errpath,
                task.attempt,
                task.retried,
                task.previous_id,
                task.next_id,
                task.waited,
                task.duration,
                serde_json::to_string(&task.tag)?,
            ],
        )?;
        Ok(())
    }

    /// Select the next `limit` unscheduled tasks in submit order and stamp
    /// them as scheduled by this server instance; mirrors `Task.next`.
    pub fn next(
        &self,
        limit: usize,
        attempts: i32,
        eager: bool,
        server_id: &str,
        server_host: &str,
    ) -> shared::Result<Vec<Task>> {
        if self.conn.is_none() {
            return Ok(Vec::new());
        }
        let mut tasks = if eager {
            let mut failed = self.schedule_next_failed(attempts, limit)?;
            if failed.len() < limit {
                let mut fresh = self.select_new(limit - failed.len())?;
                failed.append(&mut fresh);
            }
            failed
        } else {
            let mut fresh = self.select_new(limit)?;
            if fresh.len() < limit && attempts > 1 {
                let mut failed = self.schedule_next_failed(attempts, limit - fresh.len())?;
                fresh.append(&mut failed);
            }
            fresh
        };

        let now = Local::now();
        for task in &mut tasks {
            task.server_id = Some(server_id.to_string());
            task.server_host = Some(server_host.to_string());
            task.schedule_time = Some(now);
            self.stamp_scheduled(&task.id, server_id, server_host, now)?;
        }
        Ok(tasks)
    }

    fn stamp_scheduled(
        &self,
        id: &str,
        server_id: &str,
        server_host: &str,
        at: chrono::DateTime<Local>,
    ) -> shared::Result<()> {
        self.conn()?.execute(
            "UPDATE task SET server_id=?1, server_host=?2, schedule_time=?3 WHERE id=?4",
            params![server_id, server_host, render_time(at), id],
        )?;
        Ok(())
    }

    fn select_new(&self, limit: usize) -> shared::Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM task WHERE schedule_time IS NULL ORDER BY submit_time LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn select_failed(&self, attempts: i32, limit: usize) -> shared::Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM task
               WHERE exit_status IS NOT NULL AND exit_status != 0
                 AND attempt < ?1 AND retried = 0
               ORDER BY completion_time LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![attempts, limit as i64], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Build retry-chain successors for currently-failed, retry-eligible
    /// tasks, persist them as new NEW rows, and mark each predecessor
    /// `retried = true` with `next_id` pointing at its successor. Shared by
    /// both eager and non-eager scheduling paths (Open Question (b)).
    fn schedule_next_failed(&self, attempts: i32, limit: usize) -> shared::Result<Vec<Task>> {
        let failed = self.select_failed(attempts, limit)?;
        if failed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = failed.len(), "scheduling previously failed tasks for retry");
        let mut successors = Vec::with_capacity(failed.len());
        for predecessor in &failed {
            let successor = predecessor.retry_of();
            self.insert_task(&successor)?;
            self.conn()?.execute(
                "UPDATE task SET retried = 1, next_id = ?1 WHERE id = ?2",
                params![successor.id, predecessor.id],
            )?;
            successors.push(successor);
        }
        Ok(successors)
    }

    pub fn count_remaining(&self) -> shared::Result<i64> {
        let Some(conn) = &self.conn else { return Ok(0) };
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM task WHERE completion_time IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Total number of tasks ever inserted, scheduled or not. Distinct from
    /// `count_remaining`, which only counts incomplete tasks; the scheduler's
    /// FINAL-transition guard needs both (a store that never received any
    /// tasks must not be mistaken for one that has finished them all).
    pub fn count(&self) -> shared::Result<i64> {
        let Some(conn) = &self.conn else { return Ok(0) };
        Ok(conn.query_row("SELECT COUNT(*) FROM task", [], |row| row.get(0))?)
    }

    /// Tasks that were scheduled to a client but never completed, i.e. the
    /// set `revert_interrupted`/`revert_orphaned` drain back to NEW.
    pub fn count_interrupted(&self) -> shared::Result<i64> {
        let Some(conn) = &self.conn else { return Ok(0) };
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM task WHERE schedule_time IS NOT NULL AND completion_time IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    fn select_interrupted(&self, limit: usize) -> shared::Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM task
               WHERE schedule_time IS NOT NULL AND completion_time IS NULL
               ORDER BY schedule_time LIMIT ?1"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn select_orphaned(&self, client_id: &str, limit: usize) -> shared::Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM task
               WHERE schedule_time IS NOT NULL AND completion_time IS NULL AND client_id = ?1
               ORDER BY schedule_time LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![client_id, limit as i64], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn revert_all(&self, ids: &[String]) -> shared::Result<()> {
        let conn = self.conn()?;
        for id in ids {
            conn.execute(
                r#"UPDATE task SET
                    schedule_time = NULL, server_id = NULL, server_host = NULL,
                    client_id = NULL, client_host = NULL, command = NULL,
                    start_time = NULL, completion_time = NULL, exit_status = NULL,
                    outpath = NULL, errpath = NULL, waited = NULL, duration = NULL
                   WHERE id = ?1"#,
                params![id],
            )?;
        }
        Ok(())
    }

    /// Drain scheduled-but-incomplete tasks back to NEW, 100 rows at a time.
    /// Used at server startup after an unclean shutdown.
    pub fn revert_interrupted(&self) -> shared::Result<usize> {
        if self.conn.is_none() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let batch = self.select_interrupted(REVERT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
            total += ids.len();
            self.revert_all(&ids)?;
        }
        Ok(total)
    }

    /// Drain a single evicted client's in-flight tasks back to NEW.
    pub fn revert_orphaned(&self, client_id: &str) -> shared::Result<usize> {
        if self.conn.is_none() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let batch = self.select_orphaned(client_id, REVERT_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
            total += ids.len();
            self.revert_all(&ids)?;
        }
        Ok(total)
    }

    /// Update a batch of tasks with their final run state (from a completed
    /// bundle the receiver unpacked).
    pub fn update_completed(&self, tasks: &[Task]) -> shared::Result<()> {
        let Some(conn) = &self.conn else { return Ok(()) };
        for task in tasks {
            conn.execute(
                r#"UPDATE task SET
                    client_id = ?1, client_host = ?2, command = ?3,
                    start_time = ?4, completion_time = ?5, exit_status = ?6,
                    outpath = ?7, errpath = ?8, waited = ?9, duration = ?10
                   WHERE id = ?11"#,
                params![
                    task.client_id,
                    task.client_host,
                    task.command,
                    task.start_time.map(render_time),
                    task.completion_time.map(render_time),
                    task.exit_status,
                    task.outpath,
                    task.errpath,
                    task.waited,
                    task.duration,
                    task.id,
                ],
            )?;
        }
        Ok(())
    }

    /// Stamp ownership (`client_id`/`client_host`) onto a bundle of tasks
    /// once a client has confirmed receipt (`ClientInfo::transpose`).
    pub fn update_assignment(&self, rows: &[shared::client_info::TaskAssignment]) -> shared::Result<()> {
        let Some(conn) = &self.conn else { return Ok(()) };
        for row in rows {
            conn.execute(
                "UPDATE task SET client_id = ?1, client_host = ?2 WHERE id = ?3",
                params![row.client_id, row.client_host, row.id],
            )?;
        }
        Ok(())
    }

    pub fn upsert_client(&self, client: &Client) -> shared::Result<()> {
        let Some(conn) = &self.conn else { return Ok(()) };
        conn.execute(
            r#"INSERT INTO client (id, host, server_id, server_host, connected_at, disconnected_at, evicted)
               VALUES (?1,?2,?3,?4,?5,?6,?7)
               ON CONFLICT(id) DO UPDATE SET
                 host = excluded.host,
                 connected_at = excluded.connected_at,
                 disconnected_at = excluded.disconnected_at,
                 evicted = excluded.evicted"#,
            params![
                client.id,
                client.host,
                client.server_id,
                client.server_host,
                render_time(client.connected_at),
                client.disconnected_at.map(render_time),
                client.evicted,
            ],
        )?;
        Ok(())
    }

    /// Mark a client disconnected/evicted and revert its orphaned tasks.
    pub fn evict_client(&self, client_id: &str) -> shared::Result<usize> {
        if let Some(conn) = &self.conn {
            conn.execute(
                "UPDATE client SET disconnected_at = ?1, evicted = 1 WHERE id = ?2",
                params![render_time(Local::now()), client_id],
            )?;
        }
        self.revert_orphaned(client_id)
    }

    /// Number of clients currently connected (heartbeating, not yet
    /// disconnected/evicted), the AutoScaler's "registered size" signal.
    pub fn count_connected_clients(&self) -> shared::Result<i64> {
        let Some(conn) = &self.conn else { return Ok(0) };
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM client WHERE disconnected_at IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Most recent server instance id to have scheduled anything, used to
    /// scope rate/ETC aggregates to the currently-running server.
    fn latest_server(&self) -> shared::Result<Option<String>> {
        let Some(conn) = &self.conn else { return Ok(None) };
        Ok(conn
            .query_row(
                r#"SELECT server_id FROM task
                   WHERE schedule_time IS NOT NULL
                   GROUP BY server_id
                   ORDER BY MAX(schedule_time) DESC
                   LIMIT 1"#,
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Average completed-task duration across currently-connected clients.
    pub fn avg_duration(&self) -> shared::Result<Option<f64>> {
        let Some(server_id) = self.latest_server()? else { return Ok(None) };
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                r#"SELECT AVG(task.duration) FROM task
                   JOIN client ON task.client_id = client.id
                   WHERE task.server_id = ?1 AND task.duration IS NOT NULL
                     AND client.disconnected_at IS NULL"#,
                params![server_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    /// Estimated time to completion for all unscheduled tasks, in seconds,
    /// given the current effective per-client completion rate.
    pub fn time_to_completion(&self) -> shared::Result<Option<f64>> {
        let Some(rate) = self.effective_rate()? else { return Ok(None) };
        if rate <= 0.0 {
            return Ok(None);
        }
        Ok(Some(self.count_remaining()? as f64 / rate))
    }

    fn effective_rate(&self) -> shared::Result<Option<f64>> {
        let Some(server_id) = self.latest_server()? else { return Ok(None) };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT (JULIANDAY(MAX(task.completion_time)) - JULIANDAY(MIN(task.start_time))) * 86400.0,
                      COUNT(task.id)
               FROM task
               JOIN client ON task.client_id = client.id
               WHERE task.server_id = ?1 AND task.completion_time IS NOT NULL
                 AND client.disconnected_at IS NULL
               GROUP BY task.client_id"#,
        )?;
        let mut total = 0.0;
        let mut any = false;
        let rows = stmt.query_map(params![server_id], |row| {
            let elapsed: f64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((elapsed, count))
        })?;
        for row in rows {
            let (elapsed, count) = row?;
            if elapsed > 0.0 && count > 0 {
                total += count as f64 / elapsed;
                any = true;
            }
        }
        Ok(if any { Some(total) } else { None })
    }

    /// `pressure = time_to_completion / (factor * avg_duration)`, the
    /// autoscaler's dynamic-policy signal.
    pub fn task_pressure(&self, factor: f64) -> shared::Result<Option<f64>> {
        let Some(avg) = self.avg_duration()? else { return Ok(None) };
        if avg <= 0.0 {
            return Ok(None);
        }
        let Some(toc) = self.time_to_completion()? else { return Ok(None) };
        Ok(Some(toc / (factor * avg)))
    }
}

fn render_time(value: chrono::DateTime<Local>) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
}

fn parse_time(raw: &str) -> rusqlite::Result<chrono::DateTime<Local>> {
    chrono::DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.6f%:z")
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, "time".into(), rusqlite::types::Type::Text))
}

fn parse_time_opt(raw: Option<String>) -> rusqlite::Result<Option<chrono::DateTime<Local>>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_time(&raw).map(Some),
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let tag_json: String = row.get("tag")?;
    let tag: TagMap = serde_json::from_str(&tag_json).unwrap_or_else(|_| {
        let mut m = TagMap::new();
        m.insert("_unparsed".to_string(), TagValue::String(tag_json.clone()));
        m
    });
    Ok(Task {
        id: row.get("id")?,
        args: row.get("args")?,
        submit_id: row.get("submit_id")?,
        submit_host: row.get("submit_host")?,
        submit_time: parse_time(&row.get::<_, String>("submit_time")?)?,
        server_id: row.get("server_id")?,
        server_host: row.get("server_host")?,
        schedule_time: parse_time_opt(row.get("schedule_time")?)?,
        client_id: row.get("client_id")?,
        client_host: row.get("client_host")?,
        command: row.get("command")?,
        start_time: parse_time_opt(row.get("start_time")?)?,
        completion_time: parse_time_opt(row.get("completion_time")?)?,
        exit_status: row.get("exit_status")?,
        outpath: row.get("outpath")?,
        errpath: row.get("errpath")?,
        attempt: row.get("attempt")?,
        retried: row.get("retried")?,
        previous_id: row.get("previous_id")?,
        next_id: row.get("next_id")?,
        waited: row.get("waited")?,
        duration: row.get("duration")?,
        tag,
    })
}
