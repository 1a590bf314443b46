//! SQLite-backed event log. Simple, synchronous under a mutex; event
//! volume per resource is low and queries touch one key at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};

use rudder_core::{ResourceEvent, ResourceId};

use crate::EventLog;

pub struct SqliteEventLog {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteEventLog {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("RUDDER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resource_event (
                resource_id TEXT NOT NULL,
                application TEXT NOT NULL,
                kind        TEXT NOT NULL,
                ts          INTEGER NOT NULL,
                payload     TEXT NOT NULL
            )",
            [],
        )
        .context("creating resource_event table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_resource_event_id_ts ON resource_event(resource_id, ts DESC)",
            [],
        )
        .ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn query_events(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT payload FROM resource_event WHERE resource_id = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((id.as_str(), limit as i64))?;
        let mut out: Vec<ResourceEvent> = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload).context("decoding stored event")?);
        }
        Ok(out)
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, event: ResourceEvent) -> Result<()> {
        let started = std::time::Instant::now();
        let payload = serde_json::to_string(&event)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO resource_event(resource_id, application, kind, ts, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                event.id.as_str(),
                &event.application,
                event.data.name(),
                event.timestamp.timestamp_millis(),
                &payload,
            ),
        )?;
        histogram!("persist_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_append_total", 1u64);
        Ok(())
    }

    async fn last_event(&self, id: &ResourceId) -> Result<Option<ResourceEvent>> {
        let started = std::time::Instant::now();
        let mut events = self.query_events(id, 1)?;
        histogram!("persist_last_event_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(events.pop())
    }

    async fn history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>> {
        let started = std::time::Instant::now();
        let events = self.query_events(id, limit)?;
        histogram!("persist_history_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(events)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".rudder");
        let _ = std::fs::create_dir_all(&p);
        p.push("rudder.db");
        return p.to_string_lossy().to_string();
    }
    "rudder.db".to_string()
}
