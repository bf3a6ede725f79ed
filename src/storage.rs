use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::token::{AccessToken, CredentialStore};

/// The credentials table holds a single row in this slot.
const CREDENTIAL_SLOT: i64 = 1;

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;
        debug!("storage: opened {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn get_credential(&self) -> Result<Option<AccessToken>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT access_token, token_type, scope, refresh_token, expires_in, device_id, issued_at
FROM credentials
WHERE slot = ?1
"#,
            params![CREDENTIAL_SLOT],
            credential_from_row,
        )
        .optional()
        .context("storage: query credential")
    }

    pub fn upsert_credential(&self, token: &AccessToken) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO credentials (slot, access_token, token_type, scope, refresh_token, expires_in, device_id, issued_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(slot) DO UPDATE SET
  access_token = excluded.access_token,
  token_type = excluded.token_type,
  scope = excluded.scope,
  refresh_token = excluded.refresh_token,
  expires_in = excluded.expires_in,
  device_id = excluded.device_id,
  issued_at = excluded.issued_at
"#,
            params![
                CREDENTIAL_SLOT,
                token.access_token,
                token.token_type,
                token.scope,
                token.refresh_token,
                token.expires_in,
                token.device_id,
                token.issued_at.timestamp(),
            ],
        )
        .context("storage: upsert credential")?;
        Ok(())
    }

    pub fn delete_credential(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM credentials WHERE slot = ?1",
            params![CREDENTIAL_SLOT],
        )
        .context("storage: delete credential")?;
        Ok(())
    }
}

impl CredentialStore for Store {
    fn load(&self) -> Result<Option<AccessToken>> {
        self.get_credential()
    }

    fn save(&self, token: &AccessToken) -> Result<()> {
        self.upsert_credential(token)
    }

    fn clear(&self) -> Result<()> {
        self.delete_credential()
    }
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    let issued: i64 = row.get(6)?;
    Ok(AccessToken {
        access_token: row.get(0)?,
        token_type: row.get(1)?,
        scope: row.get(2)?,
        refresh_token: row.get(3)?,
        expires_in: row.get(4)?,
        device_id: row.get(5)?,
        issued_at: Utc
            .timestamp_opt(issued, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS credentials (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  access_token TEXT NOT NULL,
  token_type TEXT NOT NULL,
  scope TEXT NOT NULL,
  refresh_token TEXT,
  expires_in INTEGER NOT NULL,
  device_id TEXT,
  issued_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("redlurk").join("state.db"))
}
