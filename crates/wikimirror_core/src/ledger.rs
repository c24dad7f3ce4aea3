use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

const LEDGER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_ledger (
    team TEXT NOT NULL,
    local_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    remote_url TEXT NOT NULL,
    uploaded_at_unix INTEGER NOT NULL,
    PRIMARY KEY (team, local_path)
);
CREATE INDEX IF NOT EXISTS idx_upload_ledger_team ON upload_ledger(team);
"#;

/// Asset uploads remembered across runs, keyed by team and mirror-relative
/// path. An entry only counts while the file's content hash still matches.
pub struct UploadLedger {
    connection: Connection,
    team: String,
}

impl UploadLedger {
    pub fn open(path: &Path, team: &str) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("ledger path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create ledger parent directory {}", parent.display())
        })?;
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection, team)
    }

    pub fn open_in_memory(team: &str) -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory ledger")?;
        Self::with_connection(connection, team)
    }

    fn with_connection(connection: Connection, team: &str) -> Result<Self> {
        connection
            .execute_batch(LEDGER_SCHEMA_SQL)
            .context("failed to initialize upload ledger schema")?;
        Ok(Self {
            connection,
            team: team.to_string(),
        })
    }

    /// Remote URL recorded for `local_path`, if its content is unchanged.
    pub fn lookup(&self, local_path: &str, content_hash: &str) -> Result<Option<String>> {
        let row: Option<(String, String)> = self
            .connection
            .query_row(
                "SELECT content_hash, remote_url FROM upload_ledger
                 WHERE team = ?1 AND local_path = ?2",
                params![self.team, local_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read upload ledger row for {local_path}"))?;
        Ok(row.and_then(|(stored_hash, remote_url)| {
            (stored_hash == content_hash).then_some(remote_url)
        }))
    }

    pub fn record(&self, local_path: &str, content_hash: &str, remote_url: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before UNIX_EPOCH")?
            .as_secs();
        self.connection
            .execute(
                "INSERT INTO upload_ledger (
                    team, local_path, content_hash, remote_url, uploaded_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(team, local_path) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    remote_url = excluded.remote_url,
                    uploaded_at_unix = excluded.uploaded_at_unix",
                params![
                    self.team,
                    local_path,
                    content_hash,
                    remote_url,
                    i64::try_from(now).context("timestamp does not fit into i64")?
                ],
            )
            .with_context(|| format!("failed to upsert upload ledger row for {local_path}"))?;
        Ok(())
    }

    pub fn entry_count(&self) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM upload_ledger WHERE team = ?1",
                [&self.team],
                |row| row.get(0),
            )
            .context("failed to count upload ledger rows")?;
        usize::try_from(count).context("ledger row count is negative")
    }
}

pub fn compute_file_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}
