use crate::error::EscrowError;
use crate::journal::{JournalEntry, JournalEntryKind, TransitionJournal};
use crate::ledger::MilestoneLedger;
use crate::types::{Escrow, Milestone, MilestoneStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;

/// Escrow persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep escrows, milestones and the journal in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL and hydrate state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
enum StorageBackend {
    Memory,
    Postgres(PostgresEscrowStore),
}

/// Authoritative escrow state, held in memory and optionally mirrored to PostgreSQL.
///
/// Invariant handling:
/// - every write is conditioned on the revision or version the caller read;
/// - writes are persisted before they become visible in memory;
/// - on startup, PostgreSQL rows are hydrated and the journal chain is verified.
#[derive(Debug, Clone)]
pub struct EscrowStore {
    ledgers: HashMap<String, MilestoneLedger>,
    milestone_index: HashMap<String, String>,
    journal: TransitionJournal,
    backend: StorageBackend,
}

impl EscrowStore {
    /// Build a memory-backed store from already persisted state.
    pub fn from_parts(
        ledgers: Vec<MilestoneLedger>,
        journal_entries: Vec<JournalEntry>,
    ) -> Result<Self, EscrowError> {
        let mut store = Self {
            ledgers: HashMap::new(),
            milestone_index: HashMap::new(),
            journal: TransitionJournal::from_entries(journal_entries)?,
            backend: StorageBackend::Memory,
        };
        for ledger in ledgers {
            store.install(ledger);
        }
        Ok(store)
    }

    pub async fn bootstrap(config: StorageConfig) -> Result<Self, EscrowError> {
        match config {
            StorageConfig::Memory => Self::from_parts(Vec::new(), Vec::new()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pg = PostgresEscrowStore::connect(&database_url, max_connections).await?;
                pg.ensure_schema().await?;
                let ledgers = pg.load_ledgers().await?;
                let entries = pg.load_journal().await?;
                let mut store = Self::from_parts(ledgers, entries)?;
                store.backend = StorageBackend::Postgres(pg);
                Ok(store)
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            StorageBackend::Memory => "memory",
            StorageBackend::Postgres(_) => "postgres",
        }
    }

    pub fn ledger(&self, escrow_id: &str) -> Result<&MilestoneLedger, EscrowError> {
        self.ledgers
            .get(escrow_id)
            .ok_or_else(|| EscrowError::escrow_not_found(escrow_id))
    }

    /// Snapshot of a milestone together with its escrow.
    pub fn milestone(&self, milestone_id: &str) -> Result<(Escrow, Milestone), EscrowError> {
        let ledger = self
            .milestone_index
            .get(milestone_id)
            .and_then(|escrow_id| self.ledgers.get(escrow_id))
            .ok_or_else(|| EscrowError::milestone_not_found(milestone_id))?;
        let milestone = ledger
            .milestone(milestone_id)
            .ok_or_else(|| EscrowError::milestone_not_found(milestone_id))?;
        Ok((ledger.escrow().clone(), milestone.clone()))
    }

    pub fn ledgers(&self) -> impl Iterator<Item = &MilestoneLedger> {
        self.ledgers.values()
    }

    pub fn journal(&self) -> &TransitionJournal {
        &self.journal
    }

    pub async fn insert_escrow(&mut self, escrow: Escrow) -> Result<MilestoneLedger, EscrowError> {
        if self.ledgers.contains_key(&escrow.escrow_id) {
            return Err(EscrowError::escrow_conflict(&escrow.escrow_id));
        }
        if let StorageBackend::Postgres(pg) = &self.backend {
            pg.insert_escrow(&escrow).await?;
        }
        let ledger = MilestoneLedger::new(escrow);
        self.install(ledger.clone());
        Ok(ledger)
    }

    /// Replace an escrow's ledger if nothing was written since `expected_revision`.
    ///
    /// Used for drafting edits and funding, which touch several milestones at once.
    pub async fn save_ledger(
        &mut self,
        mut ledger: MilestoneLedger,
        expected_revision: u64,
    ) -> Result<MilestoneLedger, EscrowError> {
        let escrow_id = ledger.escrow().escrow_id.clone();
        let current = self.ledger(&escrow_id)?;
        if current.escrow().revision != expected_revision {
            return Err(EscrowError::escrow_conflict(&escrow_id));
        }
        let removed: Vec<String> = current
            .milestones()
            .iter()
            .filter(|milestone| ledger.milestone(&milestone.milestone_id).is_none())
            .map(|milestone| milestone.milestone_id.clone())
            .collect();

        ledger.escrow_mut().revision = expected_revision + 1;

        if let StorageBackend::Postgres(pg) = &self.backend {
            pg.save_ledger(&ledger, expected_revision).await?;
        }

        for milestone_id in removed {
            self.milestone_index.remove(&milestone_id);
        }
        self.install(ledger.clone());
        Ok(ledger)
    }

    /// Conditionally write one transitioned milestone.
    ///
    /// Fails with `Conflict` when the stored version moved past `expected_version`;
    /// the caller re-reads and re-validates.
    pub async fn commit_milestone(
        &mut self,
        updated: Milestone,
        expected_version: u64,
    ) -> Result<Milestone, EscrowError> {
        let escrow_id = self
            .milestone_index
            .get(&updated.milestone_id)
            .cloned()
            .ok_or_else(|| EscrowError::milestone_not_found(&updated.milestone_id))?;
        let mut ledger = self.ledger(&escrow_id)?.clone();
        let committed = ledger.commit(updated, expected_version)?;
        {
            let escrow = ledger.escrow_mut();
            escrow.revision += 1;
            escrow.updated_at = committed.updated_at;
        }

        if let StorageBackend::Postgres(pg) = &self.backend {
            pg.update_milestone(&committed, expected_version).await?;
        }

        self.ledgers.insert(escrow_id, ledger);
        Ok(committed)
    }

    /// Append an entry to the transition journal, persisting it first.
    pub async fn append_journal<T: Serialize>(
        &mut self,
        escrow_id: &str,
        milestone_id: Option<&str>,
        kind: JournalEntryKind,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<JournalEntry, EscrowError> {
        let entry = self
            .journal
            .build_entry(escrow_id, milestone_id, kind, payload, timestamp)?;

        if let StorageBackend::Postgres(pg) = &self.backend {
            pg.insert_journal_entry(&entry).await?;
        }

        self.journal.commit_entry(entry.clone())?;
        Ok(entry)
    }

    fn install(&mut self, ledger: MilestoneLedger) {
        let escrow_id = ledger.escrow().escrow_id.clone();
        for milestone in ledger.milestones() {
            self.milestone_index
                .insert(milestone.milestone_id.clone(), escrow_id.clone());
        }
        self.ledgers.insert(escrow_id, ledger);
    }
}

#[derive(Debug, Clone)]
struct PostgresEscrowStore {
    pool: PgPool,
}

impl PostgresEscrowStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EscrowError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| storage_error("connect", e))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), EscrowError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS escrow_accounts (
                escrow_id TEXT PRIMARY KEY,
                payer_id TEXT NOT NULL,
                payee_id TEXT NOT NULL,
                payee_account TEXT NOT NULL,
                contract_type TEXT NULL,
                currency TEXT NOT NULL,
                total_minor BIGINT NOT NULL,
                funded_minor BIGINT NOT NULL,
                has_milestones BOOLEAN NOT NULL,
                revision BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS escrow_milestones (
                milestone_id TEXT PRIMARY KEY,
                escrow_id TEXT NOT NULL REFERENCES escrow_accounts (escrow_id),
                sequence_number INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                due_date TIMESTAMPTZ NULL,
                status TEXT NOT NULL,
                rating SMALLINT NULL,
                feedback TEXT NULL,
                auto_approved BOOLEAN NOT NULL,
                funded_at TIMESTAMPTZ NULL,
                started_at TIMESTAMPTZ NULL,
                submitted_at TIMESTAMPTZ NULL,
                approved_at TIMESTAMPTZ NULL,
                released_at TIMESTAMPTZ NULL,
                release_reference TEXT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_escrow_milestones_escrow_id ON escrow_milestones (escrow_id)",
            r#"
            CREATE TABLE IF NOT EXISTS escrow_journal (
                journal_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                escrow_id TEXT NOT NULL,
                milestone_id TEXT NULL,
                kind TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_escrow_journal_milestone_id ON escrow_journal (milestone_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("schema create", e))?;
        }
        Ok(())
    }

    async fn load_ledgers(&self) -> Result<Vec<MilestoneLedger>, EscrowError> {
        let escrow_rows = sqlx::query(
            r#"
            SELECT escrow_id, payer_id, payee_id, payee_account, contract_type, currency,
                   total_minor, funded_minor, has_milestones, revision, created_at, updated_at
            FROM escrow_accounts
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("escrow load", e))?;

        let milestone_rows = sqlx::query(
            r#"
            SELECT milestone_id, escrow_id, sequence_number, title, description, amount_minor,
                   due_date, status, rating, feedback, auto_approved, funded_at, started_at,
                   submitted_at, approved_at, released_at, release_reference, version,
                   created_at, updated_at
            FROM escrow_milestones
            ORDER BY escrow_id, sequence_number ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("milestone load", e))?;

        let mut grouped: HashMap<String, Vec<Milestone>> = HashMap::new();
        for row in &milestone_rows {
            let milestone = decode_milestone(row)?;
            grouped
                .entry(milestone.escrow_id.clone())
                .or_default()
                .push(milestone);
        }

        let mut ledgers = Vec::with_capacity(escrow_rows.len());
        for row in &escrow_rows {
            let escrow = decode_escrow(row)?;
            let milestones = grouped.remove(&escrow.escrow_id).unwrap_or_default();
            ledgers.push(MilestoneLedger::from_parts(escrow, milestones)?);
        }

        if let Some(orphan) = grouped.keys().next() {
            return Err(EscrowError::Storage(format!(
                "milestones reference unknown escrow '{orphan}'"
            )));
        }
        Ok(ledgers)
    }

    async fn load_journal(&self) -> Result<Vec<JournalEntry>, EscrowError> {
        let rows = sqlx::query(
            r#"
            SELECT journal_index, entry_id, escrow_id, milestone_id, kind, entry_timestamp,
                   payload, previous_hash, entry_hash
            FROM escrow_journal
            ORDER BY journal_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("journal load", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: String = column(row, "kind")?;
            let index: i64 = column(row, "journal_index")?;
            entries.push(JournalEntry {
                entry_id: column(row, "entry_id")?,
                index: from_db(index, "journal_index")?,
                escrow_id: column(row, "escrow_id")?,
                milestone_id: column(row, "milestone_id")?,
                kind: JournalEntryKind::parse(&kind).ok_or_else(|| {
                    EscrowError::Storage(format!("unknown journal kind '{kind}' in postgres"))
                })?,
                timestamp: column(row, "entry_timestamp")?,
                payload: column(row, "payload")?,
                previous_hash: column(row, "previous_hash")?,
                entry_hash: column(row, "entry_hash")?,
            });
        }
        Ok(entries)
    }

    async fn insert_escrow(&self, escrow: &Escrow) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            INSERT INTO escrow_accounts (
                escrow_id, payer_id, payee_id, payee_account, contract_type, currency,
                total_minor, funded_minor, has_milestones, revision, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&escrow.escrow_id)
        .bind(&escrow.payer_id)
        .bind(&escrow.payee_id)
        .bind(&escrow.payee_account)
        .bind(&escrow.contract_type)
        .bind(&escrow.currency)
        .bind(to_db(escrow.total_minor, "total_minor")?)
        .bind(to_db(escrow.funded_minor, "funded_minor")?)
        .bind(escrow.has_milestones)
        .bind(to_db(escrow.revision, "revision")?)
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("escrow insert", e))?;
        Ok(())
    }

    /// Escrow row, milestone upserts and removals commit together or not at all.
    async fn save_ledger(
        &self,
        ledger: &MilestoneLedger,
        expected_revision: u64,
    ) -> Result<(), EscrowError> {
        let escrow = ledger.escrow();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("transaction begin", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE escrow_accounts
            SET funded_minor = $2, has_milestones = $3, revision = $4, updated_at = $5
            WHERE escrow_id = $1 AND revision = $6
            "#,
        )
        .bind(&escrow.escrow_id)
        .bind(to_db(escrow.funded_minor, "funded_minor")?)
        .bind(escrow.has_milestones)
        .bind(to_db(escrow.revision, "revision")?)
        .bind(escrow.updated_at)
        .bind(to_db(expected_revision, "revision")?)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("escrow update", e))?;

        if updated.rows_affected() == 0 {
            return Err(EscrowError::escrow_conflict(&escrow.escrow_id));
        }

        let keep: Vec<String> = ledger
            .milestones()
            .iter()
            .map(|milestone| milestone.milestone_id.clone())
            .collect();
        sqlx::query(
            r#"
            DELETE FROM escrow_milestones
            WHERE escrow_id = $1 AND status = 'pending' AND NOT (milestone_id = ANY($2))
            "#,
        )
        .bind(&escrow.escrow_id)
        .bind(&keep)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("milestone delete", e))?;

        for milestone in ledger.milestones() {
            upsert_milestone(&mut tx, milestone).await?;
        }

        tx.commit()
            .await
            .map_err(|e| storage_error("transaction commit", e))
    }

    async fn update_milestone(
        &self,
        milestone: &Milestone,
        expected_version: u64,
    ) -> Result<(), EscrowError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("transaction begin", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE escrow_milestones
            SET status = $3, rating = $4, feedback = $5, auto_approved = $6,
                funded_at = $7, started_at = $8, submitted_at = $9, approved_at = $10,
                released_at = $11, release_reference = $12, version = $13, updated_at = $14
            WHERE milestone_id = $1 AND version = $2
            "#,
        )
        .bind(&milestone.milestone_id)
        .bind(to_db(expected_version, "version")?)
        .bind(milestone.status.name())
        .bind(milestone.rating.map(i16::from))
        .bind(&milestone.feedback)
        .bind(milestone.auto_approved)
        .bind(milestone.funded_at)
        .bind(milestone.started_at)
        .bind(milestone.submitted_at)
        .bind(milestone.approved_at)
        .bind(milestone.released_at)
        .bind(&milestone.release_reference)
        .bind(to_db(milestone.version, "version")?)
        .bind(milestone.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("milestone update", e))?;

        if updated.rows_affected() == 0 {
            return Err(EscrowError::milestone_conflict(&milestone.milestone_id));
        }

        sqlx::query(
            "UPDATE escrow_accounts SET revision = revision + 1, updated_at = $2 WHERE escrow_id = $1",
        )
        .bind(&milestone.escrow_id)
        .bind(milestone.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("escrow revision bump", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_error("transaction commit", e))
    }

    async fn insert_journal_entry(&self, entry: &JournalEntry) -> Result<(), EscrowError> {
        sqlx::query(
            r#"
            INSERT INTO escrow_journal (
                journal_index, entry_id, escrow_id, milestone_id, kind, entry_timestamp,
                payload, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(to_db(entry.index, "journal_index")?)
        .bind(&entry.entry_id)
        .bind(&entry.escrow_id)
        .bind(&entry.milestone_id)
        .bind(entry.kind.name())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("journal insert", e))?;
        Ok(())
    }
}

async fn upsert_milestone(
    tx: &mut Transaction<'_, Postgres>,
    milestone: &Milestone,
) -> Result<(), EscrowError> {
    sqlx::query(
        r#"
        INSERT INTO escrow_milestones (
            milestone_id, escrow_id, sequence_number, title, description, amount_minor,
            due_date, status, rating, feedback, auto_approved, funded_at, started_at,
            submitted_at, approved_at, released_at, release_reference, version,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        ON CONFLICT (milestone_id) DO UPDATE SET
            sequence_number = EXCLUDED.sequence_number,
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            amount_minor = EXCLUDED.amount_minor,
            due_date = EXCLUDED.due_date,
            status = EXCLUDED.status,
            funded_at = EXCLUDED.funded_at,
            version = EXCLUDED.version,
            updated_at = EXCLUDED.updated_at
        WHERE escrow_milestones.status = 'pending'
        "#,
    )
    .bind(&milestone.milestone_id)
    .bind(&milestone.escrow_id)
    .bind(to_db_i32(milestone.number)?)
    .bind(&milestone.title)
    .bind(&milestone.description)
    .bind(to_db(milestone.amount_minor, "amount_minor")?)
    .bind(milestone.due_date)
    .bind(milestone.status.name())
    .bind(milestone.rating.map(i16::from))
    .bind(&milestone.feedback)
    .bind(milestone.auto_approved)
    .bind(milestone.funded_at)
    .bind(milestone.started_at)
    .bind(milestone.submitted_at)
    .bind(milestone.approved_at)
    .bind(milestone.released_at)
    .bind(&milestone.release_reference)
    .bind(to_db(milestone.version, "version")?)
    .bind(milestone.created_at)
    .bind(milestone.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("milestone upsert", e))?;
    Ok(())
}

fn decode_escrow(row: &PgRow) -> Result<Escrow, EscrowError> {
    Ok(Escrow {
        escrow_id: column(row, "escrow_id")?,
        payer_id: column(row, "payer_id")?,
        payee_id: column(row, "payee_id")?,
        payee_account: column(row, "payee_account")?,
        contract_type: column(row, "contract_type")?,
        currency: column(row, "currency")?,
        total_minor: from_db(column(row, "total_minor")?, "total_minor")?,
        funded_minor: from_db(column(row, "funded_minor")?, "funded_minor")?,
        has_milestones: column(row, "has_milestones")?,
        revision: from_db(column(row, "revision")?, "revision")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn decode_milestone(row: &PgRow) -> Result<Milestone, EscrowError> {
    let status: String = column(row, "status")?;
    let number: i32 = column(row, "sequence_number")?;
    let rating: Option<i16> = column(row, "rating")?;

    Ok(Milestone {
        milestone_id: column(row, "milestone_id")?,
        escrow_id: column(row, "escrow_id")?,
        number: u32::try_from(number).map_err(|_| {
            EscrowError::Storage("negative sequence_number in storage".to_string())
        })?,
        title: column(row, "title")?,
        description: column(row, "description")?,
        amount_minor: from_db(column(row, "amount_minor")?, "amount_minor")?,
        due_date: column(row, "due_date")?,
        status: MilestoneStatus::parse(&status).ok_or_else(|| {
            EscrowError::Storage(format!("unknown milestone status '{status}' in postgres"))
        })?,
        rating: rating
            .map(u8::try_from)
            .transpose()
            .map_err(|_| EscrowError::Storage("rating out of range in storage".to_string()))?,
        feedback: column(row, "feedback")?,
        auto_approved: column(row, "auto_approved")?,
        funded_at: column(row, "funded_at")?,
        started_at: column(row, "started_at")?,
        submitted_at: column(row, "submitted_at")?,
        approved_at: column(row, "approved_at")?,
        released_at: column(row, "released_at")?,
        release_reference: column(row, "release_reference")?,
        version: from_db(column(row, "version")?, "version")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, EscrowError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| EscrowError::Storage(format!("postgres decode {name} failed: {e}")))
}

fn to_db(value: u64, field: &str) -> Result<i64, EscrowError> {
    i64::try_from(value)
        .map_err(|_| EscrowError::Storage(format!("{field} exceeds postgres BIGINT range")))
}

fn to_db_i32(value: u32) -> Result<i32, EscrowError> {
    i32::try_from(value).map_err(|_| {
        EscrowError::Storage("sequence_number exceeds postgres INTEGER range".to_string())
    })
}

fn from_db(value: i64, field: &str) -> Result<u64, EscrowError> {
    u64::try_from(value).map_err(|_| EscrowError::Storage(format!("negative {field} in storage")))
}

fn storage_error(operation: &str, error: sqlx::Error) -> EscrowError {
    EscrowError::Storage(format!("postgres {operation} failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::escrow;
    use crate::types::MilestoneDraft;

    async fn store_with_escrow(total: u64) -> (EscrowStore, MilestoneLedger) {
        let mut store = EscrowStore::bootstrap(StorageConfig::memory()).await.unwrap();
        let ledger = store.insert_escrow(escrow(total)).await.unwrap();
        (store, ledger)
    }

    #[tokio::test]
    async fn save_ledger_bumps_revision_and_indexes_milestones() {
        let (mut store, mut ledger) = store_with_escrow(10_000).await;
        let added = ledger
            .add_milestone(MilestoneDraft::new("Design", 10_000), Utc::now())
            .unwrap();

        let saved = store.save_ledger(ledger, 0).await.unwrap();
        assert_eq!(saved.escrow().revision, 1);

        let (escrow, milestone) = store.milestone(&added.milestone_id).unwrap();
        assert_eq!(escrow.escrow_id, saved.escrow().escrow_id);
        assert_eq!(milestone.title, "Design");
    }

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let (mut store, ledger) = store_with_escrow(10_000).await;
        let mut first = ledger.clone();
        first
            .add_milestone(MilestoneDraft::new("Design", 5_000), Utc::now())
            .unwrap();
        let mut second = ledger;
        second
            .add_milestone(MilestoneDraft::new("Build", 5_000), Utc::now())
            .unwrap();

        store.save_ledger(first, 0).await.unwrap();
        let err = store.save_ledger(second, 0).await.unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));
        assert_eq!(
            store.ledger(&store_escrow_id(&store)).unwrap().milestones().len(),
            1
        );
    }

    #[tokio::test]
    async fn removed_milestones_drop_out_of_the_index() {
        let (mut store, mut ledger) = store_with_escrow(10_000).await;
        let added = ledger
            .add_milestone(MilestoneDraft::unallocated("Design"), Utc::now())
            .unwrap();
        let mut ledger = store.save_ledger(ledger, 0).await.unwrap();

        ledger.remove_milestone(&added.milestone_id, Utc::now()).unwrap();
        store.save_ledger(ledger, 1).await.unwrap();
        assert!(matches!(
            store.milestone(&added.milestone_id),
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn commit_milestone_is_conditional_on_version() {
        let (mut store, mut ledger) = store_with_escrow(10_000).await;
        let added = ledger
            .add_milestone(MilestoneDraft::new("Design", 10_000), Utc::now())
            .unwrap();
        store.save_ledger(ledger, 0).await.unwrap();

        let mut renamed = added.clone();
        renamed.title = "Design v2".to_string();
        let committed = store.commit_milestone(renamed.clone(), 0).await.unwrap();
        assert_eq!(committed.version, 1);

        let err = store.commit_milestone(renamed, 0).await.unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));

        let ledger = store.ledger(&added.escrow_id).unwrap();
        assert_eq!(ledger.escrow().revision, 2);
    }

    #[tokio::test]
    async fn journal_appends_are_chained() {
        let (mut store, ledger) = store_with_escrow(10_000).await;
        let escrow_id = ledger.escrow().escrow_id.clone();
        for amount in [1_000u64, 2_000] {
            store
                .append_journal(
                    &escrow_id,
                    None,
                    JournalEntryKind::Funding,
                    &serde_json::json!({ "amount_minor": amount }),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        assert_eq!(store.journal().len(), 2);
        assert!(store.journal().verify_chain());
    }

    #[tokio::test]
    async fn duplicate_escrow_ids_are_rejected() {
        let (mut store, ledger) = store_with_escrow(10_000).await;
        let err = store
            .insert_escrow(ledger.escrow().clone())
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));
        assert_eq!(store.backend_label(), "memory");
    }

    fn store_escrow_id(store: &EscrowStore) -> String {
        store
            .ledgers()
            .next()
            .map(|ledger| ledger.escrow().escrow_id.clone())
            .unwrap()
    }
}
