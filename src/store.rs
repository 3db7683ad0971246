use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::Result;
use crate::models::{AbilityState, DifficultyRating, InteractionRecord, UserState};

/// Persistence collaborator.
///
/// Every method is a single all-or-nothing unit: on error nothing is
/// written. Interaction records are append-only.
pub trait Store: Send {
    /// Current epoch and ability states; an unknown user is an empty state.
    fn load_user_state(&self, user_id: &str) -> Result<UserState>;

    fn save_user_state(&mut self, state: &UserState) -> Result<()>;

    /// Append a record and return its id.
    fn append_interaction(&mut self, record: &InteractionRecord) -> Result<i64>;

    /// All records of the user, every epoch, oldest first.
    fn load_interactions(&self, user_id: &str) -> Result<Vec<InteractionRecord>>;

    /// Save `state` and append `record` atomically.
    fn commit_attempt(&mut self, state: &UserState, record: &InteractionRecord) -> Result<i64>;

    /// Start a new epoch with every stored ability overwritten by the prior.
    fn reset_user(&mut self, user_id: &str, initial_theta: f64) -> Result<UserState>;

    fn list_users(&self) -> Result<Vec<String>>;
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                epoch INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS ability_states (
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                theta REAL NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                correct_count INTEGER NOT NULL DEFAULT 0,
                mastered INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT,
                PRIMARY KEY (user_id, topic),
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            );

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                question_name TEXT NOT NULL,
                topic TEXT NOT NULL,
                theta_before REAL NOT NULL,
                theta_after REAL NOT NULL,
                passed INTEGER NOT NULL,
                test_pass_rate REAL NOT NULL CHECK(test_pass_rate BETWEEN 0 AND 100),
                timestamp TEXT NOT NULL,
                difficulty_rating TEXT CHECK(difficulty_rating IN ('easy', 'medium', 'hard')),
                confidence_level INTEGER CHECK(confidence_level BETWEEN 1 AND 5),
                notes TEXT,
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_user ON interactions(user_id, epoch);
            "#,
        )?;
        Ok(())
    }

    fn user_epoch(conn: &Connection, user_id: &str) -> Result<Option<u32>> {
        let epoch = conn
            .query_row(
                "SELECT epoch FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(epoch)
    }

    fn ensure_user(conn: &Connection, user_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id) VALUES (?1)",
            params![user_id],
        )?;
        Ok(())
    }

    fn write_state(conn: &Connection, state: &UserState) -> Result<()> {
        Self::ensure_user(conn, &state.user_id)?;
        let mut stmt = conn.prepare(
            r#"
            INSERT INTO ability_states
                (user_id, topic, theta, attempt_count, correct_count, mastered, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id, topic) DO UPDATE SET
                theta = excluded.theta,
                attempt_count = excluded.attempt_count,
                correct_count = excluded.correct_count,
                mastered = excluded.mastered,
                updated_at = excluded.updated_at
            "#,
        )?;
        for ability in state.abilities.values() {
            stmt.execute(params![
                state.user_id,
                ability.topic,
                ability.theta,
                ability.attempt_count,
                ability.correct_count,
                ability.mastered,
                ability.updated_at,
            ])?;
        }
        Ok(())
    }

    fn insert_interaction(conn: &Connection, record: &InteractionRecord) -> Result<i64> {
        Self::ensure_user(conn, &record.user_id)?;
        conn.execute(
            r#"
            INSERT INTO interactions
                (user_id, epoch, question_name, topic, theta_before, theta_after, passed,
                 test_pass_rate, timestamp, difficulty_rating, confidence_level, notes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.user_id,
                record.epoch,
                record.question_name,
                record.topic,
                record.theta_before,
                record.theta_after,
                record.passed,
                record.test_pass_rate,
                record.timestamp,
                record.difficulty_rating.map(|d| d.as_str()),
                record.confidence_level,
                record.notes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn row_to_interaction(row: &Row) -> rusqlite::Result<InteractionRecord> {
        let rating: Option<String> = row.get(10)?;
        Ok(InteractionRecord {
            id: Some(row.get(0)?),
            user_id: row.get(1)?,
            epoch: row.get(2)?,
            question_name: row.get(3)?,
            topic: row.get(4)?,
            theta_before: row.get(5)?,
            theta_after: row.get(6)?,
            passed: row.get(7)?,
            test_pass_rate: row.get(8)?,
            timestamp: row.get(9)?,
            difficulty_rating: rating.as_deref().and_then(DifficultyRating::from_str),
            confidence_level: row.get(11)?,
            notes: row.get(12)?,
        })
    }
}

impl Store for Database {
    fn load_user_state(&self, user_id: &str) -> Result<UserState> {
        let epoch = Self::user_epoch(&self.conn, user_id)?.unwrap_or(0);
        let mut state = UserState::new(user_id, epoch);

        let mut stmt = self.conn.prepare(
            r#"
            SELECT topic, theta, attempt_count, correct_count, mastered, updated_at
            FROM ability_states
            WHERE user_id = ?1
            ORDER BY topic
            "#,
        )?;
        let abilities = stmt
            .query_map(params![user_id], |row| {
                Ok(AbilityState {
                    topic: row.get(0)?,
                    theta: row.get(1)?,
                    attempt_count: row.get(2)?,
                    correct_count: row.get(3)?,
                    mastered: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for ability in abilities {
            state.abilities.insert(ability.topic.clone(), ability);
        }
        Ok(state)
    }

    fn save_user_state(&mut self, state: &UserState) -> Result<()> {
        let tx = self.conn.transaction()?;
        Self::write_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    fn append_interaction(&mut self, record: &InteractionRecord) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let id = Self::insert_interaction(&tx, record)?;
        tx.commit()?;
        Ok(id)
    }

    fn load_interactions(&self, user_id: &str) -> Result<Vec<InteractionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, epoch, question_name, topic, theta_before, theta_after, passed,
                   test_pass_rate, timestamp, difficulty_rating, confidence_level, notes
            FROM interactions
            WHERE user_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let records = stmt
            .query_map(params![user_id], Self::row_to_interaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn commit_attempt(&mut self, state: &UserState, record: &InteractionRecord) -> Result<i64> {
        let tx = self.conn.transaction()?;
        Self::write_state(&tx, state)?;
        let id = Self::insert_interaction(&tx, record)?;
        tx.commit()?;
        debug!(user = %record.user_id, id, "attempt committed");
        Ok(id)
    }

    fn reset_user(&mut self, user_id: &str, initial_theta: f64) -> Result<UserState> {
        let tx = self.conn.transaction()?;
        Self::ensure_user(&tx, user_id)?;
        tx.execute(
            "UPDATE users SET epoch = epoch + 1 WHERE user_id = ?1",
            params![user_id],
        )?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            UPDATE ability_states
            SET theta = ?1, attempt_count = 0, correct_count = 0, mastered = 0, updated_at = ?2
            WHERE user_id = ?3
            "#,
            params![initial_theta, now, user_id],
        )?;
        tx.commit()?;
        self.load_user_state(user_id)
    }

    fn list_users(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM users ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(users)
    }
}
