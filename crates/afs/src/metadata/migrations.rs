//! Ordered, idempotent schema migrations.
//!
//! Each step is identified by the SHA-256 of its name and SQL, so an edited
//! step gets a new id. Applied ids are recorded in `afs_migrations`; a step
//! runs at most once, inside its own transaction.

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use super::schema;
use crate::error::Result;
use crate::time::now_millis;

/// One migration step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Human-readable name
    pub name: &'static str,
    /// SQL batch to execute
    pub sql: &'static str,
}

impl Migration {
    /// Stable identifier of this step.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// All migrations in the order they must be applied.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            name: "001_source_metadata",
            sql: schema::SOURCE_METADATA,
        },
        Migration {
            name: "002_view_metadata",
            sql: schema::VIEW_METADATA,
        },
        Migration {
            name: "003_afs_slots",
            sql: schema::SLOTS,
        },
        Migration {
            name: "004_afs_deps_meta",
            sql: schema::DEPS,
        },
    ]
}

/// Apply every pending migration. Returns how many were applied.
pub fn apply_migrations(conn: &mut Connection) -> Result<usize> {
    apply(conn, &all_migrations())
}

pub(crate) fn apply(conn: &mut Connection, migrations: &[Migration]) -> Result<usize> {
    conn.execute_batch(schema::MIGRATIONS_TABLE)?;

    let mut applied = 0;
    for migration in migrations {
        let id = migration.id();
        let done: Option<String> = conn
            .query_row(
                "SELECT id FROM afs_migrations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if done.is_some() {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO afs_migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
            params![id, migration.name, now_millis()],
        )?;
        tx.commit()?;

        tracing::info!(migration = migration.name, "applied metadata migration");
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_distinct() {
        let migrations = all_migrations();
        let ids: Vec<_> = migrations.iter().map(Migration::id).collect();
        assert_eq!(ids, all_migrations().iter().map(Migration::id).collect::<Vec<_>>());
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids[0].len(), 64);
    }

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&mut conn).unwrap(), all_migrations().len());
        assert_eq!(apply_migrations(&mut conn).unwrap(), 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM afs_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, all_migrations().len());
    }

    #[test]
    fn test_new_step_applies_after_existing() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();

        let mut extended = all_migrations();
        extended.push(Migration {
            name: "005_test_index",
            sql: "CREATE INDEX IF NOT EXISTS idx_test ON source_metadata(kind)",
        });
        assert_eq!(apply(&mut conn, &extended).unwrap(), 1);
    }
}
