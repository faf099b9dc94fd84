//! SQLite-backed metadata store.
//!
//! All mutations are primary-key upserts, so concurrent writers to the same
//! key resolve last-writer-wins and writers to different keys never block
//! each other beyond the connection lock. Calls run on the blocking pool.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;

use super::migrations::apply_migrations;
use super::types::{DependencyEdge, SourceMetadata, Slot, ViewMetadata, ViewState};
use crate::error::{AfsError, Result};
use crate::time::{millis_ago, now_millis};
use crate::view::{View, ViewKey};

const SOURCE_COLUMNS: &str =
    "module, path, source_revision, updated_at, drivers_hint, kind, attrs_json, created_at";
const VIEW_COLUMNS: &str = "module, path, view, state, derived_from, generated_at, error, storage_path, created_at, updated_at";
const SLOT_COLUMNS: &str = r#"owner_path, slot_id, owner_revision, slot_type, "desc", intent_key, asset_path, slug, updated_at"#;
const DEP_COLUMNS: &str = "out_path, out_view_key, in_path, in_revision, role, updated_at";

/// Persistent record of source revisions, projections, slots and
/// dependency edges.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open (or create) a store at `path` and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        apply_migrations(&mut conn)?;
        tracing::debug!(path = %path.as_ref().display(), "opened metadata store");
        Ok(Self::from_connection(conn))
    }

    /// A private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        apply_migrations(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AfsError::Internal("metadata connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| AfsError::Internal(format!("metadata task failed: {err}")))?
    }

    // ---- source metadata ----

    /// Fetch the source record of `(module, path)`.
    pub async fn get_source(&self, module: &str, path: &str) -> Result<Option<SourceMetadata>> {
        let (module, path) = (module.to_string(), path.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {SOURCE_COLUMNS} FROM source_metadata WHERE module = ?1 AND path = ?2"
                    ),
                    params![module, path],
                    source_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Insert or replace a source record. `created_at` survives updates.
    pub async fn set_source(&self, meta: SourceMetadata) -> Result<SourceMetadata> {
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO source_metadata
                    (module, path, source_revision, updated_at, drivers_hint, kind, attrs_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?4)
                 ON CONFLICT(module, path) DO UPDATE SET
                    source_revision = excluded.source_revision,
                    updated_at = excluded.updated_at,
                    drivers_hint = excluded.drivers_hint,
                    kind = excluded.kind,
                    attrs_json = excluded.attrs_json",
                params![
                    meta.module,
                    meta.path,
                    meta.source_revision,
                    now,
                    serde_json::to_string(&meta.drivers_hint)?,
                    meta.kind,
                    serde_json::to_string(&meta.attrs)?,
                ],
            )?;
            let stored = conn.query_row(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM source_metadata WHERE module = ?1 AND path = ?2"
                ),
                params![meta.module, meta.path],
                source_from_row,
            )?;
            Ok(stored)
        })
        .await
    }

    /// Insert a source record only if none exists. Returns whether it was
    /// inserted; an existing row is never touched.
    pub async fn ensure_source(&self, meta: SourceMetadata) -> Result<bool> {
        self.with_conn(move |conn| {
            let now = now_millis();
            let inserted = conn.execute(
                "INSERT INTO source_metadata
                    (module, path, source_revision, updated_at, drivers_hint, kind, attrs_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?4)
                 ON CONFLICT(module, path) DO NOTHING",
                params![
                    meta.module,
                    meta.path,
                    meta.source_revision,
                    now,
                    serde_json::to_string(&meta.drivers_hint)?,
                    meta.kind,
                    serde_json::to_string(&meta.attrs)?,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    /// Remove the source record of `(module, path)`.
    pub async fn delete_source(&self, module: &str, path: &str) -> Result<bool> {
        let (module, path) = (module.to_string(), path.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM source_metadata WHERE module = ?1 AND path = ?2",
                params![module, path],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    // ---- view metadata ----

    /// Fetch the projection record of `(module, path, view)`.
    pub async fn get_view(
        &self,
        module: &str,
        path: &str,
        view: &View,
    ) -> Result<Option<ViewMetadata>> {
        self.get_view_by_key(module, path, &view.key()).await
    }

    /// Fetch a projection record by canonical key.
    pub async fn get_view_by_key(
        &self,
        module: &str,
        path: &str,
        key: &ViewKey,
    ) -> Result<Option<ViewMetadata>> {
        let (module, path, key) = (module.to_string(), path.to_string(), key.clone());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {VIEW_COLUMNS} FROM view_metadata
                         WHERE module = ?1 AND path = ?2 AND view = ?3"
                    ),
                    params![module, path, key.as_str()],
                    view_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Insert or replace a projection record after checking its per-state
    /// invariants. `created_at` survives updates.
    pub async fn set_view(&self, meta: ViewMetadata) -> Result<ViewMetadata> {
        meta.validate()?;
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO view_metadata
                    (module, path, view, state, derived_from, generated_at, error, storage_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(module, path, view) DO UPDATE SET
                    state = excluded.state,
                    derived_from = excluded.derived_from,
                    generated_at = excluded.generated_at,
                    error = excluded.error,
                    storage_path = excluded.storage_path,
                    updated_at = excluded.updated_at",
                params![
                    meta.module,
                    meta.path,
                    meta.view.as_str(),
                    meta.state.as_str(),
                    meta.derived_from,
                    meta.generated_at,
                    meta.error,
                    meta.storage_path,
                    now,
                ],
            )?;
            let stored = conn.query_row(
                &format!(
                    "SELECT {VIEW_COLUMNS} FROM view_metadata
                     WHERE module = ?1 AND path = ?2 AND view = ?3"
                ),
                params![meta.module, meta.path, meta.view.as_str()],
                view_from_row,
            )?;
            Ok(stored)
        })
        .await
    }

    /// All projection records of `(module, path)`, ordered by view key.
    pub async fn list_views(&self, module: &str, path: &str) -> Result<Vec<ViewMetadata>> {
        let (module, path) = (module.to_string(), path.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VIEW_COLUMNS} FROM view_metadata
                 WHERE module = ?1 AND path = ?2 ORDER BY view"
            ))?;
            let rows = stmt
                .query_map(params![module, path], view_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete one projection record, or all of `(module, path)` when `view`
    /// is `None`.
    pub async fn delete_views(
        &self,
        module: &str,
        path: &str,
        view: Option<&View>,
    ) -> Result<usize> {
        let (module, path) = (module.to_string(), path.to_string());
        let key = view.map(View::key);
        self.with_conn(move |conn| {
            let removed = match key {
                Some(key) => conn.execute(
                    "DELETE FROM view_metadata WHERE module = ?1 AND path = ?2 AND view = ?3",
                    params![module, path, key.as_str()],
                )?,
                None => conn.execute(
                    "DELETE FROM view_metadata WHERE module = ?1 AND path = ?2",
                    params![module, path],
                )?,
            };
            Ok(removed)
        })
        .await
    }

    /// Atomically claim a projection for generation.
    ///
    /// Succeeds when the row is absent, `stale`, `failed`, `ready` but
    /// derived from a revision other than `revision`, or `generating` with
    /// no update for longer than `reclaim_after`. Fails (returns `false`)
    /// when a live run holds it or it is already fresh.
    pub async fn try_begin_generation(
        &self,
        module: &str,
        path: &str,
        key: &ViewKey,
        revision: &str,
        storage_path: &str,
        reclaim_after: Duration,
    ) -> Result<bool> {
        let (module, path, key) = (module.to_string(), path.to_string(), key.clone());
        let (revision, storage_path) = (revision.to_string(), storage_path.to_string());
        let now = now_millis();
        let abandoned_before = millis_ago(reclaim_after);
        self.with_conn(move |conn| {
            let claimed = conn.execute(
                "INSERT INTO view_metadata
                    (module, path, view, state, derived_from, generated_at, error, storage_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'generating', ?4, NULL, NULL, ?5, ?6, ?6)
                 ON CONFLICT(module, path, view) DO UPDATE SET
                    state = 'generating',
                    derived_from = excluded.derived_from,
                    error = NULL,
                    storage_path = excluded.storage_path,
                    updated_at = excluded.updated_at
                 WHERE view_metadata.state IN ('stale', 'failed')
                    OR (view_metadata.state = 'ready'
                        AND view_metadata.derived_from IS NOT excluded.derived_from)
                    OR (view_metadata.state = 'generating'
                        AND view_metadata.updated_at < ?7)",
                params![module, path, key.as_str(), revision, storage_path, now, abandoned_before],
            )?;
            Ok(claimed == 1)
        })
        .await
    }

    /// Move a `generating` projection to `ready`.
    pub async fn complete_generation(
        &self,
        module: &str,
        path: &str,
        key: &ViewKey,
        revision: &str,
        storage_path: &str,
    ) -> Result<()> {
        let (module, path, key) = (module.to_string(), path.to_string(), key.clone());
        let (revision, storage_path) = (revision.to_string(), storage_path.to_string());
        self.with_conn(move |conn| {
            let now = now_millis();
            let updated = conn.execute(
                "UPDATE view_metadata SET
                    state = 'ready', derived_from = ?4, generated_at = ?6,
                    storage_path = ?5, error = NULL, updated_at = ?6
                 WHERE module = ?1 AND path = ?2 AND view = ?3 AND state = 'generating'",
                params![module, path, key.as_str(), revision, storage_path, now],
            )?;
            ensure_transition(updated, &module, &path, &key, ViewState::Ready)
        })
        .await
    }

    /// Move a `generating` projection to `failed`, recording `error`.
    pub async fn fail_generation(
        &self,
        module: &str,
        path: &str,
        key: &ViewKey,
        error: &str,
    ) -> Result<()> {
        let (module, path, key) = (module.to_string(), path.to_string(), key.clone());
        let error = error.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE view_metadata SET state = 'failed', error = ?4, updated_at = ?5
                 WHERE module = ?1 AND path = ?2 AND view = ?3 AND state = 'generating'",
                params![module, path, key.as_str(), error, now_millis()],
            )?;
            ensure_transition(updated, &module, &path, &key, ViewState::Failed)
        })
        .await
    }

    /// Mark every `ready` or `failed` projection of `(module, path)` stale.
    ///
    /// Rows in `generating` keep generating so an in-flight run is never
    /// orphaned. Idempotent; returns the number of rows changed.
    pub async fn mark_views_as_stale(&self, module: &str, path: &str) -> Result<usize> {
        let (module, path) = (module.to_string(), path.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE view_metadata SET state = 'stale', updated_at = ?3
                 WHERE module = ?1 AND path = ?2 AND state IN ('ready', 'failed')",
                params![module, path, now_millis()],
            )?;
            if changed > 0 {
                tracing::debug!(module = %module, path = %path, changed, "marked views stale");
            }
            Ok(changed)
        })
        .await
    }

    /// Mark a single `ready` or `failed` projection stale.
    pub async fn mark_view_stale(&self, module: &str, path: &str, key: &ViewKey) -> Result<bool> {
        let (module, path, key) = (module.to_string(), path.to_string(), key.clone());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE view_metadata SET state = 'stale', updated_at = ?4
                 WHERE module = ?1 AND path = ?2 AND view = ?3 AND state IN ('ready', 'failed')",
                params![module, path, key.as_str(), now_millis()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Projections waiting for regeneration.
    pub async fn list_stale_views(&self) -> Result<Vec<ViewMetadata>> {
        self.list_by_state(ViewState::Stale).await
    }

    /// Projections with a driver run in flight.
    pub async fn list_generating_views(&self) -> Result<Vec<ViewMetadata>> {
        self.list_by_state(ViewState::Generating).await
    }

    async fn list_by_state(&self, state: ViewState) -> Result<Vec<ViewMetadata>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VIEW_COLUMNS} FROM view_metadata
                 WHERE state = ?1 ORDER BY module, path, view"
            ))?;
            let rows = stmt
                .query_map(params![state.as_str()], view_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete projection records whose source record no longer exists.
    pub async fn cleanup_orphaned_view_metadata(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM view_metadata WHERE NOT EXISTS (
                    SELECT 1 FROM source_metadata s
                    WHERE s.module = view_metadata.module AND s.path = view_metadata.path
                 )",
                [],
            )?;
            Ok(removed)
        })
        .await
    }

    /// Delete `failed` projections last updated more than `older_than` ago,
    /// or all of them when `older_than` is `None`.
    pub async fn cleanup_failed_views(&self, older_than: Option<Duration>) -> Result<usize> {
        let cutoff = match older_than {
            Some(age) => millis_ago(age),
            None => i64::MAX,
        };
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM view_metadata WHERE state = 'failed' AND updated_at < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })
        .await
    }

    // ---- slots ----

    /// Replace the slot set of `owner_path` with `slots` in one transaction.
    ///
    /// Unchanged rows are left alone and rows whose ids are absent from
    /// `slots` are deleted. Returns the number of rows inserted, updated or
    /// deleted, so re-syncing identical slots returns zero.
    pub async fn sync_slots(&self, owner_path: &str, slots: Vec<Slot>) -> Result<usize> {
        let owner_path = owner_path.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = now_millis();
            let mut changed = 0;
            for slot in &slots {
                changed += tx.execute(
                    r#"INSERT INTO afs_slots
                        (owner_path, slot_id, owner_revision, slot_type, "desc", intent_key, asset_path, slug, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(owner_path, slot_id) DO UPDATE SET
                        owner_revision = excluded.owner_revision,
                        slot_type = excluded.slot_type,
                        "desc" = excluded."desc",
                        intent_key = excluded.intent_key,
                        asset_path = excluded.asset_path,
                        slug = excluded.slug,
                        updated_at = excluded.updated_at
                     WHERE afs_slots.owner_revision IS NOT excluded.owner_revision
                        OR afs_slots.slot_type IS NOT excluded.slot_type
                        OR afs_slots."desc" IS NOT excluded."desc"
                        OR afs_slots.intent_key IS NOT excluded.intent_key
                        OR afs_slots.asset_path IS NOT excluded.asset_path
                        OR afs_slots.slug IS NOT excluded.slug"#,
                    params![
                        owner_path,
                        slot.slot_id,
                        slot.owner_revision,
                        slot.slot_type,
                        slot.desc,
                        slot.intent_key,
                        slot.asset_path,
                        slot.slug,
                        now,
                    ],
                )?;
            }

            let keep: HashSet<&str> = slots.iter().map(|slot| slot.slot_id.as_str()).collect();
            let existing: Vec<String> = {
                let mut stmt = tx.prepare("SELECT slot_id FROM afs_slots WHERE owner_path = ?1")?;
                stmt.query_map(params![owner_path], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for slot_id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
                changed += tx.execute(
                    "DELETE FROM afs_slots WHERE owner_path = ?1 AND slot_id = ?2",
                    params![owner_path, slot_id],
                )?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    /// Slots declared by `owner_path`, ordered by id.
    pub async fn slots_for_owner(&self, owner_path: &str) -> Result<Vec<Slot>> {
        let owner_path = owner_path.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SLOT_COLUMNS} FROM afs_slots WHERE owner_path = ?1 ORDER BY slot_id"
            ))?;
            let rows = stmt
                .query_map(params![owner_path], slot_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Slots sharing `intent_key`, across all owners.
    pub async fn slots_by_intent(&self, intent_key: &str) -> Result<Vec<Slot>> {
        let intent_key = intent_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SLOT_COLUMNS} FROM afs_slots WHERE intent_key = ?1
                 ORDER BY owner_path, slot_id"
            ))?;
            let rows = stmt
                .query_map(params![intent_key], slot_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Any one slot pointing at `asset_path`.
    pub async fn slot_for_asset(&self, asset_path: &str) -> Result<Option<Slot>> {
        let asset_path = asset_path.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {SLOT_COLUMNS} FROM afs_slots WHERE asset_path = ?1
                         ORDER BY owner_path, slot_id LIMIT 1"
                    ),
                    params![asset_path],
                    slot_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Distinct asset paths referenced by any slot, sorted.
    pub async fn asset_paths(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT asset_path FROM afs_slots")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(paths.into_iter().collect())
        })
        .await
    }

    // ---- dependency edges ----

    /// Insert or replace the edge `(out_path, out_view_key) -> in_path`.
    pub async fn record_dependency(&self, edge: DependencyEdge) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO afs_deps_meta (out_path, out_view_key, in_path, in_revision, role, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(out_path, out_view_key, in_path) DO UPDATE SET
                    in_revision = excluded.in_revision,
                    role = excluded.role,
                    updated_at = excluded.updated_at",
                params![
                    edge.out_path,
                    edge.out_view_key.as_str(),
                    edge.in_path,
                    edge.in_revision,
                    edge.role,
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Inputs consumed by one output.
    pub async fn dependencies_of(
        &self,
        out_path: &str,
        out_view_key: &ViewKey,
    ) -> Result<Vec<DependencyEdge>> {
        let (out_path, key) = (out_path.to_string(), out_view_key.clone());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEP_COLUMNS} FROM afs_deps_meta
                 WHERE out_path = ?1 AND out_view_key = ?2 ORDER BY in_path"
            ))?;
            let rows = stmt
                .query_map(params![out_path, key.as_str()], dep_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Outputs that consumed `in_path`.
    pub async fn dependents_of(&self, in_path: &str) -> Result<Vec<DependencyEdge>> {
        let in_path = in_path.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEP_COLUMNS} FROM afs_deps_meta
                 WHERE in_path = ?1 ORDER BY out_path, out_view_key"
            ))?;
            let rows = stmt
                .query_map(params![in_path], dep_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Mark stale every projection of `module` that transitively consumed
    /// `in_path`. Cycles in the edge graph are visited once.
    pub async fn invalidate_dependents(&self, module: &str, in_path: &str) -> Result<usize> {
        let (module, in_path) = (module.to_string(), in_path.to_string());
        self.with_conn(move |conn| {
            let mut queue = VecDeque::from([in_path.clone()]);
            let mut visited = HashSet::from([in_path]);
            let mut changed = 0;
            let mut select = conn.prepare(
                "SELECT DISTINCT out_path, out_view_key FROM afs_deps_meta WHERE in_path = ?1",
            )?;
            let mut mark = conn.prepare(
                "UPDATE view_metadata SET state = 'stale', updated_at = ?4
                 WHERE module = ?1 AND path = ?2 AND view = ?3 AND state IN ('ready', 'failed')",
            )?;
            while let Some(input) = queue.pop_front() {
                let outputs = select
                    .query_map(params![input], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (out_path, out_view) in outputs {
                    changed += mark.execute(params![module, out_path, out_view, now_millis()])?;
                    if visited.insert(out_path.clone()) {
                        queue.push_back(out_path);
                    }
                }
            }
            if changed > 0 {
                tracing::debug!(module = %module, changed, "invalidated dependent views");
            }
            Ok(changed)
        })
        .await
    }

    /// Drop every edge touching `path` on either side.
    pub async fn delete_dependencies(&self, path: &str) -> Result<usize> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM afs_deps_meta WHERE out_path = ?1 OR in_path = ?1",
                params![path],
            )?;
            Ok(removed)
        })
        .await
    }
}

fn ensure_transition(
    updated: usize,
    module: &str,
    path: &str,
    key: &ViewKey,
    target: ViewState,
) -> Result<()> {
    if updated == 0 {
        return Err(AfsError::Validation(format!(
            "view {module}:{path} [{key}] is not generating; cannot move to {target}"
        )));
    }
    Ok(())
}

fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
        }),
    }
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceMetadata> {
    Ok(SourceMetadata {
        module: row.get(0)?,
        path: row.get(1)?,
        source_revision: row.get(2)?,
        updated_at: row.get(3)?,
        drivers_hint: json_column(row, 4)?,
        kind: row.get(5)?,
        attrs: json_column(row, 6)?,
        created_at: row.get(7)?,
    })
}

fn view_from_row(row: &Row<'_>) -> rusqlite::Result<ViewMetadata> {
    let state: String = row.get(3)?;
    let state = state
        .parse::<ViewState>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err)))?;
    Ok(ViewMetadata {
        module: row.get(0)?,
        path: row.get(1)?,
        view: ViewKey::from_stored(row.get::<_, String>(2)?),
        state,
        derived_from: row.get(4)?,
        generated_at: row.get(5)?,
        error: row.get(6)?,
        storage_path: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<Slot> {
    Ok(Slot {
        owner_path: row.get(0)?,
        slot_id: row.get(1)?,
        owner_revision: row.get(2)?,
        slot_type: row.get(3)?,
        desc: row.get(4)?,
        intent_key: row.get(5)?,
        asset_path: row.get(6)?,
        slug: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn dep_from_row(row: &Row<'_>) -> rusqlite::Result<DependencyEdge> {
    Ok(DependencyEdge {
        out_path: row.get(0)?,
        out_view_key: ViewKey::from_stored(row.get::<_, String>(1)?),
        in_path: row.get(2)?,
        in_revision: row.get(3)?,
        role: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn store() -> MetadataStore {
        MetadataStore::open_in_memory().unwrap()
    }

    fn en() -> ViewKey {
        View::language("en").key()
    }

    async fn ready(store: &MetadataStore, path: &str, revision: &str) {
        store.set_source(SourceMetadata::new("docs", path, revision)).await.unwrap();
        assert!(
            store
                .try_begin_generation("docs", path, &en(), revision, "/.i18n/en/a.md", LEASE)
                .await
                .unwrap()
        );
        store
            .complete_generation("docs", path, &en(), revision, "/.i18n/en/a.md")
            .await
            .unwrap();
    }

    fn slot(owner: &str, id: &str, desc: &str, key: &str) -> Slot {
        Slot {
            owner_path: owner.to_string(),
            slot_id: id.to_string(),
            owner_revision: "r1".to_string(),
            slot_type: "image".to_string(),
            desc: desc.to_string(),
            intent_key: key.to_string(),
            asset_path: format!("/.afs/images/by-intent/{key}"),
            slug: desc.to_string(),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_source_upsert_preserves_created_at() {
        let store = store();
        let first = store
            .set_source(
                SourceMetadata::new("docs", "/a.md", "r1")
                    .with_drivers_hint(["i18n"])
                    .with_kind("document")
                    .with_attr("lines", 3),
            )
            .await
            .unwrap();
        assert_eq!(first.drivers_hint, vec!["i18n".to_string()]);
        assert_eq!(first.attrs.get("lines"), Some(&serde_json::json!(3)));

        let second = store
            .set_source(SourceMetadata::new("docs", "/a.md", "r2"))
            .await
            .unwrap();
        assert_eq!(second.source_revision, "r2");
        assert_eq!(second.created_at, first.created_at);

        assert!(store.delete_source("docs", "/a.md").await.unwrap());
        assert!(store.get_source("docs", "/a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_source_never_overwrites() {
        let store = store();
        assert!(store.ensure_source(SourceMetadata::new("docs", "/x", "intent:1")).await.unwrap());
        assert!(!store.ensure_source(SourceMetadata::new("docs", "/x", "intent:2")).await.unwrap());
        let row = store.get_source("docs", "/x").await.unwrap().unwrap();
        assert_eq!(row.source_revision, "intent:1");
    }

    #[tokio::test]
    async fn test_equivalent_views_share_one_row() {
        let store = store();
        let a = View::from_pairs([("format", "PNG"), ("language", "EN")]).unwrap();
        let b = View::from_pairs([("language", "en"), ("format", "png")]).unwrap();
        assert!(
            store
                .try_begin_generation("docs", "/a", &a.key(), "r1", "/p", LEASE)
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_begin_generation("docs", "/a", &b.key(), "r1", "/p", LEASE)
                .await
                .unwrap()
        );
        assert_eq!(store.list_views("docs", "/a").await.unwrap().len(), 1);
        assert!(store.get_view("docs", "/a", &b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generation_lifecycle() {
        let store = store();
        ready(&store, "/a.md", "r1").await;
        let row = store.get_view_by_key("docs", "/a.md", &en()).await.unwrap().unwrap();
        assert_eq!(row.state, ViewState::Ready);
        assert!(row.is_fresh("r1"));
        assert!(row.generated_at.is_some());

        // Fresh rows cannot be claimed again
        assert!(
            !store
                .try_begin_generation("docs", "/a.md", &en(), "r1", "/p", LEASE)
                .await
                .unwrap()
        );
        // Completing a row that is not generating is rejected
        assert!(
            store
                .complete_generation("docs", "/a.md", &en(), "r1", "/p")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_drifted_ready_row_can_be_claimed() {
        let store = store();
        ready(&store, "/a.md", "r1").await;
        assert!(
            store
                .try_begin_generation("docs", "/a.md", &en(), "r2", "/p", LEASE)
                .await
                .unwrap()
        );
        let row = store.get_view_by_key("docs", "/a.md", &en()).await.unwrap().unwrap();
        assert_eq!(row.state, ViewState::Generating);
        assert_eq!(row.derived_from.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_mark_stale_skips_generating_rows() {
        let store = store();
        assert!(
            store
                .try_begin_generation("docs", "/a.md", &en(), "r1", "/p", LEASE)
                .await
                .unwrap()
        );
        assert_eq!(store.mark_views_as_stale("docs", "/a.md").await.unwrap(), 0);
        let row = store.get_view_by_key("docs", "/a.md", &en()).await.unwrap().unwrap();
        assert_eq!(row.state, ViewState::Generating);
        assert_eq!(store.list_generating_views().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_generation_can_be_reclaimed() {
        let store = store();
        let key = en();
        let claim = |lease| store.try_begin_generation("docs", "/a.md", &key, "r1", "/p", lease);
        assert!(claim(LEASE).await.unwrap());
        assert!(!claim(LEASE).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(claim(Duration::from_millis(5)).await.unwrap());
        let row = store.get_view_by_key("docs", "/a.md", &key).await.unwrap().unwrap();
        assert_eq!(row.state, ViewState::Generating);
        assert!(!claim(LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_stale_is_idempotent() {
        let store = store();
        ready(&store, "/a.md", "r1").await;
        assert_eq!(store.mark_views_as_stale("docs", "/a.md").await.unwrap(), 1);
        assert_eq!(store.mark_views_as_stale("docs", "/a.md").await.unwrap(), 0);
        let stale = store.list_stale_views().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].path, "/a.md");
    }

    #[tokio::test]
    async fn test_failed_views_and_cleanup() {
        let store = store();
        store.set_source(SourceMetadata::new("docs", "/a.md", "r1")).await.unwrap();
        store
            .try_begin_generation("docs", "/a.md", &en(), "r1", "/p", LEASE)
            .await
            .unwrap();
        store
            .fail_generation("docs", "/a.md", &en(), "backend down")
            .await
            .unwrap();
        let row = store.get_view_by_key("docs", "/a.md", &en()).await.unwrap().unwrap();
        assert_eq!(row.state, ViewState::Failed);
        assert_eq!(row.error.as_deref(), Some("backend down"));

        // Recent failures survive an age-bounded cleanup
        assert_eq!(
            store
                .cleanup_failed_views(Some(Duration::from_secs(3600)))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.cleanup_failed_views(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_view_validates_state_fields() {
        let store = store();
        let bad = ViewMetadata {
            module: "docs".to_string(),
            path: "/a.md".to_string(),
            view: en(),
            state: ViewState::Failed,
            derived_from: None,
            generated_at: None,
            error: None,
            storage_path: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(matches!(
            store.set_view(bad).await,
            Err(AfsError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_views() {
        let store = store();
        ready(&store, "/a.md", "r1").await;
        store
            .try_begin_generation("docs", "/gone.md", &en(), "r1", "/p", LEASE)
            .await
            .unwrap();
        assert_eq!(store.cleanup_orphaned_view_metadata().await.unwrap(), 1);
        assert_eq!(store.list_views("docs", "/a.md").await.unwrap().len(), 1);
        assert_eq!(store.delete_views("docs", "/a.md", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_slots_is_idempotent_and_prunes() {
        let store = store();
        let slots = vec![
            slot("/a.md", "hero", "a cat", "k1"),
            slot("/a.md", "logo", "a dog", "k2"),
        ];
        assert_eq!(store.sync_slots("/a.md", slots.clone()).await.unwrap(), 2);
        assert_eq!(store.sync_slots("/a.md", slots).await.unwrap(), 0);

        let changed = store
            .sync_slots("/a.md", vec![slot("/a.md", "hero", "a cat", "k1")])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let remaining = store.slots_for_owner("/a.md").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].slot_id, "hero");
    }

    #[tokio::test]
    async fn test_slots_by_intent_spans_owners() {
        let store = store();
        store
            .sync_slots("/a.md", vec![slot("/a.md", "hero", "a cat", "k1")])
            .await
            .unwrap();
        store
            .sync_slots("/b.md", vec![slot("/b.md", "pic", "a cat", "k1")])
            .await
            .unwrap();
        let shared = store.slots_by_intent("k1").await.unwrap();
        assert_eq!(shared.len(), 2);
        assert_eq!(store.asset_paths().await.unwrap(), vec!["/.afs/images/by-intent/k1"]);
        let found = store
            .slot_for_asset("/.afs/images/by-intent/k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.owner_path, "/a.md");
    }

    #[tokio::test]
    async fn test_invalidate_dependents_is_transitive_and_cycle_safe() {
        let store = store();
        ready(&store, "/summary.md", "s1").await;
        ready(&store, "/digest.md", "d1").await;
        // summary <- notes, digest <- summary, notes <- digest (cycle)
        for (out, input) in [
            ("/summary.md", "/notes.md"),
            ("/digest.md", "/summary.md"),
            ("/notes.md", "/digest.md"),
        ] {
            store
                .record_dependency(DependencyEdge::new(out, en(), input, "r", "context"))
                .await
                .unwrap();
        }

        let changed = store.invalidate_dependents("docs", "/notes.md").await.unwrap();
        assert_eq!(changed, 2);
        let stale: Vec<_> = store
            .list_stale_views()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.path)
            .collect();
        assert_eq!(stale, vec!["/digest.md", "/summary.md"]);

        assert_eq!(store.dependents_of("/summary.md").await.unwrap().len(), 1);
        assert_eq!(
            store.dependencies_of("/summary.md", &en()).await.unwrap()[0].in_path,
            "/notes.md"
        );
        assert_eq!(store.delete_dependencies("/summary.md").await.unwrap(), 2);
    }
}
