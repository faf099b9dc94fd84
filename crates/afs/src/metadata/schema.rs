//! Table definitions for the metadata store.

pub const MIGRATIONS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS afs_migrations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    )
";

pub const SOURCE_METADATA: &str = "
    CREATE TABLE IF NOT EXISTS source_metadata (
        module TEXT NOT NULL,
        path TEXT NOT NULL,
        source_revision TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        drivers_hint TEXT,            -- JSON array of driver names
        kind TEXT,
        attrs_json TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE(module, path)
    );
";

pub const VIEW_METADATA: &str = "
    CREATE TABLE IF NOT EXISTS view_metadata (
        module TEXT NOT NULL,
        path TEXT NOT NULL,
        view TEXT NOT NULL,           -- canonical view key
        state TEXT NOT NULL,          -- generating, ready, stale, failed
        derived_from TEXT,
        generated_at INTEGER,
        error TEXT,
        storage_path TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(module, path, view)
    );
    CREATE INDEX IF NOT EXISTS idx_view_metadata_path ON view_metadata(path);
    CREATE INDEX IF NOT EXISTS idx_view_metadata_state ON view_metadata(state);
    CREATE INDEX IF NOT EXISTS idx_view_metadata_derived_from ON view_metadata(derived_from);
";

pub const SLOTS: &str = r#"
    CREATE TABLE IF NOT EXISTS afs_slots (
        owner_path TEXT NOT NULL,
        slot_id TEXT NOT NULL,
        owner_revision TEXT NOT NULL,
        slot_type TEXT NOT NULL,
        "desc" TEXT NOT NULL,
        intent_key TEXT NOT NULL,
        asset_path TEXT NOT NULL,
        slug TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY(owner_path, slot_id)
    );
    CREATE INDEX IF NOT EXISTS idx_afs_slots_asset_path ON afs_slots(asset_path);
    CREATE INDEX IF NOT EXISTS idx_afs_slots_intent_key ON afs_slots(intent_key);
"#;

pub const DEPS: &str = "
    CREATE TABLE IF NOT EXISTS afs_deps_meta (
        out_path TEXT NOT NULL,
        out_view_key TEXT NOT NULL,
        in_path TEXT NOT NULL,
        in_revision TEXT NOT NULL,
        role TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY(out_path, out_view_key, in_path)
    );
    CREATE INDEX IF NOT EXISTS idx_afs_deps_in_path ON afs_deps_meta(in_path);
    CREATE INDEX IF NOT EXISTS idx_afs_deps_out ON afs_deps_meta(out_path, out_view_key);
";
