//! SQLite schema for the local remote.
//!
//! - `entities` is the content store, keyed by content id
//! - `perspectives` keeps each registered perspective with its current
//!   details and the data id of its head, for secondary lookups
//! - `ecosystem` lists the children linked below each perspective, in order
//! - `store_meta` tracks the schema version

/// Migration v1: core tables plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    object TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS perspectives (
    id TEXT PRIMARY KEY,
    context TEXT NOT NULL,
    remote TEXT NOT NULL,
    creator_id TEXT NOT NULL,
    head_id TEXT,
    guardian_id TEXT,
    data_id TEXT
);

CREATE TABLE IF NOT EXISTS ecosystem (
    perspective_id TEXT NOT NULL REFERENCES perspectives(id) ON DELETE CASCADE,
    child_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (perspective_id, child_id),
    CHECK (perspective_id <> child_id)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 1);
";

/// Migration v2: secondary-attribute indexes.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_perspectives_context
    ON perspectives(context, id);

CREATE INDEX IF NOT EXISTS idx_perspectives_data
    ON perspectives(data_id, id);

CREATE INDEX IF NOT EXISTS idx_ecosystem_child
    ON ecosystem(child_id, perspective_id);

UPDATE store_meta
SET schema_version = 2
WHERE id = 1;
";

/// Indexes backing the range queries of [`super::SqliteRemote`].
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_perspectives_context",
    "idx_perspectives_data",
    "idx_ecosystem_child",
];
