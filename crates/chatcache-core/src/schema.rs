//! Database schema for chatcache.

/// SQL schema for the schema migrations tracking table.
pub const SCHEMA: &str = r#"
-- Schema migration tracking table
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
"#;

/// A versioned schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Migrations in application order. Never edit an entry once released.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages_and_index_status",
        sql: r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            sender_id TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            text TEXT,
            attachments JSON NOT NULL DEFAULT '[]',
            liked_by TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id);

        CREATE TABLE IF NOT EXISTS index_status (
            conversation_id TEXT PRIMARY KEY,
            last_indexed_id TEXT NOT NULL DEFAULT ''
        );
        "#,
    },
    Migration {
        version: 2,
        name: "message_system_flag_and_status_timestamp",
        sql: r#"
        ALTER TABLE messages ADD COLUMN system INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE index_status ADD COLUMN updated_at INTEGER;
        "#,
    },
];

/// Highest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}
