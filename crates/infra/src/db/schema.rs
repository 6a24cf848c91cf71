//! Postgres table layouts for every persistent store.
//!
//! Each statement is idempotent (`IF NOT EXISTS`) and executed in order by
//! [`migrate`](super::migrate).

/// Stream heads. `version` is the stream length and is advanced by a
/// compare-and-swap `UPDATE` inside the append transaction.
pub const EVENT_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS event_streams (
    stream_id   TEXT PRIMARY KEY,
    version     BIGINT NOT NULL DEFAULT 0 CHECK (version >= 0),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Name of the `UNIQUE (stream_id, version)` constraint on `events`.
pub const EVENTS_STREAM_VERSION_KEY: &str = "events_stream_id_version_key";

/// Append-only event log. `UNIQUE (stream_id, version)` backs the stream CAS.
pub const EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    stream_id       TEXT NOT NULL REFERENCES event_streams (stream_id),
    version         BIGINT NOT NULL CHECK (version >= 0),
    event_type      TEXT NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    correlation_id  UUID NULL,
    causation_id    UUID NULL,
    tenant_id       UUID NULL,
    metadata        JSONB NULL,
    recorded_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT events_stream_id_version_key UNIQUE (stream_id, version)
)
"#;

pub const SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_id  TEXT NOT NULL,
    version       BIGINT NOT NULL CHECK (version >= 0),
    state         JSONB NOT NULL,
    taken_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (aggregate_id, version)
)
"#;

/// Outbox rows. `seq` gives a stable oldest-first drain order.
pub const OUTBOX_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_messages (
    seq               BIGSERIAL UNIQUE,
    id                UUID PRIMARY KEY,
    event_id          UUID NOT NULL,
    envelope          JSONB NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    published_at      TIMESTAMPTZ NULL,
    attempts          INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    last_attempt_at   TIMESTAMPTZ NULL,
    error             TEXT NULL,
    dead_lettered_at  TIMESTAMPTZ NULL
)
"#;

pub const OUTBOX_PENDING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS outbox_messages_pending_idx
    ON outbox_messages (seq)
    WHERE published_at IS NULL AND dead_lettered_at IS NULL
"#;

/// Inbox rows keyed by the delivered event id (the dedupe key).
pub const INBOX_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS inbox_messages (
    event_id      UUID PRIMARY KEY,
    id            UUID NOT NULL UNIQUE,
    envelope      JSONB NOT NULL,
    received_at   TIMESTAMPTZ NOT NULL,
    processed_at  TIMESTAMPTZ NULL
)
"#;

/// JSONB document store shared by every read model collection.
pub const READ_MODELS: &str = r#"
CREATE TABLE IF NOT EXISTS read_models (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    version     BIGINT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    data        JSONB NOT NULL,
    PRIMARY KEY (collection, id)
)
"#;

/// All statements in dependency order.
pub const ALL: &[&str] = &[
    EVENT_STREAMS,
    EVENTS,
    SNAPSHOTS,
    OUTBOX_MESSAGES,
    OUTBOX_PENDING_INDEX,
    INBOX_MESSAGES,
    READ_MODELS,
];
