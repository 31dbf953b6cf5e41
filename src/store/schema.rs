pub const SCHEMA: &str = r#"
-- Namespaces mirrored from the web layer
CREATE TABLE IF NOT EXISTS namespaces (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER,            -- NULL = root namespace
    name TEXT NOT NULL
);

-- Projects mirrored from the web layer
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    namespace_id INTEGER NOT NULL,
    root_namespace_id INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_root_namespace ON projects(root_namespace_id);

-- Billing end dates, supplied by the subscription service
CREATE TABLE IF NOT EXISTS namespace_subscriptions (
    namespace_id INTEGER PRIMARY KEY,
    end_date TEXT NOT NULL
);

-- Index-serving nodes, identified by the UUID they report
CREATE TABLE IF NOT EXISTS zoekt_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    index_base_url TEXT NOT NULL,   -- not unique: a node may be re-registered under a new UUID
    search_base_url TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    indexed_bytes INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    task_failures INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_zoekt_nodes_last_seen ON zoekt_nodes(last_seen_at);

-- Root namespaces opted into search
CREATE TABLE IF NOT EXISTS zoekt_enabled_namespaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_namespace_id INTEGER NOT NULL UNIQUE,
    search INTEGER NOT NULL DEFAULT 0,
    last_rollout_failed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS zoekt_replicas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zoekt_enabled_namespace_id INTEGER NOT NULL
        REFERENCES zoekt_enabled_namespaces(id) ON DELETE CASCADE,
    namespace_id INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_zoekt_replicas_enabled_namespace
    ON zoekt_replicas(zoekt_enabled_namespace_id);

-- Placement of one replica on one node
CREATE TABLE IF NOT EXISTS zoekt_indices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zoekt_node_id INTEGER NOT NULL REFERENCES zoekt_nodes(id) ON DELETE CASCADE,
    zoekt_replica_id INTEGER REFERENCES zoekt_replicas(id) ON DELETE SET NULL,
    zoekt_enabled_namespace_id INTEGER
        REFERENCES zoekt_enabled_namespaces(id) ON DELETE SET NULL,
    namespace_id INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    watermark_level TEXT NOT NULL DEFAULT 'healthy',
    reserved_storage_bytes INTEGER NOT NULL,
    used_storage_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE(zoekt_replica_id, zoekt_node_id)
);

CREATE INDEX IF NOT EXISTS idx_zoekt_indices_node ON zoekt_indices(zoekt_node_id);
CREATE INDEX IF NOT EXISTS idx_zoekt_indices_state ON zoekt_indices(state);

-- Indexing record for one project inside one index
CREATE TABLE IF NOT EXISTS zoekt_repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zoekt_index_id INTEGER NOT NULL REFERENCES zoekt_indices(id) ON DELETE RESTRICT,
    project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
    project_identifier INTEGER NOT NULL,   -- survives project deletion
    state TEXT NOT NULL DEFAULT 'pending',
    size_bytes INTEGER NOT NULL DEFAULT 0,
    indexed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE(zoekt_index_id, project_identifier)
);

CREATE INDEX IF NOT EXISTS idx_zoekt_repositories_project
    ON zoekt_repositories(project_identifier);

-- Time slices of the task log
CREATE TABLE IF NOT EXISTS zoekt_task_partitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    detached_at TEXT
);

CREATE TABLE IF NOT EXISTS zoekt_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER NOT NULL REFERENCES zoekt_task_partitions(id),
    zoekt_node_id INTEGER NOT NULL REFERENCES zoekt_nodes(id) ON DELETE CASCADE,
    zoekt_repository_id INTEGER NOT NULL,
    project_identifier INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    retries_left INTEGER NOT NULL DEFAULT 0,
    perform_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- At most one pending task per (repository, node, type)
CREATE UNIQUE INDEX IF NOT EXISTS idx_zoekt_tasks_pending_unique
    ON zoekt_tasks(zoekt_repository_id, zoekt_node_id, task_type)
    WHERE state = 'pending';

CREATE INDEX IF NOT EXISTS idx_zoekt_tasks_due ON zoekt_tasks(state, perform_at);
CREATE INDEX IF NOT EXISTS idx_zoekt_tasks_partition ON zoekt_tasks(partition_id, state);

-- Out-of-band namespace-level work created with and retired with indices
CREATE TABLE IF NOT EXISTS zoekt_index_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    zoekt_index_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_zoekt_index_jobs_state ON zoekt_index_jobs(state, id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Bearer tokens: admin tokens for the admin API, node tokens for node ingress
CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,          -- argon2id hash with embedded salt
    token_lookup TEXT NOT NULL UNIQUE, -- first 8 chars of ID for fast lookup
    is_admin INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,            -- NULL = never
    last_used_at TEXT
);
"#;
