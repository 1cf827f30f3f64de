//! DDL for the catalog's SQLite database (spec.md §6: a single relational
//! file database under `<base_dir>/db/database.db`).

pub(super) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS fingerprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    human_readable_id TEXT NOT NULL,
    inference_server_url TEXT NOT NULL,
    version TEXT,
    description TEXT,
    delete_locally INTEGER NOT NULL DEFAULT 1,
    delete_remotely INTEGER NOT NULL DEFAULT 1,
    created_timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint_id INTEGER NOT NULL REFERENCES fingerprints(id) ON DELETE CASCADE,
    study_description_pattern TEXT,
    series_description_pattern TEXT,
    sop_class_uid_exact TEXT,
    exclude_pattern TEXT
);

CREATE TABLE IF NOT EXISTS destinations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    ae_title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fingerprint_destinations (
    fingerprint_id INTEGER NOT NULL REFERENCES fingerprints(id) ON DELETE CASCADE,
    destination_id INTEGER NOT NULL REFERENCES destinations(id),
    PRIMARY KEY (fingerprint_id, destination_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint_id INTEGER NOT NULL REFERENCES fingerprints(id),
    input_archive_path TEXT NOT NULL,
    output_archive_path TEXT NOT NULL,
    status INTEGER NOT NULL,
    inference_server_uid TEXT,
    deleted_local INTEGER NOT NULL DEFAULT 0,
    deleted_remote INTEGER NOT NULL DEFAULT 0,
    created_timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inference_server_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    operation TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    observed_timestamp TEXT NOT NULL
);
"#;
