//! SQLite-backed database.
//!
//! Every session opens its own connection, so sessions are never shared
//! between phases or requests. Read-only sessions open the file read-only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::debug;

use crate::domain::{
    Model, NewObject, NewPluginConfiguration, PluginConfiguration, Project, ProjectId,
    RenderEngineConfiguration, Revision, RevisionId, RevisionSummary, SerializerId, StoredObject,
};

use super::{CheckoutRecord, Database, DatabaseAction, Session, SessionMode, StoreError, Transaction};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS revisions (
    id          INTEGER PRIMARY KEY,
    project_id  INTEGER NOT NULL REFERENCES projects(id),
    number      INTEGER NOT NULL,
    user        TEXT NOT NULL,
    comment     TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    UNIQUE (project_id, number)
);

CREATE TABLE IF NOT EXISTS objects (
    id           INTEGER PRIMARY KEY,
    revision_id  INTEGER NOT NULL REFERENCES revisions(id),
    type_name    TEXT NOT NULL,
    attributes   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS objects_by_revision ON objects(revision_id);

CREATE TABLE IF NOT EXISTS plugin_configurations (
    id                    INTEGER PRIMARY KEY,
    kind                  TEXT NOT NULL,
    name                  TEXT NOT NULL UNIQUE,
    plugin_class          TEXT NOT NULL,
    render_engine_name    TEXT,
    render_engine_class   TEXT
);

CREATE TABLE IF NOT EXISTS checkouts (
    id             TEXT PRIMARY KEY,
    revision_id    INTEGER NOT NULL REFERENCES revisions(id),
    serializer_id  INTEGER NOT NULL,
    username       TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database stored in a single file
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    /// Open (creating if needed) the database file and apply the schema
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let database = Self { path };
        database.migrate()?;
        Ok(database)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, mode: SessionMode) -> Result<Connection, StoreError> {
        let conn = match mode {
            SessionMode::ReadWrite => Connection::open(&self.path)?,
            SessionMode::ReadOnly => Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Create missing tables
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.connect(SessionMode::ReadWrite)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Find a project by name, creating it if needed
    pub fn ensure_project(&self, name: &str) -> Result<Project, StoreError> {
        let conn = self.connect(SessionMode::ReadWrite)?;

        let existing = conn
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE name = ?1",
                params![name],
                project_from_row,
            )
            .optional()?;
        if let Some(project) = existing {
            return Ok(project);
        }

        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO projects (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;

        Ok(Project {
            id: ProjectId(conn.last_insert_rowid()),
            name: name.to_string(),
            created_at,
        })
    }

    /// Store a new revision of a project with the given objects
    pub fn import_revision(
        &self,
        project_id: ProjectId,
        user: &str,
        comment: &str,
        objects: &[NewObject],
    ) -> Result<Revision, StoreError> {
        let mut conn = self.connect(SessionMode::ReadWrite)?;
        let tx = conn.transaction()?;

        let number: u32 = tx.query_row(
            "SELECT COALESCE(MAX(number), 0) + 1 FROM revisions WHERE project_id = ?1",
            params![project_id.0],
            |row| row.get(0),
        )?;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO revisions (project_id, number, user, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id.0, number, user, comment, created_at],
        )?;
        let revision_id = RevisionId(tx.last_insert_rowid());

        {
            let mut insert = tx.prepare(
                "INSERT INTO objects (revision_id, type_name, attributes) VALUES (?1, ?2, ?3)",
            )?;
            for object in objects {
                let attributes = serde_json::to_string(&object.attributes)?;
                insert.execute(params![revision_id.0, object.type_name, attributes])?;
            }
        }
        tx.commit()?;

        debug!(%revision_id, number, objects = objects.len(), "Imported revision");

        Ok(Revision {
            id: revision_id,
            project_id,
            number,
            user: user.to_string(),
            comment: comment.to_string(),
            created_at,
        })
    }

    pub fn add_plugin_configuration(&self, configuration: NewPluginConfiguration) -> Result<PluginConfiguration, StoreError> {
        let conn = self.connect(SessionMode::ReadWrite)?;
        let (engine_name, engine_class) = match &configuration.render_engine {
            Some(engine) => (Some(engine.name.as_str()), Some(engine.plugin_class.as_str())),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO plugin_configurations
                 (kind, name, plugin_class, render_engine_name, render_engine_class)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                configuration.kind,
                configuration.name,
                configuration.plugin_class,
                engine_name,
                engine_class
            ],
        )?;

        Ok(configuration.into_configuration(SerializerId(conn.last_insert_rowid())))
    }

    pub fn list_plugin_configurations(&self) -> Result<Vec<PluginConfiguration>, StoreError> {
        let conn = self.connect(SessionMode::ReadOnly)?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, name, plugin_class, render_engine_name, render_engine_class
             FROM plugin_configurations ORDER BY id",
        )?;
        let rows = stmt.query_map([], plugin_configuration_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_revisions(&self) -> Result<Vec<RevisionSummary>, StoreError> {
        let conn = self.connect(SessionMode::ReadOnly)?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.project_id, r.number, r.user, r.comment, r.created_at, p.name,
                    (SELECT COUNT(*) FROM objects o WHERE o.revision_id = r.id)
             FROM revisions r JOIN projects p ON p.id = r.project_id
             ORDER BY r.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RevisionSummary {
                revision: revision_from_row(row)?,
                project_name: row.get(6)?,
                object_count: row.get::<_, i64>(7)? as usize,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn checkouts(&self, revision_id: RevisionId) -> Result<Vec<CheckoutRecord>, StoreError> {
        let conn = self.connect(SessionMode::ReadOnly)?;
        let mut stmt = conn.prepare(
            "SELECT id, revision_id, serializer_id, username, created_at
             FROM checkouts WHERE revision_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![revision_id.0], |row| {
            let id: String = row.get(0)?;
            Ok(CheckoutRecord {
                id: id.parse().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                })?,
                revision_id: RevisionId(row.get(1)?),
                serializer_id: SerializerId(row.get(2)?),
                username: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl Database for SqliteDatabase {
    fn open_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(SqliteSession {
            conn: self.connect(mode)?,
            mode,
        }))
    }
}

struct SqliteSession {
    conn: Connection,
    mode: SessionMode,
}

impl Session for SqliteSession {
    fn mode(&self) -> SessionMode {
        self.mode
    }

    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError> {
        find_revision(&self.conn, id)
    }

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        find_project(&self.conn, id)
    }

    fn plugin_configuration(&mut self, id: SerializerId) -> Result<Option<PluginConfiguration>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, kind, name, plugin_class, render_engine_name, render_engine_class
                 FROM plugin_configurations WHERE id = ?1",
                params![id.0],
                plugin_configuration_from_row,
            )
            .optional()?)
    }

    fn execute_and_commit(self: Box<Self>, action: &dyn DatabaseAction) -> Result<Model, StoreError> {
        if self.mode == SessionMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }

        let mut session = *self;
        let tx = session.conn.transaction()?;
        // Dropping the transaction on error rolls it back
        let model = action.execute(&mut SqliteTransaction { conn: &tx })?;
        tx.commit()?;

        debug!(action = action.name(), "Committed transaction");
        Ok(model)
    }

    fn close(self: Box<Self>) {
        if let Err((_, e)) = self.conn.close() {
            debug!(error = %e, "Failed to close SQLite connection cleanly");
        }
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl Transaction for SqliteTransaction<'_> {
    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError> {
        find_revision(self.conn, id)
    }

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        find_project(self.conn, id)
    }

    fn objects(&mut self, revision_id: RevisionId) -> Result<Vec<StoredObject>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type_name, attributes FROM objects WHERE revision_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![revision_id.0], |row| {
            Ok(StoredObject {
                oid: row.get(0)?,
                type_name: row.get(1)?,
                attributes: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn record_checkout(&mut self, record: &CheckoutRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO checkouts (id, revision_id, serializer_id, username, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.revision_id.0,
                record.serializer_id.0,
                record.username,
                record.created_at
            ],
        )?;
        Ok(())
    }
}

fn find_revision(conn: &Connection, id: RevisionId) -> Result<Option<Revision>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, project_id, number, user, comment, created_at FROM revisions WHERE id = ?1",
            params![id.0],
            revision_from_row,
        )
        .optional()?)
}

fn find_project(conn: &Connection, id: ProjectId) -> Result<Option<Project>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, name, created_at FROM projects WHERE id = ?1",
            params![id.0],
            project_from_row,
        )
        .optional()?)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: ProjectId(row.get(0)?),
        name: row.get(1)?,
        created_at: row.get::<_, DateTime<Utc>>(2)?,
    })
}

fn revision_from_row(row: &Row<'_>) -> rusqlite::Result<Revision> {
    Ok(Revision {
        id: RevisionId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        number: row.get(2)?,
        user: row.get(3)?,
        comment: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn plugin_configuration_from_row(row: &Row<'_>) -> rusqlite::Result<PluginConfiguration> {
    let id = SerializerId(row.get(0)?);
    let engine_name: Option<String> = row.get(4)?;
    let engine_class: Option<String> = row.get(5)?;

    let configuration = NewPluginConfiguration {
        kind: row.get(1)?,
        name: row.get(2)?,
        plugin_class: row.get(3)?,
        render_engine: match (engine_name, engine_class) {
            (Some(name), Some(plugin_class)) => Some(RenderEngineConfiguration { name, plugin_class }),
            _ => None,
        },
    };

    Ok(configuration.into_configuration(id))
}
