//! SQLite-backed entity store
//!
//! A single connection guarded by a mutex. Every write runs in one
//! transaction that also bumps the revision counters of the kinds it
//! touched, so a snapshot and its version vector always agree.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{
    Certificate, CertificateDraft, CertificateStatus, Entity, EntityDraft, EntityId, EntityKind,
    ProxyHost, ProxyHostDraft, Upstream, UpstreamDraft, UpstreamServer, UpstreamServerDraft,
};
use crate::store::{Committed, EntityStore, Snapshot, VersionVector};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const PROXY_HOST_COLUMNS: &str =
    "id, domain_names, forward_host, forward_port, ssl_enabled, certificate_id, enabled, created_at";
const CERTIFICATE_COLUMNS: &str =
    "id, name, provider, domain_name, alt_names, expires_at, status";
const UPSTREAM_COLUMNS: &str = "id, name, algorithm, description";
const SERVER_COLUMNS: &str = "id, upstream_id, host, port, weight, max_fails, status";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: entity tables
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: entity tables");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS certificates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                domain_name TEXT NOT NULL,
                alt_names TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS proxy_hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_names TEXT NOT NULL,
                forward_host TEXT NOT NULL,
                forward_port INTEGER NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                certificate_id INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                FOREIGN KEY (certificate_id) REFERENCES certificates(id) ON DELETE RESTRICT
            );

            CREATE TABLE IF NOT EXISTS upstreams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                algorithm TEXT NOT NULL DEFAULT 'round_robin',
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS upstream_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                upstream_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                max_fails INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL DEFAULT 'up',
                FOREIGN KEY (upstream_id) REFERENCES upstreams(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_proxy_hosts_certificate ON proxy_hosts(certificate_id);
            CREATE INDEX IF NOT EXISTS idx_upstream_servers_upstream ON upstream_servers(upstream_id, position);
            CREATE INDEX IF NOT EXISTS idx_certificates_status ON certificates(status);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: per-kind revision counters
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: revision counters");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS entity_revisions (
                kind TEXT PRIMARY KEY,
                revision INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO entity_revisions (kind) VALUES
                ('proxy_host'), ('certificate'), ('upstream'), ('upstream_server');

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    /// Run `f` inside a write transaction and bump the counters of `touched`
    /// before committing.
    fn write<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<(T, Vec<EntityKind>), StoreError>,
    ) -> Result<Committed<T>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (value, touched) = f(&tx)?;
        for kind in &touched {
            tx.execute(
                "UPDATE entity_revisions SET revision = revision + 1 WHERE kind = ?1",
                params![kind.as_str()],
            )?;
        }
        let revision = read_versions(&tx)?.logical_time();
        tx.commit()?;
        Ok(Committed { value, revision })
    }
}

impl EntityStore for Database {
    fn get_snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let snapshot = Snapshot {
            proxy_hosts: load_proxy_hosts(&tx)?,
            certificates: load_certificates(&tx)?,
            upstreams: load_upstreams(&tx)?,
            versions: read_versions(&tx)?,
        };
        tx.commit()?;
        Ok(snapshot)
    }

    fn get(&self, kind: EntityKind, id: EntityId) -> Result<Entity, StoreError> {
        let conn = self.conn.lock();
        let found = match kind {
            EntityKind::ProxyHost => find_proxy_host(&conn, id)?.map(Entity::ProxyHost),
            EntityKind::Certificate => find_certificate(&conn, id)?.map(Entity::Certificate),
            EntityKind::Upstream => find_upstream(&conn, id)?.map(Entity::Upstream),
            EntityKind::UpstreamServer => find_server(&conn, id)?.map(Entity::UpstreamServer),
        };
        found.ok_or(StoreError::NotFound { kind, id })
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        let conn = self.conn.lock();
        let entities = match kind {
            EntityKind::ProxyHost => load_proxy_hosts(&conn)?
                .into_iter()
                .map(Entity::ProxyHost)
                .collect(),
            EntityKind::Certificate => load_certificates(&conn)?
                .into_iter()
                .map(Entity::Certificate)
                .collect(),
            EntityKind::Upstream => load_upstreams(&conn)?
                .into_iter()
                .map(Entity::Upstream)
                .collect(),
            EntityKind::UpstreamServer => load_all_servers(&conn)?
                .into_iter()
                .map(Entity::UpstreamServer)
                .collect(),
        };
        Ok(entities)
    }

    fn create(&self, mut draft: EntityDraft) -> Result<Committed<Entity>, StoreError> {
        draft.validate()?;

        let committed = self.write(|conn| match draft {
            EntityDraft::ProxyHost(d) => {
                let host = insert_proxy_host(conn, &d)?;
                Ok((Entity::ProxyHost(host), vec![EntityKind::ProxyHost]))
            }
            EntityDraft::Certificate(d) => {
                let cert = insert_certificate(conn, &d)?;
                Ok((Entity::Certificate(cert), vec![EntityKind::Certificate]))
            }
            EntityDraft::Upstream(d) => {
                let mut touched = vec![EntityKind::Upstream];
                if d.servers.as_ref().is_some_and(|s| !s.is_empty()) {
                    touched.push(EntityKind::UpstreamServer);
                }
                let upstream = insert_upstream(conn, &d)?;
                Ok((Entity::Upstream(upstream), touched))
            }
            EntityDraft::UpstreamServer {
                upstream_id,
                server,
            } => {
                let server = insert_server(conn, upstream_id, &server)?;
                Ok((Entity::UpstreamServer(server), vec![EntityKind::UpstreamServer]))
            }
        })?;

        debug!(
            kind = %committed.value.kind(),
            id = committed.value.id(),
            revision = committed.revision,
            "Entity created"
        );
        Ok(committed)
    }

    fn update(&self, id: EntityId, mut draft: EntityDraft) -> Result<Committed<Entity>, StoreError> {
        draft.validate()?;

        let committed = self.write(|conn| match draft {
            EntityDraft::ProxyHost(d) => {
                let host = update_proxy_host(conn, id, &d)?;
                Ok((Entity::ProxyHost(host), vec![EntityKind::ProxyHost]))
            }
            EntityDraft::Certificate(d) => {
                let cert = update_certificate(conn, id, &d)?;
                Ok((Entity::Certificate(cert), vec![EntityKind::Certificate]))
            }
            EntityDraft::Upstream(d) => {
                let mut touched = vec![EntityKind::Upstream];
                if d.servers.is_some() {
                    touched.push(EntityKind::UpstreamServer);
                }
                let upstream = update_upstream(conn, id, &d)?;
                Ok((Entity::Upstream(upstream), touched))
            }
            EntityDraft::UpstreamServer {
                upstream_id,
                server,
            } => {
                let server = update_server(conn, upstream_id, id, &server)?;
                Ok((Entity::UpstreamServer(server), vec![EntityKind::UpstreamServer]))
            }
        })?;

        debug!(
            kind = %committed.value.kind(),
            id,
            revision = committed.revision,
            "Entity updated"
        );
        Ok(committed)
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> Result<Committed<()>, StoreError> {
        let committed = self.write(|conn| {
            let touched = match kind {
                EntityKind::ProxyHost => {
                    delete_row(conn, "proxy_hosts", kind, id)?;
                    vec![EntityKind::ProxyHost]
                }
                EntityKind::Certificate => {
                    let users: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM proxy_hosts WHERE certificate_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )?;
                    if users > 0 {
                        return Err(StoreError::Conflict(format!(
                            "certificate {} is used by {} proxy host(s)",
                            id, users
                        )));
                    }
                    delete_row(conn, "certificates", kind, id)?;
                    vec![EntityKind::Certificate]
                }
                EntityKind::Upstream => {
                    let servers: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM upstream_servers WHERE upstream_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )?;
                    delete_row(conn, "upstreams", kind, id)?;
                    if servers > 0 {
                        vec![EntityKind::Upstream, EntityKind::UpstreamServer]
                    } else {
                        vec![EntityKind::Upstream]
                    }
                }
                EntityKind::UpstreamServer => {
                    delete_row(conn, "upstream_servers", kind, id)?;
                    vec![EntityKind::UpstreamServer]
                }
            };
            Ok(((), touched))
        })?;

        debug!(kind = %kind, id, revision = committed.revision, "Entity deleted");
        Ok(committed)
    }

    fn revision(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        Ok(read_versions(&conn)?.logical_time())
    }

    fn expire_certificates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Committed<Vec<EntityId>>, StoreError> {
        self.write(|conn| {
            let expired: Vec<EntityId> = load_certificates(conn)?
                .into_iter()
                .filter(|c| c.status == CertificateStatus::Active && c.expires_at <= now)
                .map(|c| c.id)
                .collect();

            for id in &expired {
                conn.execute(
                    "UPDATE certificates SET status = 'expired' WHERE id = ?1",
                    params![id],
                )?;
            }

            let touched = if expired.is_empty() {
                Vec::new()
            } else {
                vec![EntityKind::Certificate]
            };
            Ok((expired, touched))
        })
    }
}

// ==================== Row mapping ====================

fn read_versions(conn: &Connection) -> Result<VersionVector, StoreError> {
    let mut stmt = conn.prepare("SELECT kind, revision FROM entity_revisions")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut versions = VersionVector::default();
    for (kind, revision) in rows {
        let revision = u64::try_from(revision).unwrap_or(0);
        match kind.as_str() {
            "proxy_host" => versions.proxy_hosts = revision,
            "certificate" => versions.certificates = revision,
            "upstream" => versions.upstreams = revision,
            "upstream_server" => versions.upstream_servers = revision,
            other => return Err(StoreError::Corrupt(format!("unknown revision kind {}", other))),
        }
    }
    Ok(versions)
}

fn parsed_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn names_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn names_json(names: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(names).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn proxy_host_from_row(row: &Row<'_>) -> rusqlite::Result<ProxyHost> {
    Ok(ProxyHost {
        id: row.get(0)?,
        domain_names: names_column(row, 1)?,
        forward_host: row.get(2)?,
        forward_port: row.get(3)?,
        ssl_enabled: row.get(4)?,
        certificate_id: row.get(5)?,
        enabled: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn certificate_from_row(row: &Row<'_>) -> rusqlite::Result<Certificate> {
    Ok(Certificate {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        domain_name: row.get(3)?,
        alt_names: names_column(row, 4)?,
        expires_at: row.get(5)?,
        status: parsed_column(row, 6)?,
    })
}

fn upstream_from_row(row: &Row<'_>) -> rusqlite::Result<Upstream> {
    Ok(Upstream {
        id: row.get(0)?,
        name: row.get(1)?,
        algorithm: parsed_column(row, 2)?,
        description: row.get(3)?,
        servers: Vec::new(),
    })
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<UpstreamServer> {
    Ok(UpstreamServer {
        id: row.get(0)?,
        upstream_id: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        weight: row.get(4)?,
        max_fails: row.get(5)?,
        status: parsed_column(row, 6)?,
    })
}

// ==================== Queries ====================

fn load_proxy_hosts(conn: &Connection) -> Result<Vec<ProxyHost>, StoreError> {
    let sql = format!("SELECT {} FROM proxy_hosts ORDER BY id", PROXY_HOST_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let hosts = stmt
        .query_map([], proxy_host_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hosts)
}

fn find_proxy_host(conn: &Connection, id: EntityId) -> Result<Option<ProxyHost>, StoreError> {
    let sql = format!("SELECT {} FROM proxy_hosts WHERE id = ?1", PROXY_HOST_COLUMNS);
    Ok(conn.query_row(&sql, params![id], proxy_host_from_row).optional()?)
}

fn load_certificates(conn: &Connection) -> Result<Vec<Certificate>, StoreError> {
    let sql = format!("SELECT {} FROM certificates ORDER BY id", CERTIFICATE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let certs = stmt
        .query_map([], certificate_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn find_certificate(conn: &Connection, id: EntityId) -> Result<Option<Certificate>, StoreError> {
    let sql = format!("SELECT {} FROM certificates WHERE id = ?1", CERTIFICATE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], certificate_from_row).optional()?)
}

fn load_all_servers(conn: &Connection) -> Result<Vec<UpstreamServer>, StoreError> {
    let sql = format!(
        "SELECT {} FROM upstream_servers ORDER BY upstream_id, position, id",
        SERVER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let servers = stmt
        .query_map([], server_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(servers)
}

fn load_servers(conn: &Connection, upstream_id: EntityId) -> Result<Vec<UpstreamServer>, StoreError> {
    let sql = format!(
        "SELECT {} FROM upstream_servers WHERE upstream_id = ?1 ORDER BY position, id",
        SERVER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let servers = stmt
        .query_map(params![upstream_id], server_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(servers)
}

fn find_server(conn: &Connection, id: EntityId) -> Result<Option<UpstreamServer>, StoreError> {
    let sql = format!("SELECT {} FROM upstream_servers WHERE id = ?1", SERVER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], server_from_row).optional()?)
}

fn load_upstreams(conn: &Connection) -> Result<Vec<Upstream>, StoreError> {
    let sql = format!("SELECT {} FROM upstreams ORDER BY name", UPSTREAM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut upstreams = stmt
        .query_map([], upstream_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_upstream: HashMap<EntityId, Vec<UpstreamServer>> = HashMap::new();
    for server in load_all_servers(conn)? {
        by_upstream.entry(server.upstream_id).or_default().push(server);
    }
    for upstream in &mut upstreams {
        upstream.servers = by_upstream.remove(&upstream.id).unwrap_or_default();
    }
    Ok(upstreams)
}

fn find_upstream(conn: &Connection, id: EntityId) -> Result<Option<Upstream>, StoreError> {
    let sql = format!("SELECT {} FROM upstreams WHERE id = ?1", UPSTREAM_COLUMNS);
    let upstream = conn.query_row(&sql, params![id], upstream_from_row).optional()?;
    match upstream {
        Some(mut upstream) => {
            upstream.servers = load_servers(conn, id)?;
            Ok(Some(upstream))
        }
        None => Ok(None),
    }
}

fn delete_row(conn: &Connection, table: &str, kind: EntityKind, id: EntityId) -> Result<(), StoreError> {
    let deleted = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![id])?;
    if deleted == 0 {
        return Err(StoreError::NotFound { kind, id });
    }
    Ok(())
}

// ==================== Proxy hosts ====================

fn check_certificate_ref(conn: &Connection, certificate_id: Option<EntityId>) -> Result<(), StoreError> {
    if let Some(id) = certificate_id {
        if find_certificate(conn, id)?.is_none() {
            return Err(StoreError::invalid(
                EntityKind::ProxyHost,
                format!("certificate {} does not exist", id),
            ));
        }
    }
    Ok(())
}

/// Enabled hosts may not share a domain name
fn check_domain_conflicts(
    conn: &Connection,
    domains: &[String],
    exclude: Option<EntityId>,
) -> Result<(), StoreError> {
    for host in load_proxy_hosts(conn)? {
        if !host.enabled || Some(host.id) == exclude {
            continue;
        }
        if let Some(domain) = domains.iter().find(|d| host.domain_names.contains(d)) {
            return Err(StoreError::Conflict(format!(
                "domain {} is already used by proxy host {}",
                domain, host.id
            )));
        }
    }
    Ok(())
}

fn insert_proxy_host(conn: &Connection, d: &ProxyHostDraft) -> Result<ProxyHost, StoreError> {
    check_certificate_ref(conn, d.certificate_id)?;
    if d.enabled {
        check_domain_conflicts(conn, &d.domain_names, None)?;
    }

    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO proxy_hosts
            (domain_names, forward_host, forward_port, ssl_enabled, certificate_id, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            names_json(&d.domain_names)?,
            d.forward_host,
            d.forward_port,
            d.ssl_enabled,
            d.certificate_id,
            d.enabled,
            created_at,
        ],
    )?;

    Ok(ProxyHost {
        id: conn.last_insert_rowid(),
        domain_names: d.domain_names.clone(),
        forward_host: d.forward_host.clone(),
        forward_port: d.forward_port,
        ssl_enabled: d.ssl_enabled,
        certificate_id: d.certificate_id,
        enabled: d.enabled,
        created_at,
    })
}

fn update_proxy_host(conn: &Connection, id: EntityId, d: &ProxyHostDraft) -> Result<ProxyHost, StoreError> {
    let existing = find_proxy_host(conn, id)?.ok_or(StoreError::NotFound {
        kind: EntityKind::ProxyHost,
        id,
    })?;

    check_certificate_ref(conn, d.certificate_id)?;
    if d.enabled {
        check_domain_conflicts(conn, &d.domain_names, Some(id))?;
    }

    conn.execute(
        "UPDATE proxy_hosts SET domain_names = ?1, forward_host = ?2, forward_port = ?3,
            ssl_enabled = ?4, certificate_id = ?5, enabled = ?6
         WHERE id = ?7",
        params![
            names_json(&d.domain_names)?,
            d.forward_host,
            d.forward_port,
            d.ssl_enabled,
            d.certificate_id,
            d.enabled,
            id,
        ],
    )?;

    Ok(ProxyHost {
        id,
        domain_names: d.domain_names.clone(),
        forward_host: d.forward_host.clone(),
        forward_port: d.forward_port,
        ssl_enabled: d.ssl_enabled,
        certificate_id: d.certificate_id,
        enabled: d.enabled,
        created_at: existing.created_at,
    })
}

// ==================== Certificates ====================

fn insert_certificate(conn: &Connection, d: &CertificateDraft) -> Result<Certificate, StoreError> {
    if !matches!(d.status, CertificateStatus::Pending | CertificateStatus::Active) {
        return Err(StoreError::invalid(
            EntityKind::Certificate,
            format!("a new certificate cannot start as {}", d.status),
        ));
    }

    conn.execute(
        "INSERT INTO certificates (name, provider, domain_name, alt_names, expires_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            d.name,
            d.provider,
            d.domain_name,
            names_json(&d.alt_names)?,
            d.expires_at,
            d.status.as_str(),
        ],
    )?;

    Ok(Certificate {
        id: conn.last_insert_rowid(),
        name: d.name.clone(),
        provider: d.provider.clone(),
        domain_name: d.domain_name.clone(),
        alt_names: d.alt_names.clone(),
        expires_at: d.expires_at,
        status: d.status,
    })
}

fn update_certificate(conn: &Connection, id: EntityId, d: &CertificateDraft) -> Result<Certificate, StoreError> {
    let existing = find_certificate(conn, id)?.ok_or(StoreError::NotFound {
        kind: EntityKind::Certificate,
        id,
    })?;

    if !existing.status.can_transition_to(d.status) {
        return Err(StoreError::invalid(
            EntityKind::Certificate,
            format!("cannot move certificate {} from {} to {}", id, existing.status, d.status),
        ));
    }

    conn.execute(
        "UPDATE certificates SET name = ?1, provider = ?2, domain_name = ?3, alt_names = ?4,
            expires_at = ?5, status = ?6
         WHERE id = ?7",
        params![
            d.name,
            d.provider,
            d.domain_name,
            names_json(&d.alt_names)?,
            d.expires_at,
            d.status.as_str(),
            id,
        ],
    )?;

    Ok(Certificate {
        id,
        name: d.name.clone(),
        provider: d.provider.clone(),
        domain_name: d.domain_name.clone(),
        alt_names: d.alt_names.clone(),
        expires_at: d.expires_at,
        status: d.status,
    })
}

// ==================== Upstreams ====================

fn check_upstream_name(conn: &Connection, name: &str, exclude: Option<EntityId>) -> Result<(), StoreError> {
    let existing: Option<EntityId> = conn
        .query_row(
            "SELECT id FROM upstreams WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(other) if Some(other) != exclude => Err(StoreError::Conflict(format!(
            "upstream {} already exists",
            name
        ))),
        _ => Ok(()),
    }
}

fn insert_servers(
    conn: &Connection,
    upstream_id: EntityId,
    servers: &[UpstreamServerDraft],
) -> Result<(), StoreError> {
    for server in servers {
        insert_server(conn, upstream_id, server)?;
    }
    Ok(())
}

fn insert_upstream(conn: &Connection, d: &UpstreamDraft) -> Result<Upstream, StoreError> {
    check_upstream_name(conn, &d.name, None)?;

    conn.execute(
        "INSERT INTO upstreams (name, algorithm, description) VALUES (?1, ?2, ?3)",
        params![d.name, d.algorithm.as_str(), d.description],
    )?;
    let id = conn.last_insert_rowid();

    if let Some(servers) = &d.servers {
        insert_servers(conn, id, servers)?;
    }

    find_upstream(conn, id)?.ok_or(StoreError::NotFound {
        kind: EntityKind::Upstream,
        id,
    })
}

fn update_upstream(conn: &Connection, id: EntityId, d: &UpstreamDraft) -> Result<Upstream, StoreError> {
    if find_upstream(conn, id)?.is_none() {
        return Err(StoreError::NotFound {
            kind: EntityKind::Upstream,
            id,
        });
    }
    check_upstream_name(conn, &d.name, Some(id))?;

    conn.execute(
        "UPDATE upstreams SET name = ?1, algorithm = ?2, description = ?3 WHERE id = ?4",
        params![d.name, d.algorithm.as_str(), d.description, id],
    )?;

    if let Some(servers) = &d.servers {
        conn.execute(
            "DELETE FROM upstream_servers WHERE upstream_id = ?1",
            params![id],
        )?;
        insert_servers(conn, id, servers)?;
    }

    find_upstream(conn, id)?.ok_or(StoreError::NotFound {
        kind: EntityKind::Upstream,
        id,
    })
}

fn insert_server(
    conn: &Connection,
    upstream_id: EntityId,
    d: &UpstreamServerDraft,
) -> Result<UpstreamServer, StoreError> {
    let exists: Option<EntityId> = conn
        .query_row(
            "SELECT id FROM upstreams WHERE id = ?1",
            params![upstream_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::NotFound {
            kind: EntityKind::Upstream,
            id: upstream_id,
        });
    }

    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM upstream_servers WHERE upstream_id = ?1",
        params![upstream_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO upstream_servers (upstream_id, position, host, port, weight, max_fails, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            upstream_id,
            position,
            d.host,
            d.port,
            d.weight,
            d.max_fails,
            d.status.as_str(),
        ],
    )?;

    Ok(UpstreamServer {
        id: conn.last_insert_rowid(),
        upstream_id,
        host: d.host.clone(),
        port: d.port,
        weight: d.weight,
        max_fails: d.max_fails,
        status: d.status,
    })
}

fn update_server(
    conn: &Connection,
    upstream_id: EntityId,
    id: EntityId,
    d: &UpstreamServerDraft,
) -> Result<UpstreamServer, StoreError> {
    match find_server(conn, id)? {
        Some(existing) if existing.upstream_id == upstream_id => {}
        _ => {
            return Err(StoreError::NotFound {
                kind: EntityKind::UpstreamServer,
                id,
            })
        }
    }

    conn.execute(
        "UPDATE upstream_servers SET host = ?1, port = ?2, weight = ?3, max_fails = ?4, status = ?5
         WHERE id = ?6",
        params![d.host, d.port, d.weight, d.max_fails, d.status.as_str(), id],
    )?;

    Ok(UpstreamServer {
        id,
        upstream_id,
        host: d.host.clone(),
        port: d.port,
        weight: d.weight,
        max_fails: d.max_fails,
        status: d.status,
    })
}
