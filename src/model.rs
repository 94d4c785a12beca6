//! Entity model: proxy hosts, certificates, upstream pools and their servers
//!
//! Inputs arrive as drafts and are validated exactly once, at the store
//! boundary (`EntityDraft::validate`). Everything downstream of the store
//! (renderer, coordinator) trusts the stored entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::StoreError;

/// Store-assigned identity
pub type EntityId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ProxyHost,
    Certificate,
    Upstream,
    UpstreamServer,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ProxyHost => "proxy_host",
            EntityKind::Certificate => "certificate",
            EntityKind::Upstream => "upstream",
            EntityKind::UpstreamServer => "upstream_server",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyHost {
    pub id: EntityId,
    /// Ordered, non-empty, normalized to lowercase
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    pub ssl_enabled: bool,
    pub certificate_id: Option<EntityId>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Certificate lifecycle. Transitions only move forward:
/// `pending -> active`, `active -> expired`, `active -> revoked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    #[default]
    Pending,
    Active,
    Expired,
    Revoked,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Active => "active",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Revoked => "revoked",
        }
    }

    /// Whether a stored certificate may move from `self` to `next`.
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, next: CertificateStatus) -> bool {
        use CertificateStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Active, Active)
                | (Expired, Expired)
                | (Revoked, Revoked)
                | (Pending, Active)
                | (Active, Expired)
                | (Active, Revoked)
        )
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CertificateStatus::Pending),
            "active" => Ok(CertificateStatus::Active),
            "expired" => Ok(CertificateStatus::Expired),
            "revoked" => Ok(CertificateStatus::Revoked),
            other => Err(format!("unknown certificate status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: EntityId,
    pub name: String,
    /// Issuing provider tag, e.g. `letsencrypt` or `custom`
    pub provider: String,
    pub domain_name: String,
    /// Subject alternative names covered in addition to `domain_name`
    #[serde(default)]
    pub alt_names: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub status: CertificateStatus,
}

impl Certificate {
    /// All names this certificate is valid for
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.domain_name.as_str()).chain(self.alt_names.iter().map(String::as_str))
    }

    /// Whether the certificate is valid for `domain`.
    ///
    /// A wildcard name `*.example.com` covers exactly one extra label:
    /// `a.example.com` but neither `example.com` nor `a.b.example.com`.
    pub fn covers(&self, domain: &str) -> bool {
        self.names().any(|name| name_covers(name, domain))
    }
}

fn name_covers(name: &str, domain: &str) -> bool {
    if name == domain {
        return true;
    }
    match name.strip_prefix("*.") {
        Some(base) => match domain.split_once('.') {
            Some((label, rest)) => !label.is_empty() && label != "*" && rest == base,
            None => false,
        },
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    #[serde(alias = "least_connections")]
    LeastConn,
    IpHash,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConn => "least_conn",
            Algorithm::IpHash => "ip_hash",
        }
    }

    /// The nginx directive selecting this algorithm, if any
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            Algorithm::RoundRobin => None,
            Algorithm::LeastConn => Some("least_conn"),
            Algorithm::IpHash => Some("ip_hash"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_conn" | "least_connections" => Ok(Algorithm::LeastConn),
            "ip_hash" => Ok(Algorithm::IpHash),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Up,
    Down,
    Draining,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Up => "up",
            ServerStatus::Down => "down",
            ServerStatus::Draining => "draining",
        }
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ServerStatus::Up),
            "down" => Ok(ServerStatus::Down),
            "draining" => Ok(ServerStatus::Draining),
            other => Err(format!("unknown server status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub id: EntityId,
    pub name: String,
    pub algorithm: Algorithm,
    pub description: String,
    /// Owned servers, in insertion order
    pub servers: Vec<UpstreamServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServer {
    pub id: EntityId,
    pub upstream_id: EntityId,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_fails: u32,
    pub status: ServerStatus,
}

/// Any stored entity, as returned by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    ProxyHost(ProxyHost),
    Certificate(Certificate),
    Upstream(Upstream),
    UpstreamServer(UpstreamServer),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::ProxyHost(h) => h.id,
            Entity::Certificate(c) => c.id,
            Entity::Upstream(u) => u.id,
            Entity::UpstreamServer(s) => s.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::ProxyHost(_) => EntityKind::ProxyHost,
            Entity::Certificate(_) => EntityKind::Certificate,
            Entity::Upstream(_) => EntityKind::Upstream,
            Entity::UpstreamServer(_) => EntityKind::UpstreamServer,
        }
    }
}

// ==================== Drafts ====================

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyHostDraft {
    pub domain_names: Vec<String>,
    pub forward_host: String,
    pub forward_port: u16,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default, alias = "ssl_cert_id")]
    pub certificate_id: Option<EntityId>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProxyHostDraft {
    pub fn validate(&mut self) -> Result<(), StoreError> {
        let kind = EntityKind::ProxyHost;

        if self.domain_names.is_empty() {
            return Err(StoreError::invalid(kind, "at least one domain name is required"));
        }

        let mut normalized: Vec<String> = Vec::with_capacity(self.domain_names.len());
        for name in &self.domain_names {
            let name = normalize_hostname(name, true).map_err(|e| StoreError::invalid(kind, e))?;
            if normalized.contains(&name) {
                return Err(StoreError::invalid(kind, format!("domain {} listed twice", name)));
            }
            normalized.push(name);
        }
        self.domain_names = normalized;

        self.forward_host =
            normalize_forward_host(&self.forward_host).map_err(|e| StoreError::invalid(kind, e))?;

        if self.forward_port == 0 {
            return Err(StoreError::invalid(kind, "forward_port must be between 1 and 65535"));
        }

        if self.ssl_enabled && self.certificate_id.is_none() {
            return Err(StoreError::invalid(kind, "ssl_enabled requires certificate_id"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertificateDraft {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub domain_name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub status: CertificateStatus,
}

impl CertificateDraft {
    pub fn validate(&mut self) -> Result<(), StoreError> {
        let kind = EntityKind::Certificate;

        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(StoreError::invalid(kind, "name must not be empty"));
        }

        self.provider = self.provider.trim().to_lowercase();
        if self.provider.is_empty() {
            return Err(StoreError::invalid(kind, "provider must not be empty"));
        }

        self.domain_name =
            normalize_hostname(&self.domain_name, true).map_err(|e| StoreError::invalid(kind, e))?;

        let mut alt_names = Vec::with_capacity(self.alt_names.len());
        for name in &self.alt_names {
            let name = normalize_hostname(name, true).map_err(|e| StoreError::invalid(kind, e))?;
            if name != self.domain_name && !alt_names.contains(&name) {
                alt_names.push(name);
            }
        }
        self.alt_names = alt_names;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamDraft {
    pub name: String,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub description: String,
    /// On create, the initial servers. On update, `None` keeps the current
    /// servers and `Some` replaces them.
    #[serde(default)]
    pub servers: Option<Vec<UpstreamServerDraft>>,
}

impl UpstreamDraft {
    pub fn validate(&mut self) -> Result<(), StoreError> {
        let kind = EntityKind::Upstream;

        self.name = self.name.trim().to_string();
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(StoreError::invalid(kind, "name must be 1-64 characters"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::invalid(
                kind,
                "name may only contain letters, digits, '-' and '_'",
            ));
        }

        if let Some(servers) = self.servers.as_mut() {
            for server in servers.iter_mut() {
                server.validate()?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamServerDraft {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(default)]
    pub status: ServerStatus,
}

impl UpstreamServerDraft {
    pub fn validate(&mut self) -> Result<(), StoreError> {
        let kind = EntityKind::UpstreamServer;

        self.host = normalize_forward_host(&self.host).map_err(|e| StoreError::invalid(kind, e))?;
        if self.port == 0 {
            return Err(StoreError::invalid(kind, "port must be between 1 and 65535"));
        }
        if self.weight == 0 {
            return Err(StoreError::invalid(kind, "weight must be a positive integer"));
        }
        Ok(())
    }
}

/// Closed set of entity inputs accepted by the store
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityDraft {
    ProxyHost(ProxyHostDraft),
    Certificate(CertificateDraft),
    Upstream(UpstreamDraft),
    UpstreamServer {
        upstream_id: EntityId,
        #[serde(flatten)]
        server: UpstreamServerDraft,
    },
}

impl EntityDraft {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityDraft::ProxyHost(_) => EntityKind::ProxyHost,
            EntityDraft::Certificate(_) => EntityKind::Certificate,
            EntityDraft::Upstream(_) => EntityKind::Upstream,
            EntityDraft::UpstreamServer { .. } => EntityKind::UpstreamServer,
        }
    }

    /// Normalize and check the draft's own fields. Cross-entity rules
    /// (uniqueness, references) are enforced by the store.
    pub fn validate(&mut self) -> Result<(), StoreError> {
        match self {
            EntityDraft::ProxyHost(d) => d.validate(),
            EntityDraft::Certificate(d) => d.validate(),
            EntityDraft::Upstream(d) => d.validate(),
            EntityDraft::UpstreamServer { server, .. } => server.validate(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "letsencrypt".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    3
}

// ==================== Helper Functions ====================

/// Normalize a DNS hostname (trim, lowercase, drop a trailing dot) and check
/// it label by label. With `allow_wildcard`, a single leading `*.` is accepted.
pub fn normalize_hostname(name: &str, allow_wildcard: bool) -> Result<String, String> {
    let name = name.trim().trim_end_matches('.').to_lowercase();

    if name.is_empty() {
        return Err("hostname cannot be empty".to_string());
    }
    if name.len() > 253 {
        return Err(format!("hostname too long: {}", name));
    }

    let rest = match name.strip_prefix("*.") {
        Some(rest) if allow_wildcard => rest,
        Some(_) => return Err(format!("wildcard not allowed here: {}", name)),
        None => name.as_str(),
    };

    for label in rest.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("invalid hostname: {}", name));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("hostname contains invalid characters: {}", name));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("hostname label may not start or end with '-': {}", name));
        }
    }

    Ok(name)
}

/// A proxy target or upstream server: an IP literal or a plain hostname.
/// IPv6 literals are stored without brackets.
pub fn normalize_forward_host(host: &str) -> Result<String, String> {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    normalize_hostname(trimmed, false)
}

/// Format `host:port` for nginx, bracketing IPv6 literals
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(domain: &str, alt: &[&str]) -> Certificate {
        Certificate {
            id: 1,
            name: "test".into(),
            provider: "custom".into(),
            domain_name: domain.into(),
            alt_names: alt.iter().map(|s| s.to_string()).collect(),
            expires_at: Utc::now(),
            status: CertificateStatus::Active,
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname(" Example.COM. ", false).unwrap(), "example.com");
        assert_eq!(normalize_hostname("*.example.com", true).unwrap(), "*.example.com");
        assert_eq!(normalize_hostname("localhost", false).unwrap(), "localhost");

        assert!(normalize_hostname("", false).is_err());
        assert!(normalize_hostname("*.example.com", false).is_err());
        assert!(normalize_hostname("a.*.example.com", true).is_err());
        assert!(normalize_hostname("-bad.example.com", false).is_err());
        assert!(normalize_hostname("bad-.example.com", false).is_err());
        assert!(normalize_hostname("a..example.com", false).is_err());
        assert!(normalize_hostname("under_score.com", false).is_err());
        assert!(normalize_hostname(&format!("{}.com", "a".repeat(64)), false).is_err());
    }

    #[test]
    fn test_normalize_forward_host() {
        assert_eq!(normalize_forward_host("10.0.0.5").unwrap(), "10.0.0.5");
        assert_eq!(normalize_forward_host("[::1]").unwrap(), "::1");
        assert_eq!(normalize_forward_host("App.Internal").unwrap(), "app.internal");
        assert!(normalize_forward_host("*.internal").is_err());
        assert!(normalize_forward_host("bad host").is_err());
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("10.0.0.5", 8080), "10.0.0.5:8080");
        assert_eq!(host_port("::1", 8080), "[::1]:8080");
        assert_eq!(host_port("app", 80), "app:80");
    }

    #[test]
    fn test_certificate_coverage() {
        let c = cert("example.com", &["www.example.com"]);
        assert!(c.covers("example.com"));
        assert!(c.covers("www.example.com"));
        assert!(!c.covers("api.example.com"));

        let wild = cert("*.example.com", &[]);
        assert!(wild.covers("api.example.com"));
        assert!(wild.covers("*.example.com"));
        assert!(!wild.covers("example.com"));
        assert!(!wild.covers("a.b.example.com"));
        assert!(!wild.covers("api.example.org"));
    }

    #[test]
    fn test_certificate_transitions() {
        use CertificateStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Revoked));
        assert!(Active.can_transition_to(Active));

        assert!(!Active.can_transition_to(Pending));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Revoked.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Expired));
    }

    #[test]
    fn test_proxy_host_draft_validation() {
        let mut draft = ProxyHostDraft {
            domain_names: vec!["A.Example.com".into(), "b.example.com".into()],
            forward_host: "127.0.0.1".into(),
            forward_port: 8080,
            ssl_enabled: false,
            certificate_id: None,
            enabled: true,
        };
        draft.validate().unwrap();
        assert_eq!(draft.domain_names, vec!["a.example.com", "b.example.com"]);

        let mut dup = draft.clone();
        dup.domain_names = vec!["a.example.com".into(), "A.EXAMPLE.COM".into()];
        assert!(dup.validate().is_err());

        let mut empty = draft.clone();
        empty.domain_names.clear();
        assert!(empty.validate().is_err());

        let mut ssl = draft.clone();
        ssl.ssl_enabled = true;
        assert!(ssl.validate().is_err());

        let mut port = draft;
        port.forward_port = 0;
        assert!(port.validate().is_err());
    }

    #[test]
    fn test_upstream_draft_validation() {
        let mut draft: UpstreamDraft = serde_json::from_str(
            r#"{"name": "backend", "algorithm": "least_conn",
                "servers": [{"host": "10.0.0.1", "port": 8080}]}"#,
        )
        .unwrap();
        draft.validate().unwrap();
        assert_eq!(draft.algorithm, Algorithm::LeastConn);
        let servers = draft.servers.unwrap();
        assert_eq!(servers[0].weight, 1);
        assert_eq!(servers[0].max_fails, 3);
        assert_eq!(servers[0].status, ServerStatus::Up);

        let mut bad: UpstreamDraft = serde_json::from_str(r#"{"name": "has space"}"#).unwrap();
        assert!(bad.validate().is_err());

        let mut zero_weight: UpstreamDraft = serde_json::from_str(
            r#"{"name": "backend", "servers": [{"host": "a", "port": 1, "weight": 0}]}"#,
        )
        .unwrap();
        assert!(zero_weight.validate().is_err());
    }

    #[test]
    fn test_entity_draft_tagging() {
        let draft: EntityDraft = serde_json::from_str(
            r#"{"kind": "upstream_server", "upstream_id": 4, "host": "10.0.0.2", "port": 81}"#,
        )
        .unwrap();
        assert_eq!(draft.kind(), EntityKind::UpstreamServer);
        match draft {
            EntityDraft::UpstreamServer { upstream_id, server } => {
                assert_eq!(upstream_id, 4);
                assert_eq!(server.port, 81);
            }
            other => panic!("unexpected draft {:?}", other),
        }
    }

    #[test]
    fn test_certificate_draft_dedupes_alt_names() {
        let mut draft: CertificateDraft = serde_json::from_str(
            r#"{"name": " main ", "domain_name": "example.com",
                "alt_names": ["EXAMPLE.com", "www.example.com", "www.example.com"],
                "expires_at": "2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        draft.validate().unwrap();
        assert_eq!(draft.name, "main");
        assert_eq!(draft.provider, "letsencrypt");
        assert_eq!(draft.alt_names, vec!["www.example.com"]);
        assert_eq!(draft.status, CertificateStatus::Pending);
    }
}
