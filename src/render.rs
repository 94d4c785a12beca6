//! Config renderer
//!
//! `render` is a pure function from a store snapshot to a complete
//! `nginx.conf`. The fingerprint hashes the canonical render input, not the
//! output text, so formatting changes never make identical state look new.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::config::RenderOptions;
use crate::error::RenderError;
use crate::model::{host_port, Certificate, CertificateStatus, ProxyHost, ServerStatus, Upstream};
use crate::store::Snapshot;

const FINGERPRINT_MARKER: &str = "# fingerprint: ";

/// Hex SHA-256 of the canonical render input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for file names and log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// Recover the fingerprint from the header of a rendered document
    pub fn from_config_text(text: &str) -> Option<Self> {
        text.lines()
            .take_while(|line| line.starts_with('#'))
            .find_map(|line| line.strip_prefix(FINGERPRINT_MARKER))
            .map(str::trim)
            .filter(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|hex| Fingerprint(hex.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable result of a render
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub fingerprint: Fingerprint,
    pub text: String,
}

#[derive(Serialize)]
struct CanonicalInput<'a> {
    options: &'a RenderOptions,
    proxy_hosts: &'a [&'a ProxyHost],
    upstreams: &'a [&'a Upstream],
    certificates: &'a [&'a Certificate],
}

pub fn render(snapshot: &Snapshot, options: &RenderOptions) -> Result<RenderedConfig, RenderError> {
    let mut hosts: Vec<&ProxyHost> = snapshot.proxy_hosts.iter().filter(|h| h.enabled).collect();
    hosts.sort_by_key(|h| h.id);

    let mut upstreams: Vec<&Upstream> = snapshot.upstreams.iter().collect();
    upstreams.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    check_domains(&hosts)?;

    if let Some(empty) = upstreams.iter().find(|u| u.servers.is_empty()) {
        return Err(RenderError::EmptyUpstream(empty.name.clone()));
    }

    let certificates = resolve_certificates(&hosts, snapshot)?;

    let canonical = CanonicalInput {
        options,
        proxy_hosts: &hosts,
        upstreams: &upstreams,
        certificates: &certificates,
    };
    let encoded =
        serde_json::to_vec(&canonical).map_err(|e| RenderError::Canonicalize(e.to_string()))?;
    let fingerprint = Fingerprint(hex::encode(Sha256::digest(&encoded)));

    let text = ConfigWriter::document(&fingerprint, options, &hosts, &upstreams);

    Ok(RenderedConfig { fingerprint, text })
}

fn check_domains(hosts: &[&ProxyHost]) -> Result<(), RenderError> {
    let mut seen: HashMap<&str, i64> = HashMap::new();
    for host in hosts {
        for domain in &host.domain_names {
            if seen.insert(domain.as_str(), host.id).is_some() {
                return Err(RenderError::DuplicateDomain(domain.clone()));
            }
        }
    }
    Ok(())
}

/// Every SSL host must point at an active certificate covering all of its
/// domains. Returns the referenced certificates ordered by id.
fn resolve_certificates<'a>(
    hosts: &[&ProxyHost],
    snapshot: &'a Snapshot,
) -> Result<Vec<&'a Certificate>, RenderError> {
    let mut used = BTreeSet::new();

    for host in hosts.iter().filter(|h| h.ssl_enabled) {
        let certificate_id = host
            .certificate_id
            .ok_or(RenderError::MissingCertificate { host_id: host.id })?;

        let cert = snapshot
            .certificate(certificate_id)
            .ok_or(RenderError::CertificateNotFound {
                host_id: host.id,
                certificate_id,
            })?;

        if cert.status != CertificateStatus::Active {
            return Err(RenderError::CertificateNotActive {
                host_id: host.id,
                certificate_id,
                status: cert.status.to_string(),
            });
        }

        if let Some(domain) = host.domain_names.iter().find(|d| !cert.covers(d)) {
            return Err(RenderError::CertificateCoverage {
                host_id: host.id,
                certificate_id,
                domain: domain.clone(),
            });
        }

        used.insert(certificate_id);
    }

    Ok(used
        .into_iter()
        .filter_map(|id| snapshot.certificate(id))
        .collect())
}

/// Indentation-aware line writer
struct ConfigWriter<'a> {
    out: String,
    depth: usize,
    options: &'a RenderOptions,
}

impl<'a> ConfigWriter<'a> {
    fn document(
        fingerprint: &Fingerprint,
        options: &'a RenderOptions,
        hosts: &[&ProxyHost],
        upstreams: &[&Upstream],
    ) -> String {
        let mut w = ConfigWriter {
            out: String::with_capacity(4096),
            depth: 0,
            options,
        };

        w.line("# Managed by balancer-studio. Manual edits are replaced on the next apply.");
        w.line(format!("{}{}", FINGERPRINT_MARKER, fingerprint));
        w.blank();
        w.line("worker_processes auto;");
        if let Some(pid) = &options.pid_file {
            w.line(format!("pid {};", pid));
        }
        w.blank();
        w.open("events");
        w.line(format!("worker_connections {};", options.worker_connections));
        w.close();
        w.blank();

        w.open("http");
        w.open("map $http_upgrade $connection_upgrade");
        w.line("default upgrade;");
        w.line("'' close;");
        w.close();

        for upstream in upstreams {
            w.blank();
            w.upstream(upstream);
        }

        for host in hosts {
            w.blank();
            w.proxy_host(host);
        }

        if let Some(listen) = &options.status_listen {
            w.blank();
            w.status_server(listen);
        }
        w.close();

        w.out
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn open(&mut self, header: impl AsRef<str>) {
        self.line(format!("{} {{", header.as_ref()));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    fn upstream(&mut self, upstream: &Upstream) {
        self.open(format!("upstream {}", upstream.name));
        if let Some(directive) = upstream.algorithm.directive() {
            self.line(format!("{};", directive));
        }
        for server in &upstream.servers {
            // nginx has no drain state; draining servers stop taking new work
            let down = match server.status {
                ServerStatus::Up => "",
                ServerStatus::Down | ServerStatus::Draining => " down",
            };
            self.line(format!(
                "server {} weight={} max_fails={}{};",
                host_port(&server.host, server.port),
                server.weight,
                server.max_fails,
                down
            ));
        }
        self.close();
    }

    fn proxy_host(&mut self, host: &ProxyHost) {
        let options = self.options;
        let server_names = host.domain_names.join(" ");
        self.line(format!("# proxy host {}", host.id));

        if host.ssl_enabled {
            self.open("server");
            self.line(format!("listen {};", options.http_port));
            self.line(format!("server_name {};", server_names));
            self.line("return 301 https://$host$request_uri;");
            self.close();

            self.open("server");
            self.line(format!("listen {} ssl;", options.https_port));
            self.line(format!("server_name {};", server_names));
            if let Some(cert_id) = host.certificate_id {
                let dir = options.certificate_dir.trim_end_matches('/');
                self.line(format!("ssl_certificate {}/{}/fullchain.pem;", dir, cert_id));
                self.line(format!("ssl_certificate_key {}/{}/privkey.pem;", dir, cert_id));
            }
        } else {
            self.open("server");
            self.line(format!("listen {};", options.http_port));
            self.line(format!("server_name {};", server_names));
        }

        self.blank();
        self.open("location /");
        self.line(format!(
            "proxy_pass http://{};",
            host_port(&host.forward_host, host.forward_port)
        ));
        self.line("proxy_http_version 1.1;");
        self.line("proxy_set_header Host $host;");
        self.line("proxy_set_header X-Real-IP $remote_addr;");
        self.line("proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;");
        self.line("proxy_set_header X-Forwarded-Proto $scheme;");
        self.line("proxy_set_header Upgrade $http_upgrade;");
        self.line("proxy_set_header Connection $connection_upgrade;");
        self.close();
        self.close();
    }

    fn status_server(&mut self, listen: &str) {
        let options = self.options;
        self.line("# status endpoint polled by balancer-studio");
        self.open("server");
        self.line(format!("listen {};", listen));
        self.line("access_log off;");
        self.open(format!("location = {}", options.status_path));
        self.line("stub_status;");
        self.close();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, UpstreamServer};
    use crate::store::VersionVector;
    use chrono::{Duration, TimeZone, Utc};

    fn host(id: i64, domains: &[&str]) -> ProxyHost {
        ProxyHost {
            id,
            domain_names: domains.iter().map(|d| d.to_string()).collect(),
            forward_host: "127.0.0.1".to_string(),
            forward_port: 3000 + id as u16,
            ssl_enabled: false,
            certificate_id: None,
            enabled: true,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn server(id: i64, upstream_id: i64, host: &str, status: ServerStatus) -> UpstreamServer {
        UpstreamServer {
            id,
            upstream_id,
            host: host.to_string(),
            port: 8080,
            weight: 1,
            max_fails: 3,
            status,
        }
    }

    fn upstream(id: i64, name: &str, servers: Vec<UpstreamServer>) -> Upstream {
        Upstream {
            id,
            name: name.to_string(),
            algorithm: Algorithm::RoundRobin,
            description: String::new(),
            servers,
        }
    }

    fn cert(id: i64, domain: &str, status: CertificateStatus) -> Certificate {
        Certificate {
            id,
            name: domain.to_string(),
            provider: "letsencrypt".to_string(),
            domain_name: domain.to_string(),
            alt_names: Vec::new(),
            expires_at: Utc::now() + Duration::days(60),
            status,
        }
    }

    fn ssl_host(id: i64, domain: &str, cert_id: i64) -> ProxyHost {
        let mut h = host(id, &[domain]);
        h.ssl_enabled = true;
        h.certificate_id = Some(cert_id);
        h
    }

    fn snapshot(hosts: Vec<ProxyHost>, upstreams: Vec<Upstream>, certs: Vec<Certificate>) -> Snapshot {
        Snapshot {
            proxy_hosts: hosts,
            certificates: certs,
            upstreams,
            versions: VersionVector::default(),
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let snap = snapshot(
            vec![host(2, &["b.example.com"]), host(1, &["a.example.com"])],
            vec![upstream(1, "backend", vec![server(1, 1, "10.0.0.1", ServerStatus::Up)])],
            vec![],
        );
        let options = RenderOptions::default();

        let first = render(&snap, &options).unwrap();
        let second = render(&snap, &options).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.text, second.text);
        assert_eq!(first.fingerprint.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_versions_and_input_order() {
        let a = snapshot(
            vec![host(1, &["a.example.com"]), host(2, &["b.example.com"])],
            vec![],
            vec![],
        );
        let mut b = snapshot(
            vec![host(2, &["b.example.com"]), host(1, &["a.example.com"])],
            vec![],
            vec![],
        );
        b.versions.proxy_hosts = 17;

        let options = RenderOptions::default();
        assert_eq!(
            render(&a, &options).unwrap().fingerprint,
            render(&b, &options).unwrap().fingerprint
        );
    }

    #[test]
    fn test_fingerprint_tracks_content_and_options() {
        let options = RenderOptions::default();
        let base = snapshot(vec![host(1, &["a.example.com"])], vec![], vec![]);
        let fp = render(&base, &options).unwrap().fingerprint;

        let mut changed = base.clone();
        changed.proxy_hosts[0].forward_port = 9999;
        assert_ne!(render(&changed, &options).unwrap().fingerprint, fp);

        let other_options = RenderOptions {
            http_port: 8080,
            ..RenderOptions::default()
        };
        assert_ne!(render(&base, &other_options).unwrap().fingerprint, fp);

        // Disabled hosts are not part of the render input
        let mut with_disabled = base.clone();
        let mut off = host(9, &["off.example.com"]);
        off.enabled = false;
        with_disabled.proxy_hosts.push(off);
        assert_eq!(render(&with_disabled, &options).unwrap().fingerprint, fp);
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let snap = snapshot(
            vec![host(1, &["a.example.com"]), host(2, &["x.example.com", "a.example.com"])],
            vec![],
            vec![],
        );
        let err = render(&snap, &RenderOptions::default()).unwrap_err();
        assert_eq!(err, RenderError::DuplicateDomain("a.example.com".into()));
        assert_eq!(err.to_string(), "duplicate domain: a.example.com");
    }

    #[test]
    fn test_duplicate_domain_ignored_when_disabled() {
        let mut disabled = host(2, &["a.example.com"]);
        disabled.enabled = false;
        let snap = snapshot(vec![host(1, &["a.example.com"]), disabled], vec![], vec![]);
        assert!(render(&snap, &RenderOptions::default()).is_ok());
    }

    #[test]
    fn test_empty_upstream_rejected() {
        let snap = snapshot(vec![], vec![upstream(1, "backend", vec![])], vec![]);
        let err = render(&snap, &RenderOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "empty upstream: backend");
    }

    #[test]
    fn test_ssl_requires_active_covering_certificate() {
        let options = RenderOptions::default();

        let absent = snapshot(vec![ssl_host(1, "a.example.com", 5)], vec![], vec![]);
        assert!(matches!(
            render(&absent, &options),
            Err(RenderError::CertificateNotFound { certificate_id: 5, .. })
        ));

        let mut no_ref = host(1, &["a.example.com"]);
        no_ref.ssl_enabled = true;
        let missing = snapshot(vec![no_ref], vec![], vec![]);
        assert!(matches!(
            render(&missing, &options),
            Err(RenderError::MissingCertificate { host_id: 1 })
        ));

        for status in [
            CertificateStatus::Pending,
            CertificateStatus::Expired,
            CertificateStatus::Revoked,
        ] {
            let inactive = snapshot(
                vec![ssl_host(1, "a.example.com", 5)],
                vec![],
                vec![cert(5, "a.example.com", status)],
            );
            assert!(matches!(
                render(&inactive, &options),
                Err(RenderError::CertificateNotActive { .. })
            ));
        }

        let uncovered = snapshot(
            vec![ssl_host(1, "a.example.com", 5)],
            vec![],
            vec![cert(5, "b.example.com", CertificateStatus::Active)],
        );
        assert!(matches!(
            render(&uncovered, &options),
            Err(RenderError::CertificateCoverage { .. })
        ));

        let wildcard = snapshot(
            vec![ssl_host(1, "a.example.com", 5)],
            vec![],
            vec![cert(5, "*.example.com", CertificateStatus::Active)],
        );
        let rendered = render(&wildcard, &options).unwrap();
        assert!(rendered.text.contains("listen 443 ssl;"));
        assert!(rendered
            .text
            .contains("ssl_certificate /etc/balancer-studio/certs/5/fullchain.pem;"));
        assert!(rendered.text.contains("return 301 https://$host$request_uri;"));
    }

    #[test]
    fn test_ssl_fingerprint_tracks_certificate() {
        let options = RenderOptions::default();
        let snap = snapshot(
            vec![ssl_host(1, "a.example.com", 5)],
            vec![],
            vec![
                cert(5, "a.example.com", CertificateStatus::Active),
                cert(6, "unused.example.com", CertificateStatus::Pending),
            ],
        );
        let fp = render(&snap, &options).unwrap().fingerprint;

        // Unreferenced certificates do not affect the fingerprint
        let mut unused_changed = snap.clone();
        unused_changed.certificates[1].name = "renamed".into();
        assert_eq!(render(&unused_changed, &options).unwrap().fingerprint, fp);

        let mut used_changed = snap;
        used_changed.certificates[0].alt_names.push("www.example.com".into());
        assert_ne!(render(&used_changed, &options).unwrap().fingerprint, fp);
    }

    #[test]
    fn test_block_ordering() {
        let snap = snapshot(
            vec![host(3, &["c.example.com"]), host(1, &["a.example.com"])],
            vec![
                upstream(1, "zeta", vec![server(1, 1, "10.0.0.1", ServerStatus::Up)]),
                upstream(2, "alpha", vec![server(2, 2, "10.0.0.2", ServerStatus::Up)]),
            ],
            vec![],
        );
        let text = render(&snap, &RenderOptions::default()).unwrap().text;

        let alpha = text.find("upstream alpha {").unwrap();
        let zeta = text.find("upstream zeta {").unwrap();
        assert!(alpha < zeta);

        let first = text.find("# proxy host 1").unwrap();
        let third = text.find("# proxy host 3").unwrap();
        assert!(first < third);
    }

    #[test]
    fn test_upstream_directives() {
        let mut up = upstream(
            1,
            "backend",
            vec![
                server(1, 1, "10.0.0.1", ServerStatus::Up),
                server(2, 1, "::1", ServerStatus::Draining),
                server(3, 1, "10.0.0.3", ServerStatus::Down),
            ],
        );
        up.algorithm = Algorithm::LeastConn;
        up.servers[0].weight = 5;

        let snap = snapshot(vec![], vec![up], vec![]);
        let text = render(&snap, &RenderOptions::default()).unwrap().text;

        assert!(text.contains("        least_conn;\n"));
        assert!(text.contains("server 10.0.0.1:8080 weight=5 max_fails=3;"));
        assert!(text.contains("server [::1]:8080 weight=1 max_fails=3 down;"));
        assert!(text.contains("server 10.0.0.3:8080 weight=1 max_fails=3 down;"));
    }

    #[test]
    fn test_document_structure() {
        let options = RenderOptions {
            pid_file: Some("/run/nginx.pid".into()),
            ..RenderOptions::default()
        };
        let snap = snapshot(vec![host(1, &["a.example.com", "b.example.com"])], vec![], vec![]);
        let rendered = render(&snap, &options).unwrap();
        let text = &rendered.text;

        assert!(text.starts_with("# Managed by balancer-studio."));
        assert!(text.contains("pid /run/nginx.pid;"));
        assert!(text.contains("worker_connections 1024;"));
        assert!(text.contains("server_name a.example.com b.example.com;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:3001;"));
        assert!(text.contains("listen 127.0.0.1:8081;"));
        assert!(text.contains("location = /nginx_status {"));
        assert_eq!(text.matches('{').count(), text.matches('}').count());

        assert_eq!(
            Fingerprint::from_config_text(text),
            Some(rendered.fingerprint.clone())
        );
    }

    #[test]
    fn test_status_server_optional() {
        let options = RenderOptions {
            status_listen: None,
            ..RenderOptions::default()
        };
        let text = render(&Snapshot::default(), &options).unwrap().text;
        assert!(!text.contains("stub_status"));
    }

    #[test]
    fn test_fingerprint_from_foreign_text() {
        assert_eq!(Fingerprint::from_config_text("worker_processes 1;\n"), None);
        assert_eq!(
            Fingerprint::from_config_text("# fingerprint: not-hex\nevents {}\n"),
            None
        );
    }
}
