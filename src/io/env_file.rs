//! Workspace `.env` handling.
//!
//! The parsed map is layered over the process environment for every hub
//! subprocess. When `DATABASE_URL` points at postgres, missing optimizer
//! connection fields are derived from it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::config::DatabaseConfig;

/// Parse a `.env` file: comments, blank lines, optional `export ` prefix,
/// single or double quoted values.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut vars = BTreeMap::new();

    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[0] == bytes[value.len() - 1] {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }

    debug!(count = vars.len(), path = %path.display(), "parsed env file");
    Ok(vars)
}

/// Fill missing optimizer connection fields from a `DATABASE_URL` value of
/// the form `postgres[ql]://user:password@host:port/dbname`.
pub fn apply_database_url_defaults(vars: &BTreeMap<String, String>, db: &mut DatabaseConfig) {
    let Some(url) = vars.get("DATABASE_URL") else {
        return;
    };
    let Some(parsed) = parse_postgres_url(url) else {
        return;
    };

    if db.user.is_empty() {
        if let Some(user) = parsed.user {
            db.user = user;
        }
    }
    if db.password.is_empty() {
        if let Some(password) = parsed.password {
            db.password = password;
        }
    }
    if db.host == "localhost" || db.host.is_empty() {
        if let Some(host) = parsed.host {
            db.host = host;
        }
    }
    if let Some(port) = parsed.port {
        if db.port == 5432 {
            db.port = port;
        }
    }
    if db.dbname.is_empty() {
        if let Some(dbname) = parsed.dbname {
            db.dbname = dbname;
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PostgresUrl {
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    dbname: Option<String>,
}

fn parse_postgres_url(url: &str) -> Option<PostgresUrl> {
    let rest = url
        .strip_prefix("postgresql://")
        .or_else(|| url.strip_prefix("postgres://"))?;

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };

    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(userinfo), hostport),
        None => (None, authority),
    };

    let mut parsed = PostgresUrl::default();
    if let Some(userinfo) = userinfo {
        match userinfo.split_once(':') {
            Some((user, password)) => {
                parsed.user = non_empty(user);
                parsed.password = Some(password.to_string());
            }
            None => parsed.user = non_empty(userinfo),
        }
    }
    match hostport.split_once(':') {
        Some((host, port)) => {
            parsed.host = non_empty(host);
            parsed.port = port.parse().ok();
        }
        None => parsed.host = non_empty(hostport),
    }
    parsed.dbname = path.and_then(|p| non_empty(p.split('?').next().unwrap_or("")));
    Some(parsed)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
