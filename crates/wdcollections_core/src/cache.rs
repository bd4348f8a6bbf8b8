use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

const SECONDS_PER_DAY: u64 = 86_400;

/// How a sync cycle treats a cached query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// A fresh cache entry means the upstream was read recently; skip the cycle.
    SkipIfFresh,
    /// Use a fresh cache entry instead of querying.
    #[default]
    ServeIfFresh,
    /// Always query and overwrite the entry.
    Refresh,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkipIfFresh => "skip_if_fresh",
            Self::ServeIfFresh => "serve_if_fresh",
            Self::Refresh => "refresh",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip_if_fresh" | "skip" => Some(Self::SkipIfFresh),
            "serve_if_fresh" | "serve" => Some(Self::ServeIfFresh),
            "refresh" => Some(Self::Refresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(String),
    Stale,
    Missing,
}

/// Query results stored as `<prefix>_<sha256>.json` files, aged by mtime.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    prefix: String,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(dir: &Path, prefix: &str, ttl_days: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: sanitize_prefix(prefix),
            ttl: Duration::from_secs(ttl_days.saturating_mul(SECONDS_PER_DAY)),
        }
    }

    /// Prefix is the collection name followed by its languages (`churches_en-fr`).
    pub fn for_collection(dir: &Path, name: &str, languages: &[String], ttl_days: u64) -> Self {
        let prefix = format!("{name}_{}", languages.join("-"));
        Self::new(dir, &prefix, ttl_days)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn entry_path(&self, query: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", self.prefix, cache_key(query)))
    }

    pub fn lookup(&self, query: &str) -> Result<CacheLookup> {
        let path = self.entry_path(query);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheLookup::Missing);
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to inspect {}", path.display()));
            }
        };
        if metadata.len() == 0 {
            debug!(path = %path.display(), "ignoring empty cache entry");
            return Ok(CacheLookup::Missing);
        }
        let modified = metadata
            .modified()
            .with_context(|| format!("failed to read mtime of {}", path.display()))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            debug!(path = %path.display(), age_secs = age.as_secs(), "cache entry is stale");
            return Ok(CacheLookup::Stale);
        }
        let payload = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(CacheLookup::Fresh(payload))
    }

    pub fn put(&self, query: &str, payload: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.entry_path(query);
        fs::write(&path, payload).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), bytes = payload.len(), "stored query result");
        Ok(path)
    }
}

/// Hex sha256 of the query with all whitespace runs collapsed to one space.
pub fn cache_key(query: &str) -> String {
    let canonical = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(canonical.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn sanitize_prefix(prefix: &str) -> String {
    prefix
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
