//! Upstream archive client.
//!
//! A thin facade over the range reader: derives archive URLs from dates,
//! probes sizes, lists published archives, and hands out [`Archive`] handles
//! whose central directory is cached per URL for the life of the process.
//!
//! The upstream publishes one archive per calendar day at
//! `{base}/v0/archive/{YYYY-MM-DD}.zip`, with top-level folders named by
//! chain code, each holding `stores.csv`, `products.csv`, `prices.csv`.
//! Missing members are common for some chains on some days and read as
//! empty text.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::UpstreamConfig;
use crate::error::ArchiveError;
use crate::zip::{self, Directory, HttpRangeSource, RangeSource};

pub const STORES_CSV: &str = "stores.csv";
pub const PRODUCTS_CSV: &str = "products.csv";
pub const PRICES_CSV: &str = "prices.csv";

const LIST_CACHE_TTL: Duration = Duration::from_secs(3600);

/// One published archive as reported by `GET {base}/v0/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveDescriptor {
    pub date: String,
    pub url: String,
    pub size: u64,
    #[serde(default)]
    pub updated: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    archives: Vec<ArchiveDescriptor>,
}

/// Client for the upstream catalog service. Cloning is cheap; clones share
/// the directory and list caches.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
    directories: Arc<Mutex<HashMap<String, Arc<Directory>>>>,
    list_cache: Arc<Mutex<Option<(Instant, Arc<Vec<ArchiveDescriptor>>)>>>,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            directories: Arc::new(Mutex::new(HashMap::new())),
            list_cache: Arc::new(Mutex::new(None)),
        })
    }

    pub fn archive_url(&self, date: &str) -> String {
        format!("{}/v0/archive/{}.zip", self.base_url, date)
    }

    /// Published archives, newest date first. Cached for an hour.
    pub async fn list_archives(&self) -> Result<Arc<Vec<ArchiveDescriptor>>> {
        if let Some((fetched_at, archives)) = self.list_cache.lock().unwrap().as_ref() {
            if fetched_at.elapsed() < LIST_CACHE_TTL {
                return Ok(Arc::clone(archives));
            }
        }

        let url = format!("{}/v0/list", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("archive list request failed: {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("archive list returned HTTP {}", response.status());
        }

        let mut list: ListResponse = response
            .json()
            .await
            .context("failed to decode archive list")?;
        list.archives.sort_by(|a, b| b.date.cmp(&a.date));

        let archives = Arc::new(list.archives);
        *self.list_cache.lock().unwrap() = Some((Instant::now(), Arc::clone(&archives)));
        Ok(archives)
    }

    /// `HEAD` the archive to learn its total byte length.
    pub async fn probe_size(&self, url: &str) -> Result<u64, ArchiveError> {
        let response = self.client.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::RangeFailed {
                status: status.as_u16(),
            });
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                ArchiveError::UpstreamUnavailable(format!("no Content-Length from HEAD {}", url))
            })
    }

    /// Open the archive for `date`: size probe, then central directory,
    /// served from the per-URL cache when the size still matches.
    pub async fn open(&self, date: &str) -> Result<Archive, ArchiveError> {
        let url = self.archive_url(date);
        let size = self.probe_size(&url).await?;
        let source: Arc<dyn RangeSource> =
            Arc::new(HttpRangeSource::new(self.client.clone(), url.clone(), size));

        if let Some(cached) = self.directories.lock().unwrap().get(&url) {
            if cached.size == size {
                return Ok(Archive {
                    source,
                    directory: Arc::clone(cached),
                });
            }
        }

        let archive = Archive::over(source).await?;
        self.directories
            .lock()
            .unwrap()
            .insert(url, Arc::clone(&archive.directory));
        Ok(archive)
    }
}

/// An opened archive: a range source plus its parsed central directory.
/// Cheap to clone; chain tasks share the underlying source.
#[derive(Clone)]
pub struct Archive {
    source: Arc<dyn RangeSource>,
    directory: Arc<Directory>,
}

impl Archive {
    /// Read the directory of an arbitrary range source. Production traffic
    /// goes through [`Upstream::open`]; this seam exists for local sources.
    pub async fn over(source: Arc<dyn RangeSource>) -> Result<Archive, ArchiveError> {
        let directory = Arc::new(zip::read_directory(source.as_ref()).await?);
        Ok(Archive { source, directory })
    }

    /// Chain codes present in the archive: the set of top-level folder names
    /// that contain at least one sub-path. Unknown codes pass through.
    pub fn chains(&self) -> Vec<String> {
        let mut chains = BTreeSet::new();
        for entry in &self.directory.entries {
            if let Some((chain, rest)) = entry.name.split_once('/') {
                if !chain.is_empty() && !rest.is_empty() {
                    chains.insert(chain.to_string());
                }
            }
        }
        chains.into_iter().collect()
    }

    /// Extract `{chain}/{file}` as text. An absent member reads as empty.
    pub async fn read_csv(&self, chain: &str, file: &str) -> Result<String, ArchiveError> {
        let name = format!("{}/{}", chain, file);
        match self.directory.entry(&name) {
            Some(entry) => zip::read_member_text(self.source.as_ref(), entry).await,
            None => Ok(String::new()),
        }
    }
}
