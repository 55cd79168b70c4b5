//! File-backed JSON document store + HTTP transport utilities for FIRA.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use fira_core::{AdminEntity, AttributeGroup, DatabaseSnapshot, Location, Report, ReportKey};

pub const CRATE_NAME: &str = "fira-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A directory of JSON documents of one type, one file per document id.
///
/// Writes go through a temp file and an atomic rename, so a document is
/// always either its previous or its new version on disk.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    name: &'static str,
    dir: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    fn new(name: &'static str, dir: PathBuf) -> Self {
        Self {
            name,
            dir,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<T>> {
        let path = self.doc_path(id);
        match fs::read(&path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes).with_context(|| {
                    format!("decoding {} document {}", self.name, path.display())
                })?;
                Ok(Some(doc))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("reading {} document {}", self.name, path.display())),
        }
    }

    /// Full-replace upsert.
    pub async fn put(&self, id: &str, doc: &T) -> anyhow::Result<()> {
        let path = self.doc_path(id);
        let bytes = serde_json::to_vec_pretty(doc)
            .with_context(|| format!("encoding {} document {id}", self.name))?;

        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp document file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp document {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    /// Every document in the collection. Non-`.json` entries (stray temp
    /// files) are ignored.
    pub async fn all(&self) -> anyhow::Result<Vec<T>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing {} collection {}", self.name, self.dir.display()))?;

        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {} collection {}", self.name, self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading {} document {}", self.name, path.display()))?;
            let doc = serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding {} document {}", self.name, path.display()))?;
            docs.push(doc);
        }
        Ok(docs)
    }

    /// First document matching the predicate, in unspecified order.
    pub async fn find<F>(&self, pred: F) -> anyhow::Result<Option<T>>
    where
        F: Fn(&T) -> bool,
    {
        for doc in self.all().await? {
            if pred(&doc) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.all().await?.len())
    }
}

/// Root handle over a store directory; hands out typed collections.
#[derive(Debug, Clone)]
pub struct DocStore {
    root: PathBuf,
}

impl DocStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn collection<T>(&self, name: &'static str) -> anyhow::Result<Collection<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating collection directory {}", dir.display()))?;
        Ok(Collection::new(name, dir))
    }
}

/// The five persisted collections, opened together.
#[derive(Debug, Clone)]
pub struct Store {
    pub reports: Collection<Report>,
    pub locations: Collection<Location>,
    pub attribute_groups: Collection<AttributeGroup>,
    pub database_snapshots: Collection<DatabaseSnapshot>,
    pub admin_entities: Collection<AdminEntity>,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let doc_store = DocStore::open(root).await?;
        Ok(Self {
            reports: doc_store.collection("reports").await?,
            locations: doc_store.collection("locations").await?,
            attribute_groups: doc_store.collection("attribute_groups").await?,
            database_snapshots: doc_store.collection("database_snapshots").await?,
            admin_entities: doc_store.collection("admin_entities").await?,
        })
    }

    /// Document id for a report: SHA-256 of the key's canonical encoding.
    pub fn report_doc_id(key: &ReportKey) -> String {
        sha256_hex(key.canonical().as_bytes())
    }

    pub async fn report(&self, key: &ReportKey) -> anyhow::Result<Option<Report>> {
        self.reports.get(&Self::report_doc_id(key)).await
    }

    pub async fn put_report(&self, report: &Report) -> anyhow::Result<()> {
        self.reports
            .put(&Self::report_doc_id(&report.key()), report)
            .await
    }

    pub async fn location(&self, id: i64) -> anyhow::Result<Option<Location>> {
        self.locations.get(&id.to_string()).await
    }

    pub async fn put_location(&self, location: &Location) -> anyhow::Result<()> {
        self.locations.put(&location.id.to_string(), location).await
    }

    pub async fn location_by_code(&self, code: &str) -> anyhow::Result<Option<Location>> {
        self.locations
            .find(|location| location.code.as_deref() == Some(code))
            .await
    }

    pub async fn admin_entity(&self, id: i64) -> anyhow::Result<Option<AdminEntity>> {
        self.admin_entities.get(&id.to_string()).await
    }

    pub async fn put_admin_entity(&self, entity: &AdminEntity) -> anyhow::Result<()> {
        self.admin_entities.put(&entity.id.to_string(), entity).await
    }

    pub async fn admin_entity_by_code(&self, code: &str) -> anyhow::Result<Option<AdminEntity>> {
        self.admin_entities
            .find(|entity| entity.code.as_deref() == Some(code))
            .await
    }

    pub async fn put_attribute_group(&self, group: &AttributeGroup) -> anyhow::Result<()> {
        self.attribute_groups.put(&group.id.to_string(), group).await
    }

    pub async fn put_snapshot(&self, snapshot: &DatabaseSnapshot) -> anyhow::Result<()> {
        self.database_snapshots.put(&snapshot.id, snapshot).await
    }
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin JSON-over-HTTP client. One attempt per call; callers that want
/// retry semantics get them from the outer scheduler, never in-run.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        auth: Option<&BasicAuth>,
    ) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(auth) = auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        debug!(url, "http get");
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json::<T>().await?)
    }

    /// POST a JSON body and hand the status back; non-2xx is the caller's
    /// call to interpret (push rejections are data, not transport errors).
    pub async fn post_json<B>(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
        body: &B,
    ) -> Result<StatusCode, TransportError>
    where
        B: Serialize,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(auth) = auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        debug!(url, "http post");
        let resp = request.send().await?;
        Ok(resp.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fira_core::{AdminCrumb, Report};
    use tempfile::tempdir;

    fn location(id: i64, code: Option<&str>, name: &str) -> Location {
        Location {
            id,
            code: code.map(str::to_string),
            name: name.to_string(),
            kind: None,
            latitude: Some(33.89),
            longitude: Some(35.5),
            admin_chain: vec![AdminCrumb {
                level_id: 1370,
                entity_id: 7,
                code: "G1".to_string(),
                name: "North".to_string(),
            }],
        }
    }

    #[test]
    fn document_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn report_doc_ids_separate_distinct_keys() {
        let key = ReportKey {
            db_name: "refugee-response".to_string(),
            period: "2015-03".to_string(),
            site_id: 11,
            activity_id: 22,
            partner_id: 33,
            indicator_id: 44,
        };
        let mut other = key.clone();
        other.indicator_id = 45;

        assert_eq!(Store::report_doc_id(&key), Store::report_doc_id(&key));
        assert_ne!(Store::report_doc_id(&key), Store::report_doc_id(&other));
    }

    #[tokio::test]
    async fn put_is_a_full_replace_upsert() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path()).await.expect("open store");

        store
            .put_location(&location(5, Some("12345-1-001"), "Village A"))
            .await
            .expect("first put");
        let mut changed = location(5, Some("12345-1-001"), "Village A (renamed)");
        changed.latitude = None;
        store.put_location(&changed).await.expect("second put");

        let stored = store.location(5).await.expect("get").expect("present");
        assert_eq!(stored.name, "Village A (renamed)");
        assert_eq!(stored.latitude, None);
        assert_eq!(store.locations.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn find_matches_by_code_and_misses_cleanly() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path()).await.expect("open store");

        store
            .put_location(&location(1, Some("12345-1-001"), "Village A"))
            .await
            .expect("put a");
        store
            .put_location(&location(2, None, "Village B"))
            .await
            .expect("put b");

        let found = store
            .location_by_code("12345-1-001")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, 1);
        assert!(store
            .location_by_code("99999-9-999")
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn listing_skips_stray_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path()).await.expect("open store");
        store
            .put_location(&location(9, None, "Village C"))
            .await
            .expect("put");

        std::fs::write(
            dir.path().join("locations").join(".orphan.tmp"),
            b"not json",
        )
        .expect("stray file");

        let all = store.locations.all().await.expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 9);
    }

    #[tokio::test]
    async fn reports_are_addressed_by_identity_key() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path()).await.expect("open store");
        let key = ReportKey {
            db_name: "refugee-response".to_string(),
            period: "2015-03".to_string(),
            site_id: 11,
            activity_id: 22,
            partner_id: 33,
            indicator_id: 44,
        };

        assert!(store.report(&key).await.expect("get").is_none());

        let mut report = Report::new(key.clone(), Utc::now());
        report.value = Some(120.0);
        store.put_report(&report).await.expect("put");

        let stored = store.report(&key).await.expect("get").expect("present");
        assert_eq!(stored.value, Some(120.0));
        assert_eq!(store.reports.count().await.expect("count"), 1);
    }
}
