use crate::error::LifecycleError;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU32, Ordering},
};
use thiserror::Error;
use tokio::sync::Mutex;
#[cfg(test)]
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage request failed: {0}")]
    Request(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for LifecycleError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Unavailable(_) => LifecycleError::storage("object_store", value.to_string()),
            StorageError::NotFound(reference) => {
                LifecycleError::not_found("object_store", "object", reference)
            }
            StorageError::Request(_) => {
                LifecycleError::storage_rejected("object_store", value.to_string())
            }
        }
    }
}

/// Blob store holding temporary and permanent media. References returned by
/// `put` are what listings record and what `get`/`delete` accept.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, StorageError>;

    async fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, reference: &str) -> Result<(), StorageError>;
}

pub fn temp_path(uploader_id: u64, upload_id: u64, filename: &str) -> String {
    format!("temp/{uploader_id}/{upload_id}/{}", sanitize_filename(filename))
}

pub fn permanent_path(listing_id: u64, folder: &str, upload_id: u64, filename: &str) -> String {
    format!(
        "listings/{listing_id}/{folder}/{upload_id}-{}",
        sanitize_filename(filename)
    )
}

fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

const MEMORY_SCHEME: &str = "mem://";

/// In-process store. Also the test double: puts can be made to fail a fixed
/// number of times or permanently for matching paths.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing_paths: Mutex<HashSet<String>>,
    fail_next_puts: AtomicU32,
    fail_deletes: AtomicU32,
    puts: AtomicU32,
    #[cfg(test)]
    held_put: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_next_puts(&self, count: u32) {
        self.fail_next_puts.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_next_deletes(&self, count: u32) {
        self.fail_deletes.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub async fn fail_puts_containing(&self, fragment: &str) {
        self.failing_paths.lock().await.insert(fragment.to_string());
    }

    #[cfg(test)]
    pub async fn heal(&self) {
        self.failing_paths.lock().await.clear();
        self.fail_next_puts.store(0, Ordering::SeqCst);
        self.fail_deletes.store(0, Ordering::SeqCst);
    }

    /// Parks the next `put` until the returned sender fires. The receiver
    /// resolves once that put has started.
    #[cfg(test)]
    pub async fn hold_next_put(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.held_put.lock().await = Some((reached_tx, release_rx));
        (reached_rx, release_tx)
    }

    #[cfg(test)]
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub async fn contains(&self, reference: &str) -> bool {
        let path = reference.strip_prefix(MEMORY_SCHEME).unwrap_or(reference);
        self.objects.lock().await.contains_key(path)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        #[cfg(test)]
        {
            let held = self.held_put.lock().await.take();
            if let Some((reached, release)) = held {
                let _ = reached.send(());
                let _ = release.await;
            }
        }
        if Self::take_failure(&self.fail_next_puts) {
            return Err(StorageError::Unavailable(format!("injected failure for {path}")));
        }
        if self
            .failing_paths
            .lock()
            .await
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
        {
            return Err(StorageError::Unavailable(format!("path {path} is failing")));
        }
        self.objects.lock().await.insert(path.to_string(), bytes);
        Ok(format!("{MEMORY_SCHEME}{path}"))
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = reference.strip_prefix(MEMORY_SCHEME).unwrap_or(reference);
        self.objects
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        if Self::take_failure(&self.fail_deletes) {
            return Err(StorageError::Unavailable(format!(
                "injected delete failure for {reference}"
            )));
        }
        let path = reference.strip_prefix(MEMORY_SCHEME).unwrap_or(reference);
        self.objects
            .lock()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }
}

/// Object store reached over plain HTTP verbs (`PUT`/`GET`/`DELETE` on
/// `{base_url}/{path}`), as exposed by most S3-compatible gateways.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: build_client(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn resolve(&self, reference: &str) -> String {
        if reference.starts_with(&self.base_url) {
            reference.to_string()
        } else {
            self.url_for(reference)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn classify(status: StatusCode, target: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        StorageError::NotFound(target.to_string())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageError::Unavailable(format!("HTTP {status} for {target}"))
    } else {
        StorageError::Request(format!("HTTP {status} for {target}"))
    }
}

fn transport(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::Request(err.to_string())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let url = self.url_for(path);
        let mut request = self.authorize(self.http.put(&url)).body(bytes);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let response = request.send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(classify(response.status(), &url));
        }
        debug!(target = "listings.storage", url = %url, "object stored");
        Ok(url)
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.resolve(reference);
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(classify(response.status(), &url));
        }
        let body = response.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let url = self.resolve(reference);
        let response = self
            .authorize(self.http.delete(&url))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(classify(response.status(), &url));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_strip_directories_and_odd_characters() {
        assert_eq!(temp_path(3, 9, "../../etc/pass wd.jpg"), "temp/3/9/pass_wd.jpg");
        assert_eq!(
            permanent_path(12, "images", 9, "front.JPG"),
            "listings/12/images/9-front.JPG"
        );
    }

    #[test]
    fn http_store_encodes_segments() {
        let store = HttpObjectStore::new("https://blobs.example.com/", None);
        assert_eq!(
            store.url_for("listings/1/images/a b.jpg"),
            "https://blobs.example.com/listings/1/images/a%20b.jpg"
        );
        assert_eq!(
            store.resolve("https://blobs.example.com/x.jpg"),
            "https://blobs.example.com/x.jpg"
        );
    }

    #[tokio::test]
    async fn memory_store_injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(1);
        assert!(store.put("a", vec![1], None).await.is_err());
        let reference = store.put("a", vec![1], None).await.expect("second put");
        assert_eq!(store.get(&reference).await.unwrap(), vec![1]);
        store.delete(&reference).await.unwrap();
        assert!(!store.contains(&reference).await);
    }
}
