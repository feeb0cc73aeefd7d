use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{LoadError, Result};

/// Raw bytes of one object fetched from the object store.
#[derive(Debug, Clone)]
pub struct SourceObject {
    pub uri: String,
    pub bytes: Vec<u8>,
}

impl SourceObject {
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    /// Parses newline-delimited JSON, concatenated objects, or a top-level
    /// array into individual records.
    pub fn records(&self) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let stream = serde_json::Deserializer::from_slice(&self.bytes).into_iter::<Value>();
        for item in stream {
            let value = item.map_err(|e| LoadError::SchemaMismatch {
                source_uri: self.uri.clone(),
                record: records.len(),
                detail: format!("malformed JSON: {}", e),
            })?;
            match value {
                Value::Array(items) => records.extend(items),
                other => records.push(other),
            }
        }
        Ok(records)
    }
}

/// Object-store access used by the staging loader.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetches every object addressed by `uri`. A prefix-style URI may expand
    /// to several objects; an empty expansion is an error.
    async fn fetch(&self, uri: &str) -> Result<Vec<SourceObject>>;
}

pub struct FileSourceReader;

impl FileSourceReader {
    fn local_path(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }

    async fn expand(uri: &str, root: &Path) -> Result<Vec<PathBuf>> {
        let meta = tokio::fs::metadata(root)
            .await
            .map_err(|e| LoadError::source_unavailable(uri, e))?;
        if meta.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }

        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| LoadError::source_unavailable(uri, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| LoadError::source_unavailable(uri, e))?
            {
                let path = entry.path();
                let kind = entry
                    .file_type()
                    .await
                    .map_err(|e| LoadError::source_unavailable(uri, e))?;
                if kind.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl SourceReader for FileSourceReader {
    async fn fetch(&self, uri: &str) -> Result<Vec<SourceObject>> {
        let root = Self::local_path(uri);
        let paths = Self::expand(uri, &root).await?;
        if paths.is_empty() {
            return Err(LoadError::source_unavailable(uri, "no .json objects under prefix"));
        }

        let mut objects = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| LoadError::source_unavailable(&path.display().to_string(), e))?;
            debug!("Read {} bytes from {}", bytes.len(), path.display());
            objects.push(SourceObject {
                uri: path.display().to_string(),
                bytes,
            });
        }
        Ok(objects)
    }
}

pub struct HttpSourceReader {
    client: reqwest::Client,
}

impl HttpSourceReader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSourceReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceReader for HttpSourceReader {
    async fn fetch(&self, uri: &str) -> Result<Vec<SourceObject>> {
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| LoadError::source_unavailable(uri, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LoadError::source_unavailable(uri, format!("HTTP {}", status)));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| LoadError::source_unavailable(uri, e))?
            .to_vec();
        debug!("Fetched {} bytes from {}", bytes.len(), uri);
        Ok(vec![SourceObject {
            uri: uri.to_string(),
            bytes,
        }])
    }
}

/// Dispatches on the URI scheme: `http(s)://` goes over the network,
/// `file://` and bare paths are read from the local filesystem.
pub struct ObjectStoreReader {
    file: FileSourceReader,
    http: HttpSourceReader,
}

impl ObjectStoreReader {
    pub fn new() -> Self {
        Self {
            file: FileSourceReader,
            http: HttpSourceReader::new(),
        }
    }
}

impl Default for ObjectStoreReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceReader for ObjectStoreReader {
    async fn fetch(&self, uri: &str) -> Result<Vec<SourceObject>> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            self.http.fetch(uri).await
        } else {
            self.file.fetch(uri).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers a single request on a local port with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/log_data/2018-11-05-events.json", addr)
    }

    fn local_http() -> HttpSourceReader {
        HttpSourceReader {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    fn object(text: &str) -> SourceObject {
        SourceObject {
            uri: "mem://test".to_string(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_records_accepts_ndjson_and_arrays() {
        assert_eq!(object("{\"a\":1}\n{\"a\":2}\n").records().unwrap().len(), 2);
        assert_eq!(object("[{\"a\":1},{\"a\":2},{\"a\":3}]").records().unwrap().len(), 3);
        assert_eq!(object("{\"a\":1}{\"a\":2}").records().unwrap().len(), 2);
        assert!(object("").records().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_is_schema_mismatch() {
        let err = object("{\"a\":1}\n{\"a\":").records().unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        assert_eq!(
            object("").digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_directory_prefix_expands_sorted() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A/B")).unwrap();
        std::fs::write(dir.path().join("A/B/two.json"), "{}").unwrap();
        std::fs::write(dir.path().join("A/one.json"), "{}").unwrap();
        std::fs::write(dir.path().join("A/notes.txt"), "skip").unwrap();

        let uri = format!("file://{}", dir.path().display());
        let objects = FileSourceReader.fetch(&uri).await.unwrap();

        assert_eq!(objects.len(), 2);
        assert!(objects[0].uri.ends_with("two.json"));
        assert!(objects[1].uri.ends_with("one.json"));
    }

    #[tokio::test]
    async fn test_missing_source_is_unavailable() {
        let err = ObjectStoreReader::new()
            .fetch("/definitely/not/here")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_empty_prefix_is_unavailable() {
        let dir = tempdir().unwrap();
        let err = FileSourceReader
            .fetch(&dir.path().display().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_http_source_is_one_object() {
        let body = "{\"ts\":1541440364796,\"page\":\"NextSong\"}\n";
        let uri = serve_once("200 OK", body).await;

        let objects = local_http().fetch(&uri).await.unwrap();

        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].uri, uri);
        assert_eq!(objects[0].bytes, body.as_bytes());
        assert_eq!(objects[0].records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_status_is_unavailable() {
        let uri = serve_once("404 Not Found", "").await;

        let err = local_http().fetch(&uri).await.unwrap_err();

        assert!(matches!(err, LoadError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_http_uri_is_fetched_over_the_network() {
        let uri = serve_once("200 OK", "[{\"song_id\":\"S1\"},{\"song_id\":\"S2\"}]").await;

        let reader = ObjectStoreReader {
            file: FileSourceReader,
            http: local_http(),
        };
        let objects = reader.fetch(&uri).await.unwrap();

        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].records().unwrap().len(), 2);
    }
}
