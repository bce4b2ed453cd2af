use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

use crate::error::ArchiveError;
use crate::progress::CancelToken;

const FETCH_CHUNK_BYTES: usize = 64 * 1024;

/// Classified outcome of a single remote operation. `NotFound` confirms a
/// gap, `Transient` is worth retrying, `Permanent` is not. `LocalWrite`
/// covers destination failures surfaced mid-stream; it fails the task
/// without a retry.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found")]
    NotFound,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    #[error("local write failed: {0}")]
    LocalWrite(String),

    #[error("cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn for_key(self, key: &str) -> ArchiveError {
        match self {
            RemoteError::NotFound => ArchiveError::RemoteNotFound(key.to_string()),
            RemoteError::Transient(message) => {
                ArchiveError::RemoteTransient(format!("{key}: {message}"))
            }
            RemoteError::Permanent { status, message } => ArchiveError::RemotePermanent {
                status,
                message: format!("{key}: {message}"),
            },
            RemoteError::LocalWrite(message) => ArchiveError::LocalWrite(message),
            RemoteError::Cancelled => ArchiveError::Cancelled,
        }
    }
}

/// One remote archive backend. Listing is a capability, not a given:
/// callers check `supports_listing` before relying on `list`.
pub trait RemoteStore: Send + Sync + Clone {
    fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    /// Streams the object into `dest`, checking the cancellation token
    /// between chunks. Returns the number of bytes written.
    fn fetch(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, RemoteError>;

    fn supports_listing(&self) -> bool;

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;
}

fn default_client(timeout: Duration) -> Result<Client, ArchiveError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("sat-archive/{}", env!("CARGO_PKG_VERSION"))).map_err(
            |err| ArchiveError::RemotePermanent {
                status: None,
                message: err.to_string(),
            },
        )?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| ArchiveError::RemotePermanent {
            status: None,
            message: err.to_string(),
        })
}

fn classify_status(status: StatusCode, context: &str) -> RemoteError {
    match status.as_u16() {
        404 => RemoteError::NotFound,
        code @ (408 | 429 | 500 | 502 | 503 | 504) => {
            RemoteError::Transient(format!("{context} returned status {code}"))
        }
        code => RemoteError::Permanent {
            status: Some(code),
            message: format!("{context} returned status {code}"),
        },
    }
}

fn classify_transport(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Permanent {
            status: None,
            message: err.to_string(),
        }
    }
}

fn copy_chunked(
    mut response: Response,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<u64, RemoteError> {
    let mut file = File::create(dest).map_err(|err| RemoteError::LocalWrite(err.to_string()))?;
    let mut buf = vec![0u8; FETCH_CHUNK_BYTES];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let read = response
            .read(&mut buf)
            .map_err(|err| RemoteError::Transient(err.to_string()))?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .map_err(|err| RemoteError::LocalWrite(err.to_string()))?;
        written += read as u64;
    }
    file.flush()
        .map_err(|err| RemoteError::LocalWrite(err.to_string()))?;
    Ok(written)
}

/// Path-addressed HTTP/CDN backend. No listing; existence is probed per
/// candidate with a HEAD request.
#[derive(Clone)]
pub struct CdnClient {
    client: Client,
    base_url: String,
}

impl CdnClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        Ok(Self {
            client: default_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

impl RemoteStore for CdnClient {
    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let url = self.url_for(key);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|err| classify_transport(&err))?;
        if response.status().is_success() {
            return Ok(true);
        }
        match classify_status(response.status(), "cdn") {
            RemoteError::NotFound => Ok(false),
            err => Err(err),
        }
    }

    fn fetch(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, RemoteError> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| classify_transport(&err))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "cdn"));
        }
        copy_chunked(response, dest, cancel)
    }

    fn supports_listing(&self) -> bool {
        false
    }

    fn list(&self, _prefix: &str) -> Result<Vec<String>, RemoteError> {
        Err(RemoteError::Permanent {
            status: None,
            message: "cdn backend does not support listing".to_string(),
        })
    }
}

/// S3-style object storage backend with anonymous access: prefix listing
/// via `list-type=2` pagination, HEAD existence checks, GET fetches.
#[derive(Clone)]
pub struct BucketClient {
    client: Client,
    endpoint: String,
    bucket: String,
}

impl BucketClient {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ArchiveError> {
        Ok(Self {
            client: default_client(timeout)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }
}

impl RemoteStore for BucketClient {
    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let url = self.object_url(key);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|err| classify_transport(&err))?;
        if response.status().is_success() {
            return Ok(true);
        }
        match classify_status(response.status(), "bucket") {
            RemoteError::NotFound => Ok(false),
            err => Err(err),
        }
    }

    fn fetch(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, RemoteError> {
        let url = self.object_url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| classify_transport(&err))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "bucket"));
        }
        copy_chunked(response, dest, cancel)
    }

    fn supports_listing(&self) -> bool {
        true
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("list-type", "2".to_string()),
                ("prefix", prefix.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token", token.clone()));
            }
            let response = self
                .client
                .get(self.bucket_url())
                .query(&query)
                .send()
                .map_err(|err| classify_transport(&err))?;
            if !response.status().is_success() {
                return Err(classify_status(response.status(), "bucket list"));
            }
            let body = response
                .text()
                .map_err(|err| classify_transport(&err))?;
            let page = parse_list_page(&body)?;
            keys.extend(page.keys);
            if page.truncated {
                match page.next_token {
                    Some(token) => continuation = Some(token),
                    None => break,
                }
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_list_page(body: &str) -> Result<ListPage, RemoteError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut page = ListPage {
        keys: Vec::new(),
        truncated: false,
        next_token: None,
    };
    let mut current: Vec<u8> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => current = element.name().as_ref().to_vec(),
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| RemoteError::Permanent {
                        status: None,
                        message: format!("malformed listing: {err}"),
                    })?
                    .into_owned();
                match current.as_slice() {
                    b"Key" => page.keys.push(value),
                    b"IsTruncated" => page.truncated = value == "true",
                    b"NextContinuationToken" => page.next_token = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current.clear(),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(RemoteError::Permanent {
                    status: None,
                    message: format!("malformed listing: {err}"),
                });
            }
        }
    }
    Ok(page)
}

/// Backend selected once at construction time from configuration. The two
/// variants differ in capability: the bucket can enumerate a prefix, the
/// CDN must be probed per candidate.
#[derive(Clone)]
pub enum ArchiveBackend {
    Cdn(CdnClient),
    Bucket(BucketClient),
}

impl RemoteStore for ArchiveBackend {
    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        match self {
            ArchiveBackend::Cdn(client) => client.exists(key),
            ArchiveBackend::Bucket(client) => client.exists(key),
        }
    }

    fn fetch(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<u64, RemoteError> {
        match self {
            ArchiveBackend::Cdn(client) => client.fetch(key, dest, cancel),
            ArchiveBackend::Bucket(client) => client.fetch(key, dest, cancel),
        }
    }

    fn supports_listing(&self) -> bool {
        match self {
            ArchiveBackend::Cdn(client) => client.supports_listing(),
            ArchiveBackend::Bucket(client) => client.supports_listing(),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        match self {
            ArchiveBackend::Cdn(client) => client.list(prefix),
            ArchiveBackend::Bucket(client) => client.list(prefix),
        }
    }
}
