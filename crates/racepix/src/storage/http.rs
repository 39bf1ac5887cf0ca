//! HTTP object storage client.
//!
//! Speaks a small REST dialect:
//!
//! - `POST   {base}/object/{bucket}/{path}` uploads (upserting)
//! - `DELETE {base}/object/{bucket}/{path}` removes
//! - `POST   {base}/object/list/{bucket}` with `{prefix, limit, offset}` lists
//! - `{base}/object/public/{bucket}/{path}` is the public URL
//!
//! Each path segment is percent-encoded, so keys may contain `#`, `%` or
//! spaces. Every request carries `Authorization: Bearer <token>`; the token
//! comes from a [`TokenProvider`] and is replaced on
//! [`ObjectStore::refresh_credentials`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{append_segments, validate_object_path, ObjectStore, StoredObject};
use crate::error::StorageError;
use crate::secrets::SecretSource;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Photos are small, but archives through `put_file` can be large.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

const LIST_PAGE_SIZE: usize = 1000;

/// Source of bearer tokens for storage requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<SecretString, StorageError>;
}

/// A token that never changes.
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self(SecretString::from(token.to_string()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn fetch_token(&self) -> Result<SecretString, StorageError> {
        Ok(SecretString::from(self.0.expose_secret().to_string()))
    }
}

/// Re-resolves a configured secret on every fetch, so a token file rewritten
/// by an external refresher is picked up.
#[async_trait]
impl TokenProvider for SecretSource {
    async fn fetch_token(&self) -> Result<SecretString, StorageError> {
        self.resolve()
            .map_err(|e| StorageError::Unauthorized(e.to_string()))
    }
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
}

pub struct HttpObjectStore {
    client: Client,
    base_url: Url,
    bucket: String,
    provider: Arc<dyn TokenProvider>,
    token: RwLock<Option<SecretString>>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        bucket: &str,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Self::with_client(client, base_url, bucket, provider)
    }

    pub fn with_client(
        client: Client,
        base_url: &str,
        bucket: &str,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidBaseUrl(base_url.to_string());
        let base_url = Url::parse(base_url).map_err(|_| invalid())?;
        if base_url.cannot_be_a_base() {
            return Err(invalid());
        }
        Ok(Self {
            client,
            base_url,
            bucket: bucket.to_string(),
            provider,
            token: RwLock::new(None),
        })
    }

    /// `{base}/{route...}/{bucket}/{path}` with every segment encoded.
    fn url_for(&self, route: &[&str], path: &str) -> Url {
        let segments = route
            .iter()
            .copied()
            .chain(std::iter::once(self.bucket.as_str()))
            .chain(path.split('/'));
        append_segments(&self.base_url, segments)
    }

    fn object_url(&self, path: &str) -> Url {
        self.url_for(&["object"], path)
    }

    fn cached_token(&self) -> Option<String> {
        let guard = match self.token.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Storage token lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.as_ref().map(|t| t.expose_secret().to_string())
    }

    fn store_token(&self, token: SecretString) {
        let mut guard = match self.token.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Storage token lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(token);
    }

    async fn bearer(&self) -> Result<String, StorageError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        self.refresh_credentials().await?;
        self.cached_token()
            .ok_or_else(|| StorageError::Unauthorized("no storage token available".to_string()))
    }
}

async fn check(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(StorageError::Unauthorized(body));
    }
    Err(StorageError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        validate_object_path(path)?;
        let size_bytes = bytes.len() as u64;
        let response = self
            .client
            .post(self.object_url(path))
            .bearer_auth(self.bearer().await?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        check(response).await?;
        tracing::debug!(bucket = %self.bucket, path, size_bytes, "Stored object");
        Ok(StoredObject {
            path: path.to_string(),
            size_bytes,
        })
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_object_path(path)?;
        let response = self
            .client
            .delete(self.object_url(path))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = self.url_for(&["object", "list"], "");
        let mut paths = Vec::new();
        let mut offset = 0;
        loop {
            let response = self
                .client
                .post(url.clone())
                .bearer_auth(self.bearer().await?)
                .json(&ListRequest {
                    prefix,
                    limit: LIST_PAGE_SIZE,
                    offset,
                })
                .send()
                .await?;
            let page: Vec<ListEntry> = check(response).await?.json().await?;
            let count = page.len();
            paths.extend(page.into_iter().map(|entry| entry.name));
            if count < LIST_PAGE_SIZE {
                break;
            }
            offset += count;
        }
        paths.sort();
        Ok(paths)
    }

    fn public_url(&self, path: &str) -> String {
        self.url_for(&["object", "public"], path).into()
    }

    async fn refresh_credentials(&self) -> Result<(), StorageError> {
        let token = self.provider.fetch_token().await?;
        self.store_token(token);
        tracing::debug!(bucket = %self.bucket, "Storage credentials refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RotatingToken {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for RotatingToken {
        async fn fetch_token(&self) -> Result<SecretString, StorageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SecretString::from(format!("token-{}", n)))
        }
    }

    fn store(server: &MockServer, provider: Arc<dyn TokenProvider>) -> HttpObjectStore {
        HttpObjectStore::new(&server.uri(), "photos", provider).unwrap()
    }

    #[tokio::test]
    async fn test_put_sends_bearer_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/object/photos/evt/photo-1.jpg"))
            .and(header("authorization", "Bearer secret"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("secret")));
        let stored = store
            .put("evt/photo-1.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 3);
    }

    #[tokio::test]
    async fn test_reserved_characters_stay_in_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("t")));
        let key = "evt-1/job-1-race#1 100%.zip";
        store.put(key, vec![1], "application/zip").await.unwrap();
        store.delete(key).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let paths: Vec<_> = requests.iter().map(|r| r.url.path().to_string()).collect();
        let expected = "/object/photos/evt-1/job-1-race%231%20100%25.zip";
        assert_eq!(paths, vec![expected, expected]);
        assert!(requests.iter().all(|r| r.url.fragment().is_none()));
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        let err = HttpObjectStore::new("not a url", "photos", Arc::new(StaticToken::new("t")))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::InvalidBaseUrl(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("jwt expired"))
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("stale")));
        let err = store.put("evt/a.jpg", vec![1], "image/jpeg").await.unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_auth_shaped_body_on_400_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"InvalidJWT","message":"jwt expired"}"#),
            )
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("stale")));
        let err = store.put("evt/a.jpg", vec![1], "image/jpeg").await.unwrap_err();
        assert!(matches!(err, StorageError::Status { status: 400, .. }));
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_delete_treats_404_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/object/photos/evt/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("t")));
        store.delete("evt/gone.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_posts_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/object/list/photos"))
            .and(body_json(serde_json::json!({
                "prefix": "evt/",
                "limit": LIST_PAGE_SIZE,
                "offset": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "evt/photo-b.jpg"},
                {"name": "evt/photo-a.jpg"}
            ])))
            .mount(&server)
            .await;

        let store = store(&server, Arc::new(StaticToken::new("t")));
        assert_eq!(
            store.list("evt/").await.unwrap(),
            vec!["evt/photo-a.jpg", "evt/photo-b.jpg"]
        );
    }

    #[tokio::test]
    async fn test_refresh_replaces_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(
            &server,
            Arc::new(RotatingToken {
                calls: AtomicUsize::new(0),
            }),
        );
        store.put("evt/a.jpg", vec![1], "image/jpeg").await.unwrap();
        store.refresh_credentials().await.unwrap();
        store.put("evt/b.jpg", vec![1], "image/jpeg").await.unwrap();
    }

    #[test]
    fn test_public_url() {
        let store = HttpObjectStore::new(
            "https://storage.example.com/",
            "public",
            Arc::new(StaticToken::new("t")),
        )
        .unwrap();
        assert_eq!(
            store.public_url("evt/watermarked/photo-1.jpg"),
            "https://storage.example.com/object/public/public/evt/watermarked/photo-1.jpg"
        );
    }
}
