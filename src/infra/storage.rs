//! Supabase Storage client backing [`ObjectStore`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use bytes::Bytes;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::application::publish::{ObjectStore, StorageError};
use crate::config::StorageConnection;

use super::error::InfraError;

const MAX_ERROR_BODY_CHARS: usize = 512;
const REDACTED: &str = "[redacted]";

pub struct SupabaseStorage {
    client: Client,
    /// `{base}/storage/v1`, without a trailing slash.
    storage_root: Url,
    bucket: String,
    service_key: String,
}

impl fmt::Debug for SupabaseStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseStorage")
            .field("storage_root", &self.storage_root.as_str())
            .field("bucket", &self.bucket)
            .field("service_key", &REDACTED)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignResponse {
    Batch(Vec<SignEntry>),
    Single(SignEntry),
}

#[derive(Debug, Deserialize)]
struct SignEntry {
    #[serde(default, rename = "signedURL")]
    signed_url_upper: Option<String>,
    #[serde(default, rename = "signedUrl")]
    signed_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SignEntry {
    fn into_signed(self) -> Result<String, StorageError> {
        if let Some(error) = self.error {
            return Err(StorageError::invalid_response(format!(
                "sign entry reported an error: {error}"
            )));
        }
        self.signed_url_upper
            .or(self.signed_url)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| StorageError::invalid_response("sign response has no signed URL"))
    }
}

impl SupabaseStorage {
    pub fn new(
        connection: &StorageConnection,
        request_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("deckpress/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|err| InfraError::storage_client(err.to_string()))?;

        let mut storage_root = connection.url.clone();
        storage_root.set_query(None);
        storage_root.set_fragment(None);
        storage_root
            .path_segments_mut()
            .map_err(|_| InfraError::configuration("storage url cannot be a base"))?
            .pop_if_empty()
            .extend(["storage", "v1"]);

        Ok(Self {
            client,
            storage_root,
            bucket: connection.bucket.clone(),
            service_key: connection.service_key.clone(),
        })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.storage_root.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn object_url(&self, key: &str) -> Url {
        self.endpoint(
            ["object", self.bucket.as_str()]
                .into_iter()
                .chain(key.split('/')),
        )
    }

    fn sign_endpoint(&self) -> Url {
        self.endpoint(["object", "sign", self.bucket.as_str()])
    }

    /// Resolve what the sign endpoint returned into an absolute URL.
    ///
    /// Current Supabase returns a path relative to `/storage/v1` that starts
    /// with `/object/sign/`; older deployments return just the token part.
    fn absolute_signed_url(&self, signed: &str) -> Result<String, StorageError> {
        if let Ok(url) = Url::parse(signed)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(url.into());
        }

        let root = self.storage_root.as_str().trim_end_matches('/');
        let candidate = if signed.starts_with('/') {
            format!("{root}{signed}")
        } else {
            format!(
                "{root}/object/sign/{}/{}",
                self.bucket,
                signed.trim_start_matches('/')
            )
        };
        Url::parse(&candidate)
            .map(String::from)
            .map_err(|err| StorageError::invalid_response(format!("signed URL is invalid: {err}")))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
    }

    async fn failure(&self, response: Response) -> StorageError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        StorageError::Status {
            status,
            body: self.sanitize_body(&text),
        }
    }

    fn sanitize_body(&self, body: &str) -> String {
        let redacted = if self.service_key.is_empty() {
            body.to_string()
        } else {
            body.replace(&self.service_key, REDACTED)
        };
        let mut chars = redacted.chars();
        let mut truncated: String = chars.by_ref().take(MAX_ERROR_BODY_CHARS).collect();
        if chars.next().is_some() {
            truncated.push_str("...");
        }
        truncated
    }
}

fn transport(err: reqwest::Error) -> StorageError {
    StorageError::transport(err.without_url().to_string())
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .authorized(self.client.put(self.object_url(key)))
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(self.failure(response).await);
        }
        debug!(
            target = "infra::storage",
            op = "storage::put",
            key,
            "Object uploaded"
        );
        Ok(())
    }

    async fn create_signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let payload = json!({
            "expiresIn": expires_in.as_secs(),
            "paths": [key],
        });
        let response = self
            .authorized(self.client.post(self.sign_endpoint()))
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(self.failure(response).await);
        }

        let bytes = response.bytes().await.map_err(transport)?;
        let parsed: SignResponse = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::invalid_response(format!("sign response is not valid JSON: {err}"))
        })?;
        let entry = match parsed {
            SignResponse::Batch(entries) => entries
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::invalid_response("sign response is empty"))?,
            SignResponse::Single(entry) => entry,
        };

        self.absolute_signed_url(&entry.into_signed()?)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .authorized(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(self.failure(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    const KEY: &str = "users/user_1/exports/Q3_Report.pdf";
    const SERVICE_KEY: &str = "service-role-secret";

    fn storage(server: &MockServer) -> SupabaseStorage {
        let connection = StorageConnection {
            url: Url::parse(&server.base_url()).expect("base url"),
            service_key: SERVICE_KEY.to_string(),
            bucket: "exports".to_string(),
        };
        SupabaseStorage::new(&connection, Duration::from_secs(5)).expect("storage")
    }

    #[tokio::test]
    async fn put_uploads_with_credentials_and_upsert() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("PUT")
                .path("/storage/v1/object/exports/users/user_1/exports/Q3_Report.pdf")
                .header("authorization", "Bearer service-role-secret")
                .header("apikey", SERVICE_KEY)
                .header("content-type", "application/pdf")
                .header("x-upsert", "true")
                .body("%PDF-1.7 test");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"Key":"exports/users/user_1/exports/Q3_Report.pdf"}"#);
        });

        storage(&server)
            .put_object(KEY, Bytes::from_static(b"%PDF-1.7 test"), "application/pdf")
            .await
            .expect("upload");
        mock.assert();
    }

    #[tokio::test]
    async fn put_failure_reports_status_without_secret() {
        let server = MockServer::start();
        let long_tail = "x".repeat(2000);
        server.mock(|when, then| {
            when.method("PUT");
            then.status(403)
                .body(format!("denied for {SERVICE_KEY} {long_tail}"));
        });

        let err = storage(&server)
            .put_object(KEY, Bytes::from_static(b"%PDF-"), "application/pdf")
            .await
            .expect_err("upload fails");

        match err {
            StorageError::Status { status, body } => {
                assert_eq!(status, 403);
                assert!(!body.contains(SERVICE_KEY));
                assert!(body.starts_with("denied for [redacted]"));
                assert!(body.chars().count() <= MAX_ERROR_BODY_CHARS + 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sign_resolves_relative_path_against_storage_root() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/storage/v1/object/sign/exports")
                .header("authorization", "Bearer service-role-secret")
                .json_body(json!({ "expiresIn": 3600, "paths": [KEY] }));
            then.status(200).json_body(json!([{
                "error": null,
                "path": KEY,
                "signedURL": "/object/sign/exports/users/user_1/exports/Q3_Report.pdf?token=abc"
            }]));
        });

        let url = storage(&server)
            .create_signed_url(KEY, Duration::from_secs(3600))
            .await
            .expect("signed url");

        mock.assert();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/sign/exports/users/user_1/exports/Q3_Report.pdf?token=abc",
                server.base_url()
            )
        );
    }

    #[tokio::test]
    async fn sign_accepts_camel_case_field() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/storage/v1/object/sign/exports");
            then.status(200)
                .json_body(json!([{ "signedUrl": "/object/sign/exports/a.pdf?token=t" }]));
        });

        let url = storage(&server)
            .create_signed_url("a.pdf", Duration::from_secs(60))
            .await
            .expect("signed url");
        assert!(url.starts_with(&server.base_url()));
        assert!(url.ends_with("/storage/v1/object/sign/exports/a.pdf?token=t"));
    }

    #[tokio::test]
    async fn sign_error_entry_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/storage/v1/object/sign/exports");
            then.status(200)
                .json_body(json!([{ "error": "Either the object does not exist or you do not have access to it", "path": KEY, "signedURL": null }]));
        });

        let err = storage(&server)
            .create_signed_url(KEY, Duration::from_secs(60))
            .await
            .expect_err("sign fails");
        assert!(matches!(err, StorageError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn sign_http_failure_keeps_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/storage/v1/object/sign/exports");
            then.status(400).body("Bucket not found");
        });

        let err = storage(&server)
            .create_signed_url(KEY, Duration::from_secs(60))
            .await
            .expect_err("sign fails");
        assert_eq!(
            err,
            StorageError::Status {
                status: 400,
                body: "Bucket not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn delete_targets_object_path() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("DELETE")
                .path("/storage/v1/object/exports/users/user_1/exports/Q3_Report.pdf")
                .header("apikey", SERVICE_KEY);
            then.status(200).body("{}");
        });

        storage(&server).delete_object(KEY).await.expect("delete");
        mock.assert();
    }

    #[test]
    fn legacy_token_only_response_is_joined_under_bucket() {
        let connection = StorageConnection {
            url: Url::parse("https://proj.supabase.co/").expect("url"),
            service_key: SERVICE_KEY.to_string(),
            bucket: "exports".to_string(),
        };
        let storage = SupabaseStorage::new(&connection, Duration::from_secs(5)).expect("storage");
        assert_eq!(
            storage
                .absolute_signed_url("a.pdf?token=t")
                .expect("signed url"),
            "https://proj.supabase.co/storage/v1/object/sign/exports/a.pdf?token=t"
        );
        assert_eq!(
            storage
                .absolute_signed_url("https://cdn.test/x?token=t")
                .expect("absolute"),
            "https://cdn.test/x?token=t"
        );
    }

    #[test]
    fn debug_output_redacts_service_key() {
        let connection = StorageConnection {
            url: Url::parse("https://proj.supabase.co").expect("url"),
            service_key: SERVICE_KEY.to_string(),
            bucket: "exports".to_string(),
        };
        let storage = SupabaseStorage::new(&connection, Duration::from_secs(5)).expect("storage");
        assert!(!format!("{storage:?}").contains(SERVICE_KEY));
    }
}
