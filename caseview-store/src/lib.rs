//! Typed HTTP client for the case-document store and its search endpoint.
//!
//! The store speaks a small JSON API plus two binary endpoints (document
//! bytes and pre-rasterized page images). All requests are blocking `ureq`
//! calls; the async trait impls bridge through `spawn_blocking`.

use std::io::Read;

use anyhow::{Context, Result};
use async_trait::async_trait;
use caseview_core::{
    ChatResponse, DocumentStore, DocumentSummary, PageManifest, SearchClient,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store returned HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("failed to reach store at {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("store returned a malformed {what} payload")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read store response body for {path}")]
    Body {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid store path {path:?}")]
    Path { path: String },
}

#[derive(Debug, Deserialize)]
struct DocsResponse {
    docs: Vec<DocumentSummary>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub uploaded: Vec<DocumentSummary>,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
struct ChatPayload<'a> {
    message: &'a str,
}

/// One file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

const UPLOAD_BOUNDARY: &str = "caseview-upload-7f92ac41d03b";

/// Client for one store instance. Cheap to clone; the underlying agent
/// pools connections.
#[derive(Clone)]
pub struct HttpCaseStore {
    base: Url,
    agent: ureq::Agent,
}

impl HttpCaseStore {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            agent: ureq::Agent::new(),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base.join(path).map_err(|_| StoreError::Path {
            path: path.to_string(),
        })
    }

    fn check(path: &str, result: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response, StoreError> {
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, _)) => Err(StoreError::Status {
                status,
                path: path.to_string(),
            }),
            Err(err) => Err(StoreError::Transport {
                path: path.to_string(),
                source: Box::new(err),
            }),
        }
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        what: &'static str,
    ) -> Result<T, StoreError> {
        let url = self.endpoint(path)?;
        let response = Self::check(path, self.agent.request_url("GET", &url).call())?;
        Self::decode_json(path, what, response)
    }

    fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.endpoint(path)?;
        let response = Self::check(path, self.agent.request_url("GET", &url).call())?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|source| StoreError::Body {
                path: path.to_string(),
                source,
            })?;
        Ok(bytes)
    }

    fn decode_json<T: for<'de> Deserialize<'de>>(
        path: &str,
        what: &'static str,
        response: ureq::Response,
    ) -> Result<T, StoreError> {
        let mut body = String::new();
        response
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|source| StoreError::Body {
                path: path.to_string(),
                source,
            })?;
        serde_json::from_str(&body).map_err(|source| StoreError::Decode { what, source })
    }

    fn docs_blocking(&self) -> Result<Vec<DocumentSummary>, StoreError> {
        let response: DocsResponse = self.get_json("api/docs", "document list")?;
        debug!(count = response.docs.len(), "fetched document list");
        Ok(response.docs)
    }

    fn delete_blocking(&self, doc_id: &str) -> Result<DeleteResponse, StoreError> {
        let path = format!("api/doc/{doc_id}");
        let url = self.endpoint(&path)?;
        let response = Self::check(&path, self.agent.request_url("DELETE", &url).call())?;
        let outcome: DeleteResponse = Self::decode_json(&path, "delete outcome", response)?;
        if !outcome.deleted {
            debug!(doc_id, reason = ?outcome.reason, "store declined to delete document");
        }
        Ok(outcome)
    }

    fn file_blocking(&self, doc_id: &str) -> Result<Vec<u8>, StoreError> {
        self.get_bytes(&format!("api/doc/{doc_id}/file"))
    }

    fn manifest_blocking(&self, doc_id: &str) -> Result<PageManifest, StoreError> {
        self.get_json(&format!("api/doc/{doc_id}/manifest"), "page manifest")
    }

    fn page_image_blocking(
        &self,
        doc_id: &str,
        page: usize,
        scale: f32,
    ) -> Result<Vec<u8>, StoreError> {
        self.get_bytes(&format!("api/doc/{doc_id}/page/{page}.png?scale={scale}"))
    }

    fn chat_blocking(&self, message: &str) -> Result<ChatResponse, StoreError> {
        let path = "api/chat";
        let url = self.endpoint(path)?;
        let payload =
            serde_json::to_string(&ChatPayload { message }).map_err(|source| StoreError::Decode {
                what: "chat request",
                source,
            })?;
        let response = Self::check(
            path,
            self.agent
                .request_url("POST", &url)
                .set("Content-Type", "application/json")
                .send_string(&payload),
        )?;
        Self::decode_json(path, "chat response", response)
    }

    fn upload_blocking(&self, files: &[UploadFile]) -> Result<UploadResponse, StoreError> {
        let path = "api/upload";
        let url = self.endpoint(path)?;
        let body = multipart_body(UPLOAD_BOUNDARY, files);
        let content_type = format!("multipart/form-data; boundary={UPLOAD_BOUNDARY}");
        let response = Self::check(
            path,
            self.agent
                .request_url("POST", &url)
                .set("Content-Type", &content_type)
                .send_bytes(&body),
        )?;
        Self::decode_json(path, "upload outcome", response)
    }

    fn health_blocking(&self) -> Result<HealthResponse, StoreError> {
        self.get_json("api/health", "health status")
    }

    /// Uploads PDFs to the store; the store extracts and indexes them and
    /// reports the freshly-created document summaries.
    pub async fn upload(&self, files: Vec<UploadFile>) -> Result<UploadResponse> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.upload_blocking(&files))
            .await
            .context("upload task failed")?
            .map_err(Into::into)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.health_blocking())
            .await
            .context("health task failed")?
            .map_err(Into::into)
    }

    /// Full delete outcome including the store's refusal reason.
    pub async fn delete(&self, doc_id: &str) -> Result<DeleteResponse> {
        let store = self.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || store.delete_blocking(&doc_id))
            .await
            .context("delete task failed")?
            .map_err(Into::into)
    }
}

fn multipart_body(boundary: &str, files: &[UploadFile]) -> Vec<u8> {
    let mut body = Vec::new();
    for file in files {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\n",
                file.name.replace('"', "_")
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/pdf\r\n\r\n");
        body.extend_from_slice(&file.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait]
impl DocumentStore for HttpCaseStore {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.docs_blocking())
            .await
            .context("document list task failed")?
            .map_err(Into::into)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        Ok(self.delete(doc_id).await?.deleted)
    }

    async fn fetch_document(&self, doc_id: &str) -> Result<Vec<u8>> {
        let store = self.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || store.file_blocking(&doc_id))
            .await
            .context("document fetch task failed")?
            .map_err(Into::into)
    }

    async fn fetch_manifest(&self, doc_id: &str) -> Result<PageManifest> {
        let store = self.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || store.manifest_blocking(&doc_id))
            .await
            .context("manifest fetch task failed")?
            .map_err(Into::into)
    }

    async fn fetch_page_image(&self, doc_id: &str, page: usize, scale: f32) -> Result<Vec<u8>> {
        let store = self.clone();
        let doc_id = doc_id.to_string();
        tokio::task::spawn_blocking(move || store.page_image_blocking(&doc_id, page, scale))
            .await
            .context("page image fetch task failed")?
            .map_err(Into::into)
    }

    fn page_image_url(&self, doc_id: &str, page: usize, scale: f32) -> String {
        self.endpoint(&format!("api/doc/{doc_id}/page/{page}.png?scale={scale}"))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("api/doc/{doc_id}/page/{page}.png?scale={scale}"))
    }
}

#[async_trait]
impl SearchClient for HttpCaseStore {
    async fn ask(&self, message: &str) -> Result<ChatResponse> {
        let store = self.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || store.chat_blocking(&message))
            .await
            .context("search task failed")?
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot loopback HTTP server. Accepts a single connection, records
    /// the request head and body, and answers with a canned response.
    struct OneShotServer {
        base: Url,
        handle: thread::JoinHandle<String>,
    }

    impl OneShotServer {
        fn respond(status_line: &str, content_type: &str, body: &[u8]) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let response = {
                let mut r = Vec::new();
                r.extend_from_slice(status_line.as_bytes());
                r.extend_from_slice(
                    format!(
                        "\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .as_bytes(),
                );
                r.extend_from_slice(body);
                r
            };
            let handle = thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = std::io::Read::read(&mut stream, &mut buf).unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let head = &text[..head_end];
                        let expected = head
                            .lines()
                            .find_map(|line| line.strip_prefix("Content-Length: "))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= head_end + 4 + expected {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                stream.write_all(&response).unwrap();
                String::from_utf8_lossy(&request).into_owned()
            });
            Self {
                base: Url::parse(&format!("http://{addr}/")).unwrap(),
                handle,
            }
        }

        fn request(self) -> String {
            self.handle.join().unwrap()
        }
    }

    #[test]
    fn page_image_url_is_absolute_and_carries_the_scale() {
        let store = HttpCaseStore::new(Url::parse("http://127.0.0.1:8000/").unwrap());
        assert_eq!(
            store.page_image_url("a1b2", 3, 1.25),
            "http://127.0.0.1:8000/api/doc/a1b2/page/3.png?scale=1.25"
        );
    }

    #[test]
    fn multipart_body_has_one_part_per_file_and_a_closing_boundary() {
        let body = multipart_body(
            "xyz",
            &[
                UploadFile {
                    name: "payslip.pdf".into(),
                    bytes: b"%PDF-1".to_vec(),
                },
                UploadFile {
                    name: "bank.pdf".into(),
                    bytes: b"%PDF-2".to_vec(),
                },
            ],
        );
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text.matches("--xyz\r\n").count(), 2);
        assert!(text.contains("name=\"files\"; filename=\"payslip.pdf\""));
        assert!(text.contains("name=\"files\"; filename=\"bank.pdf\""));
        assert!(text.ends_with("--xyz--\r\n"));
    }

    #[test]
    fn delete_response_parses_with_and_without_a_reason() {
        let refused: DeleteResponse =
            serde_json::from_str(r#"{"deleted": false, "reason": "not_found"}"#).unwrap();
        assert!(!refused.deleted);
        assert_eq!(refused.reason.as_deref(), Some("not_found"));

        let ok: DeleteResponse = serde_json::from_str(r#"{"deleted": true}"#).unwrap();
        assert!(ok.deleted);
        assert_eq!(ok.reason, None);
    }

    #[tokio::test]
    async fn list_documents_hits_the_docs_endpoint() {
        let server = OneShotServer::respond(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{"docs": [{"doc_id": "a1", "name": "Payslip.pdf", "pages": 2, "sha256": "ff", "uploaded_at": 1700000000.5}]}"#,
        );
        let store = HttpCaseStore::new(server.base.clone());

        let docs = store.list_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, "a1");
        assert_eq!(docs[0].name, "Payslip.pdf");
        assert_eq!(docs[0].pages, 2);

        let request = server.request();
        assert!(request.starts_with("GET /api/docs HTTP/1.1"));
    }

    #[tokio::test]
    async fn ask_posts_the_message_and_parses_the_full_response() {
        let server = OneShotServer::respond(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{
                "intent": {"task": "find", "field": "net pay", "month": null, "cross_docs": false, "raw": "net pay"},
                "results": [{"doc_id": "a1", "doc_name": "Payslip.pdf", "total_hits": 1,
                             "highlights": [{"page": 0, "rects": [[0.1, 0.2, 0.5, 0.6]], "label": "net pay", "score": 0.9}]}],
                "order": [{"doc_id": "a1", "doc_name": "Payslip.pdf", "page": 0, "hit_idx": 0}]
            }"#,
        );
        let store = HttpCaseStore::new(server.base.clone());

        let response = store.ask("net pay").await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].total_hits, 1);
        assert_eq!(response.order.len(), 1);
        assert_eq!(response.intent.field, "net pay");

        let request = server.request();
        assert!(request.starts_with("POST /api/chat HTTP/1.1"));
        assert!(request.contains("Content-Type: application/json"));
        assert!(request.contains(r#"{"message":"net pay"}"#));
    }

    #[tokio::test]
    async fn delete_surfaces_the_store_refusal() {
        let server = OneShotServer::respond(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{"deleted": false, "reason": "not_found"}"#,
        );
        let store = HttpCaseStore::new(server.base.clone());

        assert!(!store.delete_document("missing").await.unwrap());
        let request = server.request();
        assert!(request.starts_with("DELETE /api/doc/missing HTTP/1.1"));
    }

    #[tokio::test]
    async fn http_error_status_maps_to_a_typed_error() {
        let server = OneShotServer::respond("HTTP/1.1 500 Internal Server Error", "text/plain", b"boom");
        let store = HttpCaseStore::new(server.base.clone());

        let err = store.fetch_document("a1").await.unwrap_err();
        let store_err = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(store_err, StoreError::Status { status: 500, .. }));
        server.request();
    }

    #[tokio::test]
    async fn upload_sends_multipart_and_parses_the_created_docs() {
        let server = OneShotServer::respond(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{"uploaded": [{"doc_id": "b2", "name": "bank.pdf", "pages": 5}]}"#,
        );
        let store = HttpCaseStore::new(server.base.clone());

        let outcome = store
            .upload(vec![UploadFile {
                name: "bank.pdf".into(),
                bytes: b"%PDF-1.7".to_vec(),
            }])
            .await
            .unwrap();
        assert_eq!(outcome.uploaded.len(), 1);
        assert_eq!(outcome.uploaded[0].doc_id, "b2");

        let request = server.request();
        assert!(request.starts_with("POST /api/upload HTTP/1.1"));
        assert!(request.contains("multipart/form-data; boundary="));
        assert!(request.contains("filename=\"bank.pdf\""));
        assert!(request.contains("%PDF-1.7"));
    }
}
