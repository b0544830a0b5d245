//! Asset HTTP surface: one request per connection.
//!
//! `POST /repository` creates a repository; `GET`/`HEAD /asset/v0/<repo>/<name>`
//! serve an asset with byte-range support (`?download=1` forces a full
//! attachment); `PUT /asset/v0/<repo>/<name>` uploads through the upload policy.
//! Uploads need `Content-Length`; transfer codings are answered with 501.

use std::fmt::Write as _;
use std::io::SeekFrom;
use std::sync::Arc;

use colossus_core::ranges::{self, ServePlan, Span};
use colossus_core::repository::DEFAULT_MIME;
use colossus_core::{
    Repository, RepositoryBackend, RepositoryError, RepositoryId, SharedPool, UploadPolicy,
    UploadRejected,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

const MAX_HEADERS: usize = 32;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const ASSET_PREFIX: &str = "/asset/v0/";

/// Everything a request handler needs.
pub struct AssetService {
    pool: SharedPool,
    policy: UploadPolicy,
}

impl AssetService {
    pub fn new(pool: SharedPool, policy: UploadPolicy) -> Self {
        Self { pool, policy }
    }

    async fn repository(&self, id: &str) -> Result<Arc<Repository>, Failure> {
        let id: RepositoryId = id.parse()?;
        let found = self.pool.lock().await.get(&id).await?;
        found.ok_or_else(|| Failure::Status(404, format!("repository {id} not found")))
    }
}

/// Why a request did not complete normally.
enum Failure {
    /// Answer with this status and message.
    Status(u16, String),
    /// The client connection itself broke.
    Io(std::io::Error),
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Failure::Io(e)
    }
}

impl From<RepositoryError> for Failure {
    fn from(e: RepositoryError) -> Self {
        if matches!(e, RepositoryError::PathEscape(_)) {
            tracing::warn!(error = %e, "refused path outside repository");
        }
        Failure::Status(e.status_code(), e.to_string())
    }
}

impl From<UploadRejected> for Failure {
    fn from(e: UploadRejected) -> Self {
        Failure::Status(e.status_code(), e.to_string())
    }
}

struct Request {
    method: String,
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    /// Body bytes that arrived together with the head.
    body_start: Vec<u8>,
}

impl Request {
    fn from_parsed(req: &httparse::Request<'_, '_>, body_start: Vec<u8>) -> Self {
        let target = req.path.unwrap_or("/");
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method: req.method.unwrap_or("").to_string(),
            path,
            query,
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect(),
            body_start,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn wants_download(&self) -> bool {
        self.query.as_deref().is_some_and(|q| {
            q.split('&').any(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                key == "download" && matches!(value, "" | "1" | "true")
            })
        })
    }
}

async fn read_request<S>(io: &mut S) -> std::io::Result<Option<Request>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                return Ok(Some(Request::from_parsed(&req, buf[len..].to_vec())));
            }
            Ok(httparse::Status::Partial) if buf.len() <= MAX_HEAD_BYTES => {}
            Ok(httparse::Status::Partial) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        501 => "Not Implemented",
        _ => "Internal Server Error",
    }
}

async fn write_head<S>(io: &mut S, status: u16, headers: &[(&str, String)]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason(status));
    for (name, value) in headers {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    io.write_all(head.as_bytes()).await
}

async fn write_json<S>(io: &mut S, status: u16, body: &serde_json::Value) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = body.to_string();
    write_head(
        io,
        status,
        &[
            ("Content-Type", "application/json".to_string()),
            ("Content-Length", body.len().to_string()),
        ],
    )
    .await?;
    io.write_all(body.as_bytes()).await?;
    io.flush().await
}

/// Copy `span` of `file` to the client.
async fn copy_span<S>(io: &mut S, file: &mut tokio::fs::File, span: Span) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    file.seek(SeekFrom::Start(span.start)).await?;
    let mut part = file.take(span.len());
    tokio::io::copy(&mut part, io).await?;
    Ok(())
}

/// Bind the HTTP port and serve requests until the listener fails.
pub async fn run_http(port: u16, service: Arc<AssetService>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "asset http listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, service).await {
                tracing::debug!(%addr, error = %e, "http client dropped");
            }
        });
    }
}

/// Serve one request on `io`, then close it.
pub async fn handle_client<S>(mut io: S, service: Arc<AssetService>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(req) = read_request(&mut io).await? else {
        return Ok(());
    };
    tracing::debug!(method = %req.method, path = %req.path, "http request");
    match route(&mut io, &service, req).await {
        Ok(()) => {}
        Err(Failure::Status(status, message)) => {
            write_json(&mut io, status, &json!({ "message": message })).await?;
        }
        Err(Failure::Io(e)) => return Err(e),
    }
    io.shutdown().await
}

async fn route<S>(io: &mut S, service: &AssetService, req: Request) -> Result<(), Failure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if req.path == "/repository" {
        return match req.method.as_str() {
            "POST" => create_repository(io, service).await,
            _ => Err(Failure::Status(405, format!("{} not allowed", req.method))),
        };
    }
    let Some(rest) = req.path.strip_prefix(ASSET_PREFIX) else {
        return Err(Failure::Status(404, format!("no route for {}", req.path)));
    };
    let Some((id, name)) = rest.split_once('/').filter(|(_, name)| !name.is_empty()) else {
        return Err(Failure::Status(404, format!("no route for {}", req.path)));
    };
    let (id, name) = (id.to_string(), name.to_string());
    match req.method.as_str() {
        "GET" => serve_asset(io, service, &req, &id, &name, false).await,
        "HEAD" => serve_asset(io, service, &req, &id, &name, true).await,
        "PUT" => upload_asset(io, service, req, &id, &name).await,
        other => Err(Failure::Status(405, format!("{other} not allowed"))),
    }
}

async fn create_repository<S>(io: &mut S, service: &AssetService) -> Result<(), Failure>
where
    S: AsyncWrite + Unpin,
{
    let (id, _) = service.pool.lock().await.create().await?;
    tracing::info!(repository = %id, "repository created");
    write_json(io, 201, &json!({ "id": id.as_str() })).await?;
    Ok(())
}

async fn serve_asset<S>(
    io: &mut S,
    service: &AssetService,
    req: &Request,
    id: &str,
    name: &str,
    head_only: bool,
) -> Result<(), Failure>
where
    S: AsyncWrite + Unpin,
{
    let repo = service.repository(id).await?;
    let stats = repo.stat(name, true).await?;
    let size = stats.size;
    let mime = stats.mime.unwrap_or_else(|| DEFAULT_MIME.to_string());
    let mut file = repo.open_read(name).await?;

    if req.wants_download() {
        let filename = name.rsplit('/').next().unwrap_or(name);
        write_head(
            io,
            200,
            &[
                ("Content-Type", mime),
                ("Content-Length", size.to_string()),
                (
                    "Content-Disposition",
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
        )
        .await?;
        if !head_only {
            tokio::io::copy(&mut file, io).await?;
        }
        io.flush().await?;
        return Ok(());
    }

    let plan = match req.header("range").map(ranges::parse) {
        None => ServePlan::Full,
        Some(Ok(header)) => header.plan(size),
        Some(Err(e)) => {
            tracing::debug!(error = %e, "ignoring malformed range");
            ServePlan::Full
        }
    };

    match plan {
        ServePlan::Full => {
            write_head(
                io,
                200,
                &[
                    ("Content-Type", mime),
                    ("Content-Length", size.to_string()),
                    ("Accept-Ranges", "bytes".to_string()),
                ],
            )
            .await?;
            if !head_only {
                tokio::io::copy(&mut file, io).await?;
            }
        }
        ServePlan::Single(span) => {
            write_head(
                io,
                206,
                &[
                    ("Content-Type", mime),
                    ("Content-Length", span.len().to_string()),
                    ("Content-Range", ranges::content_range(&span, size)),
                    ("Accept-Ranges", "bytes".to_string()),
                ],
            )
            .await?;
            if !head_only {
                copy_span(io, &mut file, span).await?;
            }
        }
        ServePlan::Multipart(spans) => {
            let boundary = uuid::Uuid::new_v4().to_string();
            let part_heads: Vec<String> = spans
                .iter()
                .map(|span| {
                    format!(
                        "--{boundary}\r\nContent-Type: {mime}\r\nContent-Range: {}\r\n\r\n",
                        ranges::content_range(span, size)
                    )
                })
                .collect();
            let trailer = format!("--{boundary}--\r\n");
            let length: u64 = spans
                .iter()
                .zip(&part_heads)
                .map(|(span, head)| head.len() as u64 + span.len() + 2)
                .sum::<u64>()
                + trailer.len() as u64;
            write_head(
                io,
                206,
                &[
                    (
                        "Content-Type",
                        format!("multipart/byteranges; boundary={boundary}"),
                    ),
                    ("Content-Length", length.to_string()),
                    ("Accept-Ranges", "bytes".to_string()),
                ],
            )
            .await?;
            if !head_only {
                for (span, head) in spans.iter().zip(&part_heads) {
                    io.write_all(head.as_bytes()).await?;
                    copy_span(io, &mut file, *span).await?;
                    io.write_all(b"\r\n").await?;
                }
                io.write_all(trailer.as_bytes()).await?;
            }
        }
        ServePlan::Unsatisfiable => {
            write_head(
                io,
                416,
                &[
                    ("Content-Range", ranges::unsatisfied_range(size)),
                    ("Content-Length", "0".to_string()),
                ],
            )
            .await?;
        }
    }
    io.flush().await?;
    Ok(())
}

/// Media type from a `Content-Type` value, without parameters.
fn declared_mime(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}

async fn upload_asset<S>(
    io: &mut S,
    service: &AssetService,
    req: Request,
    id: &str,
    name: &str,
) -> Result<(), Failure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(coding) = req.header("transfer-encoding") {
        return Err(Failure::Status(501, format!("transfer-encoding {coding:?} not supported")));
    }
    let repo = service.repository(id).await?;
    // Headers alone can already settle size and declared type.
    let declared = req.header("content-type").map(declared_mime);
    let accepted = service.policy.check(req.header_pairs(), declared)?;
    let Some(length) = accepted.content_length else {
        return Err(UploadRejected::LengthRequired.into());
    };

    let mut writer = repo.open_write(name).await?;
    let mut remaining = length;

    let first = &req.body_start[..req.body_start.len().min(remaining as usize)];
    writer.write_all(first).await?;
    remaining -= first.len() as u64;

    let mut chunk = vec![0u8; READ_CHUNK];
    while remaining > 0 {
        let want = (remaining.min(READ_CHUNK as u64)) as usize;
        let n = io.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    if remaining > 0 {
        writer.abort().await;
        return Err(Failure::Status(400, "request body shorter than content-length".into()));
    }

    let sniffed = writer
        .detected_mime()
        .unwrap_or_else(|| DEFAULT_MIME.to_string());
    if let Err(rejected) = service.policy.check(req.header_pairs(), Some(&sniffed)) {
        writer.abort().await;
        return Err(rejected.into());
    }

    let size = writer.commit().await?;
    tracing::info!(repository = %id, name, size, mime = %sniffed, "asset stored");
    write_json(
        io,
        200,
        &json!({ "message": "asset stored", "name": name, "size": size, "mime": sniffed }),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use colossus_core::{BackendKind, RepositoryPool};

    struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    fn service(kind: BackendKind, policy: UploadPolicy) -> (tempfile::TempDir, Arc<AssetService>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = RepositoryPool::new(dir.path(), kind, 4).shared();
        (dir, Arc::new(AssetService::new(pool, policy)))
    }

    async fn send(service: &Arc<AssetService>, request: &[u8]) -> Reply {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let task = tokio::spawn(handle_client(server, service.clone()));
        client.write_all(request).await.unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.unwrap().unwrap();

        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut response = httparse::Response::new(&mut headers);
        let httparse::Status::Complete(len) = response.parse(&raw).unwrap() else {
            panic!("incomplete response");
        };
        Reply {
            status: response.code.unwrap(),
            headers: response
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
                .collect(),
            body: raw[len..].to_vec(),
        }
    }

    async fn create(service: &Arc<AssetService>) -> String {
        let reply = send(service, b"POST /repository HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(reply.status, 201);
        reply.json()["id"].as_str().unwrap().to_string()
    }

    fn put_request(path: &str, body: &[u8], extra: &str) -> Vec<u8> {
        let mut req = format!(
            "PUT {path} HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n{extra}\r\n",
            body.len()
        )
        .into_bytes();
        req.extend_from_slice(body);
        req
    }

    async fn put(service: &Arc<AssetService>, id: &str, name: &str, body: &[u8]) -> Reply {
        send(service, &put_request(&format!("/asset/v0/{id}/{name}"), body, "")).await
    }

    fn get(path: &str, extra: &str) -> Vec<u8> {
        format!("GET {path} HTTP/1.1\r\nHost: x\r\n{extra}\r\n").into_bytes()
    }

    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    #[tokio::test]
    async fn upload_then_full_download() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        let reply = put(&svc, &id, "docs/alphabet.txt", BODY).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["size"], 36);

        let reply = send(&svc, &get(&format!("/asset/v0/{id}/docs/alphabet.txt"), "")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("accept-ranges"), Some("bytes"));
        assert_eq!(reply.header("content-type"), Some(DEFAULT_MIME));
        assert_eq!(reply.body, BODY);
    }

    #[tokio::test]
    async fn single_range() {
        let (_dir, svc) = service(BackendKind::ContentAddressed, UploadPolicy::default());
        let id = create(&svc).await;
        put(&svc, &id, "a.txt", BODY).await;
        let path = format!("/asset/v0/{id}/a.txt");

        let reply = send(&svc, &get(&path, "Range: bytes=10-14,15-19\r\n")).await;
        assert_eq!(reply.status, 206);
        assert_eq!(reply.header("content-range"), Some("bytes 10-19/36"));
        assert_eq!(reply.body, b"abcdefghij");

        let reply = send(&svc, &get(&path, "Range: bytes=30-\r\n")).await;
        assert_eq!(reply.status, 206);
        assert_eq!(reply.body, b"uvwxyz");
    }

    #[tokio::test]
    async fn multipart_ranges() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        put(&svc, &id, "a.txt", BODY).await;

        let reply = send(
            &svc,
            &get(&format!("/asset/v0/{id}/a.txt"), "Range: bytes=0-1,34-35\r\n"),
        )
        .await;
        assert_eq!(reply.status, 206);
        let content_type = reply.header("content-type").unwrap();
        let boundary = content_type
            .strip_prefix("multipart/byteranges; boundary=")
            .unwrap();
        let body = String::from_utf8(reply.body.clone()).unwrap();
        assert_eq!(
            reply.header("content-length").unwrap().parse::<usize>().unwrap(),
            body.len()
        );
        assert!(body.contains("Content-Range: bytes 0-1/36\r\n\r\n01\r\n"));
        assert!(body.contains("Content-Range: bytes 34-35/36\r\n\r\nyz\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn malformed_and_unsatisfiable_ranges() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        put(&svc, &id, "a.txt", BODY).await;
        let path = format!("/asset/v0/{id}/a.txt");

        let reply = send(&svc, &get(&path, "Range: bytes=oops\r\n")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, BODY);

        let reply = send(&svc, &get(&path, "Range: bytes=100-200\r\n")).await;
        assert_eq!(reply.status, 416);
        assert_eq!(reply.header("content-range"), Some("bytes */36"));
    }

    #[tokio::test]
    async fn download_ignores_range() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        put(&svc, &id, "dir/file.bin", BODY).await;

        let reply = send(
            &svc,
            &get(&format!("/asset/v0/{id}/dir/file.bin?download=1"), "Range: bytes=0-1\r\n"),
        )
        .await;
        assert_eq!(reply.status, 200);
        assert_eq!(
            reply.header("content-disposition"),
            Some("attachment; filename=\"file.bin\"")
        );
        assert_eq!(reply.body, BODY);
    }

    #[tokio::test]
    async fn head_has_no_body() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        put(&svc, &id, "a.txt", BODY).await;
        let request = format!("HEAD /asset/v0/{id}/a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        let reply = send(&svc, request.as_bytes()).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("content-length"), Some("36"));
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn lookup_failures() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;

        let reply = send(&svc, &get(&format!("/asset/v0/{id}/missing"), "")).await;
        assert_eq!(reply.status, 404);
        let unknown = RepositoryId::generate();
        let reply = send(&svc, &get(&format!("/asset/v0/{unknown}/a"), "")).await;
        assert_eq!(reply.status, 404);
        let reply = send(&svc, &get("/asset/v0/not-a-uuid/a", "")).await;
        assert_eq!(reply.status, 400);
        let reply = send(&svc, &get(&format!("/asset/v0/{id}/../../../etc/passwd"), "")).await;
        assert_eq!(reply.status, 400);
        let reply = send(&svc, b"DELETE /repository HTTP/1.1\r\n\r\n").await;
        assert_eq!(reply.status, 405);
    }

    #[tokio::test]
    async fn upload_policy_codes() {
        let policy = UploadPolicy {
            max_size_bytes: 100,
            accept: vec!["image/*".to_string()],
            reject: vec![],
        };
        let (_dir, svc) = service(BackendKind::Filesystem, policy);
        let id = create(&svc).await;
        let path = format!("/asset/v0/{id}/pic.png");

        let reply = send(
            &svc,
            format!("PUT {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes(),
        )
        .await;
        assert_eq!(reply.status, 411);

        let reply = send(
            &svc,
            format!("PUT {path} HTTP/1.1\r\nContent-Length: 101\r\n\r\n").as_bytes(),
        )
        .await;
        assert_eq!(reply.status, 413);

        // Declared type is fine but the bytes are not an image.
        let reply = send(&svc, &put_request(&path, b"plain text", "Content-Type: image/png\r\n")).await;
        assert_eq!(reply.status, 415);
        let reply = send(&svc, &get(&path, "")).await;
        assert_eq!(reply.status, 404);

        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0u8; 24]);
        let reply = send(&svc, &put_request(&path, &png, "Content-Type: image/png\r\n")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["mime"], "image/png");
        let reply = send(&svc, &get(&path, "")).await;
        assert_eq!(reply.header("content-type"), Some("image/png"));
    }

    #[tokio::test]
    async fn chunked_and_unsized_uploads_are_refused() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        let path = format!("/asset/v0/{id}/greeting.txt");

        let request = format!(
            "PUT {path} HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
        );
        let reply = send(&svc, request.as_bytes()).await;
        assert_eq!(reply.status, 501);
        let reply = send(&svc, &get(&path, "")).await;
        assert_eq!(reply.status, 404);

        // No ceiling configured, but the body length must still be declared.
        let request = format!("PUT {path} HTTP/1.1\r\nHost: x\r\n\r\nhello");
        let reply = send(&svc, request.as_bytes()).await;
        assert_eq!(reply.status, 411);
        let reply = send(&svc, &get(&path, "")).await;
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn short_body_is_aborted() {
        let (_dir, svc) = service(BackendKind::Filesystem, UploadPolicy::default());
        let id = create(&svc).await;
        let path = format!("/asset/v0/{id}/cut.txt");
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(handle_client(server, svc.clone()));
        let request = format!("PUT {path} HTTP/1.1\r\nContent-Length: 10\r\n\r\nhalf");
        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(raw.starts_with(b"HTTP/1.1 400 "));
        let reply = send(&svc, &get(&path, "")).await;
        assert_eq!(reply.status, 404);
    }
}
