//! Native transfer payload.
//!
//! A drop-in replacement for the python payload scripts, started through
//! `mptcp-bench payload serve` and `mptcp-bench payload fetch`.
//!
//! # Wire contract
//!
//! ```text
//! client                                server
//!   │  GET /?filesize=10M                 │
//!   │ ──────────────────────────────────► │  parse <int>[K|M|G]
//!   │                                     │  create or reuse 10M.dat
//!   │  200 + Content-Disposition + body   │
//!   │ ◄────────────────────────────────── │  400 bad specifier
//!   │                                     │  500 file creation failed
//! ```
//!
//! The client measures from sending the request to the last body byte and
//! counts every received byte. Non-2xx responses count as failed attempts.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{FileSize, TransferReport};

pub const DEFAULT_PORT: u16 = 8000;

const CHUNK: usize = 64 * 1024;

type PayloadBody = UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid server address: {0}")]
    Url(#[from] url::ParseError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Max retries reached ({attempts}). Download failed: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Serves random payload files of the requested size.
pub struct PayloadServer {
    listener: TcpListener,
    cache_dir: Arc<PathBuf>,
}

impl PayloadServer {
    /// Binds the listening socket. Payload files are cached in `cache_dir`.
    pub async fn bind(addr: SocketAddr, cache_dir: PathBuf) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind payload server to {}", addr))?;
        Ok(Self {
            listener,
            cache_dir: Arc::new(cache_dir),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Starting server on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let cache_dir = Arc::clone(&self.cache_dir);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle_request(req, Arc::clone(&cache_dir)));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Accept failed: {}", e),
            }
        }

        info!("Payload server shutting down");
        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    cache_dir: Arc<PathBuf>,
) -> Result<Response<PayloadBody>, http::Error> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    let Some(size) = requested_size(req.uri()) else {
        return text(StatusCode::BAD_REQUEST, "Bad Request: Invalid file size specifier");
    };

    let file = match ensure_payload_file(&cache_dir, &size).await {
        Ok(path) => tokio::fs::File::open(&path).await,
        Err(e) => Err(e),
    };
    let file = match file {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to create {}: {}", size.file_name(), e);
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error: Failed to create file",
            );
        }
    };

    debug!("Sending {}", size.file_name());
    let body = StreamBody::new(ReaderStream::with_capacity(file, CHUNK).map_ok(Frame::data));
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size.bytes())
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", size.file_name()),
        )
        .body(body.boxed_unsync())
}

fn text(status: StatusCode, message: &'static str) -> Result<Response<PayloadBody>, http::Error> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never: Infallible| match never {})
        .boxed_unsync();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(body)
}

/// Extracts the percent-decoded `filesize` query parameter.
fn requested_size(uri: &Uri) -> Option<FileSize> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "filesize")
        .and_then(|(_, value)| value.parse().ok())
}

/// Returns the cached payload file for `size`, creating it on first use.
pub async fn ensure_payload_file(cache_dir: &Path, size: &FileSize) -> std::io::Result<PathBuf> {
    let path = cache_dir.join(size.file_name());
    if tokio::fs::try_exists(&path).await? {
        return Ok(path);
    }

    let cache_dir = cache_dir.to_path_buf();
    let bytes = size.bytes();
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_random_file(&cache_dir, &target, bytes))
        .await
        .map_err(std::io::Error::other)??;

    Ok(path)
}

fn write_random_file(dir: &Path, target: &Path, mut remaining: u64) -> std::io::Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; CHUNK];

    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        rng.fill_bytes(&mut buf[..n]);
        tmp.write_all(&buf[..n])?;
        remaining -= n as u64;
    }

    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Client-side download parameters.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub bind_ip: Option<IpAddr>,
    pub file_size: String,
    pub iterations: u32,
    /// Connect timeout and the longest wait for any single body chunk.
    pub timeout: Duration,
    pub max_retries: u32,
}

impl FetchOptions {
    pub fn new(server_ip: IpAddr, file_size: impl Into<String>) -> Self {
        Self {
            server_ip,
            server_port: DEFAULT_PORT,
            bind_ip: None,
            file_size: file_size.into(),
            iterations: 1,
            timeout: Duration::from_secs(15),
            max_retries: 3,
        }
    }

    fn url(&self) -> Result<Url, PayloadError> {
        let mut url = Url::parse(&format!(
            "http://{}/",
            SocketAddr::new(self.server_ip, self.server_port)
        ))?;
        url.query_pairs_mut().append_pair("filesize", &self.file_size);
        Ok(url)
    }

    fn client(&self) -> Result<reqwest::Client, PayloadError> {
        // A fresh connection per download, so every sample includes the handshake.
        let client = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .no_proxy()
            .local_address(self.bind_ip)
            .build()?;
        Ok(client)
    }
}

/// Downloads the payload `iterations` times and reports MB/s per download.
pub async fn fetch(options: &FetchOptions) -> Result<TransferReport, PayloadError> {
    let client = options.client()?;
    let url = options.url()?;
    let mut throughputs = Vec::with_capacity(options.iterations as usize);

    for i in 0..options.iterations {
        let throughput = download(&client, &url, options).await?;
        println!("Iteration {}: Throughput = {:.2} MB/s", i + 1, throughput);
        throughputs.push(throughput);
    }

    let report = TransferReport::from_throughputs(throughputs);
    println!("\nAverage Throughput: {:.2} MB/s", report.average_throughput);
    Ok(report)
}

/// One download with per-attempt retries. Returns MB/s.
async fn download(client: &reqwest::Client, url: &Url, options: &FetchOptions) -> Result<f64, PayloadError> {
    let mut last = String::new();

    for attempt in 1..=options.max_retries {
        match download_once(client, url, options.timeout).await {
            Ok((bytes, elapsed)) => {
                let secs = elapsed.as_secs_f64().max(f64::EPSILON);
                return Ok(bytes as f64 / secs / (1024.0 * 1024.0));
            }
            Err(e) => {
                println!("Connection error: {}. Retrying... (Attempt {})", e, attempt);
                last = e.to_string();
            }
        }
    }

    Err(PayloadError::RetriesExhausted {
        attempts: options.max_retries,
        last,
    })
}

async fn download_once(
    client: &reqwest::Client,
    url: &Url,
    limit: Duration,
) -> Result<(u64, Duration), PayloadError> {
    let start = Instant::now();
    let mut response = with_timeout(limit, client.get(url.clone()).send())
        .await?
        .error_for_status()?;

    let mut total = 0u64;
    while let Some(chunk) = with_timeout(limit, response.chunk()).await? {
        total += chunk.len() as u64;
    }

    Ok((total, start.elapsed()))
}

async fn with_timeout<T, E: Into<PayloadError>>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, PayloadError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PayloadError::Timeout(limit)),
    }
}
