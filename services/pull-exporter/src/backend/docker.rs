//! Docker Engine driver.
//!
//! Talks to the Engine API over its Unix socket:
//! - `GET /_ping` when acquiring a session
//! - `POST /images/create?fromImage=...&tag=...` to pull, streaming the JSON progress body
//! - `DELETE /images/{name}?force=true&noprune=false` to remove
//!
//! Reference: https://docs.docker.com/reference/api/engine/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use tracing::debug;

use super::{ChunkStream, RuntimeDriver, RuntimeError, RuntimeSession};
use crate::reference::ImageRef;

/// Driver for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    socket_path: PathBuf,
}

impl DockerDriver {
    /// Create a driver for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn connect(&self) -> Result<Box<dyn RuntimeSession>, RuntimeError> {
        if !self.socket_exists() {
            return Err(RuntimeError::Unavailable(format!(
                "Cannot connect to the Docker daemon at unix://{}. Is the docker daemon running?",
                self.socket_path.display()
            )));
        }

        let session = DockerSession {
            socket_path: self.socket_path.to_string_lossy().to_string(),
            client: Client::unix(),
        };

        let response = session
            .send(Method::GET, "/_ping")
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            let error = api_error(response).await;
            return Err(RuntimeError::Unavailable(error.to_string()));
        }

        Ok(Box::new(session))
    }
}

struct DockerSession {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerSession {
    async fn send(&self, method: Method, path: &str) -> Result<Response<Body>, RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Request to Docker Engine API");

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        Ok(self.client.request(request).await?)
    }
}

#[async_trait]
impl RuntimeSession for DockerSession {
    async fn pull(&mut self, image: &str) -> Result<ChunkStream, RuntimeError> {
        // Without `tag` the Engine pulls every tag of the repository.
        let reference = ImageRef::parse(image);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("fromImage", &reference.name())
            .append_pair("tag", reference.tag_or_digest())
            .finish();
        let response = self
            .send(Method::POST, &format!("/images/create?{query}"))
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(progress_stream(response.into_body()))
    }

    async fn remove(&mut self, image: &str) -> Result<(), RuntimeError> {
        let path = format!("/images/{image}?force=true&noprune=false");
        let response = self.send(Method::DELETE, &path).await?;

        if response.status().is_success() {
            // The body lists untagged/deleted layers; drain it so the connection is reusable.
            hyper::body::to_bytes(response.into_body()).await?;
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }
}

/// Stream the pull progress body as chunk sizes.
///
/// The Engine reports failures that happen after the pull started as
/// `{"error": ...}` lines inside a 200 response; those end the stream.
fn progress_stream(body: Body) -> ChunkStream {
    stream::unfold(
        Some((body, ProgressDecoder::default())),
        |state| async move {
            let (mut body, mut decoder) = state?;
            match body.data().await {
                Some(Ok(chunk)) => match decoder.push(&chunk) {
                    Ok(()) => Some((Ok(chunk.len() as u64), Some((body, decoder)))),
                    Err(e) => Some((Err(e), None)),
                },
                Some(Err(e)) => Some((Err(RuntimeError::Stream(e.to_string())), None)),
                None => decoder.finish().err().map(|e| (Err(e), None)),
            }
        },
    )
    .boxed()
}

#[derive(Debug, Deserialize)]
struct ProgressMessage {
    #[serde(default)]
    error: Option<String>,

    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Splits the progress body into JSON lines and surfaces error lines.
#[derive(Debug, Default)]
struct ProgressDecoder {
    pending: Vec<u8>,
}

impl ProgressDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<(), RuntimeError> {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            check_line(&line)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RuntimeError> {
        let rest = std::mem::take(&mut self.pending);
        check_line(&rest)
    }
}

fn check_line(line: &[u8]) -> Result<(), RuntimeError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(());
    }
    // Anything that is not a progress message is not ours to judge.
    let Ok(message) = serde_json::from_slice::<ProgressMessage>(line) else {
        return Ok(());
    };
    let error = message
        .error_detail
        .and_then(|detail| detail.message)
        .or(message.error);
    match error {
        Some(error) => Err(RuntimeError::Stream(error)),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Convert a non-success response into an error carrying the daemon's message.
async fn api_error(response: Response<Body>) -> RuntimeError {
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .unwrap_or_else(|_| Bytes::new());
    let message = error_message(status, &body);

    if status == StatusCode::NOT_FOUND {
        RuntimeError::NotFound(message)
    } else {
        RuntimeError::Api(message)
    }
}

fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) {
        return parsed.message;
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        format!("Docker Engine API returned {status}")
    } else {
        text
    }
}
