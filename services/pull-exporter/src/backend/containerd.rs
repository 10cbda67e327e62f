//! containerd driver.
//!
//! Pulls go through the transfer service (OCI registry source into the image
//! store). The transfer RPC is unary, so progress is observed the way `ctr`
//! does it: by polling the content store's active ingests while the transfer
//! runs. Growth of ingest offsets is what the sampler sees as chunks.
//!
//! Ingests already active when the transfer starts are ignored. The content
//! store is shared by the whole namespace, so pulls by other clients that
//! start during ours (e.g. the kubelet in `k8s.io`) are still counted.

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    DeleteImageRequest, ListStatusesRequest, TransferOptions, TransferRequest,
};
use containerd_client::types::Platform;
use futures_util::stream::{self, StreamExt};
use prost::Message;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;
use tracing::{debug, warn};

use super::{ChunkStream, RuntimeDriver, RuntimeError, RuntimeSession};
use crate::reference;

const NAMESPACE_HEADER: &str = "containerd-namespace";
const OCI_REGISTRY_TYPE: &str = "containerd.types.transfer.OCIRegistry";
const IMAGE_STORE_TYPE: &str = "containerd.types.transfer.ImageStore";

/// `containerd.types.transfer.OCIRegistry` (types/transfer/registry.proto).
///
/// The resolver (field 2) is left unset so the daemon's hosts config applies.
#[derive(Clone, PartialEq, prost::Message)]
struct OciRegistry {
    #[prost(string, tag = "1")]
    reference: String,
}

/// `containerd.types.transfer.ImageStore` (types/transfer/imagestore.proto).
#[derive(Clone, PartialEq, prost::Message)]
struct ImageStore {
    #[prost(string, tag = "1")]
    name: String,

    #[prost(map = "string, string", tag = "2")]
    labels: HashMap<String, String>,

    /// Content filter; empty means every platform.
    #[prost(message, repeated, tag = "3")]
    platforms: Vec<Platform>,

    #[prost(bool, tag = "4")]
    all_metadata: bool,

    #[prost(uint32, tag = "5")]
    manifest_limit: u32,
}

/// The platform this process runs on, in OCI terms.
fn host_platform() -> Platform {
    Platform {
        os: "linux".to_string(),
        architecture: oci_architecture(std::env::consts::ARCH).to_string(),
        ..Default::default()
    }
}

fn oci_architecture(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        "loongarch64" => "loong64",
        other => other,
    }
}

/// Driver for the containerd gRPC API.
#[derive(Debug, Clone)]
pub struct ContainerdDriver {
    socket_path: PathBuf,
    namespace: String,
    progress_interval: Duration,
}

impl ContainerdDriver {
    pub fn new<P: AsRef<Path>>(
        socket_path: P,
        namespace: &str,
        progress_interval: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            namespace: namespace.to_string(),
            progress_interval,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }
}

#[async_trait]
impl RuntimeDriver for ContainerdDriver {
    fn name(&self) -> &'static str {
        "containerd"
    }

    async fn connect(&self) -> Result<Box<dyn RuntimeSession>, RuntimeError> {
        if !self.socket_exists() {
            return Err(RuntimeError::Unavailable(format!(
                "failed to dial \"{}\": no such file or directory",
                self.socket_path.display()
            )));
        }

        let channel = containerd_client::connect(&self.socket_path)
            .await
            .map_err(|e| RuntimeError::Unavailable(error_chain(&e)))?;

        Ok(Box::new(ContainerdSession {
            channel,
            namespace: self.namespace.clone(),
            progress_interval: self.progress_interval,
        }))
    }
}

struct ContainerdSession {
    channel: Channel,
    namespace: String,
    progress_interval: Duration,
}

#[async_trait]
impl RuntimeSession for ContainerdSession {
    async fn pull(&mut self, image: &str) -> Result<ChunkStream, RuntimeError> {
        let reference = reference::normalize(image);
        debug!(image = %image, reference = %reference, "Starting containerd transfer");

        let source = OciRegistry {
            reference: reference.clone(),
        };
        let destination = ImageStore {
            name: reference,
            platforms: vec![host_platform()],
            ..Default::default()
        };
        let request = namespaced(
            TransferRequest {
                source: Some(to_any(OCI_REGISTRY_TYPE, &source)),
                destination: Some(to_any(IMAGE_STORE_TYPE, &destination)),
                options: Some(TransferOptions::default()),
            },
            &self.namespace,
        )?;

        let mut client = TransferClient::new(self.channel.clone());
        let transfer = async move { client.transfer(request).await };
        let ingests = ContentIngests {
            content: ContentClient::new(self.channel.clone()),
            namespace: self.namespace.clone(),
        };

        start_transfer(transfer, ingests, self.progress_interval).await
    }

    async fn remove(&mut self, image: &str) -> Result<(), RuntimeError> {
        let request = namespaced(
            DeleteImageRequest {
                name: reference::normalize(image),
                sync: true,
                ..Default::default()
            },
            &self.namespace,
        )?;

        ImagesClient::new(self.channel.clone())
            .delete(request)
            .await?;
        Ok(())
    }
}

/// Source of active-ingest snapshots.
#[async_trait]
trait IngestSource: Send {
    async fn snapshot(&mut self) -> Result<Vec<IngestStatus>, RuntimeError>;
}

/// Active ingests of one namespace's content store.
struct ContentIngests {
    content: ContentClient<Channel>,
    namespace: String,
}

#[async_trait]
impl IngestSource for ContentIngests {
    async fn snapshot(&mut self) -> Result<Vec<IngestStatus>, RuntimeError> {
        let request = namespaced(ListStatusesRequest { filters: vec![] }, &self.namespace)?;
        let statuses = self.content.list_statuses(request).await?.into_inner().statuses;

        Ok(statuses
            .into_iter()
            .map(|status| IngestStatus {
                reference: status.r#ref,
                offset: status.offset,
                total: status.total,
            })
            .collect())
    }
}

/// Run `transfer` under a progress monitor and expose it as a chunk stream.
///
/// An error before the first byte is returned directly, so the pipeline
/// treats it as a rejected pull; later errors end the stream.
async fn start_transfer<F, S>(
    transfer: F,
    ingests: S,
    interval: Duration,
) -> Result<ChunkStream, RuntimeError>
where
    F: Future<Output = Result<tonic::Response<()>, tonic::Status>> + Send + 'static,
    S: IngestSource + 'static,
{
    let monitor = TransferMonitor {
        ingests,
        interval,
        tracker: IngestTracker::default(),
    };

    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(monitor.run(transfer, tx));

    match rx.recv().await {
        None => Ok(stream::empty().boxed()),
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(stream::once(async move { Ok(first) })
            .chain(ReceiverStream::new(rx))
            .boxed()),
    }
}

/// Drives one transfer and reports ingest progress until it completes.
struct TransferMonitor<S> {
    ingests: S,
    interval: Duration,
    tracker: IngestTracker,
}

impl<S: IngestSource> TransferMonitor<S> {
    async fn run<F>(mut self, transfer: F, tx: mpsc::Sender<Result<u64, RuntimeError>>)
    where
        F: Future<Output = Result<tonic::Response<()>, tonic::Status>>,
    {
        // The transfer only starts once polled, so this sees foreign ingests only.
        match self.ingests.snapshot().await {
            Ok(snapshot) => self.tracker = IngestTracker::with_baseline(snapshot),
            Err(e) => warn!(error = %e, "Failed to list ingests before transfer"),
        }

        tokio::pin!(transfer);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut transfer => {
                    match result {
                        Ok(_) => {
                            let rest = self.tracker.finish();
                            if rest > 0 {
                                let _ = tx.send(Ok(rest)).await;
                            }
                        }
                        Err(status) => {
                            let _ = tx.send(Err(RuntimeError::from(status))).await;
                        }
                    }
                    return;
                }
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(0) => {}
                        Ok(received) => {
                            // Receiver gone: the pull was abandoned, dropping the RPC cancels it.
                            if tx.send(Ok(received)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(RuntimeError::Stream(e.to_string()))).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<u64, RuntimeError> {
        let snapshot = self.ingests.snapshot().await?;
        Ok(self.tracker.observe(snapshot))
    }
}

/// One active content ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IngestStatus {
    reference: String,
    offset: i64,
    total: i64,
}

/// Turns successive ingest snapshots into received-byte deltas.
#[derive(Debug, Default)]
struct IngestTracker {
    ingests: HashMap<String, (u64, u64)>,
    foreign: HashSet<String>,
}

impl IngestTracker {
    /// Ignore every ingest in `snapshot` for the rest of the transfer.
    fn with_baseline(snapshot: impl IntoIterator<Item = IngestStatus>) -> Self {
        Self {
            ingests: HashMap::new(),
            foreign: snapshot.into_iter().map(|status| status.reference).collect(),
        }
    }

    /// Apply a snapshot; returns bytes received since the previous one.
    ///
    /// Ingests that vanished were committed, so their unseen remainder counts
    /// as received. Blobs fetched entirely between two polls are not seen.
    fn observe(&mut self, snapshot: impl IntoIterator<Item = IngestStatus>) -> u64 {
        let mut received = 0;
        let mut current = HashMap::new();

        for status in snapshot {
            if self.foreign.contains(&status.reference) {
                continue;
            }
            let offset = u64::try_from(status.offset).unwrap_or(0);
            let total = u64::try_from(status.total).unwrap_or(0);
            let previous = self
                .ingests
                .get(&status.reference)
                .map_or(0, |(offset, _)| *offset);
            received += offset.saturating_sub(previous);
            current.insert(status.reference, (offset.max(previous), total));
        }

        for (reference, (offset, total)) in self.ingests.drain() {
            if !current.contains_key(&reference) {
                received += total.saturating_sub(offset);
            }
        }

        self.ingests = current;
        received
    }

    /// Remainder of every tracked ingest, once the transfer has completed.
    fn finish(&mut self) -> u64 {
        self.ingests
            .drain()
            .map(|(_, (offset, total))| total.saturating_sub(offset))
            .sum()
    }
}

fn namespaced<T>(message: T, namespace: &str) -> Result<tonic::Request<T>, RuntimeError> {
    let value: AsciiMetadataValue = namespace
        .parse()
        .map_err(|_| RuntimeError::Api(format!("invalid containerd namespace {namespace:?}")))?;
    let mut request = tonic::Request::new(message);
    request.metadata_mut().insert(NAMESPACE_HEADER, value);
    Ok(request)
}

/// containerd resolves `Any` payloads by the protobuf full name.
fn to_any<M: Message>(type_url: &str, message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// Flatten an error and its sources; tonic transport errors hide the cause.
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(reference: &str, offset: i64, total: i64) -> IngestStatus {
        IngestStatus {
            reference: reference.to_string(),
            offset,
            total,
        }
    }

    #[test]
    fn test_tracker_counts_offset_growth() {
        let mut tracker = IngestTracker::default();
        assert_eq!(tracker.observe([status("layer-1", 100, 1000)]), 100);
        assert_eq!(tracker.observe([status("layer-1", 350, 1000)]), 250);
        assert_eq!(
            tracker.observe([status("layer-1", 350, 1000), status("layer-2", 40, 80)]),
            40
        );
    }

    #[test]
    fn test_tracker_counts_completed_remainder() {
        let mut tracker = IngestTracker::default();
        tracker.observe([status("layer-1", 600, 1000), status("layer-2", 10, 20)]);
        // layer-1 was committed between polls.
        assert_eq!(tracker.observe([status("layer-2", 20, 20)]), 400 + 10);
    }

    #[test]
    fn test_tracker_ignores_regressions() {
        let mut tracker = IngestTracker::default();
        tracker.observe([status("layer-1", 500, 1000)]);
        assert_eq!(tracker.observe([status("layer-1", 200, 1000)]), 0);
        assert_eq!(tracker.observe([status("layer-1", 600, 1000)]), 100);
    }

    #[test]
    fn test_tracker_finish_drains_remainder() {
        let mut tracker = IngestTracker::default();
        tracker.observe([status("layer-1", 900, 1000), status("config", 0, 50)]);
        assert_eq!(tracker.finish(), 150);
        assert_eq!(tracker.finish(), 0);
    }

    #[test]
    fn test_namespaced_sets_header() {
        let request = namespaced((), "k8s.io").unwrap();
        let value = request.metadata().get(NAMESPACE_HEADER).unwrap();
        assert_eq!(value.to_str().unwrap(), "k8s.io");
    }

    #[test]
    fn test_namespaced_rejects_invalid_value() {
        assert!(namespaced((), "bad\nnamespace").is_err());
    }

    #[test]
    fn test_to_any_uses_full_name() {
        let source = OciRegistry {
            reference: "docker.io/library/alpine:latest".to_string(),
        };
        let any = to_any(OCI_REGISTRY_TYPE, &source);
        assert_eq!(any.type_url, "containerd.types.transfer.OCIRegistry");
        assert_eq!(OciRegistry::decode(any.value.as_slice()).unwrap(), source);
    }

    #[test]
    fn test_image_store_is_limited_to_host_platform() {
        let destination = ImageStore {
            name: "docker.io/library/alpine:latest".to_string(),
            platforms: vec![host_platform()],
            ..Default::default()
        };
        let any = to_any(IMAGE_STORE_TYPE, &destination);
        let decoded = ImageStore::decode(any.value.as_slice()).unwrap();

        assert_eq!(decoded.name, "docker.io/library/alpine:latest");
        assert_eq!(decoded.platforms.len(), 1);
        assert_eq!(decoded.platforms[0].os, "linux");
        assert_eq!(
            decoded.platforms[0].architecture,
            oci_architecture(std::env::consts::ARCH)
        );
        assert!(!decoded.all_metadata);
    }

    #[test]
    fn test_image_store_field_numbers() {
        let destination = ImageStore {
            name: "a".to_string(),
            platforms: vec![Platform {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let bytes = destination.encode_to_vec();
        // name: field 1, length-delimited
        assert_eq!(&bytes[..3], &[0x0a, 0x01, b'a']);
        // platforms: field 3, length-delimited
        assert_eq!(bytes[3], 0x1a);
    }

    #[rstest::rstest]
    #[case("x86_64", "amd64")]
    #[case("aarch64", "arm64")]
    #[case("x86", "386")]
    #[case("s390x", "s390x")]
    #[case("riscv64", "riscv64")]
    fn test_oci_architecture(#[case] rust_arch: &str, #[case] oci: &str) {
        assert_eq!(oci_architecture(rust_arch), oci);
    }

    #[test]
    fn test_tracker_ignores_baseline_ingests() {
        let mut tracker = IngestTracker::with_baseline([status("kubelet-layer", 10, 100)]);
        assert_eq!(
            tracker.observe([status("kubelet-layer", 60, 100), status("layer-1", 5, 50)]),
            5
        );
        // The foreign ingest completing is not ours either.
        assert_eq!(tracker.observe([status("layer-1", 25, 50)]), 20);
        assert_eq!(tracker.finish(), 25);
    }

    /// Replays scripted snapshots, then reports no ingests.
    struct ScriptedIngests {
        snapshots: std::collections::VecDeque<Vec<IngestStatus>>,
    }

    impl ScriptedIngests {
        fn new(snapshots: Vec<Vec<IngestStatus>>) -> Self {
            Self {
                snapshots: snapshots.into(),
            }
        }
    }

    #[async_trait]
    impl IngestSource for ScriptedIngests {
        async fn snapshot(&mut self) -> Result<Vec<IngestStatus>, RuntimeError> {
            Ok(self.snapshots.pop_front().unwrap_or_default())
        }
    }

    fn transfer_after(
        delay: Duration,
        result: Result<(), tonic::Status>,
    ) -> impl Future<Output = Result<tonic::Response<()>, tonic::Status>> + Send + 'static {
        async move {
            tokio::time::sleep(delay).await;
            result.map(tonic::Response::new)
        }
    }

    const POLL: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_error_before_first_byte_is_rejection() {
        let ingests = ScriptedIngests::new(vec![]);
        let transfer = transfer_after(
            Duration::from_secs(1),
            Err(tonic::Status::not_found(
                "docker.io/library/alpnie:latest: not found",
            )),
        );

        let err = start_transfer(transfer, ingests, POLL).await.err().unwrap();
        assert_eq!(err.to_string(), "docker.io/library/alpnie:latest: not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_bytes_breaks_stream() {
        let ingests = ScriptedIngests::new(vec![
            // baseline, taken before the transfer starts
            vec![status("other-pull", 5, 10)],
            vec![status("other-pull", 7, 10), status("layer-1", 100, 1000)],
            vec![status("layer-1", 300, 1000)],
            vec![status("layer-1", 450, 1000)],
            vec![status("layer-1", 450, 1000)],
            vec![status("layer-1", 500, 1000)],
        ]);
        let transfer = transfer_after(
            Duration::from_millis(2250),
            Err(tonic::Status::unknown("failed to copy: unexpected EOF")),
        );

        let chunks = start_transfer(transfer, ingests, POLL).await.unwrap();
        let items: Vec<_> = chunks.collect().await;

        let received: Vec<u64> = items.iter().filter_map(|item| item.as_ref().ok().copied()).collect();
        assert_eq!(received, vec![100, 200, 150, 50]);
        assert!(matches!(
            items.last(),
            Some(Err(RuntimeError::Api(msg))) if msg == "failed to copy: unexpected EOF"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_without_bytes_is_empty_stream() {
        let ingests = ScriptedIngests::new(vec![]);
        let transfer = transfer_after(Duration::from_secs(1), Ok(()));

        let chunks = start_transfer(transfer, ingests, POLL).await.unwrap();
        assert_eq!(chunks.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_reports_unseen_remainder() {
        let ingests = ScriptedIngests::new(vec![
            vec![],
            vec![status("layer-1", 600, 1000)],
            vec![status("layer-1", 600, 1000)],
        ]);
        let transfer = transfer_after(Duration::from_millis(750), Ok(()));

        let chunks = start_transfer(transfer, ingests, POLL).await.unwrap();
        let received: Vec<u64> = chunks.map(|item| item.unwrap()).collect().await;
        assert_eq!(received, vec![600, 400]);
    }

    #[tokio::test]
    async fn test_connect_without_socket() {
        let driver = ContainerdDriver::new(
            "/nonexistent/containerd.sock",
            "default",
            Duration::from_millis(500),
        );
        let err = driver.connect().await.err().unwrap();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(err.to_string().contains("/nonexistent/containerd.sock"));
    }
}
