//! Scripted runtime driver for testing and development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use super::{ChunkStream, RuntimeDriver, RuntimeError, RuntimeSession};

/// How a scripted pull behaves.
#[derive(Debug, Clone)]
pub enum MockPull {
    /// The runtime refuses to start the pull.
    Rejected(String),

    /// The pull streams these chunk sizes and completes.
    Chunks(Vec<u64>),

    /// The pull streams these chunk sizes, then fails.
    BrokenStream { chunks: Vec<u64>, error: String },
}

#[derive(Debug, Clone)]
enum MockRemove {
    NotFound(String),
    Fail(String),
}

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect,
    Pull(String),
    Remove(String),
}

#[derive(Debug, Clone, Default)]
struct MockScript {
    unreachable: Option<String>,
    pulls: HashMap<String, MockPull>,
    removals: HashMap<String, MockRemove>,
    chunk_interval: Duration,
}

type CallLog = Arc<Mutex<Vec<MockCall>>>;

fn record(calls: &CallLog, call: MockCall) {
    calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
}

/// Mock driver. Images without a script are rejected as unknown.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    script: Arc<MockScript>,
    calls: CallLog,
}

impl MockDriver {
    /// Create a mock driver where every connect succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver whose runtime cannot be reached.
    pub fn unreachable(message: impl Into<String>) -> Self {
        let mut driver = Self::new();
        Arc::make_mut(&mut driver.script).unreachable = Some(message.into());
        driver
    }

    /// Script the pull of `image`.
    pub fn script(mut self, image: impl Into<String>, pull: MockPull) -> Self {
        Arc::make_mut(&mut self.script)
            .pulls
            .insert(image.into(), pull);
        self
    }

    /// Make deleting `image` report that it is already gone.
    pub fn remove_not_found(mut self, image: impl Into<String>) -> Self {
        let image = image.into();
        let message = format!("No such image: {image}");
        Arc::make_mut(&mut self.script)
            .removals
            .insert(image, MockRemove::NotFound(message));
        self
    }

    /// Make deleting `image` fail with `message`.
    pub fn remove_fails(mut self, image: impl Into<String>, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.script)
            .removals
            .insert(image.into(), MockRemove::Fail(message.into()));
        self
    }

    /// Delay before each streamed chunk.
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        Arc::make_mut(&mut self.script).chunk_interval = interval;
        self
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RuntimeDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<Box<dyn RuntimeSession>, RuntimeError> {
        record(&self.calls, MockCall::Connect);
        if let Some(message) = &self.script.unreachable {
            return Err(RuntimeError::Unavailable(message.clone()));
        }
        Ok(Box::new(MockSession {
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockSession {
    script: Arc<MockScript>,
    calls: CallLog,
}

impl MockSession {
    fn chunk_stream(&self, chunks: Vec<u64>) -> ChunkStream {
        let interval = self.script.chunk_interval;
        stream::iter(chunks)
            .then(move |size| async move {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                Ok(size)
            })
            .boxed()
    }
}

#[async_trait]
impl RuntimeSession for MockSession {
    async fn pull(&mut self, image: &str) -> Result<ChunkStream, RuntimeError> {
        record(&self.calls, MockCall::Pull(image.to_string()));
        debug!(image = %image, "[MOCK] Pulling image");

        match self.script.pulls.get(image).cloned() {
            Some(MockPull::Chunks(chunks)) => Ok(self.chunk_stream(chunks)),
            Some(MockPull::BrokenStream { chunks, error }) => Ok(self
                .chunk_stream(chunks)
                .chain(stream::once(async move { Err(RuntimeError::Stream(error)) }))
                .boxed()),
            Some(MockPull::Rejected(message)) => Err(RuntimeError::Api(message)),
            None => Err(RuntimeError::Api(format!(
                "pull access denied for {image}, repository does not exist"
            ))),
        }
    }

    async fn remove(&mut self, image: &str) -> Result<(), RuntimeError> {
        record(&self.calls, MockCall::Remove(image.to_string()));
        debug!(image = %image, "[MOCK] Removing image");

        match self.script.removals.get(image) {
            Some(MockRemove::NotFound(message)) => Err(RuntimeError::NotFound(message.clone())),
            Some(MockRemove::Fail(message)) => Err(RuntimeError::Api(message.clone())),
            None => Ok(()),
        }
    }
}
