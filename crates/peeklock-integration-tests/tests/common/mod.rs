//! Common test utilities for peeklock integration tests
//!
//! This module provides:
//! - Scripted handlers that record what they saw
//! - Log capture for asserting on warnings
//! - Helpers for seeding the in-memory broker and running receivers

use async_trait::async_trait;
use peeklock::{
    BatchHandler, BatchOutcome, BusError, Disposition, EntityName, Handler, HandlerOutcome,
    InMemoryTransport, MessageContext, OutMessage, ReceivedMessage, Receiver,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing_subscriber::fmt::MakeWriter;

#[allow(dead_code)]
pub fn name(s: &str) -> EntityName {
    EntityName::new(s.to_string()).unwrap()
}

/// Put one message per body on `entity`
#[allow(dead_code)]
pub fn seed(broker: &InMemoryTransport, entity: &str, bodies: &[&str]) {
    for body in bodies {
        broker.enqueue(entity, OutMessage::new(body.to_string()));
    }
}

/// Poll until `condition` holds
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        sleep(Duration::from_millis(5)).await;
    }
}

/// Run `listen` on a spawned task
#[allow(dead_code)]
pub fn spawn_listen(receiver: &Arc<Receiver>) -> JoinHandle<Result<(), BusError>> {
    let receiver = receiver.clone();
    tokio::spawn(async move { receiver.listen().await })
}

// ============================================================================
// Probe
// ============================================================================

/// Observations shared by every handler built from it
#[derive(Default)]
#[allow(dead_code)]
pub struct Probe {
    handled: Mutex<Vec<String>>,
    trace_ids: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bodies in the order handling started
    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }

    pub fn trace_ids(&self) -> Vec<String> {
        self.trace_ids.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, message: &ReceivedMessage, context: &MessageContext) {
        self.handled
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&message.body).into_owned());
        self.trace_ids
            .lock()
            .unwrap()
            .push(context.trace().trace_id().to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Scripted Handlers
// ============================================================================

/// Per-message handler whose behaviour is keyed by message body.
///
/// Unscripted bodies complete immediately.
#[allow(dead_code)]
pub struct ScriptedHandler {
    probe: Arc<Probe>,
    delays: HashMap<String, Duration>,
    dispositions: HashMap<String, (Disposition, Option<String>)>,
    default_delay: Duration,
}

#[allow(dead_code)]
impl ScriptedHandler {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            delays: HashMap::new(),
            dispositions: HashMap::new(),
            default_delay: Duration::ZERO,
        }
    }

    /// Sleep this long for every message
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_delay(mut self, body: &str, delay: Duration) -> Self {
        self.delays.insert(body.to_string(), delay);
        self
    }

    pub fn with_disposition(
        mut self,
        body: &str,
        disposition: Disposition,
        error: Option<&str>,
    ) -> Self {
        self.dispositions.insert(
            body.to_string(),
            (disposition, error.map(str::to_string)),
        );
        self
    }

    pub fn arc(self) -> Arc<dyn Handler> {
        Arc::new(self)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, context: MessageContext, message: &ReceivedMessage) -> HandlerOutcome {
        self.probe.enter(message, &context);
        let body = String::from_utf8_lossy(&message.body).into_owned();

        let delay = self.delays.get(&body).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let outcome = match self.dispositions.get(&body) {
            Some((disposition, error)) => HandlerOutcome::new(
                *disposition,
                context,
                error.as_ref().map(|e| anyhow::anyhow!(e.clone())),
            ),
            None => HandlerOutcome::complete(context),
        };
        self.probe.exit();
        outcome
    }
}

/// Batch handler returning a fixed disposition list
#[allow(dead_code)]
pub struct FixedBatchHandler {
    probe: Arc<Probe>,
    dispositions: Vec<Disposition>,
    error: Option<String>,
    delay: Duration,
    batches: Mutex<Vec<usize>>,
}

#[allow(dead_code)]
impl FixedBatchHandler {
    pub fn new(probe: Arc<Probe>, dispositions: Vec<Disposition>) -> Self {
        Self {
            probe,
            dispositions,
            error: None,
            delay: Duration::ZERO,
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before returning each batch's dispositions
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Size of every batch received
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchHandler for FixedBatchHandler {
    async fn handle(&self, context: MessageContext, messages: &[ReceivedMessage]) -> BatchOutcome {
        for message in messages {
            self.probe.enter(message, &context);
            self.probe.exit();
        }
        self.batches.lock().unwrap().push(messages.len());
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        BatchOutcome::new(
            self.dispositions.clone(),
            context,
            self.error.as_ref().map(|e| anyhow::anyhow!(e.clone())),
        )
    }
}

// ============================================================================
// Log Capture
// ============================================================================

/// Captures formatted log output for the current test thread
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl LogCapture {
    /// Install as the thread default; `#[tokio::test]` keeps spawned tasks on
    /// the test thread, so their events land here too
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }

    /// Lines containing every needle
    pub fn lines_with(&self, needles: &[&str]) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| needles.iter().all(|n| line.contains(n)))
            .map(str::to_string)
            .collect()
    }
}

#[allow(dead_code)]
pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(self.buffer.clone())
    }
}
