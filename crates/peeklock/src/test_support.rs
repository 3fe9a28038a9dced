//! Shared fixtures for unit tests.

use crate::error::BusError;
use crate::message::{EntityName, LockToken, MessageId, ReceivedMessage, Timestamp};
use crate::transport::{BusTransport, ReceiverEntity, ReceiverLink, SenderLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Build a leased message with the given body
pub(crate) fn received_message(body: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId::new(),
        lock_token: LockToken::new(),
        sequence_number: 1,
        delivery_count: 1,
        application_properties: HashMap::new(),
        correlation_id: None,
        body: Bytes::from(body.to_string()),
        enqueued_at: Timestamp::now(),
        locked_until: Timestamp::from_datetime(chrono::Utc::now() + chrono::Duration::seconds(60)),
        dead_letter_reason: None,
    }
}

/// One call made against a [`ScriptedLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    Receive(usize),
    Renew(String),
    Complete(String),
    Abandon(String),
    DeadLetter(String, String),
    Close,
}

/// Receiver link that replays scripted fetch results and records every call.
///
/// Once the script is exhausted `receive_messages` never resolves, which is
/// how an idle broker behaves.
#[derive(Default)]
pub(crate) struct ScriptedLink {
    fetches: Mutex<VecDeque<Result<Vec<ReceivedMessage>, BusError>>>,
    calls: Mutex<Vec<LinkCall>>,
    fail_settlement: Mutex<Option<fn(&ReceivedMessage) -> BusError>>,
    fail_renewal: Mutex<bool>,
}

impl ScriptedLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_fetch(&self, messages: Vec<ReceivedMessage>) {
        self.fetches.lock().unwrap().push_back(Ok(messages));
    }

    pub(crate) fn push_fetch_error(&self, error: BusError) {
        self.fetches.lock().unwrap().push_back(Err(error));
    }

    /// Make every complete, abandon and dead-letter call fail
    pub(crate) fn fail_settlement_with(&self, error: fn(&ReceivedMessage) -> BusError) {
        *self.fail_settlement.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_renewal(&self) {
        *self.fail_renewal.lock().unwrap() = true;
    }

    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn renew_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, LinkCall::Renew(_)))
            .count()
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn settlement_result(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        match *self.fail_settlement.lock().unwrap() {
            Some(error) => Err(error(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ReceiverLink for ScriptedLink {
    async fn receive_messages(
        &self,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.record(LinkCall::Receive(max_messages));
        let next = self.fetches.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.record(LinkCall::Renew(message.message_id.to_string()));
        if *self.fail_renewal.lock().unwrap() {
            return Err(BusError::transport("renew", "link detached"));
        }
        Ok(())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.record(LinkCall::Complete(message.message_id.to_string()));
        self.settlement_result(message)
    }

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.record(LinkCall::Abandon(message.message_id.to_string()));
        self.settlement_result(message)
    }

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: &str,
    ) -> Result<(), BusError> {
        self.record(LinkCall::DeadLetter(
            message.message_id.to_string(),
            reason.to_string(),
        ));
        self.settlement_result(message)
    }

    async fn close(&self) -> Result<(), BusError> {
        self.record(LinkCall::Close);
        Ok(())
    }
}

/// Transport handing out one shared [`ScriptedLink`] for every receiver
pub(crate) struct ScriptedTransport {
    pub(crate) link: Arc<ScriptedLink>,
    pub(crate) opened: Mutex<Vec<ReceiverEntity>>,
}

impl ScriptedTransport {
    pub(crate) fn new(link: Arc<ScriptedLink>) -> Arc<Self> {
        Arc::new(Self {
            link,
            opened: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BusTransport for ScriptedTransport {
    async fn open_receiver(
        &self,
        entity: &ReceiverEntity,
    ) -> Result<Arc<dyn ReceiverLink>, BusError> {
        self.opened.lock().unwrap().push(entity.clone());
        Ok(self.link.clone())
    }

    async fn open_sender(&self, entity: &EntityName) -> Result<Arc<dyn SenderLink>, BusError> {
        Err(BusError::EntityNotFound {
            entity: entity.to_string(),
        })
    }
}

/// Captures formatted log output for the current thread
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Install a capturing subscriber as the thread default.
    ///
    /// `#[tokio::test]` runs every task on the test thread, so spawned tasks
    /// log into the same capture.
    pub(crate) fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    pub(crate) fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

pub(crate) struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

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
