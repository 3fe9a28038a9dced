//! Receive loops for the parallel, serial and batch topologies.
//!
//! Every loop repeats fetch, dispatch, dispose until the receiver's root
//! token is cancelled. A fetch in progress is dropped on cancellation; a
//! cycle that has started dispatching always runs to the end of its
//! disposals first. A fetch failure or an `Unknown` disposition ends the loop
//! with an error, handler failures never do.

use crate::deadline::Deadline;
use crate::disposition::{dispose, Disposition};
use crate::error::BusError;
use crate::handler::{is_lock_lost, BatchHandler, Handler, HandlerError, MessageContext};
use crate::lease::spawn_lock_renewal;
use crate::message::ReceivedMessage;
use crate::settle::MessageSettler;
use crate::trace::{TraceContext, TracePropagator};
use crate::transport::ReceiverLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How leases are kept for the duration of processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseStrategy {
    /// Renew every message's lock at `interval` while it is processed
    Renew { interval: Duration },
    /// No renewal; processing is bounded by a deadline
    Deadline { max_duration: Duration },
}

/// One message handed to a parallel worker together with its completion slot
struct Job {
    index: usize,
    message: ReceivedMessage,
    done: oneshot::Sender<Result<(), BusError>>,
}

type SharedJobs = Arc<Mutex<mpsc::Receiver<Job>>>;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    link: Arc<dyn ReceiverLink>,
    settler: MessageSettler,
    propagator: Arc<dyn TracePropagator>,
    lease: LeaseStrategy,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        link: Arc<dyn ReceiverLink>,
        propagator: Arc<dyn TracePropagator>,
        lease: LeaseStrategy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settler: MessageSettler::new(link.clone()),
            link,
            propagator,
            lease,
            cancel,
        }
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Fetch up to `max` messages; `None` once the receiver is cancelled
    pub(crate) async fn fetch(
        &self,
        max: usize,
    ) -> Result<Option<Vec<ReceivedMessage>>, BusError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Receive cancelled");
                Ok(None)
            }
            result = self.link.receive_messages(max) => match result {
                Ok(messages) => {
                    debug!(count = messages.len(), "Received messages");
                    Ok(Some(messages))
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    Err(e)
                }
            }
        }
    }

    // ========================================================================
    // Parallel
    // ========================================================================

    /// One worker per handler fed from a channel of the same depth. A cycle
    /// fetches at most one message per worker and does not fetch again until
    /// every message of the cycle has been disposed.
    pub(crate) async fn run_parallel(&self, handlers: &[Arc<dyn Handler>]) -> Result<(), BusError> {
        let worker_count = handlers.len();
        debug!(worker_count, lease = ?self.lease, "Starting parallel workers");

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(worker_count);
        let jobs: SharedJobs = Arc::new(Mutex::new(jobs_rx));
        // Not tied to the receiver token: queued jobs are drained before the
        // workers stop.
        let stop = CancellationToken::new();

        let mut workers = JoinSet::new();
        for (worker, handler) in handlers.iter().enumerate() {
            let dispatcher = self.clone();
            let handler = handler.clone();
            let jobs = jobs.clone();
            let stop = stop.clone();
            workers.spawn(
                async move { dispatcher.run_worker(handler, jobs, stop).await }
                    .instrument(tracing::debug_span!("worker", worker)),
            );
        }
        drop(jobs);

        let result = self.parallel_cycles(worker_count, &jobs_tx).await;

        stop.cancel();
        drop(jobs_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Parallel worker panicked");
            }
        }
        result
    }

    async fn parallel_cycles(
        &self,
        worker_count: usize,
        jobs: &mpsc::Sender<Job>,
    ) -> Result<(), BusError> {
        loop {
            let Some(messages) = self.fetch(worker_count).await? else {
                return Ok(());
            };
            let total = messages.len();

            let mut pending = Vec::with_capacity(total);
            for (i, message) in messages.into_iter().enumerate() {
                let (done, completed) = oneshot::channel();
                let job = Job {
                    index: i + 1,
                    message,
                    done,
                };
                if jobs.send(job).await.is_err() {
                    return Err(BusError::HandlerFailed {
                        message: "all parallel workers have stopped".to_string(),
                    });
                }
                pending.push(completed);
            }

            let mut first_error = None;
            for completed in pending {
                match completed.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        first_error.get_or_insert(BusError::HandlerFailed {
                            message: "worker stopped before disposing its message".to_string(),
                        });
                    }
                }
            }
            debug!(total, "Processed messages");

            if let Some(e) = first_error {
                return Err(e);
            }
        }
    }

    async fn run_worker(
        &self,
        handler: Arc<dyn Handler>,
        jobs: SharedJobs,
        stop: CancellationToken,
    ) {
        loop {
            let job = {
                let mut jobs = jobs.lock().await;
                tokio::select! {
                    job = jobs.recv() => job,
                    _ = stop.cancelled() => None,
                }
            };
            let Some(job) = job else {
                debug!("Stop worker");
                return;
            };

            let result = self
                .process_with_lease(job.index, &job.message, handler.as_ref())
                .await;
            // The cycle may have been abandoned by a panicking peer.
            let _ = job.done.send(result);
        }
    }

    /// Process one message under its own lease: a renewal loop or a deadline
    async fn process_with_lease(
        &self,
        index: usize,
        message: &ReceivedMessage,
        handler: &dyn Handler,
    ) -> Result<(), BusError> {
        match self.lease {
            LeaseStrategy::Renew { interval } => {
                let scope = self.cancel.child_token();
                let renewal = spawn_lock_renewal(
                    self.link.clone(),
                    scope.clone(),
                    index,
                    message.clone(),
                    interval,
                );
                let result = self
                    .process_message(index, scope.clone(), None, message, handler)
                    .await;
                scope.cancel();
                join_renewals(vec![renewal]).await;
                result
            }
            LeaseStrategy::Deadline { max_duration } => {
                let deadline = Deadline::start(&self.cancel, max_duration, message);
                let result = self
                    .process_message(
                        index,
                        deadline.token().clone(),
                        Some(&deadline),
                        message,
                        handler,
                    )
                    .await;
                deadline.cancel();
                result
            }
        }
    }

    // ========================================================================
    // Serial
    // ========================================================================

    /// Fetch up to `batch_size` messages and handle them one after another,
    /// disposing each before the next starts.
    pub(crate) async fn run_serial(
        &self,
        handler: &dyn Handler,
        batch_size: usize,
    ) -> Result<(), BusError> {
        debug!(batch_size, lease = ?self.lease, "Starting serial receive loop");
        loop {
            let Some(messages) = self.fetch(batch_size).await? else {
                return Ok(());
            };
            let total = messages.len();

            let result = match self.lease {
                LeaseStrategy::Renew { interval } => {
                    self.serial_with_renewal(&messages, handler, interval).await
                }
                LeaseStrategy::Deadline { .. } => {
                    let mut first_error = None;
                    for (i, message) in messages.iter().enumerate() {
                        if let Err(e) = self.process_with_lease(i + 1, message, handler).await {
                            first_error.get_or_insert(e);
                        }
                    }
                    first_error.map_or(Ok(()), Err)
                }
            };
            debug!(total, "Processed messages");
            result?;
        }
    }

    /// Every fetched message is renewed from the start of the cycle, since
    /// later messages wait for earlier ones. Each renewal stops as soon as its
    /// own message has been disposed.
    async fn serial_with_renewal(
        &self,
        messages: &[ReceivedMessage],
        handler: &dyn Handler,
        interval: Duration,
    ) -> Result<(), BusError> {
        let cycle = self.cancel.child_token();
        let scopes: Vec<CancellationToken> =
            messages.iter().map(|_| cycle.child_token()).collect();
        let renewals: Vec<_> = messages
            .iter()
            .zip(&scopes)
            .enumerate()
            .map(|(i, (message, scope))| {
                spawn_lock_renewal(
                    self.link.clone(),
                    scope.clone(),
                    i + 1,
                    message.clone(),
                    interval,
                )
            })
            .collect();

        let mut first_error = None;
        for (i, (message, scope)) in messages.iter().zip(&scopes).enumerate() {
            if let Err(e) = self
                .process_message(i + 1, scope.clone(), None, message, handler)
                .await
            {
                first_error.get_or_insert(e);
            }
            scope.cancel();
        }

        cycle.cancel();
        join_renewals(renewals).await;
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Batch
    // ========================================================================

    /// Fetch up to `batch_size` messages and hand them to the batch handler
    /// in one call.
    pub(crate) async fn run_batch(
        &self,
        handler: &dyn BatchHandler,
        batch_size: usize,
    ) -> Result<(), BusError> {
        debug!(batch_size, lease = ?self.lease, "Starting batch receive loop");
        loop {
            let Some(messages) = self.fetch(batch_size).await? else {
                return Ok(());
            };
            if messages.is_empty() {
                continue;
            }

            match self.lease {
                LeaseStrategy::Renew { interval } => {
                    let scope = self.cancel.child_token();
                    let renewals: Vec<_> = messages
                        .iter()
                        .enumerate()
                        .map(|(i, message)| {
                            spawn_lock_renewal(
                                self.link.clone(),
                                scope.clone(),
                                i + 1,
                                message.clone(),
                                interval,
                            )
                        })
                        .collect();
                    let result = self
                        .process_batch(scope.clone(), None, &messages, handler)
                        .await;
                    scope.cancel();
                    join_renewals(renewals).await;
                    result?;
                }
                LeaseStrategy::Deadline { max_duration } => {
                    // The first message was locked earliest, so it bounds the batch.
                    let deadline = Deadline::start(&self.cancel, max_duration, &messages[0]);
                    let result = self
                        .process_batch(
                            deadline.token().clone(),
                            Some(&deadline),
                            &messages,
                            handler,
                        )
                        .await;
                    deadline.cancel();
                    result?;
                }
            }
        }
    }

    async fn process_batch(
        &self,
        scope: CancellationToken,
        deadline: Option<&Deadline>,
        messages: &[ReceivedMessage],
        handler: &dyn BatchHandler,
    ) -> Result<(), BusError> {
        let started = Instant::now();
        let total = messages.len();
        let context = self.message_context(scope, &messages[0]);
        let span = context.span().clone();

        let outcome = handler
            .handle(context, messages)
            .instrument(span.clone())
            .await;
        let error = outcome.error;
        let dispositions = align_dispositions(outcome.dispositions, total);

        let mut first_error = None;
        for (message, (disposition, padding_error)) in messages.iter().zip(dispositions) {
            let reason = padding_error.as_ref().or(error.as_ref());
            if let Err(e) = dispose(&self.settler, disposition, reason, message)
                .instrument(outcome.context.span().clone())
                .await
            {
                error!(message_id = %message.message_id, error = %e, "Batch disposal failed");
                first_error.get_or_insert(e);
            }
        }

        report_timing(total, started.elapsed(), deadline, error.as_ref());
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Per-message processing
    // ========================================================================

    /// Run the handler for one message and apply its disposition
    async fn process_message(
        &self,
        index: usize,
        scope: CancellationToken,
        deadline: Option<&Deadline>,
        message: &ReceivedMessage,
        handler: &dyn Handler,
    ) -> Result<(), BusError> {
        let started = Instant::now();
        debug!(index, message_id = %message.message_id, "Processing message");

        let context = self.message_context(scope, message);
        let span = context.span().clone();
        let outcome = handler.handle(context, message).instrument(span).await;

        let result = dispose(
            &self.settler,
            outcome.disposition,
            outcome.error.as_ref(),
            message,
        )
        .instrument(outcome.context.span().clone())
        .await;
        if let Err(e) = &result {
            error!(index, message_id = %message.message_id, error = %e, "Disposal failed");
        }

        report_timing(1, started.elapsed(), deadline, outcome.error.as_ref());
        result
    }

    /// Build the handler scope, continuing the sender's trace when the
    /// message carries one
    pub(crate) fn message_context(
        &self,
        scope: CancellationToken,
        message: &ReceivedMessage,
    ) -> MessageContext {
        let trace = match self.propagator.extract(&message.application_properties) {
            Some(parent) => parent.child(),
            None => {
                debug!(message_id = %message.message_id, "No trace context on message");
                TraceContext::new_root()
            }
        };
        let span = tracing::info_span!(
            "handle_message",
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            trace_id = %trace.trace_id(),
        );
        MessageContext::new(scope, trace, span)
    }
}

/// Pair each message slot with a disposition.
///
/// A handler returning fewer dispositions than messages gets the missing
/// ones dead-lettered with a reason describing the mismatch; surplus
/// dispositions are dropped.
pub(crate) fn align_dispositions(
    dispositions: Vec<Disposition>,
    expected: usize,
) -> Vec<(Disposition, Option<HandlerError>)> {
    let returned = dispositions.len();
    if returned != expected {
        warn!(
            returned,
            expected, "Batch handler returned a disposition count that does not match the batch"
        );
    }

    let mut aligned: Vec<(Disposition, Option<HandlerError>)> = dispositions
        .into_iter()
        .take(expected)
        .map(|d| (d, None))
        .collect();
    while aligned.len() < expected {
        aligned.push((
            Disposition::Deadletter,
            Some(anyhow::anyhow!(
                "batch handler returned {returned} dispositions for {expected} messages"
            )),
        ));
    }
    aligned
}

/// Wait for renewal loops that have been told to stop
async fn join_renewals(renewals: Vec<JoinHandle<u64>>) {
    for renewal in renewals {
        if let Err(e) = renewal.await {
            error!(error = %e, "Lock renewal task panicked");
        }
    }
}

pub(crate) fn report_timing(
    count: usize,
    elapsed: Duration,
    deadline: Option<&Deadline>,
    error: Option<&HandlerError>,
) {
    let elapsed_ms = elapsed.as_millis() as u64;
    debug!(count, elapsed_ms, "Processing took");

    if let Some(deadline) = deadline {
        if let Some(overrun) = deadline.exceeded_by(elapsed) {
            warn!(
                count,
                elapsed_ms,
                deadline_ms = deadline.max_duration().as_millis() as u64,
                overrun_ms = overrun.as_millis() as u64,
                "Processing exceeded the deadline; enable lock renewal or reduce the batch size"
            );
        }
    }

    if let Some(error) = error {
        if is_lock_lost(error) {
            warn!(
                count,
                error = %format!("{:#}", error),
                "Handler lost the message lock; enable lock renewal"
            );
        } else {
            info!(count, error = %format!("{:#}", error), "Handler reported an error");
        }
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
