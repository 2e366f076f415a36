//! Reader task for a running endpoint.
//!
//! This module provides the background task that reads lines from the peer
//! and routes them:
//! - Calls are dispatched to local handlers on their own tasks, so a slow
//!   handler never stalls the loop (and re-entrant calls can be answered)
//! - Replies resolve the matching pending call
//! - Malformed lines are logged and skipped; answerable ones get an error reply
//!
//! The loop ends on end of stream, read error, or cancellation. On exit it
//! closes the link, which fails every pending call. After end of stream or a
//! read error, calls already read are still answered before the writer is
//! shut down; cancellation abandons them.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::pending::Resolution;
use crate::caller::Link;
use crate::protocol::{CallMessage, InboundMessage, ReplyMessage, parse_line};
use crate::transport::{TransportReader, TransportWriter};

/// Handle to a running reader task.
///
/// Dropping the handle cancels the task.
pub(crate) struct ReaderTaskHandle {
    join_handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
    /// Stops waiting on in-flight dispatches once the stream has ended.
    drain_token: CancellationToken,
}

impl ReaderTaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
        self.drain_token.cancel();
    }

    /// Wait for the task to finish.
    pub(crate) async fn join(mut self) {
        let Some(handle) = self.join_handle.take() else {
            return;
        };
        if let Err(e) = handle.await
            && e.is_panic()
        {
            log::error!(
                target: "crosspulse::reader",
                "Reader task panicked: {}",
                e
            );
        }
    }
}

impl Drop for ReaderTaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Shared state the reader task needs.
pub(crate) struct ReaderContext {
    pub(crate) link: Arc<Link>,
    pub(crate) writer: Arc<TransportWriter>,
    pub(crate) dispatcher: Dispatcher,
    /// Cancelled when the task exits, after the writer has been shut down.
    pub(crate) finished: CancellationToken,
}

/// Why the loop stopped.
enum Exit {
    Cancelled,
    Ended(String),
}

/// Spawn the reader task.
///
/// The task's token is a child of the link's shutdown token, so closing the
/// link from anywhere also stops the loop.
pub(crate) fn spawn_reader_task(reader: TransportReader, ctx: ReaderContext) -> ReaderTaskHandle {
    let cancel_token = ctx.link.shutdown.child_token();
    let drain_token = CancellationToken::new();
    let join_handle = tokio::spawn(reader_loop(
        reader,
        ctx,
        cancel_token.clone(),
        drain_token.clone(),
    ));

    ReaderTaskHandle {
        join_handle: Some(join_handle),
        cancel_token,
        drain_token,
    }
}

async fn reader_loop(
    mut reader: TransportReader,
    ctx: ReaderContext,
    cancel_token: CancellationToken,
    drain_token: CancellationToken,
) {
    let _finished = ctx.finished.clone().drop_guard();
    let mut dispatches = JoinSet::new();

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break Exit::Cancelled,

            result = reader.next_line() => {
                match result {
                    Ok(Some(line)) => handle_line(&line, &ctx, &mut dispatches),
                    Ok(None) => break Exit::Ended("peer closed the stream".to_string()),
                    Err(e) => {
                        log::warn!(
                            target: "crosspulse::reader",
                            "Read error: {}, failing pending calls",
                            e
                        );
                        break Exit::Ended(format!("read error: {}", e));
                    }
                }
            }
        }

        while let Some(joined) = dispatches.try_join_next() {
            log_dispatch_failure(joined);
        }
    };

    match exit {
        Exit::Cancelled => {
            log::debug!(target: "crosspulse::reader", "Reader loop exiting: endpoint shut down");
            ctx.link.close("endpoint shut down");
            // Unfinished dispatches are aborted when the set drops
        }
        Exit::Ended(reason) => {
            log::debug!(target: "crosspulse::reader", "Reader loop exiting: {}", reason);
            ctx.link.close(&reason);
            drain_dispatches(&mut dispatches, &drain_token).await;
        }
    }
    ctx.link.close_transport().await;
}

/// Let every dispatched call write its reply, unless `drain_token` fires first.
async fn drain_dispatches(dispatches: &mut JoinSet<()>, drain_token: &CancellationToken) {
    if dispatches.is_empty() {
        return;
    }
    log::debug!(
        target: "crosspulse::reader",
        "Waiting for {} in-flight call(s) to reply",
        dispatches.len()
    );

    loop {
        tokio::select! {
            biased;

            _ = drain_token.cancelled() => {
                log::debug!(
                    target: "crosspulse::reader",
                    "Abandoning {} in-flight call(s)",
                    dispatches.len()
                );
                dispatches.abort_all();
                return;
            }

            joined = dispatches.join_next() => match joined {
                Some(joined) => log_dispatch_failure(joined),
                None => return,
            },
        }
    }
}

fn log_dispatch_failure(joined: Result<(), JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        log::error!(
            target: "crosspulse::reader",
            "Dispatch task panicked: {}",
            e
        );
    }
}

/// Route one received line.
fn handle_line(line: &str, ctx: &ReaderContext, dispatches: &mut JoinSet<()>) {
    if line.trim().is_empty() {
        return;
    }

    log::trace!(target: "crosspulse::reader", "Received: {}", line);

    match parse_line(line) {
        Ok(InboundMessage::Call(call)) => spawn_dispatch(call, ctx, dispatches),
        Ok(InboundMessage::Reply(reply)) => route_reply(reply, ctx),
        Err(violation) => {
            log::warn!(
                target: "crosspulse::reader",
                "Ignoring malformed line: {}",
                violation.reason
            );
            if let Some(id) = violation.reply_to {
                let reply = ReplyMessage::failure(id, format!("Protocol error: {}", violation.reason));
                let writer = Arc::clone(&ctx.writer);
                dispatches.spawn(async move { send_reply(&writer, reply).await });
            }
        }
    }
}

fn spawn_dispatch(call: CallMessage, ctx: &ReaderContext, dispatches: &mut JoinSet<()>) {
    let dispatcher = ctx.dispatcher.clone();
    let writer = Arc::clone(&ctx.writer);
    dispatches.spawn(async move {
        let reply = dispatcher.dispatch(call).await;
        send_reply(&writer, reply).await;
    });
}

fn route_reply(reply: ReplyMessage, ctx: &ReaderContext) {
    let id = reply.id;
    let resolution = if reply.success {
        Resolution::Success(reply.result.unwrap_or_default())
    } else {
        Resolution::Failure(
            reply
                .error
                .unwrap_or_else(|| "peer reported failure without an error message".to_string()),
        )
    };

    if !ctx.link.pending.resolve(id, resolution) {
        log::debug!(
            target: "crosspulse::reader",
            "Dropping reply for unknown or expired call {}",
            id
        );
    }
}

async fn send_reply(writer: &TransportWriter, reply: ReplyMessage) {
    let id = reply.id;
    let line = match reply.to_line() {
        Ok(line) => line,
        Err(e) => {
            log::error!(
                target: "crosspulse::reader",
                "Failed to serialize reply {}: {}",
                id,
                e
            );
            return;
        }
    };

    if let Err(e) = writer.write_line(&line).await {
        log::debug!(
            target: "crosspulse::reader",
            "Could not write reply {}: {}",
            id,
            e
        );
    }
}
