// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live feed loop.
//!
//! A reader task pulls raw events off the feed and hands them, one at a
//! time, to the applier loop:
//!
//! ```text
//! reader ──(event, ack)──► mpsc(1) ──► applier loop
//!   ▲                                      │ apply → persist cursor
//!   └──────────── ack (oneshot) ◄──────────┘
//! ```
//!
//! The reader does not pull the next event until the previous one is
//! acknowledged, so at most one event is in flight.
//!
//! # Failures
//!
//! - The feed erroring or ending is always fatal (`Stream` error).
//! - A failed event is fatal with `exit_on_error`, otherwise it is logged
//!   and skipped and the cursor moves past it.

use crate::applier::ChangeEventApplier;
use crate::config::FeedKind;
use crate::cursor::FeedCursorStore;
use crate::error::{ReplicationError, Result};
use crate::feed::{parse_change_event, parse_oplog_entry, FeedEvent};
use crate::metrics;
use crate::source::{DocumentSource, DocumentStream};
use crate::target::TargetStore;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

type Handoff = (Result<FeedEvent>, oneshot::Sender<()>);

/// Settings for one feed loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TailSettings {
    pub kind: FeedKind,
    pub exit_on_error: bool,
}

/// Apply the feed until shutdown or a fatal error.
pub(crate) async fn run_feed<S, T>(
    stream: DocumentStream,
    applier: Arc<ChangeEventApplier<S, T>>,
    cursor_store: Arc<FeedCursorStore>,
    settings: TailSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: DocumentSource,
    T: TargetStore,
{
    let span = info_span!("feed", kind = %settings.kind);
    async move {
        info!(exit_on_error = settings.exit_on_error, "Tailing change feed");

        let (tx, mut rx) = mpsc::channel::<Handoff>(1);
        let reader = tokio::spawn(read_feed(stream, settings.kind, tx, shutdown_rx.clone()).in_current_span());

        let result = loop {
            let (item, ack) = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping feed");
                        break Ok(());
                    }
                    continue;
                }
                next = rx.recv() => match next {
                    Some(handoff) => handoff,
                    None => break Ok(()),
                },
            };

            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    metrics::record_error("feed", e.kind());
                    error!(error = %e, "Change feed failed");
                    break Err(e);
                }
            };

            if let Err(e) = handle_event(&applier, &cursor_store, &event, settings.exit_on_error).await {
                break Err(e);
            }
            // Reader gone means shutdown already won the race.
            let _ = ack.send(());
        };

        reader.abort();
        info!("Change feed stopped");
        result
    }
    .instrument(span)
    .await
}

async fn handle_event<S, T>(
    applier: &ChangeEventApplier<S, T>,
    cursor_store: &FeedCursorStore,
    event: &FeedEvent,
    exit_on_error: bool,
) -> Result<()>
where
    S: DocumentSource,
    T: TargetStore,
{
    // The applier records applied and ignored events itself.
    if let Err(e) = applier.apply(event).await {
        metrics::record_error("applier", e.kind());
        if exit_on_error {
            error!(error = %e, kind = event.change.kind(), "Change failed, stopping");
            return Err(e);
        }
        error!(
            error = %e,
            kind = event.change.kind(),
            namespace = event.change.namespace().unwrap_or_default(),
            "Change failed, skipping"
        );
    }

    if let Some(position) = &event.position {
        if let Some(ts) = position.timestamp() {
            metrics::set_feed_lag_seconds(lag_seconds(ts.time));
        }
        cursor_store.set_position(position).await?;
    }
    Ok(())
}

fn lag_seconds(event_secs: u32) -> f64 {
    let now_ms = Utc::now().timestamp_millis();
    ((now_ms - i64::from(event_secs) * 1000) as f64 / 1000.0).max(0.0)
}

/// Pull events and wait for each acknowledgement before reading the next.
async fn read_feed(
    mut stream: DocumentStream,
    kind: FeedKind,
    tx: mpsc::Sender<Handoff>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let (item, fatal) = match next {
            Some(Ok(raw)) => {
                let event = match kind {
                    FeedKind::Oplog => parse_oplog_entry(&raw),
                    FeedKind::ChangeStream => parse_change_event(&raw),
                };
                (Ok(event), false)
            }
            Some(Err(e)) => (Err(ReplicationError::Stream(e.to_string())), true),
            None => (Err(ReplicationError::Stream("change feed closed".to_string())), true),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send((item, ack_tx)).await.is_err() || fatal {
            break;
        }
        if ack_rx.await.is_err() {
            debug!("Applier stopped before acknowledging event");
            break;
        }
    }
    if *shutdown_rx.borrow() {
        debug!("Feed reader stopping");
    } else {
        warn!("Feed reader stopped");
    }
}
