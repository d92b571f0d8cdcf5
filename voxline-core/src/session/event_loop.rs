//! Per-session task: applies inbound connection events in arrival order and
//! re-evaluates the speaking flag on a fixed tick.

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec;
use crate::ipc::events::NoticeLevel;
use crate::session::{AudioSession, SessionState, Shared};
use crate::transport::{ConnectionEvent, TransportLink};

pub(crate) async fn run(
    session: Arc<Mutex<AudioSession>>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    link: TransportLink,
    shared: Shared,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut chunk_seq = 0u64;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.unwrap_or(ConnectionEvent::Closed);
                if handle_event(&session, &shared, &link, event, &mut chunk_seq).is_break() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if poll_speaking(&session, &shared).is_break() {
                    break;
                }
            }
        }
    }
    debug!("session event loop stopped");
}

fn handle_event(
    session: &Mutex<AudioSession>,
    shared: &Shared,
    link: &TransportLink,
    event: ConnectionEvent,
    chunk_seq: &mut u64,
) -> ControlFlow<()> {
    match event {
        ConnectionEvent::InboundAudio { pcm, sample_rate } => {
            let chunk = codec::decode_chunk(*chunk_seq, &pcm, sample_rate);
            *chunk_seq += 1;
            if chunk.is_empty() {
                return ControlFlow::Continue(());
            }
            let mut s = session.lock();
            if s.state != SessionState::Open {
                return ControlFlow::Break(());
            }
            if let Some(playback) = s.playback.as_mut() {
                if playback.enqueue(&chunk).is_some() {
                    shared
                        .diagnostics
                        .chunks_scheduled
                        .fetch_add(1, Ordering::Relaxed);
                }
                shared.set_speaking(playback.is_speaking());
            }
        }

        ConnectionEvent::TurnComplete => {
            let mut s = session.lock();
            if let Some(playback) = s.playback.as_mut() {
                playback.turn_complete();
            }
            shared.set_speaking(false);
        }

        ConnectionEvent::Interrupted => {
            let mut s = session.lock();
            if let Some(playback) = s.playback.as_mut() {
                playback.interrupt();
            }
            shared.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
            shared.set_speaking(false);
            info!(session_id = %s.id, "assistant interrupted");
        }

        ConnectionEvent::ToolCall(invocations) => {
            for invocation in invocations {
                debug!(tool = %invocation.name, id = %invocation.id, "tool call received");
                // Answered on its own task; the loop keeps draining events.
                drop(shared.dispatcher.dispatch(invocation, link.clone()));
            }
        }

        ConnectionEvent::TransportError(reason) => {
            warn!("transport error: {reason}");
            shared.notify(NoticeLevel::Error, "Connection lost", reason.clone());
            let mut s = session.lock();
            s.last_error = Some(reason);
            if s.state == SessionState::Open {
                shared.teardown(&mut s, SessionState::Closed, false);
            }
            return ControlFlow::Break(());
        }

        ConnectionEvent::Closed => {
            let mut s = session.lock();
            if s.state == SessionState::Open {
                info!(session_id = %s.id, "backend closed the session");
                shared.teardown(&mut s, SessionState::Closed, false);
            }
            return ControlFlow::Break(());
        }

        ConnectionEvent::Opened => debug!("duplicate session-open acknowledgement ignored"),
    }
    ControlFlow::Continue(())
}

fn poll_speaking(session: &Mutex<AudioSession>, shared: &Shared) -> ControlFlow<()> {
    let mut s = session.lock();
    if s.state != SessionState::Open {
        return ControlFlow::Break(());
    }
    if let Some(playback) = s.playback.as_mut() {
        if playback.poll() {
            shared.set_speaking(false);
        }
    }
    ControlFlow::Continue(())
}
