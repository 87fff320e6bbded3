//! Notification emitter.
//!
//! Progress and settings snapshots are handed off through a bounded channel to a per-player
//! pump thread, which is the only thread that calls into the [`EventListener`]. The render
//! callback only ever does a non-blocking `try_send`; a progress event that does not fit is
//! owed and delivered later as the latest snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_engine_types::{PlaybackData, PlaybackEvent};
use crossbeam_channel::{Receiver, Sender, TrySendError, select};

/// Snapshot delivered to listeners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlayerEvent {
    Progress(PlaybackEvent),
    Settings(PlaybackData),
}

/// Receives events for every player, always on that player's pump thread.
pub trait EventListener: Send + Sync {
    fn on_event(&self, player_id: &str, event: &PlayerEvent);
}

/// Listener that forwards `(player_id, event)` pairs into a channel.
pub struct ChannelListener {
    tx: Sender<(String, PlayerEvent)>,
}

impl ChannelListener {
    pub fn new(tx: Sender<(String, PlayerEvent)>) -> Self {
        Self { tx }
    }

    /// Listener plus the receiving end of an unbounded channel.
    pub fn unbounded() -> (Arc<Self>, Receiver<(String, PlayerEvent)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self::new(tx)), rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, player_id: &str, event: &PlayerEvent) {
        let _ = self.tx.send((player_id.to_string(), *event));
    }
}

/// Listener that discards everything.
pub struct NoopListener;

impl EventListener for NoopListener {
    fn on_event(&self, _player_id: &str, _event: &PlayerEvent) {}
}

/// Where the pump reads the latest progress snapshot from.
pub trait ProgressSource: Send + Sync {
    fn progress(&self) -> PlaybackEvent;

    /// Whether periodic progress is due (playback is advancing).
    fn advancing(&self) -> bool;
}

/// Producer side of a player's notification queue.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<PlayerEvent>,
    /// Capacity one; rung after `deferred` is set.
    wake: Sender<()>,
    /// A progress event did not fit; the pump owes the listener a fresh snapshot.
    deferred: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Enqueue without blocking. Safe on the render thread.
    ///
    /// A progress event that finds the queue full is replaced by a flag; the pump then
    /// delivers the latest progress snapshot once it has caught up. A full queue drops
    /// settings events.
    pub fn notify(&self, event: PlayerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(PlayerEvent::Progress(_))) => {
                self.deferred.store(true, Ordering::Release);
                let _ = self.wake.try_send(());
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Enqueue, waiting for room. Control thread only.
    pub fn notify_blocking(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Events lost to a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Pump thread handle.
///
/// The thread exits when every [`Notifier`] is gone or when the handle is dropped; in the
/// latter case events already queued are still delivered before the join returns.
pub struct EventPump {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Drop for EventPump {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the pump thread for `player_id`.
///
/// With an `interval`, progress from `source` is emitted whenever no event arrived within
/// it while `source` is advancing.
pub fn spawn_event_pump(
    player_id: String,
    capacity: usize,
    listener: Arc<dyn EventListener>,
    interval: Option<Duration>,
    source: Arc<dyn ProgressSource>,
) -> Result<(Notifier, EventPump)> {
    let (tx, rx) = crossbeam_channel::bounded::<PlayerEvent>(capacity.max(1));
    let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let deferred = Arc::new(AtomicBool::new(false));
    let owed = deferred.clone();
    let join = std::thread::Builder::new()
        .name(format!("events-{player_id}"))
        .spawn(move || {
            let deliver = |ev: &PlayerEvent| listener.on_event(&player_id, ev);
            let settle = || {
                if owed.swap(false, Ordering::AcqRel) {
                    deliver(&PlayerEvent::Progress(source.progress()));
                }
            };
            loop {
                let tick = match interval {
                    Some(every) => crossbeam_channel::after(every),
                    None => crossbeam_channel::never(),
                };
                select! {
                    recv(rx) -> msg => match msg {
                        Ok(ev) => deliver(&ev),
                        Err(_) => break,
                    },
                    recv(wake_rx) -> msg => {
                        if msg.is_err() {
                            for ev in rx.try_iter() {
                                deliver(&ev);
                            }
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => {
                        for ev in rx.try_iter() {
                            deliver(&ev);
                        }
                        break;
                    }
                    recv(tick) -> _ => {
                        if source.advancing() {
                            deliver(&PlayerEvent::Progress(source.progress()));
                        }
                    }
                }
                // Older queued events go first.
                if rx.is_empty() {
                    settle();
                }
            }
            settle();
            tracing::debug!(player = %player_id, "event pump stopped");
        })
        .context("spawn event pump")?;

    Ok((
        Notifier {
            tx,
            wake: wake_tx,
            deferred,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventPump {
            stop: Some(stop_tx),
            join: Some(join),
        },
    ))
}
