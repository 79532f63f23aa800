//! Outstanding requests and their retry schedule.

use crate::wire::{Command, Packet};
use bytes::Bytes;
use log::debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Callback of an asynchronous request, receives `None` if request expired or was cancelled.
pub type ReplyCallback = Box<dyn FnOnce(Option<Packet>) + Send>;

/// Handle of a pending request, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub(crate) u64);

/// Total time that request may wait for reply: `max(1, 2 * retries) * per_retry`.
pub fn total_timeout(retries: u32, per_retry: Duration) -> Duration {
    per_retry * (2 * retries).max(1)
}

/// Rendezvous point between a blocked caller and the reader thread.
#[derive(Default)]
pub(crate) struct SyncSlot {
    // `None` - still waiting, `Some(None)` - cancelled, `Some(Some(_))` - resolved
    state: Mutex<Option<Option<Packet>>>,
    cv: Condvar,
}

impl SyncSlot {
    pub(crate) fn complete(&self, reply: Option<Packet>) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(reply);
            self.cv.notify_all();
        }
    }

    /// Block until request completes or `timeout` elapsed.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Option<Packet>> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.is_none())
            .unwrap();
        state.take()
    }
}

pub(crate) struct AsyncState {
    raw: Bytes,
    retries_left: u32,
    per_retry: Duration,
    total: Duration,
    created: Instant,
    last_sent: Instant,
    callback: ReplyCallback,
}

pub(crate) enum Waiter {
    Sync(Arc<SyncSlot>),
    Async(AsyncState),
}

pub(crate) struct PendingRequest {
    pub(crate) handle: RequestHandle,
    pub(crate) cmd: Command,
    pub(crate) seq: u16,
    pub(crate) waiter: Waiter,
}

impl PendingRequest {
    pub(crate) fn new_sync(
        handle: RequestHandle,
        cmd: Command,
        seq: u16,
        slot: Arc<SyncSlot>,
    ) -> Self {
        Self {
            handle,
            cmd,
            seq,
            waiter: Waiter::Sync(slot),
        }
    }

    pub(crate) fn new_async(
        handle: RequestHandle,
        packet: &Packet,
        raw: Bytes,
        retries: u32,
        per_retry: Duration,
        callback: ReplyCallback,
    ) -> Self {
        let now = Instant::now();
        Self {
            handle,
            cmd: packet.cmd(),
            seq: packet.header.seq,
            waiter: Waiter::Async(AsyncState {
                raw,
                retries_left: retries,
                per_retry,
                total: total_timeout(retries, per_retry),
                created: now,
                last_sent: now,
                callback,
            }),
        }
    }

    #[inline(always)]
    fn is_match(&self, reply: &Packet) -> bool {
        self.cmd == reply.cmd() && self.seq == reply.header.seq_reply
    }

    /// Complete request. Asynchronous callback is returned instead of being called
    /// because callbacks run on the dispatch thread.
    pub(crate) fn complete(self, reply: Option<Packet>) -> Option<(ReplyCallback, Option<Packet>)> {
        match self.waiter {
            Waiter::Sync(slot) => {
                slot.complete(reply);
                None
            }
            Waiter::Async(state) => Some((state.callback, reply)),
        }
    }
}

/// Result of a retry schedule tick.
#[derive(Default)]
pub(crate) struct Tick {
    pub(crate) resend: Vec<Bytes>,
    pub(crate) expired: Vec<PendingRequest>,
}

/// Set of requests awaiting reply. Safe for concurrent insertion and removal.
#[derive(Default)]
pub(crate) struct PendingRequests {
    list: Mutex<Vec<PendingRequest>>,
}

impl PendingRequests {
    pub(crate) fn push(&self, req: PendingRequest) {
        self.list.lock().unwrap().push(req);
    }

    /// Remove and return the single request matched by `(cmd, seq == reply.seq_reply)`.
    pub(crate) fn take_match(&self, reply: &Packet) -> Option<PendingRequest> {
        let mut list = self.list.lock().unwrap();
        let pos = list.iter().position(|r| r.is_match(reply))?;
        Some(list.remove(pos))
    }

    pub(crate) fn take(&self, handle: RequestHandle) -> Option<PendingRequest> {
        let mut list = self.list.lock().unwrap();
        let pos = list.iter().position(|r| r.handle == handle)?;
        Some(list.remove(pos))
    }

    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        std::mem::take(&mut *self.list.lock().unwrap())
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    /// Advance retry schedule of asynchronous requests.
    /// Retry timer counts from the latest of last send and last channel activity,
    /// so retries are suppressed while other traffic proves the link alive.
    pub(crate) fn tick(&self, now: Instant, last_activity: Instant) -> Tick {
        let mut tick = Tick::default();
        let mut list = self.list.lock().unwrap();

        let mut i = 0;
        while i < list.len() {
            let Waiter::Async(ref mut state) = list[i].waiter else {
                i += 1;
                continue;
            };

            if now.duration_since(state.created) >= state.total {
                debug!(target: "engine", "async request {} expired", list[i].cmd);
                tick.expired.push(list.remove(i));
                continue;
            }

            let idle_since = state.last_sent.max(last_activity);
            if state.retries_left > 0 && now.duration_since(idle_since) >= state.per_retry {
                state.retries_left -= 1;
                state.last_sent = now;
                tick.resend.push(state.raw.clone());
            }
            i += 1;
        }

        tick
    }
}
