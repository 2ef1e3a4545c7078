// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Stream-ordered execution for non-host platforms.

use std::fmt;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{Result, XcallError};

/// Work item executed in stream order.
pub type StreamWork = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Receives failures whose [`StreamEvent`] was dropped without waiting.
pub type UnclaimedSink = Box<dyn FnOnce(XcallError) + Send + 'static>;

enum SlotState {
    Waiting,
    Done(Result<()>),
    Abandoned,
    Claimed,
}

struct EventSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
    unclaimed: Mutex<Option<UnclaimedSink>>,
}

impl EventSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hand_off(&self, err: XcallError) {
        let sink = self
            .unclaimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sink) = sink {
            sink(err);
        }
    }
}

/// Completion of one enqueued work item.
///
/// Waiting yields that item's own outcome. If the event is dropped unwaited,
/// a failure goes to the sink given at construction instead.
pub struct StreamEvent {
    slot: Arc<EventSlot>,
}

/// Producer half of a [`StreamEvent`], held by whoever runs the work.
pub struct EventSignal {
    slot: Option<Arc<EventSlot>>,
}

impl StreamEvent {
    pub fn channel(unclaimed: UnclaimedSink) -> (EventSignal, StreamEvent) {
        let slot = Arc::new(EventSlot {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
            unclaimed: Mutex::new(Some(unclaimed)),
        });
        (
            EventSignal {
                slot: Some(Arc::clone(&slot)),
            },
            StreamEvent { slot },
        )
    }

    /// Block until the work item has run.
    pub fn wait(self) -> Result<()> {
        let mut state = self.slot.lock();
        while matches!(*state, SlotState::Waiting) {
            state = self
                .slot
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let previous = std::mem::replace(&mut *state, SlotState::Claimed);
        match previous {
            SlotState::Done(outcome) => outcome,
            _ => Err(XcallError::Internal("stream event already consumed".into())),
        }
    }
}

impl Drop for StreamEvent {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        let previous = std::mem::replace(&mut *state, SlotState::Abandoned);
        match previous {
            SlotState::Done(Err(err)) => {
                drop(state);
                self.slot.hand_off(err);
            }
            SlotState::Claimed => *state = SlotState::Claimed,
            _ => {}
        }
    }
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEvent").finish_non_exhaustive()
    }
}

impl EventSignal {
    /// Deliver the outcome of the work item.
    pub fn complete(mut self, outcome: Result<()>) {
        if let Some(slot) = self.slot.take() {
            deliver(&slot, outcome);
        }
    }

    /// Withdraw work that was never accepted; the event reports nothing.
    pub fn cancel(mut self) {
        self.slot.take();
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            deliver(
                &slot,
                Err(XcallError::Internal(
                    "stream work was dropped before it ran".into(),
                )),
            );
        }
    }
}

fn deliver(slot: &EventSlot, outcome: Result<()>) {
    let mut state = slot.lock();
    if matches!(*state, SlotState::Abandoned) {
        drop(state);
        if let Err(err) = outcome {
            slot.hand_off(err);
        }
        return;
    }
    *state = SlotState::Done(outcome);
    slot.ready.notify_all();
}

/// An ordered execution queue, such as an accelerator stream.
///
/// Enqueued work runs in submission order.
pub trait Stream: Send + Sync {
    /// Opaque platform handle forwarded to native stream handlers.
    fn raw_handle(&self) -> *mut c_void;

    fn enqueue(&self, work: StreamWork) -> Result<StreamEvent>;

    /// Block until all enqueued work has run. Returns the first failure
    /// whose event was dropped unwaited since the previous synchronization.
    fn synchronize(&self) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    pending: usize,
    first_error: Option<XcallError>,
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
}

struct Job {
    work: StreamWork,
    signal: EventSignal,
}

/// Host-emulated stream backed by one worker thread.
pub struct InOrderStream {
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InOrderStream {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("mind-xcall-stream".into())
            .spawn(move || {
                for Job { work, signal } in receiver {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|_| {
                        Err(XcallError::Internal("stream work panicked".into()))
                    });
                    if let Err(err) = &outcome {
                        tracing::warn!(error = %err, "stream work failed");
                    }
                    signal.complete(outcome);
                    let mut state = worker_shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    state.pending -= 1;
                    if state.pending == 0 {
                        worker_shared.idle.notify_all();
                    }
                }
            })
            .ok();
        Self {
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Number of enqueued items that have not finished.
    pub fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
    }
}

impl Default for InOrderStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for InOrderStream {
    fn raw_handle(&self) -> *mut c_void {
        Arc::as_ptr(&self.shared) as *mut c_void
    }

    fn enqueue(&self, work: StreamWork) -> Result<StreamEvent> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(XcallError::Internal("stream worker is not running".into()));
        };
        let shared = Arc::clone(&self.shared);
        let (signal, event) = StreamEvent::channel(Box::new(move |err| {
            shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .first_error
                .get_or_insert(err);
        }));
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending += 1;
        if let Err(mpsc::SendError(job)) = sender.send(Job { work, signal }) {
            job.signal.cancel();
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending -= 1;
            return Err(XcallError::Internal("stream worker has exited".into()));
        }
        Ok(event)
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.pending > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for InOrderStream {
    fn drop(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn work_runs_in_order() {
        let stream = InOrderStream::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            stream
                .enqueue(Box::new(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn unwaited_error_surfaces_on_synchronize() {
        let stream = InOrderStream::new();
        let ran = Arc::new(AtomicUsize::new(0));
        drop(
            stream
                .enqueue(Box::new(|| Err(XcallError::Internal("boom".into()))))
                .unwrap(),
        );
        let counter = Arc::clone(&ran);
        stream
            .enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert_eq!(
            stream.synchronize(),
            Err(XcallError::Internal("boom".into()))
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        stream.synchronize().unwrap();
    }

    #[test]
    fn events_report_only_their_own_outcome() {
        let stream = InOrderStream::new();
        let failed = stream
            .enqueue(Box::new(|| Err(XcallError::Internal("first".into()))))
            .unwrap();
        let ok = stream.enqueue(Box::new(|| Ok(()))).unwrap();
        ok.wait().unwrap();
        assert_eq!(failed.wait(), Err(XcallError::Internal("first".into())));
        stream.synchronize().unwrap();
    }
}
