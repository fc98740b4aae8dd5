// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-device worker thread.
//!
//! Every kick handler and every piece of deferred control work of a device runs on one thread,
//! in FIFO order. Work items are shared objects that can be queued any number of times: queuing
//! an item that is still pending only bumps its sequence number, and flushing an item waits
//! until a run that started after the flush call's snapshot has finished.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

use crate::logger::{IncMetric, VhostDeviceMetrics};
use crate::utils::{lock, wait};

// Epoll token of the wake eventfd. Kick tokens start after it.
const WAKE_TOKEN: u64 = 0;
const EVENT_BUFFER_SIZE: usize = 16;

/// Errors of the worker thread.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum WorkerError {
    /// Failed to spawn the worker thread: {0}
    Spawn(io::Error),
    /// Failed to create the wake eventfd: {0}
    EventFd(io::Error),
    /// Failed to set up epoll: {0}
    Epoll(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkState {
    Idle,
    Queued,
    Running,
}

#[derive(Debug)]
struct WorkSeq {
    state: WorkState,
    queue_seq: u32,
    done_seq: u32,
    flushing: u32,
}

/// A unit of work for the worker thread.
pub struct VhostWork {
    func: Box<dyn Fn() + Send + Sync>,
    seq: Mutex<WorkSeq>,
    done: Condvar,
}

impl Debug for VhostWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VhostWork")
            .field("seq", &*lock(&self.seq))
            .finish_non_exhaustive()
    }
}

impl VhostWork {
    /// Wraps `func` in a work item.
    pub fn new(func: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(VhostWork {
            func: Box::new(func),
            seq: Mutex::new(WorkSeq {
                state: WorkState::Idle,
                queue_seq: 0,
                done_seq: 0,
                flushing: 0,
            }),
            done: Condvar::new(),
        })
    }

    // Returns whether the item must be linked into the queue.
    fn mark_queued(&self) -> bool {
        let mut seq = lock(&self.seq);
        seq.queue_seq = seq.queue_seq.wrapping_add(1);
        if seq.state == WorkState::Queued {
            return false;
        }
        seq.state = WorkState::Queued;
        true
    }

    fn run(&self) {
        let seq = {
            let mut seq = lock(&self.seq);
            seq.state = WorkState::Running;
            seq.queue_seq
        };

        (self.func)();

        let mut state = lock(&self.seq);
        state.done_seq = seq;
        if state.state == WorkState::Running {
            state.state = WorkState::Idle;
        }
        if state.flushing > 0 {
            self.done.notify_all();
        }
    }

    /// Blocks until every run requested before this call has completed.
    ///
    /// Returns immediately if the item is neither queued nor running.
    pub fn flush(&self) {
        let mut state = lock(&self.seq);
        let seq = state.queue_seq;
        state.flushing += 1;
        // Serial-number comparison, wrap safe.
        while state.done_seq.wrapping_sub(seq) >= 1 << 31 {
            state = wait(&self.done, state);
        }
        state.flushing -= 1;
    }
}

struct PollEntry {
    evt: EventFd,
    work: Arc<VhostWork>,
}

struct WorkerShared {
    name: String,
    queue: Mutex<VecDeque<Arc<VhostWork>>>,
    wake: EventFd,
    epoll: Epoll,
    // Lock order: `polls`, then `queue`, then a work item's `seq`.
    polls: Mutex<BTreeMap<u64, PollEntry>>,
    next_token: AtomicU64,
    stop: AtomicBool,
    metrics: Arc<VhostDeviceMetrics>,
}

impl WorkerShared {
    // A stopped worker never links: the item stays idle and can be queued elsewhere.
    fn queue(&self, work: &Arc<VhostWork>) {
        let mut queue = lock(&self.queue);
        if self.stop.load(Ordering::Acquire) {
            debug!("{}: dropping work queued after stop", self.name);
            return;
        }
        if !work.mark_queued() {
            return;
        }
        queue.push_back(Arc::clone(work));
        drop(queue);
        self.wake();
    }

    fn wake(&self) {
        if let Err(err) = self.wake.write(1) {
            error!("{}: failed to wake worker: {err}", self.name);
            self.metrics.worker_fails.inc();
        }
    }

    fn dequeue(&self) -> Option<Arc<VhostWork>> {
        lock(&self.queue).pop_front()
    }

    fn run(&self) {
        let mut events = vec![EpollEvent::default(); EVENT_BUFFER_SIZE];
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if let Some(work) = self.dequeue() {
                work.run();
                self.metrics.work_count.inc();
                continue;
            }

            let ready = match self.epoll.wait(-1, &mut events) {
                Ok(ready) => ready,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("{}: epoll wait failed: {err}", self.name);
                    self.metrics.worker_fails.inc();
                    continue;
                }
            };
            for event in &events[..ready] {
                self.handle_event(event.data());
            }
        }
        debug!("{}: worker stopped", self.name);
    }

    fn handle_event(&self, token: u64) {
        if token == WAKE_TOKEN {
            // Nonblocking: a concurrent wake may have drained it already.
            let _ = self.wake.read();
            return;
        }
        let polls = lock(&self.polls);
        let Some(entry) = polls.get(&token) else {
            // Stopped between the wakeup and now.
            return;
        };
        match entry.evt.read() {
            Ok(_) => {
                self.metrics.kick_count.inc();
                self.queue(&entry.work);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!("{}: failed to read kick eventfd: {err}", self.name);
                self.metrics.worker_fails.inc();
            }
        }
    }
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle(Arc<WorkerShared>);

impl Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerHandle").field(&self.0.name).finish()
    }
}

impl WorkerHandle {
    /// Queues `work` unless it is already pending or the worker has stopped.
    pub fn queue(&self, work: &Arc<VhostWork>) {
        self.0.queue(work);
    }

    /// Queues `work` every time `evt` is signalled. Returns a token for
    /// [`WorkerHandle::poll_stop`].
    pub fn poll_start(&self, evt: &EventFd, work: &Arc<VhostWork>) -> Result<u64, WorkerError> {
        let evt = evt.try_clone().map_err(WorkerError::EventFd)?;
        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed);
        let mut polls = lock(&self.0.polls);
        self.0
            .epoll
            .ctl(
                ControlOperation::Add,
                evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, token),
            )
            .map_err(WorkerError::Epoll)?;
        polls.insert(
            token,
            PollEntry {
                evt,
                work: Arc::clone(work),
            },
        );
        Ok(token)
    }

    /// Stops polling the eventfd registered under `token`.
    pub fn poll_stop(&self, token: u64) {
        let mut polls = lock(&self.0.polls);
        let Some(entry) = polls.remove(&token) else {
            return;
        };
        if let Err(err) = self.0.epoll.ctl(
            ControlOperation::Delete,
            entry.evt.as_raw_fd(),
            EpollEvent::default(),
        ) {
            debug!("{}: failed to remove kick eventfd: {err}", self.0.name);
        }
    }
}

/// The worker thread of a device. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker thread named `name`.
    pub fn spawn(name: String, metrics: Arc<VhostDeviceMetrics>) -> Result<Self, WorkerError> {
        let wake = EventFd::new(EFD_NONBLOCK).map_err(WorkerError::EventFd)?;
        let epoll = Epoll::new().map_err(WorkerError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                wake.as_raw_fd(),
                EpollEvent::new(EventSet::IN, WAKE_TOKEN),
            )
            .map_err(WorkerError::Epoll)?;

        let shared = Arc::new(WorkerShared {
            name: name.clone(),
            queue: Mutex::new(VecDeque::new()),
            wake,
            epoll,
            polls: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(WAKE_TOKEN + 1),
            stop: AtomicBool::new(false),
            metrics,
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || thread_shared.run())
            .map_err(WorkerError::Spawn)?;

        Ok(Worker {
            handle: WorkerHandle(shared),
            thread: Some(thread),
        })
    }

    /// Handle for queuing work.
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Stops the thread once the work it is running returns, and joins it. Work still queued is
    /// not run.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // Set under the queue lock so no `queue` call can link after the drain below.
        {
            let _queue = lock(&self.handle.0.queue);
            self.handle.0.stop.store(true, Ordering::Release);
        }
        self.handle.0.wake();
        if thread.join().is_err() {
            error!("{}: worker thread panicked", self.handle.0.name);
        }
        // Queued items will never run, let them be queued again.
        for work in lock(&self.handle.0.queue).drain(..) {
            let mut seq = lock(&work.seq);
            seq.state = WorkState::Idle;
            seq.done_seq = seq.queue_seq;
            work.done.notify_all();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join();
    }
}

/// Adapter running a work item whenever an eventfd is signalled.
#[derive(Debug)]
pub struct VhostPoll {
    work: Arc<VhostWork>,
    token: Mutex<Option<(WorkerHandle, u64)>>,
}

impl VhostPoll {
    /// Creates a poll for `work`. It does nothing until started.
    pub fn new(work: Arc<VhostWork>) -> Self {
        VhostPoll {
            work,
            token: Mutex::new(None),
        }
    }

    /// Starts polling `evt` on `worker`, replacing any previous registration.
    pub fn start(&self, worker: &WorkerHandle, evt: &EventFd) -> Result<(), WorkerError> {
        let mut token = lock(&self.token);
        if let Some((old_worker, old)) = token.take() {
            old_worker.poll_stop(old);
        }
        *token = Some((worker.clone(), worker.poll_start(evt, &self.work)?));
        Ok(())
    }

    /// Stops polling. The work item may still be queued or running.
    pub fn stop(&self) {
        if let Some((worker, token)) = lock(&self.token).take() {
            worker.poll_stop(token);
        }
    }

    /// Whether an eventfd is being polled.
    pub fn is_started(&self) -> bool {
        lock(&self.token).is_some()
    }

    /// Queues the work item on `worker`.
    pub fn queue(&self, worker: &WorkerHandle) {
        worker.queue(&self.work);
    }

    /// Waits for the runs of the work item requested so far.
    pub fn flush(&self) {
        self.work.flush();
    }

    /// The polled work item.
    pub fn work(&self) -> &Arc<VhostWork> {
        &self.work
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn worker() -> Worker {
        let metrics = Arc::new(VhostDeviceMetrics::default());
        Worker::spawn("vhost-test".to_string(), metrics).unwrap()
    }

    fn wait_running(work: &VhostWork) {
        while lock(&work.seq).state != WorkState::Running {
            thread::yield_now();
        }
    }

    #[test]
    fn test_flush_never_queued() {
        let work = VhostWork::new(|| {});
        work.flush();
    }

    #[test]
    fn test_idempotent_enqueue() {
        let worker = worker();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Barrier::new(2));

        // Park the worker on a blocker so `work` stays queued.
        let blocker_gate = Arc::clone(&gate);
        let blocker = VhostWork::new(move || {
            blocker_gate.wait();
        });
        let counter = Arc::clone(&runs);
        let work = VhostWork::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let flusher = |flushing: u32| {
            let item = Arc::clone(&work);
            let count = Arc::clone(&runs);
            let waiter = thread::spawn(move || {
                item.flush();
                count.load(Ordering::SeqCst)
            });
            while lock(&work.seq).flushing != flushing {
                thread::yield_now();
            }
            waiter
        };

        worker.handle().queue(&blocker);
        wait_running(&blocker);
        worker.handle().queue(&work);
        let first_seq = lock(&work.seq).queue_seq;
        let first = flusher(1);
        worker.handle().queue(&work);
        let second_seq = lock(&work.seq).queue_seq;
        let second = flusher(2);
        assert_eq!(second_seq, first_seq + 1);
        assert_eq!(lock(&worker.handle().0.queue).len(), 1);

        gate.wait();
        assert_eq!(first.join().unwrap(), 1);
        assert_eq!(second.join().unwrap(), 1);
        blocker.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&work.seq).done_seq, second_seq);
    }

    #[test]
    fn test_fifo_order() {
        let worker = worker();
        let order = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<_> = (0..4)
            .map(|i| {
                let order = Arc::clone(&order);
                VhostWork::new(move || lock(&order).push(i))
            })
            .collect();
        for work in &items {
            worker.handle().queue(work);
        }
        for work in &items {
            work.flush();
        }
        assert_eq!(*lock(&order), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_requeue_while_running() {
        let worker = worker();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Barrier::new(2));
        let counter = Arc::clone(&runs);
        let work_gate = Arc::clone(&gate);
        let work = VhostWork::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                work_gate.wait();
            }
        });

        worker.handle().queue(&work);
        wait_running(&work);
        // Queuing a running item schedules another run.
        worker.handle().queue(&work);
        gate.wait();
        work.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_poll_eventfd() {
        let worker = worker();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let poll = VhostPoll::new(VhostWork::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let kick = EventFd::new(EFD_NONBLOCK).unwrap();

        poll.start(worker.handle(), &kick).unwrap();
        assert!(poll.is_started());
        kick.write(1).unwrap();
        while runs.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        poll.flush();

        poll.stop();
        assert!(!poll.is_started());
        kick.write(1).unwrap();
        thread::sleep(Duration::from_millis(20));
        poll.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_across_seq_wrap() {
        let worker = worker();
        let work = VhostWork::new(|| {});
        {
            let mut seq = lock(&work.seq);
            seq.queue_seq = u32::MAX;
            seq.done_seq = u32::MAX;
        }
        worker.handle().queue(&work);
        work.flush();
        assert_eq!(lock(&work.seq).done_seq, 0);
    }

    #[test]
    fn test_stop_releases_flushers() {
        let worker = worker();
        let gate = Arc::new(Barrier::new(2));
        let blocker_gate = Arc::clone(&gate);
        let blocker = VhostWork::new(move || {
            blocker_gate.wait();
        });
        let pending = VhostWork::new(|| {});
        worker.handle().queue(&blocker);
        wait_running(&blocker);
        worker.handle().queue(&pending);

        let stopper = thread::spawn(move || worker.stop());
        thread::sleep(Duration::from_millis(20));
        gate.wait();
        stopper.join().unwrap();
        pending.flush();
    }

    #[test]
    fn test_queue_on_stopped_worker() {
        let first = worker();
        let stale = first.handle().clone();
        first.stop();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let work = VhostWork::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        stale.queue(&work);
        assert_eq!(lock(&work.seq).state, WorkState::Idle);
        assert!(lock(&stale.0.queue).is_empty());
        // Nothing pending: returns at once.
        work.flush();

        let second = worker();
        second.handle().queue(&work);
        work.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
