// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Submission and fence tracking.
//!
//! Recorded command buffers accumulate in a "current call" until
//! [`SubmissionTracker::execute`] submits them as one batch with a fresh
//! fence and signal semaphore. Each call waits on the previous call's signal,
//! so calls run in program order on the GPU without the CPU blocking.
//!
//! Resources owned by a call are released only after its fence has been
//! observed signaled, either by [`SubmissionTracker::free_unused_memory`]
//! (non-blocking) or [`SubmissionTracker::wait_for`] (blocking).

use std::collections::VecDeque;
use std::fmt::Debug;

use log::{debug, trace, warn};

use crate::error::GalResult;

/// Monotonic identifier of a submitted call. The first call is 1.
pub type CallId = u64;

/// One batch handed to [`SyncDevice::submit`].
pub struct Submission<'a, D: SyncDevice + ?Sized> {
    pub command_buffers: &'a [D::CommandBuffer],
    pub wait_semaphores: &'a [D::Semaphore],
    pub signal_semaphore: D::Semaphore,
    pub fence: &'a D::Fence,
}

/// Host primitives needed to submit work and observe its completion.
pub trait SyncDevice {
    type Queue: Copy;
    type CommandBuffer: Copy + PartialEq + Debug;
    type CommandPool: Copy + Debug;
    type Fence;
    type Semaphore: Copy + PartialEq + Debug;
    /// Host object whose destruction must wait until the GPU is done with it.
    type Deferred;

    /// Allocate a primary command buffer from a transient pool and begin it.
    fn begin_one_shot(&mut self) -> GalResult<(Self::CommandBuffer, Self::CommandPool)>;
    fn end_command_buffer(&mut self, command_buffer: Self::CommandBuffer) -> GalResult<()>;
    fn free_command_buffer(&mut self, pool: Self::CommandPool, command_buffer: Self::CommandBuffer);

    fn create_fence(&mut self) -> GalResult<Self::Fence>;
    fn destroy_fence(&mut self, fence: Self::Fence);
    /// Non-blocking completion query.
    fn fence_signaled(&mut self, fence: &Self::Fence) -> GalResult<bool>;
    /// Block until `fence` signals. Bounded by the device's wait timeout.
    fn wait_fence(&mut self, fence: &Self::Fence) -> GalResult<()>;

    fn create_semaphore(&mut self) -> GalResult<Self::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);

    fn submit(&mut self, queue: Self::Queue, submission: &Submission<'_, Self>) -> GalResult<()>;
    fn release_deferred(&mut self, item: Self::Deferred);
    fn wait_idle(&mut self) -> GalResult<()>;
}

struct Recorded<D: SyncDevice> {
    buffer: D::CommandBuffer,
    pool: Option<D::CommandPool>,
}

struct PendingCall<D: SyncDevice> {
    commands: Vec<Recorded<D>>,
    deferred: Vec<D::Deferred>,
}

impl<D: SyncDevice> Default for PendingCall<D> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

/// A submitted batch awaiting retirement.
pub struct Call<D: SyncDevice> {
    id: CallId,
    commands: Vec<Recorded<D>>,
    fence: D::Fence,
    signal: D::Semaphore,
    waits: Vec<D::Semaphore>,
    deferred: Vec<D::Deferred>,
}

impl<D: SyncDevice> Call<D> {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn signal(&self) -> D::Semaphore {
        self.signal
    }

    /// Semaphores this call waited on. They are destroyed when it retires.
    pub fn waits(&self) -> &[D::Semaphore] {
        &self.waits
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

pub struct SubmissionTracker<D: SyncDevice> {
    device: D,
    current: PendingCall<D>,
    calls: VecDeque<Call<D>>,
    /// Signal of the most recent call, not yet consumed by a later call or
    /// handed out through `query_signal`.
    wait_semaphore: Option<D::Semaphore>,
    next_id: CallId,
    shut_down: bool,
}

impl<D: SyncDevice> SubmissionTracker<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            current: PendingCall::default(),
            calls: VecDeque::new(),
            wait_semaphore: None,
            next_id: 1,
            shut_down: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Start recording a one-shot command buffer that belongs to the current
    /// call. The caller ends it with [`end_record`](Self::end_record).
    pub fn begin_record(&mut self) -> GalResult<D::CommandBuffer> {
        let (buffer, pool) = self.device.begin_one_shot()?;
        self.add_command(buffer, Some(pool));
        Ok(buffer)
    }

    pub fn end_record(&mut self, buffer: D::CommandBuffer) -> GalResult<()> {
        self.device.end_command_buffer(buffer)
    }

    /// Drop a command buffer from the current call without submitting it,
    /// freeing it if the call owns its pool. Returns false if it is not part
    /// of the current call.
    pub fn abort_record(&mut self, buffer: D::CommandBuffer) -> bool {
        let Some(i) = self.current.commands.iter().position(|c| c.buffer == buffer) else {
            return false;
        };
        let recorded = self.current.commands.remove(i);
        if let Some(pool) = recorded.pool {
            self.device.free_command_buffer(pool, recorded.buffer);
        }
        debug!("Aborted command buffer {:?}", buffer);
        true
    }

    /// Append an already recorded command buffer. With a pool it is freed
    /// when the call retires; without one the caller keeps ownership.
    pub fn add_command(&mut self, buffer: D::CommandBuffer, pool: Option<D::CommandPool>) {
        self.current.commands.push(Recorded { buffer, pool });
    }

    /// Release `item` once the GPU can no longer be using it.
    pub fn defer_release(&mut self, item: D::Deferred) {
        if !self.current.commands.is_empty() {
            self.current.deferred.push(item);
        } else if let Some(last) = self.calls.back_mut() {
            // Calls complete in order, so the newest one covers everything.
            last.deferred.push(item);
        } else {
            self.device.release_deferred(item);
        }
    }

    pub fn execute(&mut self, queue: D::Queue) -> GalResult<CallId> {
        self.execute_with(queue, Vec::new())
    }

    /// Submit the current call. Besides the previous call's signal it also
    /// waits on `extra_waits`, which it takes ownership of.
    pub fn execute_with(
        &mut self,
        queue: D::Queue,
        extra_waits: Vec<D::Semaphore>,
    ) -> GalResult<CallId> {
        let signal = self.device.create_semaphore()?;
        let fence = match self.device.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                self.device.destroy_semaphore(signal);
                return Err(e);
            }
        };

        let previous = self.wait_semaphore.take();
        let mut waits = Vec::with_capacity(extra_waits.len() + 1);
        waits.extend(previous);
        waits.extend(extra_waits);

        let buffers: Vec<D::CommandBuffer> =
            self.current.commands.iter().map(|c| c.buffer).collect();

        let submitted = self.device.submit(
            queue,
            &Submission {
                command_buffers: &buffers,
                wait_semaphores: &waits,
                signal_semaphore: signal,
                fence: &fence,
            },
        );
        if let Err(e) = submitted {
            self.device.destroy_fence(fence);
            self.device.destroy_semaphore(signal);
            // The previous signal is still unconsumed; extra waits were ours.
            let mut waits = waits.into_iter();
            if previous.is_some() {
                self.wait_semaphore = waits.next();
            }
            for semaphore in waits {
                self.device.destroy_semaphore(semaphore);
            }
            return Err(e);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.wait_semaphore = Some(signal);

        let pending = std::mem::take(&mut self.current);
        debug!(
            "Call {} submitted: {} command buffers, {} waits",
            id,
            pending.commands.len(),
            waits.len()
        );
        self.calls.push_back(Call {
            id,
            commands: pending.commands,
            fence,
            signal,
            waits,
            deferred: pending.deferred,
        });
        Ok(id)
    }

    /// Retire every call whose fence has signaled. Never blocks.
    pub fn free_unused_memory(&mut self) -> GalResult<usize> {
        let mut freed = 0;
        let mut i = 0;
        while i < self.calls.len() {
            if self.device.fence_signaled(&self.calls[i].fence)? {
                if let Some(call) = self.calls.remove(i) {
                    self.retire(call);
                    freed += 1;
                }
            } else {
                i += 1;
            }
        }
        if freed > 0 {
            trace!("Retired {} calls, {} outstanding", freed, self.calls.len());
        }
        Ok(freed)
    }

    /// Hand the most recent call's signal to the caller, who then owns it.
    /// Returns `None` if it was already consumed.
    pub fn query_signal(&mut self) -> Option<D::Semaphore> {
        self.wait_semaphore.take()
    }

    /// Block until call `id` has completed, then retire it and any other
    /// completed calls.
    pub fn wait_for(&mut self, id: CallId) -> GalResult<()> {
        if let Some(call) = self.calls.iter().find(|c| c.id == id) {
            self.device.wait_fence(&call.fence)?;
        }
        self.free_unused_memory()?;
        Ok(())
    }

    pub fn is_retired(&self, id: CallId) -> bool {
        id < self.next_id && !self.calls.iter().any(|c| c.id == id)
    }

    pub fn last_submitted(&self) -> Option<CallId> {
        (self.next_id > 1).then(|| self.next_id - 1)
    }

    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }

    pub fn outstanding_calls(&self) -> impl Iterator<Item = &Call<D>> {
        self.calls.iter()
    }

    pub fn pending_commands(&self) -> usize {
        self.current.commands.len()
    }

    /// Wait for the device to go idle and release everything still tracked.
    pub fn shutdown(&mut self) -> GalResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.device.wait_idle()?;
        self.shut_down = true;

        while let Some(call) = self.calls.pop_front() {
            self.retire(call);
        }
        if let Some(semaphore) = self.wait_semaphore.take() {
            self.device.destroy_semaphore(semaphore);
        }
        let pending = std::mem::take(&mut self.current);
        for recorded in pending.commands {
            if let Some(pool) = recorded.pool {
                self.device.free_command_buffer(pool, recorded.buffer);
            }
        }
        for item in pending.deferred {
            self.device.release_deferred(item);
        }
        debug!("Submission tracker shut down after {} calls", self.next_id - 1);
        Ok(())
    }

    fn retire(&mut self, call: Call<D>) {
        trace!("Retiring call {}", call.id);
        for semaphore in call.waits {
            self.device.destroy_semaphore(semaphore);
        }
        self.device.destroy_fence(call.fence);
        for recorded in call.commands {
            if let Some(pool) = recorded.pool {
                self.device.free_command_buffer(pool, recorded.buffer);
            }
        }
        for item in call.deferred {
            self.device.release_deferred(item);
        }
    }
}

impl<D: SyncDevice> Drop for SubmissionTracker<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Submission tracker shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::{SoftwareDevice, SoftwareGarbage, SoftwareQueue};

    fn record(tracker: &mut SubmissionTracker<SoftwareDevice>) {
        let cb = tracker.begin_record().unwrap();
        tracker.end_record(cb).unwrap();
    }

    #[test]
    fn test_execute_chains_signals() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        for _ in 0..3 {
            record(&mut tracker);
            tracker.execute(SoftwareQueue).unwrap();
        }

        let calls: Vec<_> = tracker.outstanding_calls().collect();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].waits().is_empty());
        assert_eq!(calls[1].waits(), &[calls[0].signal()]);
        assert_eq!(calls[2].waits(), &[calls[1].signal()]);

        // Nothing has completed on the simulated GPU yet.
        assert_eq!(tracker.free_unused_memory().unwrap(), 0);
        assert_eq!(tracker.outstanding(), 3);

        tracker.device_mut().complete_all();
        assert_eq!(tracker.free_unused_memory().unwrap(), 3);
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.device().live_command_buffers(), 0);
    }

    #[test]
    fn test_free_unused_memory_is_partial() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        record(&mut tracker);
        let first = tracker.execute(SoftwareQueue).unwrap();
        record(&mut tracker);
        let second = tracker.execute(SoftwareQueue).unwrap();

        tracker.device_mut().complete_through(1);
        assert_eq!(tracker.free_unused_memory().unwrap(), 1);
        assert!(tracker.is_retired(first));
        assert!(!tracker.is_retired(second));
        assert_eq!(tracker.last_submitted(), Some(second));
    }

    #[test]
    fn test_query_signal_is_handed_out_once() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        record(&mut tracker);
        tracker.execute(SoftwareQueue).unwrap();
        let signal = tracker.outstanding_calls().next().unwrap().signal();

        assert_eq!(tracker.query_signal(), Some(signal));
        assert_eq!(tracker.query_signal(), None);

        // The next call no longer waits on the consumed signal.
        record(&mut tracker);
        tracker.execute(SoftwareQueue).unwrap();
        assert!(tracker.outstanding_calls().nth(1).unwrap().waits().is_empty());

        tracker.device_mut().destroy_semaphore(signal);
    }

    #[test]
    fn test_each_semaphore_destroyed_once() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        for _ in 0..4 {
            record(&mut tracker);
            tracker.execute(SoftwareQueue).unwrap();
        }
        tracker.device_mut().complete_all();
        tracker.free_unused_memory().unwrap();
        // Only the newest signal is still alive, held for the next call.
        assert_eq!(tracker.device().live_semaphores(), 1);

        tracker.shutdown().unwrap();
        assert_eq!(tracker.device().live_semaphores(), 0);
        assert_eq!(tracker.device().live_fences(), 0);
        assert_eq!(tracker.device().double_destroys(), 0);
    }

    #[test]
    fn test_wait_for_blocks_until_complete() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        record(&mut tracker);
        let id = tracker.execute(SoftwareQueue).unwrap();
        assert!(!tracker.is_retired(id));

        tracker.wait_for(id).unwrap();
        assert!(tracker.is_retired(id));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_deferred_release_waits_for_retirement() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());

        // Nothing in flight: released immediately.
        tracker.defer_release(SoftwareGarbage("idle"));
        assert_eq!(tracker.device().released(), &["idle"]);

        record(&mut tracker);
        tracker.defer_release(SoftwareGarbage("recorded"));
        tracker.execute(SoftwareQueue).unwrap();
        tracker.defer_release(SoftwareGarbage("in flight"));
        assert_eq!(tracker.device().released().len(), 1);

        tracker.device_mut().complete_all();
        tracker.free_unused_memory().unwrap();
        assert_eq!(tracker.device().released(), &["idle", "recorded", "in flight"]);
    }

    #[test]
    fn test_abort_record_drops_buffer() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        record(&mut tracker);
        let aborted = tracker.begin_record().unwrap();
        assert_eq!(tracker.pending_commands(), 2);

        assert!(tracker.abort_record(aborted));
        assert!(!tracker.abort_record(aborted));
        assert_eq!(tracker.pending_commands(), 1);
        assert_eq!(tracker.device().live_command_buffers(), 1);

        tracker.execute(SoftwareQueue).unwrap();
        let submitted = &tracker.device().submissions()[0];
        assert_eq!(submitted.command_buffers.len(), 1);
        assert!(!submitted.command_buffers.contains(&aborted));
    }

    #[test]
    fn test_extra_waits_are_owned_by_call() {
        let mut tracker = SubmissionTracker::new(SoftwareDevice::new());
        let acquire = tracker.device_mut().create_semaphore().unwrap();
        record(&mut tracker);
        tracker.execute_with(SoftwareQueue, vec![acquire]).unwrap();
        assert_eq!(tracker.outstanding_calls().next().unwrap().waits(), &[acquire]);

        tracker.device_mut().complete_all();
        tracker.free_unused_memory().unwrap();
        assert!(!tracker.device().is_semaphore_alive(acquire));
    }
}
