//! Cross-stream readiness tokens.
//!
//! A [`GpuEventSynchronizer`] is marked by the producer once a buffer is
//! ready and waited on by consumers. Host-side producers (and the emulated
//! accelerator) mark it directly; on CUDA it wraps an event recorded on the
//! producing stream.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaEvent, CudaStream};

#[derive(Default)]
struct EventState {
    marked: bool,
    #[cfg(feature = "cuda")]
    cuda_event: Option<CudaEvent>,
}

#[derive(Default)]
struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
}

/// Shared readiness token; clones refer to the same event.
#[derive(Clone, Default)]
pub struct GpuEventSynchronizer {
    inner: Arc<EventInner>,
}

impl std::fmt::Debug for GpuEventSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuEventSynchronizer")
            .field("marked", &self.inner.state.lock().marked)
            .finish()
    }
}

impl GpuEventSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the event from the host.
    pub fn mark_event(&self) {
        let mut state = self.inner.state.lock();
        state.marked = true;
        self.inner.cv.notify_all();
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        #[cfg(feature = "cuda")]
        if let Some(event) = &state.cuda_event {
            return event.is_complete();
        }
        state.marked
    }

    /// Blocks until the event has been marked and has completed.
    pub fn wait_for_event(&self) {
        let mut state = self.inner.state.lock();
        while !state.marked {
            self.inner.cv.wait(&mut state);
        }
        #[cfg(feature = "cuda")]
        if let Some(event) = &state.cuda_event {
            if let Err(e) = event.synchronize() {
                log::error!("❌ Event synchronization failed: {:?}", e);
            }
        }
    }

    /// Returns the event to the unmarked state for the next step.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.marked = false;
        #[cfg(feature = "cuda")]
        {
            state.cuda_event = None;
        }
    }

    /// Records the event on `stream`; consumers wait for the work enqueued
    /// so far.
    #[cfg(feature = "cuda")]
    pub fn mark_on_stream(&self, stream: &Arc<CudaStream>) -> Result<(), prism_core::PrismError> {
        let event = stream
            .record_event(None)
            .map_err(|e| prism_core::PrismError::gpu("record_event", format!("{:?}", e)))?;
        let mut state = self.inner.state.lock();
        state.cuda_event = Some(event);
        state.marked = true;
        self.inner.cv.notify_all();
        Ok(())
    }

    /// Makes `stream` wait for the event without blocking the host. Falls
    /// back to a host wait when the producer marked the event from the host.
    #[cfg(feature = "cuda")]
    pub fn enqueue_wait(&self, stream: &Arc<CudaStream>) -> Result<(), prism_core::PrismError> {
        let state = self.inner.state.lock();
        if let Some(event) = &state.cuda_event {
            return stream
                .wait(event)
                .map_err(|e| prism_core::PrismError::gpu("stream_wait_event", format!("{:?}", e)));
        }
        drop(state);
        self.wait_for_event();
        Ok(())
    }
}
