//! Software device that executes the CPU kernel mirrors.
//!
//! Buffers live in host memory and every operation behaves like the wgpu
//! backend at the handle level, so the resource and fallback logic above it
//! can be exercised without a GPU. Faults are injected through [`FaultPlan`].

use std::collections::HashMap;
use std::task::Poll;

use parking_lot::Mutex;

use crate::backend::{BufferDesc, BufferId, BufferUsage, Dispatch, PipelineId, ReadFuture};
use crate::{kernels, layout, BufferView, ComputeBackend, ComputeError, Kernel};

/// Default device buffer limit, matching `wgpu::Limits::default().max_buffer_size`.
pub const MOCK_MAX_BUFFER_SIZE: u64 = 256 << 20;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FaultPlan {
    /// The next N dispatches fail with a device error.
    pub fail_dispatches: u32,
    /// The next N reads return buffers filled with NaN.
    pub corrupt_reads: u32,
    /// Pipelines with a larger workgroup size fail to build.
    pub max_workgroup_size: Option<u32>,
    /// `recover()` fails while set.
    pub refuse_recovery: bool,
    /// Overrides the maximum buffer size.
    pub max_buffer_size: Option<u64>,
    /// Every read stays pending for this many polls before it completes.
    pub read_delay_polls: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockStats {
    pub buffers_created: u64,
    pub buffers_live: usize,
    pub writes: u64,
    pub bytes_written: u64,
    pub pipelines_created: u64,
    pub dispatches: u64,
    pub reads: u64,
}

struct MockBuffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    buffers: HashMap<u64, MockBuffer>,
    pipelines: HashMap<u64, (Kernel, u32)>,
    next_id: u64,
    epoch: u64,
    lost: bool,
    unavailable: bool,
    faults: FaultPlan,
    stats: MockStats,
}

#[derive(Default)]
pub struct MockCpu {
    state: Mutex<MockState>,
}

impl MockCpu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that reports itself unavailable and refuses all work.
    #[must_use]
    pub fn unavailable() -> Self {
        let cpu = Self::default();
        cpu.state.lock().unavailable = true;
        cpu
    }

    pub fn inject(&self, f: impl FnOnce(&mut FaultPlan)) {
        f(&mut self.state.lock().faults);
    }

    /// Simulates a device loss: every handle becomes invalid until `recover`.
    pub fn lose_device(&self) {
        let mut state = self.state.lock();
        state.lost = true;
        state.buffers.clear();
        state.pipelines.clear();
    }

    #[must_use]
    pub fn stats(&self) -> MockStats {
        let state = self.state.lock();
        MockStats {
            buffers_live: state.buffers.len(),
            ..state.stats
        }
    }

    fn read_now(&self, id: BufferId, size: u64) -> Result<Vec<u8>, ComputeError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let mut data = state
            .buffers
            .get(&id.0)
            .ok_or(ComputeError::UnknownHandle(id.0))?
            .data
            .get(..size as usize)
            .ok_or(ComputeError::ShapeMismatch("read past the end of buffer"))?
            .to_vec();
        if state.faults.corrupt_reads > 0 {
            state.faults.corrupt_reads -= 1;
            for chunk in data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&f32::NAN.to_ne_bytes());
            }
        }
        state.stats.reads += 1;
        Ok(data)
    }
}

impl MockState {
    fn check_alive(&self) -> Result<(), ComputeError> {
        if self.unavailable {
            return Err(ComputeError::BackendUnavailable);
        }
        if self.lost {
            return Err(ComputeError::DeviceLost);
        }
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn max_buffer_size(&self) -> u64 {
        self.faults.max_buffer_size.unwrap_or(MOCK_MAX_BUFFER_SIZE)
    }
}

impl ComputeBackend for MockCpu {
    fn name(&self) -> &'static str {
        "MockCpu"
    }

    fn is_available(&self) -> bool {
        self.state.lock().check_alive().is_ok()
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    fn recover(&self) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        if state.unavailable || state.faults.refuse_recovery {
            return Err(ComputeError::BackendUnavailable);
        }
        if state.lost {
            state.lost = false;
            state.epoch += 1;
            tracing::info!(epoch = state.epoch, "MockCpu device re-created");
        }
        Ok(())
    }

    fn max_buffer_size(&self) -> u64 {
        self.state.lock().max_buffer_size()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, ComputeError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let limit = state.max_buffer_size();
        if desc.size > limit {
            return Err(ComputeError::AllocationOverflow {
                label: desc.label.clone(),
                requested: desc.size,
                limit,
            });
        }
        let id = state.alloc_id();
        state.buffers.insert(
            id,
            MockBuffer {
                usage: desc.usage,
                data: vec![0; desc.size as usize],
            },
        );
        state.stats.buffers_created += 1;
        Ok(BufferId(id))
    }

    fn release_buffer(&self, id: BufferId) {
        self.state.lock().buffers.remove(&id.0);
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        let buffer = state
            .buffers
            .get_mut(&id.0)
            .ok_or(ComputeError::UnknownHandle(id.0))?;
        if buffer.usage == BufferUsage::Staging {
            return Err(ComputeError::Device(
                "write to a staging buffer".to_string(),
            ));
        }
        let start = offset as usize;
        let dst = buffer
            .data
            .get_mut(start..start + data.len())
            .ok_or(ComputeError::ShapeMismatch("write past the end of buffer"))?;
        dst.copy_from_slice(data);
        state.stats.writes += 1;
        state.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn create_pipeline(
        &self,
        kernel: Kernel,
        workgroup_size: u32,
    ) -> Result<PipelineId, ComputeError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if workgroup_size == 0 {
            return Err(ComputeError::PipelineBuild {
                kernel,
                message: "workgroup size must be non-zero".to_string(),
            });
        }
        if let Some(max) = state.faults.max_workgroup_size {
            if workgroup_size > max {
                return Err(ComputeError::PipelineBuild {
                    kernel,
                    message: format!("workgroup size {workgroup_size} exceeds limit {max}"),
                });
            }
        }
        let id = state.alloc_id();
        state.pipelines.insert(id, (kernel, workgroup_size));
        state.stats.pipelines_created += 1;
        Ok(PipelineId(id))
    }

    fn release_pipeline(&self, id: PipelineId) {
        self.state.lock().pipelines.remove(&id.0);
    }

    fn dispatch(&self, dispatch: &Dispatch<'_>) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        if state.faults.fail_dispatches > 0 {
            state.faults.fail_dispatches -= 1;
            return Err(ComputeError::Device("injected dispatch failure".to_string()));
        }
        let (kernel, _workgroup_size) = *state
            .pipelines
            .get(&dispatch.pipeline.0)
            .ok_or(ComputeError::UnknownHandle(dispatch.pipeline.0))?;
        if dispatch.bindings.len() != kernel.binding_count() as usize {
            return Err(ComputeError::ShapeMismatch(
                "Binding count does not match kernel layout",
            ));
        }

        let mut binds = Vec::with_capacity(dispatch.bindings.len());
        for id in dispatch.bindings {
            let buffer = state
                .buffers
                .get(&id.0)
                .ok_or(ComputeError::UnknownHandle(id.0))?;
            let len = buffer.data.len();
            binds.push(BufferView::new(buffer.data.clone().into(), vec![len], 1));
        }
        for buffer_view in &binds {
            buffer_view.validate()?;
        }

        let outputs = match kernel {
            Kernel::CastRays => kernels::handle_cast_rays(&binds)?,
            Kernel::Forward => kernels::handle_forward(&binds)?,
        };
        let out_id = dispatch.bindings[layout::output_binding(&kernel) as usize];
        let out = state
            .buffers
            .get_mut(&out_id.0)
            .ok_or(ComputeError::UnknownHandle(out_id.0))?;
        for bytes in &outputs {
            out.data
                .get_mut(..bytes.len())
                .ok_or(ComputeError::ShapeMismatch("kernel output larger than bound buffer"))?
                .copy_from_slice(bytes);
        }

        if let Some(readback) = dispatch.readback {
            let size = readback.size as usize;
            let src = state
                .buffers
                .get(&readback.source.0)
                .and_then(|b| b.data.get(..size))
                .map(<[u8]>::to_vec)
                .ok_or(ComputeError::UnknownHandle(readback.source.0))?;
            let staging = state
                .buffers
                .get_mut(&readback.staging.0)
                .ok_or(ComputeError::UnknownHandle(readback.staging.0))?;
            staging
                .data
                .get_mut(..size)
                .ok_or(ComputeError::ShapeMismatch("readback larger than staging buffer"))?
                .copy_from_slice(&src);
        }
        state.stats.dispatches += 1;
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, size: u64) -> ReadFuture<'_> {
        let mut delay = self.state.lock().faults.read_delay_polls;
        Box::pin(std::future::poll_fn(move |cx| {
            if delay > 0 {
                delay -= 1;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(self.read_now(id, size))
        }))
    }
}
