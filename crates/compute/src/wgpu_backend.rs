//! GPU implementation of [`ComputeBackend`] built on [`wgpu`].
//!
//! Buffers and pipelines are kept in per-device tables keyed by handle. When
//! the device is lost every table is dropped and [`ComputeBackend::recover`]
//! requests a fresh device, bumping the epoch so callers rebuild their
//! resources.
//!
//! Readbacks never block the calling thread: the map request is driven with
//! non-blocking device polls and the read future yields between them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::task::Poll;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{BufferDesc, BufferId, BufferUsage, Dispatch, PipelineId, ReadFuture};
use crate::layout::{binding_kind, BindingKind};
use crate::{shaders, ComputeBackend, ComputeError, Kernel};

struct GpuPipeline {
    kernel: Kernel,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

struct DeviceState {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    adapter_name: String,
    limits: wgpu::Limits,
    buffers: HashMap<u64, Arc<wgpu::Buffer>>,
    pipelines: HashMap<u64, GpuPipeline>,
    bind_groups: HashMap<(u64, Vec<u64>), wgpu::BindGroup>,
}

/// GPU-backed implementation of [`ComputeBackend`] built on `wgpu`.
pub struct WgpuBackend {
    timeout: Duration,
    state: Mutex<Option<DeviceState>>,
    lost: Arc<AtomicBool>,
    epoch: AtomicU64,
    next_id: AtomicU64,
}

impl WgpuBackend {
    /// Requests a high-performance adapter and device, giving up after
    /// `timeout`.
    pub fn request(timeout: Duration) -> Result<Self, ComputeError> {
        let lost = Arc::new(AtomicBool::new(false));
        let state = acquire(timeout, lost.clone())?;
        Ok(Self {
            timeout,
            state: Mutex::new(Some(state)),
            lost,
            epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn adapter_name(&self) -> String {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.adapter_name.clone())
            .unwrap_or_default()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut DeviceState) -> Result<T, ComputeError>,
    ) -> Result<T, ComputeError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(ComputeError::DeviceLost);
        }
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(ComputeError::DeviceLost)?;
        f(state)
    }
}

/// The acquisition thread that outlived its timeout, if any.
static ACQUISITION: Mutex<Option<JoinHandle<()>>> = parking_lot::const_mutex(None);

/// Runs `job` on its own thread and waits up to `timeout` for the result.
///
/// A job that times out keeps running and stays parked in `pending`. No new
/// job is started until it has finished, so a long outage costs at most one
/// stray thread.
fn run_bounded<T: Send + 'static>(
    pending: &Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
    job: impl FnOnce() -> T + Send + 'static,
) -> Result<T, ComputeError> {
    let mut pending = pending.lock();
    if let Some(handle) = pending.take() {
        if !handle.is_finished() {
            *pending = Some(handle);
            tracing::debug!("previous device acquisition still running");
            return Err(ComputeError::Busy);
        }
        let _ = handle.join();
    }

    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("wgpu-acquire".to_string())
        .spawn(move || {
            let _ = tx.send(job());
        })
        .map_err(|e| ComputeError::Device(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(value) => {
            let _ = handle.join();
            Ok(value)
        }
        Err(RecvTimeoutError::Timeout) => {
            *pending = Some(handle);
            Err(ComputeError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
            Err(ComputeError::BackendUnavailable)
        }
    }
}

fn acquire(timeout: Duration, lost: Arc<AtomicBool>) -> Result<DeviceState, ComputeError> {
    let (adapter_name, device, queue) = run_bounded(&ACQUISITION, timeout, || {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    force_fallback_adapter: false,
                    compatible_surface: None,
                })
                .await
                .ok_or(ComputeError::BackendUnavailable)?;
            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("perception"),
                        required_features: wgpu::Features::empty(),
                        required_limits: wgpu::Limits::default(),
                        memory_hints: Default::default(),
                    },
                    None,
                )
                .await
                .map_err(|e| ComputeError::Device(e.to_string()))?;
            Ok::<_, ComputeError>((adapter.get_info().name, device, queue))
        })
    })??;

    let lost_flag = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        lost_flag.store(true, Ordering::Release);
        tracing::error!(?reason, %message, "wgpu device lost");
    });
    device.on_uncaptured_error(Box::new(|err| {
        tracing::error!(%err, "uncaptured wgpu error");
    }));
    lost.store(false, Ordering::Release);

    let limits = device.limits();
    tracing::info!(adapter = %adapter_name, max_buffer = limits.max_buffer_size, "wgpu device acquired");
    Ok(DeviceState {
        device: Arc::new(device),
        queue,
        adapter_name,
        limits,
        buffers: HashMap::new(),
        pipelines: HashMap::new(),
        bind_groups: HashMap::new(),
    })
}

fn layout_entry(kernel: Kernel, binding: u32) -> wgpu::BindGroupLayoutEntry {
    let ty = match binding_kind(&kernel, binding) {
        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
        BindingKind::StorageRead => wgpu::BufferBindingType::Storage { read_only: true },
        BindingKind::StorageReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn is_available(&self) -> bool {
        !self.lost.load(Ordering::Acquire) && self.state.lock().is_some()
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn recover(&self) -> Result<(), ComputeError> {
        if self.is_available() {
            return Ok(());
        }
        *self.state.lock() = None;
        let state = acquire(self.timeout, self.lost.clone())?;
        *self.state.lock() = Some(state);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(epoch, "wgpu device re-created");
        Ok(())
    }

    fn max_buffer_size(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |s| {
            s.limits
                .max_buffer_size
                .min(u64::from(s.limits.max_storage_buffer_binding_size))
        })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, ComputeError> {
        let id = self.alloc_id();
        self.with_state(|state| {
            let limit = state.limits.max_buffer_size;
            if desc.size > limit {
                return Err(ComputeError::AllocationOverflow {
                    label: desc.label.clone(),
                    requested: desc.size,
                    limit,
                });
            }
            let usage = match desc.usage {
                BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                BufferUsage::Storage => {
                    wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC
                }
                BufferUsage::Staging => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            };
            let buffer = state.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size: desc.size,
                usage,
                mapped_at_creation: false,
            });
            state.buffers.insert(id, Arc::new(buffer));
            Ok(BufferId(id))
        })
    }

    fn release_buffer(&self, id: BufferId) {
        // Dropping the handle defers destruction until queued work finishes.
        if let Some(state) = self.state.lock().as_mut() {
            state.buffers.remove(&id.0);
            state.bind_groups.retain(|(_, ids), _| !ids.contains(&id.0));
        }
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ComputeError> {
        self.with_state(|state| {
            let buffer = state
                .buffers
                .get(&id.0)
                .ok_or(ComputeError::UnknownHandle(id.0))?;
            if offset + data.len() as u64 > buffer.size() {
                return Err(ComputeError::ShapeMismatch("write past the end of buffer"));
            }
            state.queue.write_buffer(buffer, offset, data);
            Ok(())
        })
    }

    fn create_pipeline(
        &self,
        kernel: Kernel,
        workgroup_size: u32,
    ) -> Result<PipelineId, ComputeError> {
        let id = self.alloc_id();
        self.with_state(|state| {
            let limits = &state.limits;
            if workgroup_size == 0
                || workgroup_size > limits.max_compute_invocations_per_workgroup
                || workgroup_size > limits.max_compute_workgroup_size_x
            {
                return Err(ComputeError::PipelineBuild {
                    kernel,
                    message: format!("workgroup size {workgroup_size} outside device limits"),
                });
            }

            let device = &state.device;
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let source = shaders::specialize(kernel, workgroup_size);
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.label()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            let entries: Vec<_> = (0..kernel.binding_count())
                .map(|b| layout_entry(kernel, b))
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(kernel.label()),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel.label()),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.label()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
            if let Some(err) = pollster::block_on(device.pop_error_scope()) {
                return Err(ComputeError::PipelineBuild {
                    kernel,
                    message: err.to_string(),
                });
            }
            state.pipelines.insert(
                id,
                GpuPipeline {
                    kernel,
                    pipeline,
                    layout,
                },
            );
            Ok(PipelineId(id))
        })
    }

    fn release_pipeline(&self, id: PipelineId) {
        if let Some(state) = self.state.lock().as_mut() {
            state.pipelines.remove(&id.0);
            state.bind_groups.retain(|(p, _), _| *p != id.0);
        }
    }

    fn dispatch(&self, dispatch: &Dispatch<'_>) -> Result<(), ComputeError> {
        self.with_state(|state| {
            let gpu = state
                .pipelines
                .get(&dispatch.pipeline.0)
                .ok_or(ComputeError::UnknownHandle(dispatch.pipeline.0))?;
            if dispatch.bindings.len() != gpu.kernel.binding_count() as usize {
                return Err(ComputeError::ShapeMismatch(
                    "Binding count does not match kernel layout",
                ));
            }

            let key = (
                dispatch.pipeline.0,
                dispatch.bindings.iter().map(|b| b.0).collect::<Vec<_>>(),
            );
            if !state.bind_groups.contains_key(&key) {
                let mut entries = Vec::with_capacity(dispatch.bindings.len());
                for (binding, id) in dispatch.bindings.iter().enumerate() {
                    let buffer = state
                        .buffers
                        .get(&id.0)
                        .ok_or(ComputeError::UnknownHandle(id.0))?;
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding as u32,
                        resource: buffer.as_entire_binding(),
                    });
                }
                let bind_group = state.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(gpu.kernel.label()),
                    layout: &gpu.layout,
                    entries: &entries,
                });
                state.bind_groups.insert(key.clone(), bind_group);
            }
            let bind_group = state
                .bind_groups
                .get(&key)
                .ok_or(ComputeError::UnknownHandle(dispatch.pipeline.0))?;

            state.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let mut encoder = state
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(gpu.kernel.label()),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(gpu.kernel.label()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&gpu.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                let [x, y, z] = dispatch.workgroups;
                pass.dispatch_workgroups(x, y, z);
            }
            if let Some(readback) = dispatch.readback {
                let source = state
                    .buffers
                    .get(&readback.source.0)
                    .ok_or(ComputeError::UnknownHandle(readback.source.0))?;
                let staging = state
                    .buffers
                    .get(&readback.staging.0)
                    .ok_or(ComputeError::UnknownHandle(readback.staging.0))?;
                encoder.copy_buffer_to_buffer(source, 0, staging, 0, readback.size);
            }
            state.queue.submit(Some(encoder.finish()));
            if let Some(err) = pollster::block_on(state.device.pop_error_scope()) {
                return Err(ComputeError::Device(err.to_string()));
            }
            Ok(())
        })
    }

    fn read_buffer(&self, id: BufferId, size: u64) -> ReadFuture<'_> {
        let handles = self.with_state(|state| {
            let buffer = state
                .buffers
                .get(&id.0)
                .cloned()
                .ok_or(ComputeError::UnknownHandle(id.0))?;
            Ok((state.device.clone(), buffer))
        });
        let lost = self.lost.clone();
        Box::pin(async move {
            let (device, buffer) = handles?;
            if size == 0 {
                return Ok(Vec::new());
            }
            let (tx, rx) = mpsc::channel();
            buffer.slice(..size).map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
            let mapped = {
                let lost = Arc::clone(&lost);
                std::future::poll_fn(move |cx| {
                    if lost.load(Ordering::Acquire) {
                        return Poll::Ready(Err(ComputeError::DeviceLost));
                    }
                    let _ = device.poll(wgpu::Maintain::Poll);
                    match rx.try_recv() {
                        Ok(Ok(())) => Poll::Ready(Ok(())),
                        Ok(Err(err)) => Poll::Ready(Err(ComputeError::Device(err.to_string()))),
                        Err(TryRecvError::Empty) => {
                            // the map callback only fires from a device poll
                            cx.waker().wake_by_ref();
                            Poll::Pending
                        }
                        Err(TryRecvError::Disconnected) => Poll::Ready(Err(ComputeError::DeviceLost)),
                    }
                })
            };
            mapped.await?;
            if lost.load(Ordering::Acquire) {
                buffer.unmap();
                return Err(ComputeError::DeviceLost);
            }
            let data = buffer.slice(..size).get_mapped_range().to_vec();
            buffer.unmap();
            Ok(data)
        })
    }
}
