#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
//! # Compute
//!
//! Accelerator abstraction for the perception engine.
//!
//! The crate exposes a handle-based [`ComputeBackend`] trait with two
//! implementations: [`MockCpu`] (feature `mock`), a software device that runs
//! the CPU mirrors of the WGSL kernels and supports fault injection, and
//! [`WgpuBackend`] (feature `gpu`), which runs the real shaders through `wgpu`.
//! Device memory and pipelines are owned by a [`ResourceManager`], which grows
//! buffers on demand and rebuilds everything after a device loss.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod backend;
pub mod gpu_types;
pub mod kernels;
pub mod layout;
pub mod resources;
pub mod shaders;

#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use backend::{
    BufferDesc, BufferId, BufferUsage, ComputeBackend, Dispatch, PipelineId, ReadFuture, Readback,
};
#[cfg(feature = "mock")]
pub use backend::mock_cpu::{FaultPlan, MockCpu, MockStats};
pub use resources::{Ensured, PipelineHandle, ResourceManager, ResourceStats};
#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("buffer shape mismatch: {0}")]
    ShapeMismatch(&'static str),
    #[error("backend not available")]
    BackendUnavailable,
    #[error("allocation of {requested} bytes for `{label}` exceeds the device limit of {limit} bytes")]
    AllocationOverflow {
        label: String,
        requested: u64,
        limit: u64,
    },
    #[error("pipeline build failed for {kernel:?}: {message}")]
    PipelineBuild { kernel: Kernel, message: String },
    #[error("device error: {0}")]
    Device(String),
    #[error("device lost")]
    DeviceLost,
    #[error("device acquisition timed out after {0:?}")]
    Timeout(Duration),
    #[error("an accelerated operation is already in flight")]
    Busy,
    #[error("unknown resource handle {0}")]
    UnknownHandle(u64),
}

impl ComputeError {
    /// Errors after which every resource handle must be treated as stale.
    #[must_use]
    pub fn invalidates_resources(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::Device(_) | Self::UnknownHandle(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kernel {
    /// One invocation per (agent, ray) slot of the padded ray grid.
    CastRays,
    /// One invocation per agent of an architecture group.
    Forward,
}

impl Kernel {
    #[must_use]
    pub const fn binding_count(&self) -> u32 {
        layout::binding_count(self)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Kernel::CastRays => "cast_rays",
            Kernel::Forward => "forward",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BufferView {
    pub data: Arc<[u8]>,
    pub shape: Vec<usize>, // Number of elements per dimension
    pub element_size_in_bytes: usize,
}

impl BufferView {
    #[must_use]
    pub fn new(data: Arc<[u8]>, shape: Vec<usize>, element_size_in_bytes: usize) -> Self {
        Self {
            data,
            shape,
            element_size_in_bytes,
        }
    }

    /// Packs a slice of plain-old-data values into a one-dimensional view.
    #[must_use]
    pub fn from_pod<T: bytemuck::Pod>(values: &[T]) -> Self {
        Self::new(
            bytemuck::cast_slice(values).to_vec().into(),
            vec![values.len()],
            std::mem::size_of::<T>(),
        )
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Checks that the byte length matches `shape` and `element_size_in_bytes`.
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.data.len() != self.element_count() * self.element_size_in_bytes {
            return Err(ComputeError::ShapeMismatch(
                "Buffer data length does not match product of shape dimensions and element size",
            ));
        }
        Ok(())
    }
}

/// Returns the best accelerator that initializes within `timeout`.
///
/// With the `gpu` feature a [`WgpuBackend`] is tried first. If that fails and
/// the `mock` feature is enabled, the software [`MockCpu`] device is returned.
/// `None` means the engine has to run on the CPU paths only.
#[must_use]
#[allow(unused_variables)]
pub fn default_backend(timeout: Duration) -> Option<Arc<dyn ComputeBackend>> {
    #[cfg(feature = "gpu")]
    {
        match WgpuBackend::request(timeout) {
            Ok(gpu) => {
                tracing::info!(adapter = %gpu.adapter_name(), "using wgpu backend");
                return Some(Arc::new(gpu));
            }
            Err(err) => tracing::warn!(%err, "wgpu backend initialization failed, falling back"),
        }
    }

    #[cfg(feature = "mock")]
    {
        tracing::info!("using MockCpu backend");
        Some(Arc::new(MockCpu::new()))
    }

    #[cfg(not(feature = "mock"))]
    {
        tracing::warn!("no accelerator available, perception runs on the CPU paths only");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_view_validates_length() {
        let good = BufferView::new(vec![0u8; 16].into(), vec![4], 4);
        assert!(good.validate().is_ok());

        let bad = BufferView::new(vec![0u8; 12].into(), vec![4], 4);
        assert!(matches!(bad.validate(), Err(ComputeError::ShapeMismatch(_))));
    }

    #[test]
    fn from_pod_records_shape() {
        let view = BufferView::from_pod(&[1.0f32, 2.0, 3.0]);
        assert_eq!(view.shape, vec![3]);
        assert_eq!(view.element_size_in_bytes, 4);
        assert_eq!(view.data.len(), 12);
    }

    #[test]
    fn kernel_binding_counts() {
        assert_eq!(Kernel::CastRays.binding_count(), 7);
        assert_eq!(Kernel::Forward.binding_count(), 5);
    }

    #[test]
    fn device_faults_invalidate_resources() {
        assert!(ComputeError::DeviceLost.invalidates_resources());
        assert!(ComputeError::Device("validation".into()).invalidates_resources());
        assert!(!ComputeError::Busy.invalidates_resources());
        assert!(!ComputeError::BackendUnavailable.invalidates_resources());
    }
}
