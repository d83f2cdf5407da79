use std::future::Future;
use std::pin::Pin;

use crate::{ComputeError, Kernel};

#[cfg(feature = "mock")]
pub mod mock_cpu;

/// Future returned by [`ComputeBackend::read_buffer`].
pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, ComputeError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Small parameter block bound at slot 0.
    Uniform,
    /// Kernel input or output, copyable in both directions.
    Storage,
    /// Host-mappable destination of a readback copy.
    Staging,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Copy of `size` bytes from `source` into the mappable `staging` buffer,
/// recorded after the compute pass of the same submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readback {
    pub source: BufferId,
    pub staging: BufferId,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Dispatch<'a> {
    pub pipeline: PipelineId,
    /// One buffer per binding slot, in binding order (see [`crate::layout`]).
    pub bindings: &'a [BufferId],
    pub workgroups: [u32; 3],
    pub readback: Option<Readback>,
}

pub trait ComputeBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `false` once the device is lost or was never acquired.
    fn is_available(&self) -> bool;

    /// Incremented every time the device is re-created. Handles issued under
    /// an older epoch are invalid.
    fn epoch(&self) -> u64;

    /// Re-acquires a lost device. All previously issued handles are dropped.
    fn recover(&self) -> Result<(), ComputeError>;

    /// Largest single buffer the device accepts, in bytes.
    fn max_buffer_size(&self) -> u64;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId, ComputeError>;

    /// Releases a buffer. Work already submitted against it still completes.
    fn release_buffer(&self, id: BufferId);

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ComputeError>;

    /// Builds the pipeline for `kernel` specialized to `workgroup_size`
    /// invocations per workgroup.
    fn create_pipeline(&self, kernel: Kernel, workgroup_size: u32)
        -> Result<PipelineId, ComputeError>;

    fn release_pipeline(&self, id: PipelineId);

    /// Records and submits one compute pass, followed by the optional
    /// readback copy.
    ///
    /// # Errors
    ///
    /// Returns `ComputeError::ShapeMismatch` if the binding count does not
    /// match the kernel, `ComputeError::UnknownHandle` for stale handles and
    /// `ComputeError::DeviceLost` when the device went away.
    fn dispatch(&self, dispatch: &Dispatch<'_>) -> Result<(), ComputeError>;

    /// Maps `size` bytes of a staging buffer and copies them out. Resolves
    /// once the device has finished all work submitted before the call.
    fn read_buffer(&self, id: BufferId, size: u64) -> ReadFuture<'_>;
}
