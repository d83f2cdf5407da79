//! Device memory and pipeline ownership.
//!
//! Buffers are addressed by slot name. A slot keeps its buffer while the
//! requested size fits and is reallocated with headroom otherwise. All
//! handles are forgotten when the backend reports a new device epoch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BufferDesc, BufferId, BufferUsage};
use crate::{ComputeBackend, ComputeError, Kernel, PipelineId};

/// Smallest buffer ever allocated, in bytes.
pub const MIN_BUFFER_BYTES: u64 = 256;

/// Workgroup sizes tried in order when building a pipeline.
pub const WORKGROUP_CANDIDATES: [u32; 4] = [256, 128, 64, 32];

/// A slot is released by [`ResourceManager::trim`] when its capacity exceeds
/// this multiple of the largest size requested since the previous trim.
pub const TRIM_SLACK: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandle {
    pub id: PipelineId,
    pub workgroup_size: u32,
}

impl PipelineHandle {
    /// One-dimensional dispatch size covering `items` invocations.
    #[must_use]
    pub fn workgroups_for(&self, items: u32) -> [u32; 3] {
        [items.div_ceil(self.workgroup_size).max(1), 1, 1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ensured {
    pub id: BufferId,
    /// The slot received a new buffer; previous contents are gone.
    pub reallocated: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    pub allocations: u64,
    pub reallocations: u64,
    pub bytes_allocated: u64,
    pub uploads: u64,
    pub bytes_uploaded: u64,
    pub pipeline_builds: u64,
    pub invalidations: u64,
    pub trimmed: u64,
}

#[derive(Debug)]
struct Slot {
    id: BufferId,
    usage: BufferUsage,
    capacity: u64,
    high_water: u64,
}

pub struct ResourceManager {
    backend: Arc<dyn ComputeBackend>,
    slots: HashMap<String, Slot>,
    pipelines: HashMap<Kernel, PipelineHandle>,
    epoch: u64,
    growth_factor: f64,
    ring_depth: u64,
    stats: ResourceStats,
}

fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

impl ResourceManager {
    #[must_use]
    pub fn new(backend: Arc<dyn ComputeBackend>, growth_factor: f32, ring_depth: usize) -> Self {
        let epoch = backend.epoch();
        Self {
            backend,
            slots: HashMap::new(),
            pipelines: HashMap::new(),
            epoch,
            growth_factor: f64::from(growth_factor.max(1.0)),
            ring_depth: ring_depth.max(1) as u64,
            stats: ResourceStats::default(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Forgets every handle if the device was re-created since the last call.
    /// Returns `true` when handles were dropped.
    pub fn sync_epoch(&mut self) -> bool {
        let epoch = self.backend.epoch();
        if epoch == self.epoch {
            return false;
        }
        tracing::info!(
            old = self.epoch,
            new = epoch,
            slots = self.slots.len(),
            "device epoch changed, dropping stale resources"
        );
        self.slots.clear();
        self.pipelines.clear();
        self.epoch = epoch;
        self.stats.invalidations += 1;
        true
    }

    /// Releases every buffer and pipeline. The next request rebuilds them.
    pub fn invalidate(&mut self) {
        self.release_all();
        self.stats.invalidations += 1;
    }

    /// Makes sure `slot` holds a buffer of at least `bytes` bytes.
    ///
    /// # Errors
    ///
    /// `ComputeError::AllocationOverflow` if `bytes` exceeds the device limit;
    /// backend errors from buffer creation are passed through.
    pub fn ensure(
        &mut self,
        slot: &str,
        usage: BufferUsage,
        bytes: u64,
    ) -> Result<Ensured, ComputeError> {
        self.sync_epoch();
        let needed = align4(bytes.max(MIN_BUFFER_BYTES));
        let high_water = match self.slots.get_mut(slot) {
            Some(existing) => {
                existing.high_water = existing.high_water.max(bytes);
                if existing.capacity >= needed && existing.usage == usage {
                    return Ok(Ensured {
                        id: existing.id,
                        reallocated: false,
                    });
                }
                existing.high_water
            }
            None => bytes,
        };

        let limit = self.backend.max_buffer_size();
        if needed > limit {
            return Err(ComputeError::AllocationOverflow {
                label: slot.to_string(),
                requested: needed,
                limit,
            });
        }
        let grown = align4((needed as f64 * self.growth_factor).ceil() as u64);
        let capacity = grown.min(limit & !3).max(needed);
        let id = self.backend.create_buffer(&BufferDesc {
            label: slot.to_string(),
            size: capacity,
            usage,
        })?;
        self.stats.allocations += 1;

        let previous = self.slots.insert(
            slot.to_string(),
            Slot {
                id,
                usage,
                capacity,
                high_water,
            },
        );
        let reallocated = previous.is_some();
        if let Some(old) = previous {
            self.backend.release_buffer(old.id);
            self.stats.reallocations += 1;
            tracing::debug!(slot, old = old.capacity, new = capacity, "buffer grown");
        }
        Ok(Ensured { id, reallocated })
    }

    /// Ensures capacity for `data` and writes it at offset zero.
    pub fn upload(
        &mut self,
        slot: &str,
        usage: BufferUsage,
        data: &[u8],
    ) -> Result<Ensured, ComputeError> {
        let ensured = self.ensure(slot, usage, data.len() as u64)?;
        if !data.is_empty() {
            self.backend.write_buffer(ensured.id, 0, data)?;
            self.stats.uploads += 1;
            self.stats.bytes_uploaded += data.len() as u64;
        }
        Ok(ensured)
    }

    /// Writes into an existing slot without resizing it.
    pub fn write(&mut self, slot: &str, offset: u64, data: &[u8]) -> Result<(), ComputeError> {
        let id = self
            .slots
            .get(slot)
            .map(|s| s.id)
            .ok_or(ComputeError::ShapeMismatch("write to an unallocated slot"))?;
        self.backend.write_buffer(id, offset, data)?;
        self.stats.uploads += 1;
        self.stats.bytes_uploaded += data.len() as u64;
        Ok(())
    }

    #[must_use]
    pub fn buffer(&self, slot: &str) -> Option<BufferId> {
        self.slots.get(slot).map(|s| s.id)
    }

    #[must_use]
    pub fn capacity(&self, slot: &str) -> Option<u64> {
        self.slots.get(slot).map(|s| s.capacity)
    }

    /// Number of staging buffers each readback label rotates through.
    #[must_use]
    pub fn ring_depth(&self) -> usize {
        self.ring_depth as usize
    }

    /// Position of `tick` in the staging ring.
    #[must_use]
    pub fn ring_index(&self, tick: u64) -> usize {
        (tick % self.ring_depth) as usize
    }

    /// Name of the staging slot used for `label` on `tick`. Consecutive ticks
    /// rotate through `ring_depth` buffers.
    #[must_use]
    pub fn staging_slot(&self, label: &str, tick: u64) -> String {
        format!("{label}.staging.{}", self.ring_index(tick))
    }

    /// Returns the cached pipeline for `kernel`, building it on first use.
    ///
    /// Workgroup sizes from [`WORKGROUP_CANDIDATES`] are tried largest first.
    ///
    /// # Errors
    ///
    /// The last `ComputeError::PipelineBuild` if no size is accepted.
    pub fn pipeline(&mut self, kernel: Kernel) -> Result<PipelineHandle, ComputeError> {
        self.sync_epoch();
        if let Some(handle) = self.pipelines.get(&kernel) {
            return Ok(*handle);
        }
        let mut last_err = ComputeError::PipelineBuild {
            kernel,
            message: "no workgroup size candidates".to_string(),
        };
        for workgroup_size in WORKGROUP_CANDIDATES {
            match self.backend.create_pipeline(kernel, workgroup_size) {
                Ok(id) => {
                    let handle = PipelineHandle { id, workgroup_size };
                    self.pipelines.insert(kernel, handle);
                    self.stats.pipeline_builds += 1;
                    tracing::info!(kernel = kernel.label(), workgroup_size, "pipeline built");
                    return Ok(handle);
                }
                Err(err @ ComputeError::PipelineBuild { .. }) => {
                    tracing::warn!(kernel = kernel.label(), workgroup_size, %err, "pipeline build failed, retrying smaller");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Drops cached pipelines so they are rebuilt on next use.
    pub fn refresh_pipelines(&mut self) {
        for (_, handle) in self.pipelines.drain() {
            self.backend.release_pipeline(handle.id);
        }
    }

    pub fn release_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            self.backend.release_buffer(slot.id);
        }
        self.refresh_pipelines();
    }

    /// Releases slots whose capacity is far above recent demand. Returns the
    /// number of slots released.
    pub fn trim(&mut self) -> usize {
        let oversized: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.capacity > align4(s.high_water.max(MIN_BUFFER_BYTES)) * TRIM_SLACK)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &oversized {
            if let Some(slot) = self.slots.remove(name) {
                self.backend.release_buffer(slot.id);
            }
        }
        for slot in self.slots.values_mut() {
            slot.high_water = 0;
        }
        self.stats.trimmed += oversized.len() as u64;
        oversized.len()
    }

    #[must_use]
    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            bytes_allocated: self.slots.values().map(|s| s.capacity).sum(),
            ..self.stats
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::MockCpu;

    fn manager() -> (Arc<MockCpu>, ResourceManager) {
        let cpu = Arc::new(MockCpu::new());
        let rm = ResourceManager::new(cpu.clone(), 1.5, 2);
        (cpu, rm)
    }

    #[test]
    fn growth_reallocates_once_for_large_jump() {
        let (_, mut rm) = manager();
        let first = rm.ensure("agents", BufferUsage::Storage, 1000).unwrap();
        assert!(!first.reallocated);
        assert!(rm.capacity("agents").unwrap() >= 1500);

        let same = rm.ensure("agents", BufferUsage::Storage, 1200).unwrap();
        assert_eq!(same.id, first.id);
        assert!(!same.reallocated);

        let grown = rm.ensure("agents", BufferUsage::Storage, 3000).unwrap();
        assert!(grown.reallocated);
        assert_ne!(grown.id, first.id);
        assert!(rm.capacity("agents").unwrap() >= 3000);
        assert_eq!(rm.stats().reallocations, 1);
    }

    #[test]
    fn overflow_is_reported_and_growth_clamped() {
        let (cpu, mut rm) = manager();
        cpu.inject(|f| f.max_buffer_size = Some(1024));
        let result = rm.ensure("big", BufferUsage::Storage, 2000);
        assert!(
            matches!(result, Err(ComputeError::AllocationOverflow { .. })),
            "Expected AllocationOverflow, got {result:?}"
        );
        rm.ensure("fits", BufferUsage::Storage, 800).unwrap();
        assert_eq!(rm.capacity("fits"), Some(1024));
    }

    #[test]
    fn epoch_change_drops_handles() {
        let (cpu, mut rm) = manager();
        let before = rm.ensure("hits", BufferUsage::Storage, 64).unwrap();
        rm.pipeline(Kernel::CastRays).unwrap();
        cpu.lose_device();
        cpu.recover().unwrap();

        let after = rm.ensure("hits", BufferUsage::Storage, 64).unwrap();
        assert_ne!(before.id, after.id);
        assert!(!after.reallocated);
        assert_eq!(rm.stats().invalidations, 1);
        rm.pipeline(Kernel::CastRays).unwrap();
        assert_eq!(rm.stats().pipeline_builds, 2);
    }

    #[test]
    fn pipeline_retries_smaller_workgroups() {
        let (cpu, mut rm) = manager();
        cpu.inject(|f| f.max_workgroup_size = Some(64));
        let handle = rm.pipeline(Kernel::Forward).unwrap();
        assert_eq!(handle.workgroup_size, 64);
        assert_eq!(handle.workgroups_for(130), [3, 1, 1]);
        assert_eq!(rm.pipeline(Kernel::Forward).unwrap(), handle);
    }

    #[test]
    fn pipeline_gives_up_when_nothing_builds() {
        let (cpu, mut rm) = manager();
        cpu.inject(|f| f.max_workgroup_size = Some(16));
        let result = rm.pipeline(Kernel::Forward);
        assert!(
            matches!(result, Err(ComputeError::PipelineBuild { .. })),
            "Expected PipelineBuild, got {result:?}"
        );
    }

    #[test]
    fn staging_ring_rotates() {
        let (_, rm) = manager();
        assert_eq!(rm.staging_slot("hits", 0), "hits.staging.0");
        assert_eq!(rm.staging_slot("hits", 1), "hits.staging.1");
        assert_eq!(rm.staging_slot("hits", 2), "hits.staging.0");
    }

    #[test]
    fn trim_releases_oversized_slots() {
        let (cpu, mut rm) = manager();
        rm.ensure("grid", BufferUsage::Storage, 100_000).unwrap();
        rm.ensure("small", BufferUsage::Storage, 100).unwrap();
        // a trim pass resets demand tracking, the next one sees only new requests
        assert_eq!(rm.trim(), 0);
        rm.ensure("grid", BufferUsage::Storage, 1_000).unwrap();
        assert_eq!(rm.trim(), 1);
        assert_eq!(rm.capacity("grid"), None);
        assert!(rm.capacity("small").is_some());
        assert_eq!(cpu.stats().buffers_live, 1);
    }

    #[test]
    fn upload_counts_bytes() {
        let (cpu, mut rm) = manager();
        rm.upload("params", BufferUsage::Uniform, &[0u8; 48]).unwrap();
        rm.write("params", 4, &[1u8; 4]).unwrap();
        let stats = rm.stats();
        assert_eq!(stats.uploads, 2);
        assert_eq!(stats.bytes_uploaded, 52);
        assert_eq!(cpu.stats().bytes_written, 52);
    }
}
