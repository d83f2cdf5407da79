//! Architecture groups as batched `forward` kernel dispatches.
//!
//! Every group owns a set of device slots named after its key. Weights are
//! stored per agent at the agent's position in the group, and a slot is only
//! rewritten when the [`WeightCache`] reports a change or the slot holds
//! another agent's weights.
//!
//! [`AcceleratedInference::submit`] queues every group and returns an
//! [`InferenceTicket`] that owns the in-flight claim, so a second submission
//! is refused until the ticket has been collected or dropped.
//! [`AcceleratedInference::collect`] reads every group back and writes
//! nothing to the agents until every group's output has been validated.

use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;

use compute::gpu_types::ForwardParams;
use compute::{BufferId, BufferUsage, ComputeError, Dispatch, Kernel, Readback, ResourceManager};

use crate::inference::{apply, fits_kernel, input_row};
use crate::inflight::{InflightFlag, InflightGuard};
use crate::types::{Agent, ArchitectureKey};
use crate::weight_cache::WeightCache;
use crate::PerceptionError;

/// Which agent's weights each device slot of a group currently holds.
#[derive(Debug, Default)]
struct Residency {
    weights1: Option<BufferId>,
    weights2: Option<BufferId>,
    slots: Vec<Option<u64>>,
}

#[derive(Debug)]
struct PendingGroup {
    key: ArchitectureKey,
    members: Vec<usize>,
    staging: BufferId,
    bytes: u64,
}

/// Submitted groups whose outputs are waiting in their staging buffers.
#[derive(Debug)]
pub struct InferenceTicket {
    tick: u64,
    epoch: u64,
    groups: Vec<PendingGroup>,
    _inflight: InflightGuard,
}

impl InferenceTicket {
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Architectures submitted under this ticket.
    pub fn keys(&self) -> impl Iterator<Item = ArchitectureKey> + '_ {
        self.groups.iter().map(|g| g.key)
    }
}

/// Groups that ran on the accelerator. All other groups still need the CPU.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcceleratedRun {
    pub groups: Vec<ArchitectureKey>,
    pub agents: usize,
}

impl AcceleratedRun {
    #[must_use]
    pub fn handled(&self, key: &ArchitectureKey) -> bool {
        self.groups.contains(key)
    }
}

#[derive(Debug, Default)]
pub struct AcceleratedInference {
    inflight: InflightFlag,
    residency: HashMap<ArchitectureKey, Residency>,
    rows: Vec<f32>,
    weights: Vec<f32>,
    weight_uploads: u64,
    dispatches: u64,
}

fn slot(key: &ArchitectureKey, name: &str) -> String {
    format!("fwd.{key}.{name}")
}

/// Appends `weights` resized to `len`, missing entries as zero.
fn extend_padded(dst: &mut Vec<f32>, weights: &[f32], len: usize) {
    let take = weights.len().min(len);
    dst.extend_from_slice(&weights[..take]);
    dst.resize(dst.len() + (len - take), 0.0);
}

impl AcceleratedInference {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The claim held by an outstanding [`InferenceTicket`].
    #[must_use]
    pub fn inflight_flag(&self) -> InflightFlag {
        self.inflight.clone()
    }

    /// Agents whose weights were written to the device so far.
    #[must_use]
    pub fn weight_uploads(&self) -> u64 {
        self.weight_uploads
    }

    #[must_use]
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Forgets which weights are resident, forcing a full upload next time.
    pub fn forget_residency(&mut self) {
        self.residency.clear();
    }

    /// Groups that qualify for the accelerated path.
    #[must_use]
    pub fn eligible(
        groups: &BTreeMap<ArchitectureKey, Vec<usize>>,
        min_group: usize,
    ) -> Vec<ArchitectureKey> {
        groups
            .iter()
            .filter(|&(key, members)| members.len() >= min_group && fits_kernel(key))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Runs every eligible group on the accelerator.
    ///
    /// # Errors
    ///
    /// `ComputeError::Busy` when another run holds the in-flight flag, backend
    /// errors, and `PerceptionError::ResultCorruption` for outputs outside
    /// `[0, 1]`. No agent is modified when an error is returned.
    pub async fn run(
        &mut self,
        rm: &mut ResourceManager,
        cache: &mut WeightCache,
        agents: &mut [Agent],
        groups: &BTreeMap<ArchitectureKey, Vec<usize>>,
        min_group: usize,
        tick: u64,
    ) -> Result<AcceleratedRun, PerceptionError> {
        let ticket = self.submit(rm, cache, agents, groups, min_group, tick)?;
        self.collect(rm, ticket, agents).await
    }

    /// Uploads inputs and changed weights of every eligible group and queues
    /// one dispatch per group, copying the outputs into the staging buffers
    /// of `tick`.
    ///
    /// # Errors
    ///
    /// `ComputeError::Busy` while an earlier ticket is outstanding,
    /// `ComputeError::BackendUnavailable`, and any backend error. Resident
    /// weights are forgotten on error.
    pub fn submit(
        &mut self,
        rm: &mut ResourceManager,
        cache: &mut WeightCache,
        agents: &[Agent],
        groups: &BTreeMap<ArchitectureKey, Vec<usize>>,
        min_group: usize,
        tick: u64,
    ) -> Result<InferenceTicket, PerceptionError> {
        let Some(guard) = self.inflight.try_acquire() else {
            return Err(ComputeError::Busy.into());
        };
        if !rm.backend().is_available() {
            return Err(ComputeError::BackendUnavailable.into());
        }
        let mut ticket = InferenceTicket {
            tick,
            epoch: rm.backend().epoch(),
            groups: Vec::new(),
            _inflight: guard,
        };
        let keys = Self::eligible(groups, min_group);
        if keys.is_empty() {
            return Ok(ticket);
        }
        if rm.sync_epoch() {
            self.forget_residency();
        }
        ticket.epoch = rm.backend().epoch();
        match self.submit_groups(rm, cache, agents, groups, &keys, tick, &mut ticket.groups) {
            Ok(()) => Ok(ticket),
            Err(err) => {
                self.forget_residency();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_groups(
        &mut self,
        rm: &mut ResourceManager,
        cache: &mut WeightCache,
        agents: &[Agent],
        groups: &BTreeMap<ArchitectureKey, Vec<usize>>,
        keys: &[ArchitectureKey],
        tick: u64,
        pending: &mut Vec<PendingGroup>,
    ) -> Result<(), PerceptionError> {
        let pipeline = rm.pipeline(Kernel::Forward)?;
        for key in keys {
            let Some(members) = groups.get(key) else {
                continue;
            };
            let n = members.len();
            let params = ForwardParams {
                agent_count: n as u32,
                input_size: key.input as u32,
                hidden_size: key.hidden as u32,
                output_size: key.output as u32,
            };

            self.rows.clear();
            self.rows.resize(n * key.row_len(), 0.0);
            for (row, &index) in self.rows.chunks_exact_mut(key.row_len().max(1)).zip(members) {
                input_row(&agents[index], row);
            }

            let params_id = rm
                .upload(&slot(key, "params"), BufferUsage::Uniform, bytemuck::bytes_of(&params))?
                .id;
            let inputs_id = rm
                .upload(&slot(key, "inputs"), BufferUsage::Storage, bytemuck::cast_slice(&self.rows))?
                .id;
            let [w1_id, w2_id] = self.upload_weights(rm, cache, agents, key, members)?;
            let out_bytes = (n * (key.hidden + key.output) * size_of::<f32>()) as u64;
            let out_id = rm.ensure(&slot(key, "out"), BufferUsage::Storage, out_bytes)?.id;
            let staging_slot = rm.staging_slot(&format!("fwd.{key}"), tick);
            let staging = rm.ensure(&staging_slot, BufferUsage::Staging, out_bytes)?.id;

            rm.backend().dispatch(&Dispatch {
                pipeline: pipeline.id,
                bindings: &[params_id, inputs_id, w1_id, w2_id, out_id],
                workgroups: pipeline.workgroups_for(n as u32),
                readback: Some(Readback {
                    source: out_id,
                    staging,
                    size: out_bytes,
                }),
            })?;
            self.dispatches += 1;
            pending.push(PendingGroup {
                key: *key,
                members: members.clone(),
                staging,
                bytes: out_bytes,
            });
        }
        Ok(())
    }

    /// Reads back every group of `ticket` and applies the outputs to
    /// `agents`, which must be the slice the ticket was submitted for.
    ///
    /// # Errors
    ///
    /// `ComputeError::DeviceLost` when the device was re-created after the
    /// submission, any backend error, and `PerceptionError::ResultCorruption`
    /// for outputs outside `[0, 1]`. No agent is modified when an error is
    /// returned, and resident weights are forgotten.
    pub async fn collect(
        &mut self,
        rm: &ResourceManager,
        ticket: InferenceTicket,
        agents: &mut [Agent],
    ) -> Result<AcceleratedRun, PerceptionError> {
        let result = Self::read_groups(rm, &ticket).await;
        let outputs = match result {
            Ok(outputs) => outputs,
            Err(err) => {
                self.forget_residency();
                return Err(err);
            }
        };

        let mut run = AcceleratedRun::default();
        for (group, values) in ticket.groups.iter().zip(&outputs) {
            let hidden = group.key.hidden;
            let stride = hidden + group.key.output;
            for (s, &index) in group.members.iter().enumerate() {
                let out = &values[s * stride..(s + 1) * stride];
                if let Some(agent) = agents.get_mut(index) {
                    apply(agent, &out[..hidden], &out[hidden..]);
                }
            }
            run.groups.push(group.key);
            run.agents += group.members.len();
        }
        if !run.groups.is_empty() {
            tracing::debug!(groups = run.groups.len(), agents = run.agents, "accelerated inference applied");
        }
        Ok(run)
    }

    async fn read_groups(
        rm: &ResourceManager,
        ticket: &InferenceTicket,
    ) -> Result<Vec<Vec<f32>>, PerceptionError> {
        let backend = rm.backend();
        if !ticket.groups.is_empty() && backend.epoch() != ticket.epoch {
            return Err(ComputeError::DeviceLost.into());
        }
        let mut outputs = Vec::with_capacity(ticket.groups.len());
        for group in &ticket.groups {
            let bytes = backend.read_buffer(group.staging, group.bytes).await?;
            let raw = bytes.get(..group.bytes as usize).ok_or_else(|| {
                PerceptionError::ResultCorruption(format!(
                    "group {} readback returned {} of {} bytes",
                    group.key,
                    bytes.len(),
                    group.bytes
                ))
            })?;
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(raw);
            if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                return Err(PerceptionError::ResultCorruption(format!(
                    "group {} produced activation {bad}",
                    group.key
                )));
            }
            outputs.push(values);
        }
        Ok(outputs)
    }

    /// Makes the group's weight buffers current, writing only dirty slots.
    /// Runs of adjacent dirty slots are coalesced into one write per matrix.
    fn upload_weights(
        &mut self,
        rm: &mut ResourceManager,
        cache: &mut WeightCache,
        agents: &[Agent],
        key: &ArchitectureKey,
        members: &[usize],
    ) -> Result<[BufferId; 2], PerceptionError> {
        let n = members.len();
        let (len1, len2) = (key.weights1_len(), key.weights2_len());
        let (slot1, slot2) = (slot(key, "w1"), slot(key, "w2"));
        let w1 = rm.ensure(&slot1, BufferUsage::Storage, (n * len1 * size_of::<f32>()) as u64)?;
        let w2 = rm.ensure(&slot2, BufferUsage::Storage, (n * len2 * size_of::<f32>()) as u64)?;

        let residency = self.residency.entry(*key).or_default();
        if residency.weights1 != Some(w1.id) || residency.weights2 != Some(w2.id) {
            residency.slots.clear();
            residency.weights1 = Some(w1.id);
            residency.weights2 = Some(w2.id);
        }
        residency.slots.resize(n, None);

        let dirty: Vec<bool> = members
            .iter()
            .zip(&residency.slots)
            .map(|(&index, resident)| {
                let agent = &agents[index];
                // always consult the cache so it tracks every accelerated tick
                let changed = cache.check(agent.id, &agent.brain);
                changed || *resident != Some(agent.id)
            })
            .collect();

        let mut start = 0;
        while start < n {
            if !dirty[start] {
                start += 1;
                continue;
            }
            let end = (start..n).find(|&s| !dirty[s]).unwrap_or(n);
            for (slot_name, len, pick) in [
                (&slot1, len1, 0usize),
                (&slot2, len2, 1usize),
            ] {
                if len == 0 {
                    continue;
                }
                self.weights.clear();
                for &index in &members[start..end] {
                    let brain = &agents[index].brain;
                    let source = if pick == 0 { &brain.weights1 } else { &brain.weights2 };
                    extend_padded(&mut self.weights, source, len);
                }
                let offset = (start * len * size_of::<f32>()) as u64;
                rm.write(slot_name, offset, bytemuck::cast_slice(&self.weights))?;
            }
            for (s, &index) in (start..end).zip(&members[start..end]) {
                residency.slots[s] = Some(agents[index].id);
            }
            self.weight_uploads += (end - start) as u64;
            start = end;
        }
        Ok([w1.id, w2.id])
    }
}
