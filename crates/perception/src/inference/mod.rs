//! Batched forward passes of the agents' recurrent networks.
//!
//! Agents are grouped by [`ArchitectureKey`]; each group runs either as one
//! kernel dispatch ([`accelerated`]) or agent by agent on the CPU ([`cpu`]).
//! Both write the new hidden state and the outputs back onto the agent.

pub mod accelerated;
pub mod cpu;

use std::collections::BTreeMap;

pub use accelerated::{AcceleratedInference, AcceleratedRun, InferenceTicket};
pub use cpu::{forward_cpu, run_group_cpu};

use compute::gpu_types::{MAX_FORWARD_HIDDEN, MAX_FORWARD_ROW};

use crate::types::{Agent, ArchitectureKey};

/// Agents that take part in inference this tick.
#[must_use]
pub fn is_valid(agent: &Agent) -> bool {
    agent.is_active()
        && !agent.inputs.is_empty()
        && agent.hidden.len() == agent.brain.architecture.hidden
}

/// Buckets the indices of valid agents by architecture, reusing the vectors
/// already in `groups`. Empty buckets are dropped.
pub fn group_agents(agents: &[Agent], groups: &mut BTreeMap<ArchitectureKey, Vec<usize>>) {
    for members in groups.values_mut() {
        members.clear();
    }
    for (index, agent) in agents.iter().enumerate() {
        if is_valid(agent) {
            groups.entry(agent.brain.architecture).or_default().push(index);
        }
    }
    groups.retain(|_, members| !members.is_empty());
}

/// Whether the forward kernel's local arrays can hold this architecture.
#[must_use]
pub fn fits_kernel(key: &ArchitectureKey) -> bool {
    key.row_len() <= MAX_FORWARD_ROW && key.hidden <= MAX_FORWARD_HIDDEN
}

/// Writes `inputs ++ hidden` into `row`, padding or truncating the inputs
/// to the architecture's input size.
pub fn input_row(agent: &Agent, row: &mut [f32]) {
    let key = agent.brain.architecture;
    let (inputs, hidden) = row.split_at_mut(key.input);
    for (i, slot) in inputs.iter_mut().enumerate() {
        *slot = agent.inputs.get(i).copied().unwrap_or(0.0);
    }
    hidden.copy_from_slice(&agent.hidden[..key.hidden]);
}

/// Stores the result of one forward pass on `agent`.
pub fn apply(agent: &mut Agent, hidden: &[f32], outputs: &[f32]) {
    agent.hidden.copy_from_slice(hidden);
    agent.outputs.clear();
    agent.outputs.extend_from_slice(outputs);
}
