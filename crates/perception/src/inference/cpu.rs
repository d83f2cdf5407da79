//! Agent-by-agent forward pass, used for groups the accelerator does not
//! take and whenever the accelerated path is unavailable.

use compute::kernels::sigmoid;

use crate::inference::{apply, input_row};
use crate::types::Agent;

/// One recurrent step for a single agent. `scratch` is reused between calls.
/// Weights missing from a short matrix count as zero.
pub fn forward_cpu(agent: &mut Agent, scratch: &mut Vec<f32>) {
    let key = agent.brain.architecture;
    let (hidden, output) = (key.hidden, key.output);
    scratch.clear();
    scratch.resize(key.row_len() + hidden + output, 0.0);
    let (row, rest) = scratch.split_at_mut(key.row_len());
    let (new_hidden, outputs) = rest.split_at_mut(hidden);
    input_row(agent, row);

    let w1 = &agent.brain.weights1;
    for (j, h) in new_hidden.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (i, x) in row.iter().enumerate() {
            acc += x * w1.get(i * hidden + j).copied().unwrap_or(0.0);
        }
        *h = sigmoid(acc);
    }
    let w2 = &agent.brain.weights2;
    for (k, o) in outputs.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (j, h) in new_hidden.iter().enumerate() {
            acc += h * w2.get(j * output + k).copied().unwrap_or(0.0);
        }
        *o = sigmoid(acc);
    }
    apply(agent, new_hidden, outputs);
}

/// Runs [`forward_cpu`] for every agent index in `members`.
pub fn run_group_cpu(agents: &mut [Agent], members: &[usize], scratch: &mut Vec<f32>) {
    for &index in members {
        if let Some(agent) = agents.get_mut(index) {
            forward_cpu(agent, scratch);
        }
    }
}
