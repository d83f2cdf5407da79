use crate::gpu_types::{ForwardParams, MAX_FORWARD_HIDDEN, MAX_FORWARD_ROW};
use crate::kernels::{read_one, read_pod};
use crate::layout::{FWD_INPUTS, FWD_WEIGHTS1, FWD_WEIGHTS2, PARAMS};
use crate::{BufferView, ComputeError, Kernel};

/// Logistic activation shared by the kernel mirror and the CPU forward pass.
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Two-layer recurrent step for every agent of one architecture group.
///
/// Per agent the input row is `inputs ++ previous hidden`; weights are stored
/// row-major per agent (`row_len x hidden`, then `hidden x output`). The
/// output holds the new hidden state followed by the outputs.
pub fn handle_forward(binds: &[BufferView]) -> Result<Vec<Vec<u8>>, ComputeError> {
    if binds.len() != Kernel::Forward.binding_count() as usize {
        return Err(ComputeError::ShapeMismatch(
            "Forward kernel expects 5 buffers",
        ));
    }
    let params: ForwardParams = read_one(&binds[PARAMS as usize], "Forward params buffer too small")?;
    let agents = params.agent_count as usize;
    let row_len = params.row_len();
    let hidden = params.hidden_size as usize;
    let output = params.output_size as usize;
    if row_len > MAX_FORWARD_ROW || hidden > MAX_FORWARD_HIDDEN {
        return Err(ComputeError::ShapeMismatch(
            "Forward layer sizes exceed the kernel's local storage",
        ));
    }

    let inputs: Vec<f32> = read_pod(
        &binds[FWD_INPUTS as usize],
        agents * row_len,
        "Forward input buffer shorter than agent_count * row_len",
    )?;
    let w1: Vec<f32> = read_pod(
        &binds[FWD_WEIGHTS1 as usize],
        agents * row_len * hidden,
        "Forward first-layer weights too short",
    )?;
    let w2: Vec<f32> = read_pod(
        &binds[FWD_WEIGHTS2 as usize],
        agents * hidden * output,
        "Forward second-layer weights too short",
    )?;

    let out_len = params.out_len();
    let mut out = vec![0.0f32; agents * out_len];
    for agent in 0..agents {
        let row = &inputs[agent * row_len..(agent + 1) * row_len];
        let w1_base = agent * row_len * hidden;
        let w2_base = agent * hidden * output;
        let dst = &mut out[agent * out_len..(agent + 1) * out_len];
        for j in 0..hidden {
            let mut acc = 0.0f32;
            for (i, x) in row.iter().enumerate() {
                acc += x * w1[w1_base + i * hidden + j];
            }
            dst[j] = sigmoid(acc);
        }
        for k in 0..output {
            let mut acc = 0.0f32;
            for j in 0..hidden {
                acc += dst[j] * w2[w2_base + j * output + k];
            }
            dst[hidden + k] = sigmoid(acc);
        }
    }
    Ok(vec![bytemuck::cast_slice(&out).to_vec()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(params: ForwardParams, inputs: &[f32], w1: &[f32], w2: &[f32]) -> Vec<f32> {
        let out = vec![0.0f32; params.agent_count as usize * params.out_len()];
        let binds = [
            BufferView::from_pod(&[params]),
            BufferView::from_pod(inputs),
            BufferView::from_pod(w1),
            BufferView::from_pod(w2),
            BufferView::from_pod(&out),
        ];
        let result = handle_forward(&binds).unwrap();
        bytemuck::pod_collect_to_vec(&result[0])
    }

    #[test]
    fn zero_weights_give_half() {
        let params = ForwardParams {
            agent_count: 2,
            input_size: 2,
            hidden_size: 1,
            output_size: 2,
        };
        let out = run(params, &[1.0; 6], &[0.0; 6], &[0.0; 4]);
        assert_eq!(out, vec![0.5; 6]);
    }

    #[test]
    fn weights_are_per_agent() {
        let params = ForwardParams {
            agent_count: 2,
            input_size: 1,
            hidden_size: 1,
            output_size: 1,
        };
        // agent 0 drives its hidden unit hard positive, agent 1 hard negative
        let out = run(params, &[1.0, 0.0, 1.0, 0.0], &[20.0, 0.0, -20.0, 0.0], &[1.0, 1.0]);
        assert!(out[0] > 0.99, "Expected saturated hidden, got {out:?}");
        assert!(out[2] < 0.01, "Expected suppressed hidden, got {out:?}");
        assert!((out[1] - sigmoid(out[0])).abs() < 1e-6);
        assert!((out[3] - sigmoid(out[2])).abs() < 1e-6);
    }

    #[test]
    fn oversized_hidden_layer_is_rejected() {
        let params = ForwardParams {
            agent_count: 0,
            input_size: 1,
            hidden_size: MAX_FORWARD_HIDDEN as u32 + 1,
            output_size: 1,
        };
        let binds = [
            BufferView::from_pod(&[params]),
            BufferView::from_pod::<f32>(&[]),
            BufferView::from_pod::<f32>(&[]),
            BufferView::from_pod::<f32>(&[]),
            BufferView::from_pod::<f32>(&[]),
        ];
        let result = handle_forward(&binds);
        assert!(
            matches!(result, Err(ComputeError::ShapeMismatch(_))),
            "Expected ShapeMismatch error, got {result:?}"
        );
    }
}
