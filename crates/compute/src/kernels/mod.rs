// CPU mirrors of the WGSL kernels, used by the MockCpu backend and as the
// reference for the GPU golden tests.

use bytemuck::Pod;

use crate::{BufferView, ComputeError};

pub mod cast_rays_op;
pub use cast_rays_op::handle_cast_rays;
pub mod forward_op;
pub use forward_op::{handle_forward, sigmoid};

/// Reads the first `count` records of a bound buffer. Bound buffers may be
/// larger than their logical contents, so the count always comes from the
/// kernel parameters.
pub(crate) fn read_pod<T: Pod>(
    view: &BufferView,
    count: usize,
    what: &'static str,
) -> Result<Vec<T>, ComputeError> {
    let size = std::mem::size_of::<T>();
    let bytes = count
        .checked_mul(size)
        .and_then(|len| view.data.get(..len))
        .ok_or(ComputeError::ShapeMismatch(what))?;
    Ok(bytes
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

pub(crate) fn read_one<T: Pod>(view: &BufferView, what: &'static str) -> Result<T, ComputeError> {
    let size = std::mem::size_of::<T>();
    view.data
        .get(..size)
        .map(bytemuck::pod_read_unaligned)
        .ok_or(ComputeError::ShapeMismatch(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_pod_ignores_trailing_capacity() {
        let mut bytes = bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec();
        bytes.extend_from_slice(&[0xAB; 7]);
        let view = BufferView::new(bytes.into(), vec![15], 1);
        let values: Vec<f32> = read_pod(&view, 2, "floats").unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn read_pod_rejects_short_buffers() {
        let view = BufferView::from_pod(&[1u32]);
        let result = read_pod::<u32>(&view, 2, "too short");
        assert!(
            matches!(result, Err(ComputeError::ShapeMismatch("too short"))),
            "Expected ShapeMismatch, got {result:?}"
        );
    }
}
