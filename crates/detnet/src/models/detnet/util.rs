//! # `DetNet` Utilities

/// Get the output resolution of a strided layer for a given input resolution.
///
/// Every strided layer in the network (3x3 pad 1, 1x1 pad 0, and the
/// 3x3 pad 1 max-pool) rounds up: ``out = ceil(in / stride)``.
///
/// # Arguments
///
/// - `input_resolution`: ``[height_in, width_in]``.
/// - `stride`: the layer stride.
///
/// # Returns
///
/// ``[height_out, width_out]``
#[inline(always)]
pub fn stride_div_output_resolution(
    input_resolution: [usize; 2],
    stride: usize,
) -> [usize; 2] {
    assert!(stride > 0, "stride must be positive");
    input_resolution.map(|dim| dim.div_ceil(stride))
}

/// Join a parameter path prefix and a child name with ``.``.
pub fn join_path(
    prefix: &str,
    name: &str,
) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
