/// Linear interpolation from `a` towards `b` by `x`.
///
/// Every smoothed quantity in the analyzer is an EMA expressed through this.
#[inline]
pub fn mix(a: f32, b: f32, x: f32) -> f32 {
    a + (b - a) * x
}

pub fn hamming_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()
        })
        .collect()
}
