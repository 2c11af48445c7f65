// src/mathutil.rs
// Small geometry and statistics helpers shared by the calibration
// strategies. All calibration math is IEEE-754 binary32.

/// Rotate `point` around `reference` by `angle` degrees, in place.
pub fn rotate2d(point: &mut [f32; 2], reference: [f32; 2], angle_deg: f32) {
    let rad = angle_deg * core::f32::consts::PI / 180.0;
    let s = rad.sin();
    let c = rad.cos();

    let px = point[0] - reference[0];
    let py = point[1] - reference[1];

    point[0] = px * c - py * s + reference[0];
    point[1] = px * s + py * c + reference[1];
}

/// Midpoint of a 2-D segment.
pub fn midpoint(first: [f32; 2], second: [f32; 2]) -> [f32; 2] {
    [(first[0] + second[0]) / 2.0, (first[1] + second[1]) / 2.0]
}

/// Euclidean distance between two 2-D points.
pub fn distance(first: [f32; 2], second: [f32; 2]) -> f32 {
    ((second[0] - first[0]).powi(2) + (second[1] - first[1]).powi(2)).sqrt()
}

pub fn mean(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f32>() / samples.len() as f32
}

/// Population standard deviation (divisor n, matching the firmware's
/// repeatability report).
pub fn std_dev(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mu = mean(samples);
    let dev: f32 = samples.iter().map(|s| (s - mu).powi(2)).sum();
    (dev / samples.len() as f32).sqrt()
}

/// Mean of the middle four of six values: drop one lowest and one
/// highest sample, average the rest. The six-sample analog of an
/// interquartile mean.
pub fn intersextile_mean(samples: &[f32; 6]) -> f32 {
    let mut sorted = *samples;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
    sorted[1..5].iter().sum::<f32>() / 4.0
}

// f32 vector helpers for the trilateration in the delta arm solution.
pub type Vector3 = [f32; 3];

pub fn vector_sub(a: Vector3, b: Vector3) -> Vector3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn vector_add(a: Vector3, b: Vector3) -> Vector3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn vector_dot(a: Vector3, b: Vector3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn vector_cross(a: Vector3, b: Vector3) -> Vector3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn vector_mul_scalar(v: Vector3, s: f32) -> Vector3 {
    [v[0] * s, v[1] * s, v[2] * s]
}

pub fn vector_mag(v: Vector3) -> f32 {
    vector_dot(v, v).sqrt()
}

pub fn vector_unit(v: Vector3) -> Vector3 {
    let mag = vector_mag(v);
    if mag == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    vector_mul_scalar(v, 1.0 / mag)
}
