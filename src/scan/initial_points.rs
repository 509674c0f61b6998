//! Named initial point layouts in unit-cube coordinates.
//!
//! Layouts seed the campaign before the surrogate model is trusted. Fixed layouts
//! are listed verbatim; the sampled ones (`random_2D_50`, `latin_hypercube`,
//! `sobol`, `halton`) are generated on request.

use rand::seq::SliceRandom;
use rand::Rng;

/// All layout names accepted by `scanning.initial_points`.
pub const NAMES: &[&str] = &[
    "center_2D",
    "border_2D_8",
    "border_2D_16",
    "grid_2D_9",
    "grid_2D_25",
    "hexgrid_2D_13",
    "hexgrid_2D_19",
    "center_3D",
    "border_3D_25",
    "grid_3D_27",
    "random_2D_50",
    "latin_hypercube",
    "sobol",
    "halton",
];

const CENTER_2D: &[[f64; 2]] = &[[0.5, 0.5]];

const BORDER_2D_8: &[[f64; 2]] = &[
    [0.0, 0.0],
    [0.0, 0.5],
    [0.0, 1.0],
    [0.5, 1.0],
    [1.0, 1.0],
    [1.0, 0.5],
    [1.0, 0.0],
    [0.5, 0.0],
];

const BORDER_2D_16: &[[f64; 2]] = &[
    [0.0, 0.0],
    [0.0, 0.25],
    [0.0, 0.5],
    [0.0, 0.75],
    [0.0, 1.0],
    [0.25, 1.0],
    [0.5, 1.0],
    [0.75, 1.0],
    [1.0, 1.0],
    [1.0, 0.75],
    [1.0, 0.5],
    [1.0, 0.25],
    [1.0, 0.0],
    [0.75, 0.0],
    [0.5, 0.0],
    [0.25, 0.0],
];

const GRID_2D_9_CENTER: &[[f64; 2]] = &[[0.5, 0.5]];

const GRID_2D_25_INNER: &[[f64; 2]] = &[
    [0.5, 0.5],
    [0.5, 0.25],
    [0.5, 0.75],
    [0.25, 0.5],
    [0.75, 0.5],
    [0.25, 0.25],
    [0.25, 0.75],
    [0.75, 0.25],
    [0.75, 0.75],
];

const HEXGRID_2D_13: &[[f64; 2]] = &[
    [0.0, 0.5],
    [0.0, 1.0],
    [0.25, 0.75],
    [0.25, 0.25],
    [0.5, 0.0],
    [0.5, 0.5],
    [0.5, 1.0],
    [0.75, 0.75],
    [0.75, 0.25],
    [1.0, 0.0],
    [1.0, 0.5],
    [1.0, 1.0],
    [0.0, 0.0],
];

const HEXGRID_2D_19: &[[f64; 2]] = &[
    [0.0, 0.0],
    [0.0, 0.5],
    [0.0, 1.0],
    [0.25, 0.75],
    [0.25, 0.25],
    [0.5, 0.0],
    [0.5, 0.5],
    [0.5, 1.0],
    [0.75, 0.75],
    [0.75, 0.25],
    [1.0, 0.0],
    [1.0, 0.5],
    [1.0, 1.0],
    [0.25, 0.5],
    [0.5, 0.25],
    [0.5, 0.75],
    [0.75, 0.5],
    [0.5, 0.5],
    [0.5, 0.5],
];

const CENTER_3D: &[[f64; 3]] = &[[0.5, 0.5, 0.5]];

const BORDER_3D_25: &[[f64; 3]] = &[
    [0.0, 0.0, 0.0],
    [0.0, 0.0, 0.5],
    [0.0, 0.0, 1.0],
    [0.0, 0.5, 1.0],
    [0.0, 1.0, 1.0],
    [0.0, 1.0, 0.5],
    [0.0, 1.0, 0.0],
    [0.0, 0.5, 0.0],
    [0.5, 0.0, 0.0],
    [0.5, 0.0, 0.5],
    [0.5, 0.0, 1.0],
    [0.5, 0.5, 1.0],
    [0.5, 1.0, 1.0],
    [0.5, 1.0, 0.5],
    [0.5, 1.0, 0.0],
    [0.5, 0.5, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 0.0, 0.5],
    [1.0, 0.0, 1.0],
    [1.0, 0.5, 1.0],
    [1.0, 1.0, 1.0],
    [1.0, 1.0, 0.5],
    [1.0, 1.0, 0.0],
    [1.0, 0.5, 0.0],
    [0.5, 0.5, 0.5],
];

const GRID_3D_27_EXTRA: &[[f64; 3]] = &[[0.5, 0.5, 0.25], [0.5, 0.5, 0.75]];

/// Whether `name` is a known initial point layout.
pub fn is_known(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Resolve a layout by name. Returns `None` for unknown names.
pub fn layout(name: &str) -> Option<Vec<Vec<f64>>> {
    let points = match name {
        "center_2D" => to_vecs(CENTER_2D),
        "border_2D_8" => to_vecs(BORDER_2D_8),
        "border_2D_16" => to_vecs(BORDER_2D_16),
        "grid_2D_9" => [to_vecs(BORDER_2D_8), to_vecs(GRID_2D_9_CENTER)].concat(),
        "grid_2D_25" => [to_vecs(BORDER_2D_16), to_vecs(GRID_2D_25_INNER)].concat(),
        "hexgrid_2D_13" => to_vecs(HEXGRID_2D_13),
        "hexgrid_2D_19" => to_vecs(HEXGRID_2D_19),
        "center_3D" => to_vecs(CENTER_3D),
        "border_3D_25" => to_vecs(BORDER_3D_25),
        "grid_3D_27" => [to_vecs(BORDER_3D_25), to_vecs(GRID_3D_27_EXTRA)].concat(),
        "random_2D_50" => random_uniform(50, 2, &mut rand::thread_rng()),
        "latin_hypercube" => latin_hypercube(50, 2, &mut rand::thread_rng()),
        "sobol" => sobol_2d(64),
        "halton" => halton(50, 2),
        _ => return None,
    };
    Some(points)
}

fn to_vecs<const D: usize>(points: &[[f64; D]]) -> Vec<Vec<f64>> {
    points.iter().map(|p| p.to_vec()).collect()
}

fn random_uniform<R: Rng>(n: usize, dim: usize, rng: &mut R) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen::<f64>()).collect())
        .collect()
}

/// One sample per stratum on every axis, strata shuffled independently per axis.
fn latin_hypercube<R: Rng>(n: usize, dim: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut points = vec![vec![0.0; dim]; n];
    for d in 0..dim {
        let mut strata: Vec<usize> = (0..n).collect();
        strata.shuffle(rng);
        for (point, stratum) in points.iter_mut().zip(strata) {
            point[d] = (stratum as f64 + rng.gen::<f64>()) / n as f64;
        }
    }
    points
}

fn radical_inverse(mut index: u64, base: u64) -> f64 {
    let mut result = 0.0;
    let mut fraction = 1.0 / base as f64;
    while index > 0 {
        result += (index % base) as f64 * fraction;
        index /= base;
        fraction /= base as f64;
    }
    result
}

/// Unscrambled Halton sequence starting at index 0.
fn halton(n: usize, dim: usize) -> Vec<Vec<f64>> {
    const PRIMES: [u64; 6] = [2, 3, 5, 7, 11, 13];
    (0..n as u64)
        .map(|i| PRIMES.iter().take(dim).map(|&b| radical_inverse(i, b)).collect())
        .collect()
}

/// Unscrambled two-dimensional Sobol points.
///
/// The first dimension is the base-2 van der Corput sequence; the second uses the
/// primitive polynomial `x + 1` (direction numbers `m_k = 2 m_{k-1} ^ m_{k-1}`).
fn sobol_2d(n: usize) -> Vec<Vec<f64>> {
    const BITS: usize = 32;
    let mut directions = [0u64; BITS];
    let mut m: u64 = 1;
    for (k, v) in directions.iter_mut().enumerate() {
        if k > 0 {
            m = (m << 1) ^ m;
        }
        // v_k = m_k / 2^(k+1), kept as a 32-bit fixed point fraction
        *v = m << (BITS - 1 - k);
    }
    let scale = (1u64 << BITS) as f64;
    (0..n as u64)
        .map(|i| {
            let mut y = 0u64;
            for (k, v) in directions.iter().enumerate() {
                if (i >> k) & 1 == 1 {
                    y ^= v;
                }
            }
            y &= (1u64 << BITS) - 1;
            vec![radical_inverse(i, 2), y as f64 / scale]
        })
        .collect()
}
