/// Small numeric helpers for the exploratory outputs of the DE stage
use ndarray::{Array1, Array2, Axis};

const POWER_ITERATIONS: usize = 500;
const EPSILON: f64 = 1e-12;


/// log2 counts-per-million with a pseudocount of 1. Input is genes x samples.
pub fn log2_cpm(counts: &Array2<f64>) -> Array2<f64> {
    let mut out = counts.clone();
    for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
        let library: f64 = counts.column(j).sum();
        let scale = if library > 0.0 { 1e6 / library } else { 0.0 };
        column.mapv_inplace(|c| (c * scale + 1.0).log2());
    }
    out
}


#[derive(Debug, Clone)]
pub struct PcaResult {
    /// Samples x 2 component scores.
    pub scores: Array2<f64>,
    /// Fraction of total variance per component.
    pub explained: [f64; 2],
}


fn dominant_eigen(matrix: &Array2<f64>) -> (f64, Array1<f64>) {
    let n = matrix.nrows();
    let mut v = Array1::from_iter((1..=n).map(|i| i as f64));
    let norm = v.dot(&v).sqrt();
    v /= norm;

    let mut lambda = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let next = matrix.dot(&v);
        let norm = next.dot(&next).sqrt();
        if norm < EPSILON {
            return (0.0, Array1::zeros(n));
        }
        let next = next / norm;
        let delta = (&next - &v).mapv(f64::abs).sum();
        v = next;
        lambda = v.dot(&matrix.dot(&v));
        if delta < 1e-10 {
            break;
        }
    }
    (lambda, v)
}


/// First two principal components of the rows of `data` (samples x features),
/// computed from the sample Gram matrix by power iteration with deflation.
pub fn pca(data: &Array2<f64>) -> PcaResult {
    let n = data.nrows();
    let mut scores = Array2::zeros((n, 2));
    if n == 0 {
        return PcaResult { scores, explained: [0.0, 0.0] };
    }
    let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()));
    let centered = data - &mean;
    let mut gram = centered.dot(&centered.t());
    let total: f64 = gram.diag().sum();

    let mut explained = [0.0, 0.0];
    for k in 0..2 {
        let (lambda, mut v) = dominant_eigen(&gram);
        if lambda <= EPSILON {
            break;
        }
        // Sign convention: largest loading positive.
        let pivot = v.iter().cloned().fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            v.mapv_inplace(|x| -x);
        }
        let outer = v
            .view()
            .insert_axis(Axis(1))
            .dot(&v.view().insert_axis(Axis(0)));
        gram = gram - outer * lambda;
        scores.column_mut(k).assign(&(&v * lambda.sqrt()));
        explained[k] = if total > EPSILON { lambda / total } else { 0.0 };
    }
    PcaResult { scores, explained }
}


/// Pairwise Euclidean distances between rows.
pub fn euclidean_distances(data: &Array2<f64>) -> Array2<f64> {
    let n = data.nrows();
    let mut dist = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = &data.row(i) - &data.row(j);
            let d = diff.dot(&diff).sqrt();
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}


/// One agglomeration step. Leaves are `0..n`, merged clusters get `n + step`.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    pub size: usize,
}


/// Average-linkage (UPGMA) hierarchical clustering over a distance matrix.
pub fn average_linkage(dist: &Array2<f64>) -> Vec<Merge> {
    let n = dist.nrows();
    let mut clusters: Vec<(usize, Vec<usize>)> = (0..n).map(|i| (i, vec![i])).collect();
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while clusters.len() > 1 {
        let mut best = (0, 1, f64::INFINITY);
        for a in 0..clusters.len() {
            for b in (a + 1)..clusters.len() {
                let members_a = &clusters[a].1;
                let members_b = &clusters[b].1;
                let sum: f64 = members_a
                    .iter()
                    .flat_map(|&i| members_b.iter().map(move |&j| dist[[i, j]]))
                    .sum();
                let avg = sum / (members_a.len() * members_b.len()) as f64;
                if avg < best.2 {
                    best = (a, b, avg);
                }
            }
        }
        let (a, b, distance) = best;
        let (right_id, right_members) = clusters.remove(b);
        let (left_id, mut members) = clusters.remove(a);
        members.extend(right_members);
        merges.push(Merge { left: left_id, right: right_id, distance, size: members.len() });
        clusters.push((n + merges.len() - 1, members));
    }
    merges
}
