//! The low-rank update: a rank-k factorization of the delta.
//!
//! For a 2-D (or higher, folded to 2-D) parameter the delta `new - prev` is
//! factored as `R (m x k)` times `C (k x n)`. When no rank is configured it
//! is inferred as the number of singular values above a small threshold in an
//! SVD of the delta. 1-D parameters store the dense delta instead; a
//! factorization buys nothing there.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use theta_lsh::Signature;
use theta_tensor::{Dtype, Tensor};

use crate::error::{Result, ThetaError};
use crate::metadata::LfsMetadata;
use crate::metadata::ParamMetadata;
use crate::updates::{
    fetch_group, load_value_at_commit, require_prior_value, store_group, Update, UpdateContext,
    UpdateData,
};
use crate::utils::ParamName;

pub const NAME: &str = "low-rank";

/// Singular values below this are treated as numerical noise when inferring
/// the rank.
const RANK_THRESHOLD: f64 = 1e-11;

/// An update stored as two low-rank factor matrices.
#[derive(Debug, Default)]
pub struct LowRankUpdate {
    rank: Option<usize>,
    data: Option<Arc<UpdateData>>,
}

impl LowRankUpdate {
    pub fn new(data: Option<Arc<UpdateData>>) -> Self {
        Self { rank: None, data }
    }

    /// Force a fixed rank instead of inferring one.
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    fn factor_delta(&self, delta: &Tensor) -> Result<(Tensor, Tensor)> {
        let (m, n) = (delta.shape()[0], delta.shape()[1]);
        let (u, s, vt) = svd(&delta.to_f64s(), m, n);
        let k = match self.rank {
            Some(k) => k.min(s.len()),
            None => s.iter().filter(|sv| **sv > RANK_THRESHOLD).count(),
        };
        tracing::debug!(rank = k, rows = m, cols = n, "factoring low-rank delta");

        // R = U[:, :k], C = diag(S[:k]) . Vt[:k, :].
        let r_min = s.len();
        let mut r = vec![0.0; m * k];
        for i in 0..m {
            for j in 0..k {
                r[i * k + j] = u[i * r_min + j];
            }
        }
        let mut c = vec![0.0; k * n];
        for j in 0..k {
            for l in 0..n {
                c[j * n + l] = s[j] * vt[j * n + l];
            }
        }
        Ok((
            Tensor::from_f64s(vec![m, k], Dtype::F64, &r)?,
            Tensor::from_f64s(vec![k, n], Dtype::F64, &c)?,
        ))
    }
}

#[async_trait]
impl Update for LowRankUpdate {
    fn name(&self) -> &'static str {
        NAME
    }

    fn will_update(&self, name: &ParamName) -> bool {
        self.data.as_ref().is_some_and(|d| d.covers(name))
    }

    async fn write(
        &self,
        new_value: &Tensor,
        name: &ParamName,
        prev: Option<&ParamMetadata>,
        ctx: &UpdateContext,
    ) -> Result<(LfsMetadata, Option<Signature>)> {
        let prev_value = require_prior_value(prev, name, ctx).await?;

        let group: BTreeMap<String, Tensor>;
        let reconstructed: Tensor;
        if let Some(fields) = self
            .data
            .as_ref()
            .filter(|d| d.covers(name))
            .map(|d| d.fields_for(name))
        {
            // Side-loaded factors: apply them to the prior value; the
            // checkpoint's own tensor for this parameter is stale.
            let missing = |key: &str| {
                ThetaError::metadata_decode(
                    Some(&ctx.path),
                    Some(&name.to_string()),
                    format!("side-loaded low-rank update is missing {key:?}"),
                )
            };
            if let Some(delta) = fields.get("delta") {
                reconstructed = prev_value.add(delta)?;
            } else {
                let r = fields.get("R").ok_or_else(|| missing("R"))?;
                let c = fields.get("C").ok_or_else(|| missing("C"))?;
                reconstructed = apply_factors(&prev_value, r, c)?;
            }
            group = fields;
        } else if new_value.ndim() < 2 || new_value.numel() == 0 {
            let delta = new_value.sub(&prev_value)?;
            reconstructed = prev_value.add(&delta)?;
            group = BTreeMap::from([("delta".to_string(), delta)]);
        } else {
            // Fold any higher-rank parameter into a (leading axis, rest)
            // matrix before factoring.
            let delta = new_value.sub(&prev_value)?;
            let m = delta.shape()[0];
            let n = delta.numel() / m;
            let folded = Tensor::from_f64s(vec![m, n], Dtype::F64, &delta.to_f64s())?;
            let (r, c) = self.factor_delta(&folded)?;
            reconstructed = apply_factors(&prev_value, &r, &c)?;
            group = BTreeMap::from([("R".to_string(), r), ("C".to_string(), c)]);
        }

        let lfs = store_group(&group, ctx).await?;
        Ok((lfs, Some(ctx.lsh.hash(&reconstructed.to_f64s()))))
    }

    async fn apply(
        &self,
        record: &ParamMetadata,
        name: &ParamName,
        ctx: &UpdateContext,
    ) -> Result<Tensor> {
        tracing::debug!(param = %name, "applying low-rank update");
        let group = fetch_group(record, ctx).await?;
        let prev_value =
            load_value_at_commit(&record.theta_metadata.last_commit, name, ctx).await?;
        if let Some(delta) = group.get("delta") {
            return prev_value.add(delta).map_err(Into::into);
        }
        let missing = |key: &str| {
            ThetaError::metadata_decode(
                Some(&ctx.path),
                Some(&name.to_string()),
                format!("low-rank blob is missing {key:?}"),
            )
        };
        let r = group.get("R").ok_or_else(|| missing("R"))?;
        let c = group.get("C").ok_or_else(|| missing("C"))?;
        apply_factors(&prev_value, r, c)
    }
}

/// `prev + R . C`, reshaping the product back to `prev`'s shape so folded
/// higher-rank parameters reconstruct correctly.
fn apply_factors(prev: &Tensor, r: &Tensor, c: &Tensor) -> Result<Tensor> {
    let product = r.matmul(c)?;
    if product.numel() != prev.numel() {
        return Err(ThetaError::Tensor(
            theta_tensor::TensorError::DimensionMismatch {
                lhs: prev.shape().to_vec(),
                rhs: product.shape().to_vec(),
            },
        ));
    }
    let values: Vec<f64> = prev
        .to_f64s()
        .iter()
        .zip(product.to_f64s())
        .map(|(p, d)| p + d)
        .collect();
    prev.with_values(&values).map_err(Into::into)
}

/// Thin SVD `A = U . diag(S) . Vt` by one-sided Jacobi rotations.
///
/// Input is row-major `m x n`; outputs are row-major `U (m x r)`, `S (r)`,
/// `Vt (r x n)` with `r = min(m, n)`, singular values descending. Jacobi is
/// slower than bidiagonalization but unconditionally stable and dependency
/// free, and deltas are factored once per commit.
fn svd(a: &[f64], m: usize, n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if m < n {
        // SVD of the transpose, then swap the roles of U and V.
        let mut at = vec![0.0; n * m];
        for i in 0..m {
            for j in 0..n {
                at[j * m + i] = a[i * n + j];
            }
        }
        let (ut, s, vtt) = svd(&at, n, m);
        let r = s.len();
        // A = (At)^T = (Ut S Vtt)^T = Vtt^T S Ut^T.
        let mut u = vec![0.0; m * r];
        for i in 0..m {
            for j in 0..r {
                u[i * r + j] = vtt[j * m + i];
            }
        }
        let mut vt = vec![0.0; r * n];
        for j in 0..r {
            for i in 0..n {
                vt[j * n + i] = ut[i * r + j];
            }
        }
        return (u, s, vt);
    }

    // Column-major working copy of A; columns are orthogonalized in place.
    let mut w = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            w[j * m + i] = a[i * n + j];
        }
    }
    // V accumulates the rotations, column-major n x n identity to start.
    let mut v = vec![0.0; n * n];
    for j in 0..n {
        v[j * n + j] = 1.0;
    }

    let eps = 1e-13;
    for _sweep in 0..60 {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let (wp, wq) = (p * m, q * m);
                let mut alpha = 0.0;
                let mut beta = 0.0;
                let mut gamma = 0.0;
                for i in 0..m {
                    alpha += w[wp + i] * w[wp + i];
                    beta += w[wq + i] * w[wq + i];
                    gamma += w[wp + i] * w[wq + i];
                }
                if gamma.abs() <= eps * (alpha * beta).sqrt() || gamma == 0.0 {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for i in 0..m {
                    let (wi, wj) = (w[wp + i], w[wq + i]);
                    w[wp + i] = c * wi - s * wj;
                    w[wq + i] = s * wi + c * wj;
                }
                for i in 0..n {
                    let (vi, vj) = (v[p * n + i], v[q * n + i]);
                    v[p * n + i] = c * vi - s * vj;
                    v[q * n + i] = s * vi + c * vj;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    // Singular values are the column norms; sort them descending.
    let mut order: Vec<usize> = (0..n).collect();
    let norms: Vec<f64> = (0..n)
        .map(|j| (0..m).map(|i| w[j * m + i] * w[j * m + i]).sum::<f64>().sqrt())
        .collect();
    order.sort_by(|a, b| norms[*b].total_cmp(&norms[*a]));

    let mut u = vec![0.0; m * n];
    let mut s = vec![0.0; n];
    let mut vt = vec![0.0; n * n];
    for (rank, &j) in order.iter().enumerate() {
        let sigma = norms[j];
        s[rank] = sigma;
        if sigma > 0.0 {
            for i in 0..m {
                u[i * n + rank] = w[j * m + i] / sigma;
            }
        }
        for i in 0..n {
            vt[rank * n + i] = v[j * n + i];
        }
    }
    (u, s, vt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::testing::{commit_dense, context};

    fn reconstruct(u: &[f64], s: &[f64], vt: &[f64], m: usize, n: usize) -> Vec<f64> {
        let r = s.len();
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for k in 0..r {
                    out[i * n + j] += u[i * r + k] * s[k] * vt[k * n + j];
                }
            }
        }
        out
    }

    #[test]
    fn svd_reconstructs_small_matrix() {
        let a = vec![4.0, 0.0, 3.0, -5.0, 1.0, 2.0];
        for (m, n) in [(3, 2), (2, 3)] {
            let (u, s, vt) = svd(&a, m, n);
            let back = reconstruct(&u, &s, &vt, m, n);
            for (x, y) in a.iter().zip(&back) {
                assert!((x - y).abs() < 1e-9, "{m}x{n}: {x} vs {y}");
            }
            assert!(s.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn svd_detects_exact_rank() {
        // Outer product of two vectors: rank one.
        let x = [1.0, -2.0, 0.5, 3.0];
        let y = [2.0, 1.0, 0.0];
        let mut a = vec![0.0; 12];
        for i in 0..4 {
            for j in 0..3 {
                a[i * 3 + j] = x[i] * y[j];
            }
        }
        let (_, s, _) = svd(&a, 4, 3);
        assert!(s[0] > 1.0);
        assert!(s[1] < RANK_THRESHOLD);
    }

    #[tokio::test]
    async fn rank_two_delta_round_trips() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("W");
        let dim = 16;
        let base: Vec<f64> = (0..dim * dim).map(|i| ((i * 7) % 13) as f64 * 0.1).collect();
        let prev = Tensor::from_f64(vec![dim, dim], &base).unwrap();
        let prev_record = commit_dense(&ctx, &repo, &"3".repeat(40), &name, &prev).await;

        // new = prev + R.C with k = 2.
        let r: Vec<f64> = (0..dim * 2).map(|i| ((i % 5) as f64 - 2.0) * 0.3).collect();
        let c: Vec<f64> = (0..2 * dim).map(|i| ((i % 7) as f64 - 3.0) * 0.2).collect();
        let rt = Tensor::from_f64(vec![dim, 2], &r).unwrap();
        let ct = Tensor::from_f64(vec![2, dim], &c).unwrap();
        let new = prev.add(&rt.matmul(&ct).unwrap()).unwrap();

        let handler = LowRankUpdate::new(None);
        let (lfs, hash) = handler
            .write(&new, &name, Some(&prev_record), &ctx)
            .await
            .unwrap();

        // Stored factors have the inferred rank 2.
        let blob = ctx.store.smudge(&lfs.to_pointer()).await.unwrap();
        let group = ctx.serializer.deserialize(&blob).unwrap();
        assert_eq!(group["R"].shape(), &[dim, 2]);
        assert_eq!(group["C"].shape(), &[2, dim]);

        let record = crate::metadata::param_metadata(
            crate::metadata::tensor_metadata_with_hash(&new, hash.unwrap()),
            lfs,
            NAME,
            &"3".repeat(40),
        );
        let applied = handler.apply(&record, &name, &ctx).await.unwrap();
        assert!(applied.allclose(&new, 1e-6, 1e-9));
    }

    #[tokio::test]
    async fn one_dimensional_stores_dense_delta() {
        let (ctx, repo, _store) = context();
        let name = ParamName::from_path("bias");
        let prev = Tensor::from_f64(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let prev_record = commit_dense(&ctx, &repo, &"4".repeat(40), &name, &prev).await;
        let new = Tensor::from_f64(vec![3], &[1.5, 2.0, 2.0]).unwrap();

        let handler = LowRankUpdate::new(None);
        let (lfs, hash) = handler
            .write(&new, &name, Some(&prev_record), &ctx)
            .await
            .unwrap();
        let blob = ctx.store.smudge(&lfs.to_pointer()).await.unwrap();
        let group = ctx.serializer.deserialize(&blob).unwrap();
        assert!(group.contains_key("delta"));

        let record = crate::metadata::param_metadata(
            crate::metadata::tensor_metadata_with_hash(&new, hash.unwrap()),
            lfs,
            NAME,
            &"4".repeat(40),
        );
        let applied = handler.apply(&record, &name, &ctx).await.unwrap();
        assert!(applied.allclose(&new, 1e-9, 1e-12));
    }
}
