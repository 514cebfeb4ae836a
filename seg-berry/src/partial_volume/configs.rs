//! 体素组成配置: 纯类别与两类混合.

use crate::classes::ClassMapping;
use crate::mixture::{GaussianDensity, MixtureParameters};
use crate::posterior::log_sum_exp;
use crate::NumericalError;

/// 某个配置中, 由两类 `(a, b)` 组成、其中 `k` 个亚体素属于 `a` 的所有混合配置.
#[derive(Debug, Clone)]
pub(crate) struct PairFamily {
    pub a: usize,
    pub b: usize,
    /// 下标 `k - 1` 处为 `k` 个亚体素属于 `a` 时的混合高斯密度, `k = 1..N-1`.
    pub mixed: Vec<GaussianDensity>,
}

/// 所有配置的高斯密度表.
#[derive(Debug, Clone)]
pub(crate) struct ConfigTable {
    /// 每个体素的亚体素个数.
    pub n: usize,
    pub class_count: usize,
    /// 每个类别的纯配置密度. 所属组被排除时为 `None`.
    pub pure: Vec<Option<GaussianDensity>>,
    pub pairs: Vec<PairFamily>,
}

impl ConfigTable {
    pub fn new(
        n: usize,
        mixture: &MixtureParameters,
        mapping: &ClassMapping,
        excluded: &[bool],
    ) -> Result<Self, NumericalError> {
        let class_count = mapping.class_count();
        let allowed: Vec<bool> = (0..class_count)
            .map(|c| !excluded.get(mapping.group_of_class(c)).copied().unwrap_or(false))
            .collect();

        let mut pure = Vec::with_capacity(class_count);
        for c in 0..class_count {
            let g = mapping.group_of_class(c);
            pure.push(if allowed[c] {
                Some(GaussianDensity::new(mixture.group(g), g)?)
            } else {
                None
            });
        }

        let mut pairs = Vec::new();
        if n > 1 {
            for a in (0..class_count).filter(|&a| allowed[a]) {
                for b in (a + 1..class_count).filter(|&b| allowed[b]) {
                    let pa = mixture.group(mapping.group_of_class(a));
                    let pb = mixture.group(mapping.group_of_class(b));
                    let mixed = (1..n)
                        .map(|k| {
                            let params = pa.mixed(pb, k as f64 / n as f64);
                            GaussianDensity::new(&params, mapping.group_of_class(a))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    pairs.push(PairFamily { a, b, mixed });
                }
            }
        }

        Ok(Self {
            n,
            class_count,
            pure,
            pairs,
        })
    }

    /// 配置总数 (含不可能的配置).
    #[inline]
    pub fn len(&self) -> usize {
        self.class_count + self.pairs.len() * (self.n - 1)
    }

    /// 第 `p` 个两类族中 `k` 个亚体素属于 `a` 的配置的下标.
    #[inline]
    pub fn mixed_index(&self, p: usize, k: usize) -> usize {
        self.class_count + p * (self.n - 1) + (k - 1)
    }
}

/// `∏_s (π_s(a) x + π_s(b))` 的系数 (按 `x` 的升幂), 每个因子先除以其最大系数.
///
/// 返回所有因子最大系数的对数和; 某个亚体素上 `a`、`b` 先验都为 0 时返回 `None`.
/// `prior` 行优先, 形状为 `(亚体素, 类别)`.
pub(crate) fn pair_polynomial(
    prior: &[f64],
    class_count: usize,
    a: usize,
    b: usize,
    out: &mut Vec<f64>,
) -> Option<f64> {
    out.clear();
    out.push(1.0);
    let mut log_scale = 0.0;
    for row in prior.chunks_exact(class_count) {
        let (fa, fb, m) = scaled_factor(row[a], row[b])?;
        log_scale += m.ln();
        out.push(0.0);
        for k in (0..out.len()).rev() {
            let lower = if k > 0 { out[k - 1] * fa } else { 0.0 };
            out[k] = out[k] * fb + lower;
        }
    }
    Some(log_scale)
}

/// 归一化后的因子 `(π(a) / m, π(b) / m, m)`, `m = max(π(a), π(b))`.
#[inline]
fn scaled_factor(pa: f64, pb: f64) -> Option<(f64, f64, f64)> {
    let m = pa.max(pb);
    if m > 0.0 {
        Some((pa / m, pb / m, m))
    } else {
        None
    }
}

/// 一个体素上的配置求解器, 持有可复用的缓冲区.
#[derive(Debug)]
pub(crate) struct VoxelSolver<'a> {
    table: &'a ConfigTable,
    /// 每个配置的先验对数 (未归一化).
    pub log_prior: Vec<f64>,
    /// 每个配置的 `ln 先验 + ln 密度`.
    pub log_joint: Vec<f64>,
    /// 每个两类族的多项式系数 (已缩放).
    polys: Vec<Vec<f64>>,
}

/// 单个体素的求解结果.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VoxelFit {
    /// 配置先验的归一化常数的对数.
    pub log_prior_norm: f64,
    /// `ln Σ_cfg 先验 · 密度` (先验未归一化).
    pub log_evidence: f64,
}

impl VoxelFit {
    /// 该体素的对数边缘似然 (先验已归一化).
    #[inline]
    pub fn log_likelihood(&self) -> f64 {
        self.log_evidence - self.log_prior_norm
    }
}

impl<'a> VoxelSolver<'a> {
    pub fn new(table: &'a ConfigTable) -> Self {
        Self {
            table,
            log_prior: vec![f64::NEG_INFINITY; table.len()],
            log_joint: vec![f64::NEG_INFINITY; table.len()],
            polys: vec![Vec::with_capacity(table.n + 1); table.pairs.len()],
        }
    }

    /// 以亚体素先验 `prior` (形状 `(N, 类别)`, 行优先) 与强度 `y` 计算所有配置的
    /// 先验与联合概率. 没有任何可能配置时返回 `None`.
    pub fn solve(&mut self, prior: &[f64], y: &[f64]) -> Option<VoxelFit> {
        let t = self.table;
        let k_count = t.class_count;

        for c in 0..k_count {
            self.log_prior[c] = match &t.pure[c] {
                Some(_) => prior.chunks_exact(k_count).map(|row| row[c].ln()).sum::<f64>(),
                None => f64::NEG_INFINITY,
            };
        }
        for (p, fam) in t.pairs.iter().enumerate() {
            let poly = &mut self.polys[p];
            let scale = pair_polynomial(prior, k_count, fam.a, fam.b, poly);
            for k in 1..t.n {
                let i = t.mixed_index(p, k);
                self.log_prior[i] = match scale {
                    Some(s) if poly[k] > 0.0 => poly[k].ln() + s,
                    _ => f64::NEG_INFINITY,
                };
            }
        }

        let log_prior_norm = log_sum_exp(&self.log_prior);
        if !log_prior_norm.is_finite() {
            return None;
        }

        for c in 0..k_count {
            self.log_joint[c] = match &t.pure[c] {
                Some(d) if self.log_prior[c].is_finite() => self.log_prior[c] + d.log_density(y),
                _ => f64::NEG_INFINITY,
            };
        }
        for (p, fam) in t.pairs.iter().enumerate() {
            for k in 1..t.n {
                let i = t.mixed_index(p, k);
                self.log_joint[i] = if self.log_prior[i].is_finite() {
                    self.log_prior[i] + fam.mixed[k - 1].log_density(y)
                } else {
                    f64::NEG_INFINITY
                };
            }
        }
        Some(VoxelFit {
            log_prior_norm,
            log_evidence: log_sum_exp(&self.log_joint),
        })
    }

    /// 把配置权重 `weights` 折算为体素分辨率的类别概率:
    /// `post_c = w(纯 c) + Σ_{(a, b, k)} f_c · w(a, b, k)`.
    pub fn class_fractions(&self, weights: &[f64], out: &mut [f64]) {
        let t = self.table;
        out[..t.class_count].copy_from_slice(&weights[..t.class_count]);
        for (p, fam) in t.pairs.iter().enumerate() {
            for k in 1..t.n {
                let w = weights[t.mixed_index(p, k)];
                let f = k as f64 / t.n as f64;
                out[fam.a] += f * w;
                out[fam.b] += (1.0 - f) * w;
            }
        }
    }

    /// 把配置权重 `weights` 折算为每个亚体素的类别概率, 写入 `out` (形状 `(N, 类别)`).
    ///
    /// 对两类族 `(a, b)` 中 `k` 个亚体素属于 `a` 的配置, 亚体素 `s` 属于 `a` 的概率为
    /// `π_s(a) · [x^(k-1)] ∏_{t≠s} (π_t(a) x + π_t(b)) / [x^k] ∏_t (…)`.
    /// 调用前必须先以同一个 `prior` 调用过 [`Self::solve`].
    pub fn subvoxel_marginals(&self, prior: &[f64], weights: &[f64], out: &mut [f64]) {
        let t = self.table;
        let k_count = t.class_count;
        for row in out.chunks_exact_mut(k_count) {
            row.copy_from_slice(&weights[..k_count]);
        }

        let mut loo = Vec::with_capacity(t.n);
        for (p, fam) in t.pairs.iter().enumerate() {
            let full = &self.polys[p];
            if (1..t.n).all(|k| weights[t.mixed_index(p, k)] <= 0.0) {
                continue;
            }
            for s in 0..t.n {
                leave_one_out(prior, k_count, fam.a, fam.b, s, &mut loo);
                let Some((fa, _, _)) = scaled_factor(prior[s * k_count + fam.a], prior[s * k_count + fam.b])
                else {
                    continue;
                };
                let row = &mut out[s * k_count..(s + 1) * k_count];
                for k in 1..t.n {
                    let w = weights[t.mixed_index(p, k)];
                    if w <= 0.0 || full[k] <= 0.0 {
                        continue;
                    }
                    let pa = (fa * loo[k - 1] / full[k]).clamp(0.0, 1.0);
                    row[fam.a] += w * pa;
                    row[fam.b] += w * (1.0 - pa);
                }
            }
        }
    }
}

/// 去掉亚体素 `skip` 后的 [`pair_polynomial`] (同样的逐因子缩放).
fn leave_one_out(prior: &[f64], class_count: usize, a: usize, b: usize, skip: usize, out: &mut Vec<f64>) {
    out.clear();
    out.push(1.0);
    for (s, row) in prior.chunks_exact(class_count).enumerate() {
        if s == skip {
            continue;
        }
        let (fa, fb) = scaled_factor(row[a], row[b]).map_or((0.0, 0.0), |(fa, fb, _)| (fa, fb));
        out.push(0.0);
        for k in (0..out.len()).rev() {
            let lower = if k > 0 { out[k - 1] * fa } else { 0.0 };
            out[k] = out[k] * fb + lower;
        }
    }
}

/// 归一化配置权重: `exp(v - ln Σ exp(v))`.
pub(crate) fn normalized_weights(logs: &[f64], log_norm: f64, out: &mut [f64]) {
    for (o, l) in out.iter_mut().zip(logs) {
        *o = if l.is_finite() { (l - log_norm).exp() } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::GaussianParameters;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_pair_polynomial() {
        // (0.2x + 0.8)(0.5x + 0.5) = 0.1x² + 0.5x + 0.4
        let prior = [0.2, 0.8, 0.5, 0.5];
        let mut out = Vec::new();
        let scale = pair_polynomial(&prior, 2, 0, 1, &mut out).unwrap();
        let coeffs: Vec<f64> = out.iter().map(|c| c * scale.exp()).collect();
        assert!(f64_eq(coeffs[0], 0.4));
        assert!(f64_eq(coeffs[1], 0.5));
        assert!(f64_eq(coeffs[2], 0.1));

        assert!(pair_polynomial(&[0.0, 0.0, 1.0, 0.0], 2, 0, 1, &mut out).is_none());
    }

    fn two_class_table(n: usize) -> (ConfigTable, ClassMapping) {
        let mapping = ClassMapping::identity(2);
        let mixture = MixtureParameters::with_uniform_weights(
            vec![GaussianParameters::scalar(0.0, 1.0), GaussianParameters::scalar(10.0, 1.0)],
            &mapping,
        )
        .unwrap();
        (ConfigTable::new(n, &mixture, &mapping, &[false, false]).unwrap(), mapping)
    }

    #[test]
    fn test_mixed_voxel_posterior() {
        let (table, _) = two_class_table(2);
        assert_eq!(table.len(), 3);
        let mut solver = VoxelSolver::new(&table);
        let prior = [0.5, 0.5, 0.5, 0.5];
        // y = 5 正好是 (0, 1, k = 1) 混合高斯的均值.
        let fit = solver.solve(&prior, &[5.0]).unwrap();
        let mut w = vec![0.0; table.len()];
        normalized_weights(&solver.log_joint, fit.log_evidence, &mut w);
        assert!(w[2] > 0.99);

        let mut post = [0.0; 2];
        solver.class_fractions(&w, &mut post);
        assert!(f64_eq(post[0], 0.5));
        assert!(f64_eq(post[0] + post[1], 1.0));

        let mut sub = [0.0; 4];
        solver.subvoxel_marginals(&prior, &w, &mut sub);
        for row in sub.chunks_exact(2) {
            assert!(f64_eq(row[0] + row[1], 1.0));
            assert!(f64_eq(row[0], 0.5));
        }
    }

    #[test]
    fn test_subvoxel_marginals_follow_prior() {
        let (table, _) = two_class_table(2);
        let mut solver = VoxelSolver::new(&table);
        // 亚体素 0 更可能是类别 0.
        let prior = [0.9, 0.1, 0.1, 0.9];
        let fit = solver.solve(&prior, &[5.0]).unwrap();
        let mut w = vec![0.0; table.len()];
        normalized_weights(&solver.log_joint, fit.log_evidence, &mut w);
        let mut sub = [0.0; 4];
        solver.subvoxel_marginals(&prior, &w, &mut sub);
        assert!(sub[0] > 0.9);
        assert!(sub[3] > 0.9);
        // 混合配置中恰有一个亚体素属于类别 0, 两个亚体素之和为 1.
        assert!(f64_eq(sub[0] + sub[2], 1.0 + w[0] - w[1]));
    }

    #[test]
    fn test_identity_grid_has_no_pairs() {
        let (table, _) = two_class_table(1);
        assert!(table.pairs.is_empty());
        let mut solver = VoxelSolver::new(&table);
        let fit = solver.solve(&[0.3, 0.7], &[0.0]).unwrap();
        assert!(f64_eq(fit.log_prior_norm, 0.0));
        assert!(solver.solve(&[0.0, 0.0], &[0.0]).is_none());
    }
}
