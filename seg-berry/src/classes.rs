//! 类别查找表.
//!
//! 三个层级的类别:
//!
//! 1. **网格类别**: 网格节点 alpha 向量的分量;
//! 2. **类别**: 由查找表把若干网格类别合并 (alpha 相加) 而来, 后验按类别输出;
//! 3. **高斯参数组**: 由独立参数查找表把若干类别归为一组, 组内共享同一组均值/协方差.
//!
//! 一组内只有一个类别时, 该类别是 [`ClassKind::Pure`];
//! 否则组内每个类别都是 [`ClassKind::SplitChild`], 其相对权重可以单独重估.

use ndarray::{Array4, Axis, Zip};

use crate::{ConfigError, ProbabilityVolumes};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 类别类型.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
    /// 独占一组高斯参数.
    Pure {
        /// 所属高斯参数组.
        group: usize,
    },

    /// 与其它类别共享一组高斯参数.
    SplitChild {
        /// 所属高斯参数组.
        group: usize,
        /// 组内类别个数 (包括自身), 至少为 2.
        siblings: usize,
    },
}

impl ClassKind {
    /// 所属高斯参数组.
    #[inline]
    pub fn group(&self) -> usize {
        match *self {
            ClassKind::Pure { group } | ClassKind::SplitChild { group, .. } => group,
        }
    }

    /// 是否为共享参数的子类别.
    #[inline]
    pub fn is_split_child(&self) -> bool {
        matches!(self, Self::SplitChild { .. })
    }
}

/// 网格类别 -> 类别 -> 高斯参数组 的两级映射.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassMapping {
    /// 网格类别 -> 类别.
    lookup: Vec<usize>,

    /// 类别 -> 高斯参数组.
    independent: Vec<usize>,

    /// 高斯参数组 -> 类别 (升序).
    members: Vec<Vec<usize>>,

    class_count: usize,
}

impl ClassMapping {
    /// 两级均为恒等映射.
    pub fn identity(mesh_class_count: usize) -> Self {
        let id: Vec<usize> = (0..mesh_class_count).collect();
        Self {
            lookup: id.clone(),
            members: id.iter().map(|&c| vec![c]).collect(),
            independent: id,
            class_count: mesh_class_count,
        }
    }

    /// 由两张查找表构建映射. 任一表为空时视为恒等映射.
    ///
    /// `lookup[m]` 是网格类别 `m` 所属的类别, `independent[c]` 是类别 `c`
    /// 所属的高斯参数组. 要求: 表长正确, 且两个映射都是满射
    /// (每个类别至少有一个网格类别, 每组至少有一个类别).
    pub fn new(
        mesh_class_count: usize,
        lookup: &[usize],
        independent: &[usize],
    ) -> Result<Self, ConfigError> {
        if mesh_class_count == 0 {
            return Err(ConfigError::InvalidLookupTable("网格类别数为 0".into()));
        }
        let lookup: Vec<usize> = if lookup.is_empty() {
            (0..mesh_class_count).collect()
        } else {
            lookup.to_vec()
        };
        if lookup.len() != mesh_class_count {
            return Err(ConfigError::InvalidLookupTable(format!(
                "查找表长度 {} 与网格类别数 {mesh_class_count} 不一致",
                lookup.len()
            )));
        }
        let class_count = Self::check_surjective(&lookup, "类别")?;

        let independent: Vec<usize> = if independent.is_empty() {
            (0..class_count).collect()
        } else {
            independent.to_vec()
        };
        if independent.len() != class_count {
            return Err(ConfigError::InvalidLookupTable(format!(
                "独立参数查找表长度 {} 与类别数 {class_count} 不一致",
                independent.len()
            )));
        }
        let group_count = Self::check_surjective(&independent, "高斯参数组")?;

        let mut members = vec![Vec::new(); group_count];
        for (c, &g) in independent.iter().enumerate() {
            members[g].push(c);
        }

        Ok(Self {
            lookup,
            independent,
            members,
            class_count,
        })
    }

    /// 检查 `table` 的值域恰好是 `0..n`, 返回 `n`.
    fn check_surjective(table: &[usize], what: &str) -> Result<usize, ConfigError> {
        let n = table.iter().max().map_or(0, |m| m + 1);
        let mut hit = vec![false; n];
        for &t in table {
            hit[t] = true;
        }
        match hit.iter().position(|h| !h) {
            Some(missing) => Err(ConfigError::InvalidLookupTable(format!(
                "{what} {missing} 没有任何来源"
            ))),
            None => Ok(n),
        }
    }

    /// 网格类别数.
    #[inline]
    pub fn mesh_class_count(&self) -> usize {
        self.lookup.len()
    }

    /// 类别数.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// 高斯参数组数.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.members.len()
    }

    /// 网格类别 `m` 所属的类别.
    #[inline]
    pub fn class_of_mesh_class(&self, m: usize) -> usize {
        self.lookup[m]
    }

    /// 类别 `c` 所属的高斯参数组.
    #[inline]
    pub fn group_of_class(&self, c: usize) -> usize {
        self.independent[c]
    }

    /// 高斯参数组 `g` 中的所有类别 (升序).
    #[inline]
    pub fn classes_in_group(&self, g: usize) -> &[usize] {
        &self.members[g]
    }

    /// 类别 `c` 的类型.
    pub fn kind(&self, c: usize) -> ClassKind {
        let group = self.independent[c];
        match self.members[group].len() {
            1 => ClassKind::Pure { group },
            siblings => ClassKind::SplitChild { group, siblings },
        }
    }

    /// 是否存在共享参数的高斯参数组.
    pub fn has_shared_groups(&self) -> bool {
        self.members.iter().any(|m| m.len() > 1)
    }

    /// 类别 `c` 包含的所有网格类别 (升序).
    pub fn mesh_classes_of(&self, c: usize) -> Vec<usize> {
        (0..self.lookup.len())
            .filter(|&m| self.lookup[m] == c)
            .collect()
    }

    /// 把一个网格类别 alpha 向量合并为类别先验向量 (按查找表求和).
    pub fn merge_alphas<'a>(&self, alphas: impl IntoIterator<Item = &'a f64>, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.class_count);
        out.iter_mut().for_each(|o| *o = 0.0);
        for (m, a) in alphas.into_iter().enumerate() {
            out[self.lookup[m]] += *a;
        }
    }

    /// 均匀的组内相对权重: 每个类别为 `1 / 组内类别数`.
    pub fn uniform_relative_weights(&self) -> Vec<f64> {
        (0..self.class_count)
            .map(|c| 1.0 / self.members[self.independent[c]].len() as f64)
            .collect()
    }

    /// 把逐类别概率体按组求和, 得到逐高斯参数组的概率体.
    pub fn group_volumes(&self, classes: &ProbabilityVolumes) -> ProbabilityVolumes {
        debug_assert_eq!(classes.class_count(), self.class_count);
        let (x, y, z) = classes.shape();
        let mut out = Array4::zeros((self.group_count(), x, y, z));
        for (c, vol) in classes.data().axis_iter(Axis(0)).enumerate() {
            let mut dst = out.index_axis_mut(Axis(0), self.independent[c]);
            Zip::from(&mut dst).and(&vol).for_each(|d, &v| *d += v);
        }
        ProbabilityVolumes::from_array(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_empty() {
        let m = ClassMapping::new(3, &[], &[]).unwrap();
        assert_eq!(m, ClassMapping::identity(3));
        assert_eq!(m.group_count(), 3);
        assert_eq!(m.kind(1), ClassKind::Pure { group: 1 });
        assert!(!m.has_shared_groups());
    }

    #[test]
    fn test_shared_groups() {
        // 网格类别 0,1 -> 类别 0; 2 -> 1; 3 -> 2. 类别 1,2 共享组 1.
        let m = ClassMapping::new(4, &[0, 0, 1, 2], &[0, 1, 1]).unwrap();
        assert_eq!(m.class_count(), 3);
        assert_eq!(m.group_count(), 2);
        assert_eq!(m.classes_in_group(1), &[1, 2]);
        assert_eq!(m.kind(0), ClassKind::Pure { group: 0 });
        assert_eq!(
            m.kind(2),
            ClassKind::SplitChild {
                group: 1,
                siblings: 2
            }
        );
        assert_eq!(m.mesh_classes_of(0), vec![0, 1]);
        assert_eq!(m.uniform_relative_weights(), vec![1.0, 0.5, 0.5]);

        let mut out = [0.0; 3];
        m.merge_alphas(&[0.1, 0.2, 0.3, 0.4], &mut out);
        assert!((out[0] - 0.3).abs() < 1e-12);
        assert!((out[2] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_tables() {
        // 类别 1 没有来源.
        assert!(ClassMapping::new(3, &[0, 2, 2], &[]).is_err());
        // 长度错误.
        assert!(ClassMapping::new(3, &[0, 1], &[]).is_err());
        assert!(ClassMapping::new(2, &[0, 1], &[0]).is_err());
        // 组 1 没有来源.
        assert!(ClassMapping::new(2, &[0, 1], &[0, 2]).is_err());
    }

    #[test]
    fn test_group_volumes() {
        let m = ClassMapping::new(3, &[], &[0, 0, 1]).unwrap();
        let mut p = ProbabilityVolumes::zeros(3, (1, 1, 2));
        p.data_mut()[[0, 0, 0, 0]] = 0.2;
        p.data_mut()[[1, 0, 0, 0]] = 0.3;
        p.data_mut()[[2, 0, 0, 0]] = 0.5;
        let g = m.group_volumes(&p);
        assert_eq!(g.class_count(), 2);
        assert!((g.voxel((0, 0, 0))[0] - 0.5).abs() < 1e-12);
        assert!((g.voxel((0, 0, 0))[1] - 0.5).abs() < 1e-12);
    }
}
