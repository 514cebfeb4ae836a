//! 集成测试共用的合成数据.

#![allow(dead_code)]

use std::sync::Once;

use ndarray::Array3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use seg_berry::prelude::*;

static LOGGER: Once = Once::new();

/// 打开 debug 级别日志, 多次调用无副作用.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
    });
}

/// 固定种子的随机数发生器.
pub fn rng(seed: u64) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(seed)
}

/// 正态采样.
pub fn gaussian(rng: &mut impl Rng, mean: f64, std: f64) -> f64 {
    Normal::new(mean, std).unwrap().sample(rng)
}

/// 沿 x 轴分层的真值标签: `x < 3` 为 0, `3 <= x < 6` 为 1, 其余为 2.
pub fn layered_truth(shape: Idx3d) -> Array3<usize> {
    Array3::from_shape_fn(shape, |(x, _, _)| match x {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    })
}

/// 按真值标签取均值, 叠加标准差为 `std` 的噪声.
pub fn noisy_image(truth: &Array3<usize>, means: &[f64], std: f64, seed: u64) -> ChannelImage {
    let mut r = rng(seed);
    ChannelImage::new(truth.mapv(|l| gaussian(&mut r, means[l], std)))
}

/// 类别先验处处相等的网格.
pub fn flat_mesh(shape: Idx3d, classes: usize) -> AtlasMesh {
    AtlasMesh::uniform(shape, classes).unwrap()
}

/// 按均值从小到大排列的组下标.
pub fn groups_by_mean(params: &MixtureParameters, channel: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..params.group_count()).collect();
    order.sort_by(|&a, &b| {
        params.group(a).mean[channel]
            .partial_cmp(&params.group(b).mean[channel])
            .unwrap()
    });
    order
}

/// 标签与真值一致的比例. `rank[l]` 是真值 `l` 对应的类别.
pub fn accuracy(labels: &Array3<u16>, truth: &Array3<usize>, rank: &[usize]) -> f64 {
    let hit = labels
        .iter()
        .zip(truth.iter())
        .filter(|(&l, &t)| l as usize == rank[t])
        .count();
    hit as f64 / truth.len() as f64
}
