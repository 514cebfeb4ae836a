mod common;

use common::*;
use ndarray::Array3;
use seg_berry::prelude::*;

fn two_tissue(shape: Idx3d, seed: u64) -> (ChannelImage, Array3<usize>) {
    let truth = Array3::from_shape_fn(shape, |(x, _, _)| usize::from(x >= shape.0 / 2));
    (noisy_image(&truth, &[0.0, 20.0], 1.0, seed), truth)
}

#[test]
fn test_partial_volume_segmentation() {
    init_logger();
    let shape = (8, 4, 4);
    let (image, truth) = two_tissue(shape, 21);
    let mut seg = EmSegmenter::new();
    seg.set_images([image]).unwrap();
    seg.set_atlas_mesh(flat_mesh(shape, 2), &[], &[]).unwrap();
    seg.set_partial_volume_factors([2, 1, 1]).unwrap();
    seg.set_max_iterations(15).unwrap();
    seg.segment().unwrap();

    let post = seg.posteriors().unwrap().clone();
    for (idx, _) in truth.indexed_iter() {
        assert!((post.voxel_sum(idx) - 1.0).abs() < 1e-9);
    }
    let params = seg.mixture_parameters().unwrap().clone();
    let rank = groups_by_mean(&params, 0);
    assert_eq!(accuracy(&seg.label_volume().unwrap(), &truth, &rank), 1.0);

    let grid = SubvoxelGrid::new([2, 1, 1]).unwrap();
    let sr = seg.super_resolution().unwrap();
    assert_eq!(sr.posteriors.shape(), (16, 4, 4));
    assert_eq!(sr.likelihoods.shape(), (16, 4, 4));
    for idx in [(0, 0, 0), (7, 1, 2), (15, 3, 3)] {
        assert!((sr.posteriors.voxel_sum(idx) - 1.0).abs() < 1e-9);
        assert!(sr.likelihoods.voxel(idx).iter().all(|l| l.is_finite() && *l >= 0.0));
    }
    // 亚体素后验的平均值就是体素后验.
    for c in 0..2 {
        let down = grid.downsample(&sr.posteriors.class(c).to_owned());
        let diff = &down - &post.class(c);
        assert!(diff.iter().all(|d| d.abs() < 1e-9));
    }

    let priors = seg.super_resolution_priors().unwrap();
    assert_eq!(priors.shape(), (16, 4, 4));
    assert!((priors.voxel((3, 1, 1))[0] - 0.5).abs() < 1e-12);

    let images = seg.super_resolution_images().unwrap();
    let corrected = seg.bias_corrected_images().unwrap()[0].clone();
    assert_eq!(images[0].data(), &grid.upsample(corrected.data()));

    let mesh = seg.super_resolution_mesh().unwrap();
    assert_eq!(mesh.class_count(), 2);

    // 平坦先验下两类对称.
    let mix = seg.mixing_probability(0, 1).unwrap();
    assert_eq!(mix.dim(), shape);
    assert!(mix.iter().all(|m| (m - 0.5).abs() < 1e-12));
    assert!(seg.mixing_probability(0, 0).is_err());
}

#[test]
fn test_identity_factors_use_voxel_model() {
    let shape = (6, 3, 3);
    let (image, _) = two_tissue(shape, 23);
    let mut plain = EmSegmenter::new();
    plain.set_images([image.clone()]).unwrap();
    plain.set_atlas_mesh(flat_mesh(shape, 2), &[], &[]).unwrap();

    let mut pv = EmSegmenter::new();
    pv.set_images([image]).unwrap();
    pv.set_atlas_mesh(flat_mesh(shape, 2), &[], &[]).unwrap();
    pv.set_partial_volume_factors([2, 2, 2]).unwrap();
    pv.set_partial_volume_factors([1, 1, 1]).unwrap();

    let a = plain.segment().unwrap();
    let b = pv.segment().unwrap();
    assert_eq!(a.iterations, b.iterations);
    assert!((a.log_likelihood - b.log_likelihood).abs() < 1e-9 * a.log_likelihood.abs());

    // 恒等划分下超分辨率结果与体素结果一致.
    let post = pv.posteriors().unwrap().clone();
    let sr = pv.super_resolution_posteriors().unwrap();
    let diff = sr.data() - post.data();
    assert!(diff.iter().all(|d| d.abs() < 1e-9));
}
