//! 合成数据集: 在随机位置放置一个球形前景, 用于在没有真实数据时测量吞吐量.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seg_berry::consts::label::{BACKGROUND, FOREGROUND};
use seg_berry::SegResult;
use std::path::{Path, PathBuf};

/// 在 `dir/img` 与 `dir/msk` 下写入 `n` 对形状为 `shape` 的 `.npy` 样本.
///
/// 图像为均匀噪声, 前景区域整体抬高 1.0; 标签中前景为 [`FOREGROUND`], 其余为 [`BACKGROUND`].
///
/// # 返回值
///
/// `(图像目录, 标签目录)`.
pub fn write_dataset(
    dir: &Path,
    n: usize,
    shape: &[usize],
    seed: u64,
) -> SegResult<(PathBuf, PathBuf)> {
    let img_dir = dir.join("img");
    let msk_dir = dir.join("msk");
    std::fs::create_dir_all(&img_dir)?;
    std::fs::create_dir_all(&msk_dir)?;

    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..n {
        let (image, mask) = sample(shape, &mut rng);
        let name = format!("case_{i:04}.npy");
        ndarray_npy::write_npy(img_dir.join(&name), &image)?;
        ndarray_npy::write_npy(msk_dir.join(&name), &mask)?;
    }
    Ok((img_dir, msk_dir))
}

/// 生成一对样本.
pub fn sample(shape: &[usize], rng: &mut StdRng) -> (ArrayD<f32>, ArrayD<u8>) {
    let center: Vec<f64> = shape.iter().map(|&s| rng.gen_range(0.0..s as f64)).collect();
    let radius = shape.iter().copied().min().unwrap_or(1) as f64 / 4.0;

    let mask = ArrayD::from_shape_fn(IxDyn(shape), |idx| {
        let d2: f64 = (0..shape.len())
            .map(|a| (idx[a] as f64 - center[a]).powi(2))
            .sum();
        if d2 <= radius * radius {
            FOREGROUND
        } else {
            BACKGROUND
        }
    });
    let image = mask.mapv(|m| m as f32 + rng.gen::<f32>());
    (image, mask)
}
