//! 插值核. 在 2D/3D 平面 (仅空间维度, 不含通道) 的连续坐标处取样, 以及整体缩放.
//!
//! 坐标系约定: 体素 `i` 的中心位于坐标 `i`.

use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};
use num::Zero;

/// 支持的最大空间维度个数. 取样时用定长数组作缓冲, 避免逐体素分配.
pub const MAX_DIM: usize = 4;

/// n-线性插值. 落在平面之外的角点以 `cval` 参与加权.
///
/// `coord` 的长度必须等于 `plane` 的维度, 且不超过 [`MAX_DIM`].
pub fn sample_linear(plane: &ArrayViewD<f32>, coord: &[f64], cval: f32) -> f32 {
    let d = coord.len();
    debug_assert!(d == plane.ndim() && d <= MAX_DIM);
    let shape = plane.shape();

    let mut base = [0isize; MAX_DIM];
    let mut frac = [0f64; MAX_DIM];
    for k in 0..d {
        let f = coord[k].floor();
        base[k] = f as isize;
        frac[k] = coord[k] - f;
    }

    let mut idx = [0usize; MAX_DIM];
    let mut acc = 0.0f64;
    for corner in 0..(1usize << d) {
        let mut w = 1.0;
        let mut inside = true;
        for k in 0..d {
            let hi = (corner >> k) & 1 == 1;
            w *= if hi { frac[k] } else { 1.0 - frac[k] };
            let i = base[k] + hi as isize;
            if i < 0 || i >= shape[k] as isize {
                inside = false;
            } else {
                idx[k] = i as usize;
            }
        }
        if w == 0.0 {
            continue;
        }
        let v = if inside { plane[&idx[..d]] } else { cval };
        acc += w * v as f64;
    }
    acc as f32
}

/// 最近邻插值. 落在平面之外时返回 `cval`.
pub fn sample_nearest<T: Copy>(plane: &ArrayViewD<T>, coord: &[f64], cval: T) -> T {
    let d = coord.len();
    debug_assert!(d == plane.ndim() && d <= MAX_DIM);
    let shape = plane.shape();
    let mut idx = [0usize; MAX_DIM];
    for k in 0..d {
        let i = (coord[k] + 0.5).floor();
        if i < 0.0 || i >= shape[k] as f64 {
            return cval;
        }
        idx[k] = i as usize;
    }
    plane[&idx[..d]]
}

/// 缩放时每个输出下标对应的源坐标 (像素中心对齐), 截断到 `[0, src - 1]`.
fn source_coords(src: usize, dst: usize) -> Vec<f64> {
    let ratio = src as f64 / dst as f64;
    let hi = src.saturating_sub(1) as f64;
    (0..dst)
        .map(|o| ((o as f64 + 0.5) * ratio - 0.5).clamp(0.0, hi))
        .collect()
}

/// 对每个输出体素调用 `f(源坐标)`, 得到形状为 `new_shape` 的数组.
fn resample_with<T, F>(src_shape: &[usize], new_shape: &[usize], mut f: F) -> ArrayD<T>
where
    F: FnMut(&[f64]) -> T,
{
    assert_eq!(src_shape.len(), new_shape.len(), "缩放前后维度不一致");
    let d = new_shape.len();
    assert!(d <= MAX_DIM, "最多支持 {MAX_DIM} 个空间维度");
    let axes: Vec<Vec<f64>> = src_shape
        .iter()
        .zip(new_shape)
        .map(|(&s, &n)| source_coords(s, n))
        .collect();
    let mut coord = [0f64; MAX_DIM];
    ArrayD::from_shape_fn(IxDyn(new_shape), |pos: IxDyn| {
        for (k, &o) in pos.slice().iter().enumerate() {
            coord[k] = axes[k][o];
        }
        f(&coord[..d])
    })
}

/// 线性插值缩放到 `new_shape`, 边界按边缘值延拓.
pub fn resize_linear(plane: &ArrayViewD<f32>, new_shape: &[usize]) -> ArrayD<f32> {
    if plane.shape() == new_shape {
        return plane.to_owned();
    }
    resample_with(plane.shape(), new_shape, |c| sample_linear(plane, c, 0.0))
}

/// 最近邻缩放到 `new_shape`.
pub fn resize_nearest<T: Copy + Zero>(plane: &ArrayViewD<T>, new_shape: &[usize]) -> ArrayD<T> {
    if plane.shape() == new_shape {
        return plane.to_owned();
    }
    resample_with(plane.shape(), new_shape, |c| sample_nearest(plane, c, T::zero()))
}
