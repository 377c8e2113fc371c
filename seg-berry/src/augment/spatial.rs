//! 空间变换: 随机旋转与各向同性缩放, 输出居中于输入的固定形状 patch.
//!
//! 图像用线性插值, 边界外填 0; 标签用最近邻插值, 边界外填 [`BORDER`],
//! 管线末尾再映射回背景.

use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn};
use rand::rngs::StdRng;
use rand::Rng;

use crate::augment::Transform;
use crate::consts::keys::{IMAGE, MASK};
use crate::consts::label::BORDER;
use crate::data::{Field, Record};
use crate::geometry::center_crop;
use crate::geometry::interp::{sample_linear, sample_nearest, MAX_DIM};
use crate::SegResult;

type Mat = [[f64; MAX_DIM]; MAX_DIM];

fn identity() -> Mat {
    let mut m = [[0.0; MAX_DIM]; MAX_DIM];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

fn matmul(a: &Mat, b: &Mat) -> Mat {
    let mut m = [[0.0; MAX_DIM]; MAX_DIM];
    for i in 0..MAX_DIM {
        for j in 0..MAX_DIM {
            m[i][j] = (0..MAX_DIM).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    m
}

/// 在 `(p, q)` 平面内旋转 `angle` 的矩阵 (行向量右乘).
fn rotation(p: usize, q: usize, angle: f64) -> Mat {
    let (s, c) = angle.sin_cos();
    let mut m = identity();
    m[p][p] = c;
    m[p][q] = -s;
    m[q][p] = s;
    m[q][q] = c;
    m
}

/// 输出坐标到输入坐标的仿射映射.
///
/// `src = (dst - dst_center) · mat + src_center`.
struct Warp {
    mat: Mat,
    dim: usize,
    dst_center: Vec<f64>,
    src_center: Vec<f64>,
}

impl Warp {
    fn new(mat: Mat, src: &[usize], dst: &[usize]) -> Self {
        Self {
            mat,
            dim: dst.len(),
            dst_center: dst.iter().map(|&s| (s as f64 - 1.0) / 2.0).collect(),
            src_center: src.iter().map(|&s| s as f64 / 2.0 - 0.5).collect(),
        }
    }

    #[inline]
    fn map(&self, pos: &[usize], out: &mut [f64; MAX_DIM]) {
        let mut rel = [0.0; MAX_DIM];
        for k in 0..self.dim {
            rel[k] = pos[k] as f64 - self.dst_center[k];
        }
        for (j, o) in out.iter_mut().enumerate().take(self.dim) {
            *o = (0..self.dim).map(|i| rel[i] * self.mat[i][j]).sum::<f64>() + self.src_center[j];
        }
    }

    /// 对 `(c, 空间维度...)` 样本的每个通道按映射重采样.
    fn resample<T, F>(&self, sample: &ArrayViewD<T>, dst: &[usize], sample_fn: F) -> ArrayD<T>
    where
        T: Clone + num::Zero,
        F: Fn(&ArrayViewD<T>, &[f64]) -> T,
    {
        let mut shape = vec![sample.len_of(Axis(0))];
        shape.extend_from_slice(dst);
        let mut out = ArrayD::<T>::zeros(IxDyn(&shape));
        let mut coord = [0.0; MAX_DIM];
        for (mut o, plane) in out.outer_iter_mut().zip(sample.outer_iter()) {
            for (pos, v) in o.indexed_iter_mut() {
                self.map(pos.slice(), &mut coord);
                *v = sample_fn(&plane, &coord[..self.dim]);
            }
        }
        out
    }
}

/// 随机旋转与缩放.
///
/// 对批量中的每个样本, 以 `p_rot` 的概率旋转 (角度从 `rotation` 给出的各轴范围中均匀抽取),
/// 以 `p_scale` 的概率缩放; 两者都未发生时只做居中裁剪.
/// 伪 2D 模式下只在后两个轴构成的平面内旋转与缩放.
#[derive(Clone, Debug)]
pub struct SpatialTransform {
    patch_size: Vec<usize>,
    rotation: Vec<(f64, f64)>,
    dummy_2d: bool,
    p_rot: f64,
    p_scale: f64,
    scale_range: (f64, f64),
}

impl SpatialTransform {
    /// 输出形状为 `patch_size`, 默认概率均为 0.2, 缩放范围 `[0.7, 1.4]`.
    pub fn new(patch_size: &[usize], rotation: Vec<(f64, f64)>, dummy_2d: bool) -> Self {
        Self {
            patch_size: patch_size.to_vec(),
            rotation,
            dummy_2d,
            p_rot: 0.2,
            p_scale: 0.2,
            scale_range: (0.7, 1.4),
        }
    }

    /// 修改旋转与缩放的概率.
    pub fn with_probabilities(mut self, p_rot: f64, p_scale: f64) -> Self {
        self.p_rot = p_rot;
        self.p_scale = p_scale;
        self
    }

    /// 修改缩放范围.
    pub fn with_scale_range(mut self, range: (f64, f64)) -> Self {
        self.scale_range = range;
        self
    }

    fn angle(&self, axis: usize, rng: &mut StdRng) -> f64 {
        match self.rotation.get(axis) {
            Some(&(lo, hi)) if lo < hi => rng.gen_range(lo..=hi),
            Some(&(lo, _)) => lo,
            None => 0.0,
        }
    }

    /// 缩放系数: 一半概率缩小 (若范围允许), 否则放大.
    fn scale(&self, rng: &mut StdRng) -> f64 {
        let (lo, hi) = self.scale_range;
        let (a, b) = if rng.gen::<f64>() < 0.5 && lo < 1.0 {
            (lo, 1.0)
        } else {
            (lo.max(1.0), hi)
        };
        if a < b {
            rng.gen_range(a..=b)
        } else {
            a
        }
    }

    /// 为一个样本抽取变换矩阵. 不做任何变换时返回 `None`.
    fn draw(&self, rng: &mut StdRng) -> Option<Mat> {
        let dim = self.patch_size.len();
        let do_rot = rng.gen::<f64>() < self.p_rot;
        let do_scale = rng.gen::<f64>() < self.p_scale;
        if !do_rot && !do_scale {
            return None;
        }

        let mut m = identity();
        if do_rot {
            m = match (dim, self.dummy_2d) {
                (2, _) => rotation(0, 1, self.angle(0, rng)),
                (_, true) => rotation(1, 2, self.angle(0, rng)),
                _ => {
                    let rx = rotation(1, 2, self.angle(0, rng));
                    let ry = rotation(0, 2, self.angle(1, rng));
                    let rz = rotation(0, 1, self.angle(2, rng));
                    matmul(&matmul(&rx, &ry), &rz)
                }
            };
        }
        if do_scale {
            let sc = self.scale(rng);
            let first = usize::from(self.dummy_2d && dim == 3);
            for row in m.iter_mut() {
                for v in row.iter_mut().take(dim).skip(first) {
                    *v *= sc;
                }
            }
        }
        Some(m)
    }
}

impl Transform for SpatialTransform {
    fn name(&self) -> &'static str {
        "spatial"
    }

    fn apply(&self, mut record: Record, rng: &mut StdRng) -> SegResult<Record> {
        let image = record.take_image(IMAGE)?;
        let label = record.take_label(MASK)?;
        let src = &image.shape()[2..];
        let patch = &self.patch_size;

        let mut img_shape = image.shape()[..2].to_vec();
        img_shape.extend_from_slice(patch);
        let mut lbl_shape = label.shape()[..2].to_vec();
        lbl_shape.extend_from_slice(patch);
        let mut img_out = ArrayD::<f32>::zeros(IxDyn(&img_shape));
        let mut lbl_out = ArrayD::<u8>::zeros(IxDyn(&lbl_shape));

        for (b, (img, lbl)) in image.outer_iter().zip(label.outer_iter()).enumerate() {
            let (i, l) = match self.draw(rng) {
                Some(mat) => {
                    let warp = Warp::new(mat, src, patch);
                    (
                        warp.resample(&img, patch, |p, c| sample_linear(p, c, 0.0)),
                        warp.resample(&lbl, patch, |p, c| sample_nearest(p, c, BORDER)),
                    )
                }
                None => (center_crop(&img, patch), center_crop(&lbl, patch)),
            };
            // 原图小于 patch 时居中裁剪的结果偏小, 居中写入, 其余保持为 0.
            assign_centered(img_out.index_axis_mut(Axis(0), b), &i.view());
            assign_centered(lbl_out.index_axis_mut(Axis(0), b), &l.view());
        }

        record.insert(IMAGE, Field::Image(img_out));
        record.insert(MASK, Field::Label(lbl_out));
        Ok(record)
    }
}

/// 将 `src` 居中写入 `dst`. 两者通道数相同, `src` 的空间形状不大于 `dst`.
fn assign_centered<T: Clone>(mut dst: ndarray::ArrayViewMutD<T>, src: &ArrayViewD<T>) {
    if dst.shape() == src.shape() {
        dst.assign(src);
        return;
    }
    let lead: Vec<usize> = dst
        .shape()
        .iter()
        .zip(src.shape())
        .map(|(&d, &s)| d.saturating_sub(s) / 2)
        .collect();
    dst.slice_each_axis_mut(|ax| {
        let i = ax.axis.index();
        ndarray::Slice::from(lead[i]..lead[i] + src.shape()[i])
    })
    .assign(src);
}
