//! Deep supervision 目标降采样.
//!
//! 对 `(b, c, 空间维度...)` 标签批量, 按每个尺度生成一份降采样副本.
//! 插值逐类别进行, 结果只会包含原标签中出现过的取值.

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::augment::Transform;
use crate::data::{Field, Record};
use crate::geometry::interp::{resize_linear, resize_nearest};
use crate::{SegError, SegResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 一个降采样尺度.
///
/// 配置文件中既可以写一个数 (所有空间轴相同), 也可以写一个数组 (逐轴给出).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DsScale {
    /// 所有空间轴使用相同的系数.
    Uniform(f64),
    /// 逐轴给出系数, 长度必须等于空间维度个数.
    PerAxis(Vec<f64>),
}

impl DsScale {
    /// 检查该尺度能否用于 `dim` 个空间维度.
    pub fn check(&self, dim: usize) -> SegResult<()> {
        self.factors(dim).map(|_| ())
    }

    /// 展开为逐轴系数.
    ///
    /// 逐轴系数的个数与 `dim` 不同, 或存在非正系数时返回 `Err`.
    pub fn factors(&self, dim: usize) -> SegResult<Vec<f64>> {
        let factors = match self {
            DsScale::Uniform(s) => vec![*s; dim],
            DsScale::PerAxis(v) if v.len() == dim => v.clone(),
            DsScale::PerAxis(v) => {
                return Err(SegError::config(format!(
                    "deep supervision scale {v:?} has {} axes, expected {dim}",
                    v.len()
                )))
            }
        };
        if factors.iter().any(|f| !(*f > 0.0)) {
            return Err(SegError::config(format!(
                "deep supervision scale {factors:?} must be positive"
            )));
        }
        Ok(factors)
    }
}

/// 将单个标签平面 (仅空间维度) 缩放到 `new_shape`.
///
/// - `order == 0`: 最近邻;
/// - `order >= 1`: 对每个出现过的标签 (按升序) 做一对多的线性插值,
///   插值结果不小于 0.5 的体素写入该标签. 更高阶的插值也按线性处理.
///   没有任何标签达到 0.5 的体素保留最近邻结果.
pub fn resize_segmentation(
    plane: &ArrayViewD<u8>,
    new_shape: &[usize],
    order: usize,
) -> ArrayD<u8> {
    if plane.shape() == new_shape {
        return plane.to_owned();
    }
    if order == 0 {
        return resize_nearest(plane, new_shape);
    }

    let mut present = [false; 256];
    plane.iter().for_each(|&v| present[v as usize] = true);

    let mut out = resize_nearest(plane, new_shape);
    for label in (0..=u8::MAX).filter(|&l| present[l as usize]) {
        let one_vs_rest = plane.mapv(|v| if v == label { 1.0f32 } else { 0.0 });
        let resized = resize_linear(&one_vs_rest.view(), new_shape);
        Zip::from(&mut out).and(&resized).for_each(|o, &w| {
            if w >= 0.5 {
                *o = label;
            }
        });
    }
    out
}

/// 把 `(b, c, 空间维度...)` 批量的每个平面缩放到 `new_spatial`.
fn resize_batch(label: &ArrayViewD<u8>, new_spatial: &[usize], order: usize) -> ArrayD<u8> {
    let mut out_shape = label.shape()[..2].to_vec();
    out_shape.extend_from_slice(new_spatial);
    let mut out = ArrayD::<u8>::zeros(IxDyn(&out_shape));

    let per_item = |mut dst: ndarray::ArrayViewMutD<u8>, src: ArrayViewD<u8>| {
        for (mut d, s) in dst.outer_iter_mut().zip(src.outer_iter()) {
            d.assign(&resize_segmentation(&s, new_spatial, order));
        }
    };

    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(label.axis_iter(Axis(0)).into_par_iter())
                .for_each(|(dst, src)| per_item(dst, src));
        } else {
            out.axis_iter_mut(Axis(0))
                .zip(label.axis_iter(Axis(0)))
                .for_each(|(dst, src)| per_item(dst, src));
        }
    }
    out
}

/// 为 `(b, c, 空间维度...)` 标签批量生成多分辨率目标, 顺序与 `scales` 一致.
///
/// 所有系数都为 1 的尺度直接返回 `label` 本身 (`Arc::clone`, 不复制);
/// 其余尺度的新形状为 `round(shape * scale)`.
///
/// # 返回值
///
/// 标签维度少于 3, 或某个尺度与空间维度个数不符时返回 [`SegError::Configuration`].
pub fn downsample_for_ds(
    label: &Arc<ArrayD<u8>>,
    scales: &[DsScale],
    order: usize,
) -> SegResult<Vec<Arc<ArrayD<u8>>>> {
    if label.ndim() < 3 {
        return Err(SegError::config(format!(
            "deep supervision expects a (b, c, spatial...) label, got shape {:?}",
            label.shape()
        )));
    }
    let spatial = &label.shape()[2..];
    scales
        .iter()
        .map(|scale| {
            let factors = scale.factors(spatial.len())?;
            if factors.iter().all(|f| *f == 1.0) {
                return Ok(Arc::clone(label));
            }
            let new_spatial: Vec<usize> = spatial
                .iter()
                .zip(&factors)
                .map(|(&n, &f)| (n as f64 * f).round() as usize)
                .collect();
            Ok(Arc::new(resize_batch(&label.view(), &new_spatial, order)))
        })
        .collect()
}

/// 增强管线中的 deep supervision 阶段: 把 `input_key` 处的批量标签替换为多分辨率目标,
/// 写入 `output_key`.
#[derive(Clone, Debug)]
pub struct DownsampleForDs {
    scales: Vec<DsScale>,
    order: usize,
    input_key: String,
    output_key: String,
}

impl DownsampleForDs {
    /// 构造阶段. 输入输出键相同时原地替换.
    pub fn new(scales: Vec<DsScale>, order: usize, input_key: &str, output_key: &str) -> Self {
        Self {
            scales,
            order,
            input_key: input_key.to_owned(),
            output_key: output_key.to_owned(),
        }
    }
}

impl Transform for DownsampleForDs {
    fn name(&self) -> &'static str {
        "downsample_for_ds"
    }

    fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
        let label = Arc::new(record.take_label(&self.input_key)?);
        let pyramid = downsample_for_ds(&label, &self.scales, self.order)?;
        record.insert(self.output_key.as_str(), Field::Pyramid(pyramid));
        Ok(record)
    }
}
