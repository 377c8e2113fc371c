//! patch 提取: 对批量中的每个样本裁剪并填充到固定形状, 再堆叠为一个批量.

use std::sync::Arc;

use ndarray::{ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;

use crate::augment::Transform;
use crate::consts::keys::{FOREGROUND, IMAGE, MASK};
use crate::data::{Field, ForegroundIndex, Record};
use crate::geometry::crop_pad;
use crate::{SegError, SegResult};

/// 裁剪并填充.
///
/// 输入为图像键下的样本图像列表与标签键下的样本标签列表 (形状可以各不相同),
/// 输出为形如 `(b, c, patch_size...)` 的批量图像与批量标签, 样本顺序不变.
/// 记录中若带有前景索引, 则用它选取前景锚点, 并在之后将其移除.
///
/// 输入数组不会被修改, 所有结果都是新分配的.
#[derive(Clone, Debug)]
pub struct PatchTransform {
    patch_size: Vec<usize>,
    fg_rate: f64,
    fg_margin: Vec<usize>,
    image_key: String,
    mask_key: String,
}

impl PatchTransform {
    /// 使用默认键名构造.
    ///
    /// `fg_margin` 为空时视为全 0.
    pub fn new(patch_size: &[usize], fg_rate: f64, fg_margin: Vec<usize>) -> Self {
        let fg_margin = if fg_margin.is_empty() {
            vec![0; patch_size.len()]
        } else {
            fg_margin
        };
        Self {
            patch_size: patch_size.to_vec(),
            fg_rate,
            fg_margin,
            image_key: IMAGE.to_owned(),
            mask_key: MASK.to_owned(),
        }
    }

    /// 修改图像与标签的键名.
    pub fn with_keys(mut self, image_key: &str, mask_key: &str) -> Self {
        self.image_key = image_key.to_owned();
        self.mask_key = mask_key.to_owned();
        self
    }

    /// patch 形状.
    #[inline]
    pub fn patch_size(&self) -> &[usize] {
        &self.patch_size
    }
}

/// 将形状相同的样本堆叠为批量, 写入预先分配好的数组.
fn stack<T: Clone + num::Zero>(items: &[ArrayD<T>], channels: usize, patch: &[usize]) -> ArrayD<T> {
    let mut shape = vec![items.len(), channels];
    shape.extend_from_slice(patch);
    let mut out = ArrayD::<T>::zeros(IxDyn(&shape));
    for (mut dst, src) in out.outer_iter_mut().zip(items) {
        dst.assign(src);
    }
    out
}

impl Transform for PatchTransform {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn apply(&self, mut record: Record, rng: &mut StdRng) -> SegResult<Record> {
        let volumes = record.take_volumes(&self.image_key)?;
        let masks = record.take_masks(&self.mask_key)?;
        let fg: Option<Vec<Arc<ForegroundIndex>>> = if record.contains(FOREGROUND) {
            Some(record.take_foreground(FOREGROUND)?)
        } else {
            None
        };

        if volumes.len() != masks.len() {
            return Err(SegError::ShapeMismatch {
                stage: self.name(),
                image: vec![volumes.len()],
                mask: vec![masks.len()],
            });
        }
        let dim = self.patch_size.len();
        let first = volumes
            .first()
            .ok_or_else(|| SegError::field(&self.image_key, "empty batch"))?;
        let (img_c, msk_c) = (first.len_of(Axis(0)), masks[0].len_of(Axis(0)));

        let mut images = Vec::with_capacity(volumes.len());
        let mut labels = Vec::with_capacity(volumes.len());
        for (i, (volume, mask)) in volumes.iter().zip(&masks).enumerate() {
            if volume.ndim() != dim + 1 || mask.ndim() != dim + 1 {
                return Err(SegError::config(format!(
                    "sample {i} has shape {:?}, expected {dim} spatial axes plus a channel axis",
                    volume.shape()
                )));
            }
            if volume.shape()[1..] != mask.shape()[1..] {
                return Err(SegError::ShapeMismatch {
                    stage: self.name(),
                    image: volume.shape()[1..].to_vec(),
                    mask: mask.shape()[1..].to_vec(),
                });
            }
            if volume.len_of(Axis(0)) != img_c || mask.len_of(Axis(0)) != msk_c {
                return Err(SegError::field(&self.image_key, "inconsistent channel count"));
            }
            let index = fg.as_ref().and_then(|f| f.get(i)).map(Arc::as_ref);
            let (image, label) = crop_pad(
                &volume.view(),
                &mask.view(),
                &self.patch_size,
                self.fg_rate,
                &self.fg_margin,
                index,
                rng,
            );
            images.push(image);
            labels.push(label);
        }

        record.insert(
            self.image_key.as_str(),
            Field::Image(stack(&images, img_c, &self.patch_size)),
        );
        record.insert(
            self.mask_key.as_str(),
            Field::Label(stack(&labels, msk_c, &self.patch_size)),
        );
        Ok(record)
    }
}
