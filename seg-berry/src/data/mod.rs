//! 数据模型: 样本, 记录与批量, 以及读写与前景索引.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{ArrayD, Axis};

use crate::{SegError, SegResult};

pub mod foreground;
pub mod io;

pub use foreground::ForegroundIndex;
pub use io::{AdaptiveIo, ImageIo};

/// 原始强度体数据, 以 `(c, 空间维度...)` 组织, 空间维度为 2 或 3 个.
pub type Volume = ArrayD<f32>;

/// 标签, 与配对的 [`Volume`] 具有相同的空间形状.
///
/// 通道数大于 1 时视为独热编码 (每个通道只有 0/1); 单通道时视为整数编码.
pub type LabelMask = ArrayD<u8>;

/// 记录中的一个字段.
///
/// 列表形式 (`Volumes`, `Masks`) 存放 patch 提取前形状各异的单个样本,
/// 堆叠形式 (`Image`, `Label`) 存放形如 `(b, c, 空间维度...)` 的批量.
#[derive(Debug, Clone)]
pub enum Field {
    /// 惰性加载模式下尚未解码的文件路径.
    Paths(Vec<PathBuf>),

    /// 样本图像列表. 预加载模式下与数据集共享, 裁剪时才复制.
    Volumes(Vec<Arc<Volume>>),

    /// 样本标签列表.
    Masks(Vec<Arc<LabelMask>>),

    /// 与样本标签一一对应的前景索引.
    Foreground(Vec<Arc<ForegroundIndex>>),

    /// 堆叠后的批量图像.
    Image(ArrayD<f32>),

    /// 堆叠后的批量标签.
    Label(ArrayD<u8>),

    /// 多分辨率标签 (deep supervision 目标), 顺序与尺度参数一致.
    Pyramid(Vec<Arc<ArrayD<u8>>>),
}

impl Field {
    /// 字段类型名, 用于日志与错误信息.
    pub fn kind(&self) -> &'static str {
        match self {
            Field::Paths(_) => "paths",
            Field::Volumes(_) => "volumes",
            Field::Masks(_) => "masks",
            Field::Foreground(_) => "foreground",
            Field::Image(_) => "image",
            Field::Label(_) => "label",
            Field::Pyramid(_) => "pyramid",
        }
    }

    /// 字段中样本的个数.
    pub fn len(&self) -> usize {
        match self {
            Field::Paths(v) => v.len(),
            Field::Volumes(v) => v.len(),
            Field::Masks(v) => v.len(),
            Field::Foreground(v) => v.len(),
            Field::Image(a) => a.len_of(Axis(0)),
            Field::Label(a) => a.len_of(Axis(0)),
            Field::Pyramid(v) => v.first().map_or(0, |a| a.len_of(Axis(0))),
        }
    }

    /// 字段是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 逐样本的空间形状. 路径和多分辨率标签没有可比较的空间形状, 返回 `None`.
    fn spatial_shapes(&self) -> Option<Vec<Vec<usize>>> {
        match self {
            Field::Paths(_) | Field::Foreground(_) | Field::Pyramid(_) => None,
            Field::Volumes(v) => Some(v.iter().map(|a| a.shape()[1..].to_vec()).collect()),
            Field::Masks(v) => Some(v.iter().map(|a| a.shape()[1..].to_vec()).collect()),
            Field::Image(a) => Some(vec![a.shape()[2..].to_vec(); a.len_of(Axis(0))]),
            Field::Label(a) => Some(vec![a.shape()[2..].to_vec(); a.len_of(Axis(0))]),
        }
    }
}

/// 在增强管线中流动的记录: 从键名到字段的映射.
///
/// 各个阶段可以增加, 重命名或删除键. 任一阶段完成后,
/// 图像键和与之配对的标签键都必须具有相同的空间形状.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: HashMap<String, Field>,
}

impl Record {
    /// 创建空记录.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式插入字段.
    #[inline]
    pub fn with(mut self, key: impl Into<String>, field: Field) -> Self {
        self.insert(key, field);
        self
    }

    /// 插入或覆盖字段, 返回旧值.
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, field: Field) -> Option<Field> {
        self.fields.insert(key.into(), field)
    }

    /// 获取字段的不可变引用.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// 获取字段的可变引用.
    #[inline]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Field> {
        self.fields.get_mut(key)
    }

    /// 记录中是否存在 `key`.
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// 删除并返回字段.
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Field> {
        self.fields.remove(key)
    }

    /// 删除并返回字段. 字段不存在时返回 `Err`.
    #[inline]
    pub fn take(&mut self, key: &str) -> SegResult<Field> {
        self.remove(key)
            .ok_or_else(|| SegError::field(key, "missing"))
    }

    /// 将 `from` 重命名为 `to`. 若 `to` 已存在则覆盖. `from` 不存在时什么也不做.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(field) = self.fields.remove(from) {
            self.fields.insert(to.to_owned(), field);
        }
    }

    /// 所有键名, 无顺序保证.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// 检查 `image_key` 与 `mask_key` 的空间形状是否逐样本一致.
    ///
    /// 任一键缺失, 或任一字段没有可比较的空间形状时视为通过.
    pub fn check_pairing(
        &self,
        stage: &'static str,
        image_key: &str,
        mask_key: &str,
    ) -> SegResult<()> {
        let (Some(image), Some(mask)) = (self.get(image_key), self.get(mask_key)) else {
            return Ok(());
        };
        let (Some(image), Some(mask)) = (image.spatial_shapes(), mask.spatial_shapes()) else {
            return Ok(());
        };
        if image.len() != mask.len() {
            return Err(SegError::ShapeMismatch {
                stage,
                image: vec![image.len()],
                mask: vec![mask.len()],
            });
        }
        match image.into_iter().zip(mask).find(|(a, b)| a != b) {
            Some((image, mask)) => Err(SegError::ShapeMismatch { stage, image, mask }),
            None => Ok(()),
        }
    }
}

macro_rules! impl_take_as {
    ($($(#[$doc: meta])* $name: ident => $variant: ident($ty: ty), $kind: literal;)+) => {
        impl Record {
            $(
                $(#[$doc])*
                ///
                /// 类型不符时字段保留在记录中, 并返回 `Err`.
                pub fn $name(&mut self, key: &str) -> SegResult<$ty> {
                    match self.take(key)? {
                        Field::$variant(v) => Ok(v),
                        other => {
                            self.insert(key, other);
                            Err(SegError::field(key, concat!("expected ", $kind)))
                        }
                    }
                }
            )+
        }
    };
}

impl_take_as! {
    /// 取出路径列表.
    take_paths => Paths(Vec<PathBuf>), "paths";
    /// 取出样本图像列表.
    take_volumes => Volumes(Vec<Arc<Volume>>), "volumes";
    /// 取出样本标签列表.
    take_masks => Masks(Vec<Arc<LabelMask>>), "masks";
    /// 取出前景索引列表.
    take_foreground => Foreground(Vec<Arc<ForegroundIndex>>), "foreground";
    /// 取出堆叠后的批量图像.
    take_image => Image(ArrayD<f32>), "image";
    /// 取出堆叠后的批量标签.
    take_label => Label(ArrayD<u8>), "label";
    /// 取出多分辨率标签.
    take_pyramid => Pyramid(Vec<Arc<ArrayD<u8>>>), "pyramid";
}

/// 一个完全准备好的训练批量, 交给外部的训练循环消费.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(b, c, 空间维度...)` 图像.
    pub image: ArrayD<f32>,

    /// 训练目标. `target[0]` 为第一个尺度 (通常即原分辨率);
    /// 未启用 deep supervision 时只有一个元素.
    pub target: Vec<Arc<ArrayD<u8>>>,
}

impl Batch {
    /// 从记录中取出图像与目标 (即 "dict to tuple" 阶段).
    ///
    /// 目标字段可以是堆叠标签或多分辨率标签.
    pub fn from_record(mut record: Record, image_key: &str, target_key: &str) -> SegResult<Self> {
        let image = record.take_image(image_key)?;
        let target = match record.take(target_key)? {
            Field::Label(label) => vec![Arc::new(label)],
            Field::Pyramid(levels) => levels,
            _ => return Err(SegError::field(target_key, "expected label or pyramid")),
        };
        Ok(Self { image, target })
    }

    /// 批量大小.
    #[inline]
    pub fn len(&self) -> usize {
        self.image.len_of(Axis(0))
    }

    /// 批量是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 将第 `level` 个尺度的目标转换为浮点数组. 越界时返回 `None`.
    pub fn target_f32(&self, level: usize) -> Option<ArrayD<f32>> {
        self.target.get(level).map(|t| t.mapv(f32::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn volumes(shapes: &[&[usize]]) -> Field {
        Field::Volumes(shapes.iter().map(|s| Arc::new(ArrayD::zeros(IxDyn(s)))).collect())
    }

    fn masks(shapes: &[&[usize]]) -> Field {
        Field::Masks(shapes.iter().map(|s| Arc::new(ArrayD::zeros(IxDyn(s)))).collect())
    }

    #[test]
    fn test_pairing_ignores_channels() {
        let r = Record::new()
            .with("image", volumes(&[&[2, 4, 5, 6], &[1, 3, 3, 3]]))
            .with("mask", masks(&[&[3, 4, 5, 6], &[1, 3, 3, 3]]));
        assert!(r.check_pairing("t", "image", "mask").is_ok());
    }

    #[test]
    fn test_pairing_mismatch() {
        let r = Record::new()
            .with("image", Field::Image(ArrayD::zeros(IxDyn(&[2, 1, 8, 8]))))
            .with("mask", Field::Label(ArrayD::zeros(IxDyn(&[2, 1, 8, 7]))));
        match r.check_pairing("stage", "image", "mask") {
            Err(SegError::ShapeMismatch { stage, image, mask }) => {
                assert_eq!(stage, "stage");
                assert_eq!(image, vec![8, 8]);
                assert_eq!(mask, vec![8, 7]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_take_wrong_kind_keeps_field() {
        let mut r = Record::new().with("image", volumes(&[&[1, 2, 2]]));
        assert!(r.take_image("image").is_err());
        assert!(r.contains("image"));
        assert!(r.take_volumes("image").is_ok());
        assert!(!r.contains("image"));
    }

    #[test]
    fn test_batch_from_label() {
        let r = Record::new()
            .with("image", Field::Image(ArrayD::zeros(IxDyn(&[3, 1, 4, 4]))))
            .with("target", Field::Label(ArrayD::ones(IxDyn(&[3, 1, 4, 4]))));
        let b = Batch::from_record(r, "image", "target").unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.target.len(), 1);
        assert!(b.target_f32(0).unwrap().iter().all(|v| *v == 1.0));
        assert!(b.target_f32(1).is_none());
    }
}
