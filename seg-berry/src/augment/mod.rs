//! 数据增强管线.
//!
//! 管线是一组实现了 [`Transform`] 的阶段, 由 [`Compose`] 顺序执行.
//! 每个阶段消费并产出一条 [`Record`]; 阶段本身不持有随机状态,
//! 随机数发生器由调用者 (通常是工作线程) 传入.
//!
//! 训练管线的阶段顺序:
//!
//! 1. (惰性加载时) [`DataReader`] 读取文件;
//! 2. [`PatchTransform`] 裁剪并填充到放大的 patch 形状;
//! 3. [`SpatialTransform`] 旋转, 缩放, 输出最终 patch 形状;
//! 4. [`CenterCrop`];
//! 5. 噪声, 模糊, 亮度, 对比度, 低分辨率模拟, 两次 gamma;
//! 6. [`Mirror`];
//! 7. [`RemapLabel`] 把空间变换的边界标签映射回背景;
//! 8. [`Rename`] 把标签键改为目标键;
//! 9. (可选) [`DownsampleForDs`](crate::downsample::DownsampleForDs).
//!
//! 验证管线只保留 1, 2, 7, 8, 9.

use std::sync::Arc;

use rand::rngs::StdRng;

use crate::config::SegConfig;
use crate::consts::keys::{IMAGE, MASK, TARGET};
use crate::consts::label::{BACKGROUND, BORDER};
use crate::data::{Batch, ImageIo, Record};
use crate::downsample::DownsampleForDs;
use crate::SegResult;

pub mod intensity;
pub mod patch;
pub mod plan;
pub mod spatial;
pub mod utility;

pub use intensity::{
    BrightnessMultiplicative, ContrastAugmentation, Gamma, GaussianBlur, GaussianNoise,
    SimulateLowResolution,
};
pub use patch::PatchTransform;
pub use plan::AugmentPlan;
pub use spatial::SpatialTransform;
pub use utility::{CenterCrop, DataReader, Mirror, RemapLabel, Rename};

/// 增强管线的一个阶段.
pub trait Transform: Send + Sync {
    /// 阶段名, 用于日志与错误信息.
    fn name(&self) -> &'static str;

    /// 处理一条记录.
    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record>;
}

/// 顺序执行的阶段列表.
///
/// 每个阶段结束后检查图像与标签 (或目标) 的空间形状是否仍然配对.
#[derive(Default)]
pub struct Compose {
    stages: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

impl Compose {
    /// 创建空管线.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式追加阶段.
    #[inline]
    pub fn then(mut self, stage: impl Transform + 'static) -> Self {
        self.push(stage);
        self
    }

    /// 追加阶段.
    #[inline]
    pub fn push(&mut self, stage: impl Transform + 'static) {
        self.stages.push(Box::new(stage));
    }

    /// 阶段个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// 管线是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 按顺序列出阶段名.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 依次执行全部阶段, 并把结果转换为 [`Batch`].
    pub fn run(&self, record: Record, rng: &mut StdRng) -> SegResult<Batch> {
        let record = self.apply(record, rng)?;
        Batch::from_record(record, IMAGE, TARGET)
    }
}

impl Transform for Compose {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn apply(&self, mut record: Record, rng: &mut StdRng) -> SegResult<Record> {
        for stage in &self.stages {
            let name = stage.name();
            log::trace!("stage `{name}`");
            record = stage.apply(record, rng)?;
            record.check_pairing(name, IMAGE, MASK)?;
            record.check_pairing(name, IMAGE, TARGET)?;
        }
        Ok(record)
    }
}

/// 训练管线. `io` 为 `None` 时表示数据已预加载, 不需要读取阶段.
pub fn training_transforms(
    plan: &AugmentPlan,
    cfg: &SegConfig,
    io: Option<Arc<dyn ImageIo>>,
) -> Compose {
    let mut pipeline = Compose::new();
    if let Some(io) = io {
        pipeline.push(DataReader::new(io, cfg.dim()).with_foreground(cfg.fg_dir.clone()));
    }
    pipeline.push(PatchTransform::new(&plan.aug_patch_size, cfg.fg_rate, cfg.margin()));
    pipeline.push(
        SpatialTransform::new(&plan.patch_size, plan.rotation.clone(), plan.dummy_2d)
            .with_probabilities(cfg.p_rot_per_sample, cfg.p_scale_per_sample)
            .with_scale_range(cfg.scale_range),
    );
    pipeline.push(CenterCrop::new(&plan.patch_size));

    let ignore_axes = if plan.dummy_2d { vec![0] } else { Vec::new() };
    pipeline.push(GaussianNoise::default());
    pipeline.push(GaussianBlur::default());
    pipeline.push(BrightnessMultiplicative::default());
    pipeline.push(ContrastAugmentation::default());
    pipeline.push(SimulateLowResolution::default().ignore_axes(ignore_axes));
    pipeline.push(Gamma::inverted());
    pipeline.push(Gamma::default());

    if !plan.mirror_axes.is_empty() {
        pipeline.push(Mirror::new(plan.mirror_axes.clone()));
    }
    finish(pipeline, cfg)
}

/// 验证管线. `io` 为 `None` 时表示数据已预加载, 不需要读取阶段.
pub fn validation_transforms(cfg: &SegConfig, io: Option<Arc<dyn ImageIo>>) -> Compose {
    let mut pipeline = Compose::new();
    if let Some(io) = io {
        pipeline.push(DataReader::new(io, cfg.dim()).with_foreground(cfg.fg_dir.clone()));
    }
    pipeline.push(PatchTransform::new(&cfg.patch_size, cfg.fg_rate, cfg.margin()));
    finish(pipeline, cfg)
}

/// 训练与验证管线共同的尾部.
fn finish(mut pipeline: Compose, cfg: &SegConfig) -> Compose {
    pipeline.push(RemapLabel::new(BORDER, BACKGROUND));
    pipeline.push(Rename::new(MASK, TARGET));
    if let Some(scales) = &cfg.deep_supervision_scales {
        pipeline.push(DownsampleForDs::new(scales.clone(), cfg.ds_order, TARGET, TARGET));
    }
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Field;
    use crate::downsample::DsScale;
    use crate::SegError;
    use ndarray::{ArrayD, IxDyn};
    use rand::SeedableRng;

    /// 把图像沿最后一个轴截掉一格的错误阶段.
    struct Shrink;

    impl Transform for Shrink {
        fn name(&self) -> &'static str {
            "shrink"
        }

        fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
            let image = record.take_image(IMAGE)?;
            let shape = image.shape().to_vec();
            let mut smaller = shape.clone();
            *smaller.last_mut().unwrap() -= 1;
            record.insert(IMAGE, Field::Image(ArrayD::zeros(IxDyn(&smaller))));
            Ok(record)
        }
    }

    fn sample_record(n: usize, shape: &[usize]) -> Record {
        let mut full = vec![1];
        full.extend_from_slice(shape);
        let volumes = (0..n)
            .map(|i| Arc::new(ArrayD::from_elem(IxDyn(&full), i as f32)))
            .collect();
        let masks = (0..n)
            .map(|_| {
                let mut m = ArrayD::<u8>::zeros(IxDyn(&full));
                m.iter_mut().step_by(7).for_each(|v| *v = 1);
                Arc::new(m)
            })
            .collect();
        Record::new()
            .with(IMAGE, Field::Volumes(volumes))
            .with(MASK, Field::Masks(masks))
    }

    #[test]
    fn test_compose_detects_mismatch() {
        let cfg = SegConfig {
            patch_size: vec![8, 8],
            ..Default::default()
        };
        let pipeline = Compose::new()
            .then(PatchTransform::new(&cfg.patch_size, 0.5, cfg.margin()))
            .then(Shrink);
        let mut rng = StdRng::seed_from_u64(1);
        match pipeline.apply(sample_record(2, &[10, 12]), &mut rng) {
            Err(SegError::ShapeMismatch { stage, .. }) => assert_eq!(stage, "shrink"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validation_pipeline() {
        let cfg = SegConfig {
            patch_size: vec![6, 6, 6],
            deep_supervision_scales: Some(vec![DsScale::Uniform(1.0), DsScale::Uniform(0.5)]),
            ..Default::default()
        };
        let pipeline = validation_transforms(&cfg, None);
        assert_eq!(
            pipeline.names(),
            vec!["patch", "remap_label", "rename", "downsample_for_ds"]
        );
        let mut rng = StdRng::seed_from_u64(2);
        let batch = pipeline.run(sample_record(3, &[4, 9, 7]), &mut rng).unwrap();
        assert_eq!(batch.image.shape(), &[3, 1, 6, 6, 6]);
        assert_eq!(batch.target.len(), 2);
        assert_eq!(batch.target[1].shape(), &[3, 1, 3, 3, 3]);
        // 样本顺序保持不变.
        for (i, item) in batch.image.outer_iter().enumerate() {
            assert!(item.iter().all(|v| *v == 0.0 || *v == i as f32));
        }
    }

    #[test]
    fn test_training_pipeline() {
        for patch in [vec![12, 12], vec![8, 10, 10], vec![4, 16, 16]] {
            let cfg = SegConfig {
                patch_size: patch.clone(),
                ..Default::default()
            };
            let plan = AugmentPlan::from_config(&cfg).unwrap();
            let pipeline = training_transforms(&plan, &cfg, None);
            let mut rng = StdRng::seed_from_u64(3);
            for _ in 0..4 {
                let record = sample_record(2, &[20, 20, 20][..patch.len()]);
                let batch = pipeline.run(record, &mut rng).unwrap();
                assert_eq!(&batch.image.shape()[2..], patch.as_slice());
                assert_eq!(&batch.target[0].shape()[2..], patch.as_slice());
                assert!(batch.target[0].iter().all(|v| *v <= 1));
            }
        }
    }
}
