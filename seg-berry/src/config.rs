//! 类型化的配置. 列出管线识别的全部参数及其默认值, 在加载时统一校验一次.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::{
    is_supported_spatial_dim, DEFAULT_FG_RATE, DEFAULT_QUEUE_FACTOR, DEFAULT_VAL_SPLIT,
    DEFAULT_WORKERS,
};
use crate::downsample::DsScale;
use crate::{SegError, SegResult};

/// 数据管线配置.
///
/// 缺省字段取 [`Default`] 中的值. 构造后应调用 [`SegConfig::validate`];
/// [`SegConfig::from_json_file`] 会自动校验.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegConfig {
    /// 图像目录.
    pub img_dir: PathBuf,

    /// 标签目录. 与图像同名的文件视为一对.
    pub msk_dir: PathBuf,

    /// 前景索引缓存目录. 为 `None` 时每次裁剪都扫描标签.
    pub fg_dir: Option<PathBuf>,

    /// 折表 (csv). 为 `None` 时按 `val_split` 划分目录中的文件.
    pub folds_csv: Option<PathBuf>,

    /// 用作验证集的折号.
    pub fold: usize,

    /// 没有折表时划入验证集的比例.
    pub val_split: f64,

    /// 训练模式 (否则为验证模式).
    pub train: bool,

    /// 是否在构造时把整个数据集读入内存 (仅支持 `.npy`).
    pub load_data: bool,

    /// 最终 patch 的空间形状, 2 或 3 个维度.
    pub patch_size: Vec<usize>,

    /// 批量大小.
    pub batch_size: usize,

    /// 每个 epoch 的总步数 (所有工作线程合计).
    pub nbof_steps: usize,

    /// 以前景为锚点裁剪的概率.
    pub fg_rate: f64,

    /// 前景锚点距窗口边界的最小距离. 为空时视为全 0.
    pub fg_margin: Vec<usize>,

    /// 工作线程个数. 为 1 时在调用者线程中生产批量.
    pub num_workers: usize,

    /// 批量队列容量. 为 `None` 时取 `DEFAULT_QUEUE_FACTOR * num_workers`.
    pub queue_capacity: Option<usize>,

    /// 随机种子. 第 `i` 个工作线程使用 `seed + i`.
    pub seed: u64,

    /// deep supervision 尺度. 为 `None` 时不生成多分辨率目标.
    pub deep_supervision_scales: Option<Vec<DsScale>>,

    /// deep supervision 降采样的插值阶数.
    pub ds_order: usize,

    /// 镜像轴. 为 `None` 时由 patch 形状推断.
    pub mirror_axes: Option<Vec<usize>>,

    /// 每个轴的旋转角度范围 (弧度). 为 `None` 时由 patch 形状推断.
    pub rotation: Option<Vec<(f64, f64)>>,

    /// 单个样本做旋转的概率.
    pub p_rot_per_sample: f64,

    /// 单个样本做缩放的概率.
    pub p_scale_per_sample: f64,

    /// 缩放系数范围.
    pub scale_range: (f64, f64),
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            img_dir: PathBuf::new(),
            msk_dir: PathBuf::new(),
            fg_dir: None,
            folds_csv: None,
            fold: 0,
            val_split: DEFAULT_VAL_SPLIT,
            train: true,
            load_data: false,
            patch_size: vec![128, 128, 128],
            batch_size: 2,
            nbof_steps: 250,
            fg_rate: DEFAULT_FG_RATE,
            fg_margin: Vec::new(),
            num_workers: DEFAULT_WORKERS,
            queue_capacity: None,
            seed: 0,
            deep_supervision_scales: None,
            ds_order: 0,
            mirror_axes: None,
            rotation: None,
            p_rot_per_sample: 0.2,
            p_scale_per_sample: 0.2,
            scale_range: (0.7, 1.4),
        }
    }
}

/// `v` 是否为合法概率?
#[inline]
fn is_prob(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl SegConfig {
    /// 读取 json 配置文件并校验.
    pub fn from_json_file(path: impl AsRef<Path>) -> SegResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let cfg: Self = serde_json::from_reader(reader)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 空间维度个数.
    #[inline]
    pub fn dim(&self) -> usize {
        self.patch_size.len()
    }

    /// 前景边距; 未配置时为全 0.
    pub fn margin(&self) -> Vec<usize> {
        if self.fg_margin.is_empty() {
            vec![0; self.dim()]
        } else {
            self.fg_margin.clone()
        }
    }

    /// 实际使用的队列容量.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(DEFAULT_QUEUE_FACTOR * self.num_workers)
            .max(1)
    }

    /// 校验所有参数. 第一个非法参数以 [`SegError::Configuration`] 报告.
    pub fn validate(&self) -> SegResult<()> {
        let dim = self.dim();
        if !is_supported_spatial_dim(dim) {
            return Err(SegError::config(format!(
                "patch_size must have 2 or 3 axes, got {:?}",
                self.patch_size
            )));
        }
        if self.patch_size.contains(&0) {
            return Err(SegError::config("patch_size contains a zero axis"));
        }
        if self.batch_size == 0 {
            return Err(SegError::config("batch_size must be positive"));
        }
        if self.nbof_steps == 0 {
            return Err(SegError::config("nbof_steps must be positive"));
        }
        if self.num_workers == 0 {
            return Err(SegError::config("num_workers must be positive"));
        }
        if self.queue_capacity == Some(0) {
            return Err(SegError::config("queue_capacity must be positive"));
        }
        for (name, p) in [
            ("fg_rate", self.fg_rate),
            ("val_split", self.val_split),
            ("p_rot_per_sample", self.p_rot_per_sample),
            ("p_scale_per_sample", self.p_scale_per_sample),
        ] {
            if !is_prob(p) {
                return Err(SegError::config(format!("{name} must lie in [0, 1], got {p}")));
            }
        }
        if !self.fg_margin.is_empty() && self.fg_margin.len() != dim {
            return Err(SegError::config(format!(
                "fg_margin has {} axes but patch_size has {dim}",
                self.fg_margin.len()
            )));
        }
        let (lo, hi) = self.scale_range;
        if !(lo > 0.0 && lo <= hi) {
            return Err(SegError::config(format!("invalid scale_range ({lo}, {hi})")));
        }
        if let Some(axes) = &self.mirror_axes {
            if let Some(a) = axes.iter().find(|a| **a >= dim) {
                return Err(SegError::config(format!("mirror axis {a} out of range")));
            }
        }
        if let Some(rotation) = &self.rotation {
            let expected = if dim == 2 { 1 } else { 3 };
            if rotation.len() != expected {
                return Err(SegError::config(format!(
                    "rotation needs {expected} ranges for {dim}d patches, got {}",
                    rotation.len()
                )));
            }
        }
        if let Some(scales) = &self.deep_supervision_scales {
            for s in scales {
                s.check(dim)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = SegConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.capacity(), 2 * DEFAULT_WORKERS);
        assert_eq!(cfg.margin(), vec![0, 0, 0]);
    }

    #[test]
    fn test_partial_json() {
        let cfg: SegConfig = serde_json::from_str(
            r#"{
                "patch_size": [64, 96],
                "batch_size": 8,
                "deep_supervision_scales": [1.0, [0.5, 0.5], 0.25]
            }"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.dim(), 2);
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.fg_rate, DEFAULT_FG_RATE);
        assert_eq!(
            cfg.deep_supervision_scales.unwrap(),
            vec![
                DsScale::Uniform(1.0),
                DsScale::PerAxis(vec![0.5, 0.5]),
                DsScale::Uniform(0.25)
            ]
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            SegConfig {
                patch_size: vec![64],
                ..Default::default()
            },
            SegConfig {
                batch_size: 0,
                ..Default::default()
            },
            SegConfig {
                fg_rate: 1.5,
                ..Default::default()
            },
            SegConfig {
                num_workers: 0,
                ..Default::default()
            },
            SegConfig {
                fg_margin: vec![1, 1],
                ..Default::default()
            },
            SegConfig {
                scale_range: (1.4, 0.7),
                ..Default::default()
            },
            SegConfig {
                mirror_axes: Some(vec![3]),
                ..Default::default()
            },
            SegConfig {
                deep_supervision_scales: Some(vec![DsScale::PerAxis(vec![0.5, 0.5])]),
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(SegError::Configuration(_))),
                "{cfg:?}"
            );
        }
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("seg-berry-cfg-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"patch_size": [32, 32, 32], "num_workers": 3}"#).unwrap();
        let cfg = SegConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.capacity(), 6);

        std::fs::write(&path, r#"{"patch_size": [32, 32, 32], "val_split": -1.0}"#).unwrap();
        assert!(SegConfig::from_json_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
