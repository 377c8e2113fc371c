//! 由 patch 形状推断增强参数: 旋转范围, 伪 2D 模式, 增强前的放大 patch 形状, 镜像轴.

use std::f64::consts::PI;

use crate::config::SegConfig;
use crate::consts::is_supported_spatial_dim;
use crate::{SegError, SegResult};

/// 角度转弧度.
#[inline]
fn deg(d: f64) -> f64 {
    d / 360.0 * 2.0 * PI
}

/// 计算增强前的放大 patch 形状时使用的缩放范围.
const PLAN_SCALE_RANGE: (f64, f64) = (0.85, 1.25);

/// 伪 2D 模式的判定阈值: 最长轴与第一个轴之比超过该值时启用.
const DUMMY_2D_RATIO: f64 = 3.0;

/// 增强参数.
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentPlan {
    /// 最终 patch 形状.
    pub patch_size: Vec<usize>,

    /// 旋转角度范围 (弧度). 2D 只有一个, 3D 依次为绕第 0, 1, 2 轴.
    pub rotation: Vec<(f64, f64)>,

    /// 伪 2D 模式: 只在后两个轴构成的平面内旋转与缩放, 第 0 轴保持不变.
    pub dummy_2d: bool,

    /// 空间变换之前裁剪的 (放大) patch 形状, 保证旋转缩放后中心区域不出现空洞.
    pub aug_patch_size: Vec<usize>,

    /// 镜像轴.
    pub mirror_axes: Vec<usize>,
}

impl AugmentPlan {
    /// 仅由 patch 形状推断增强参数.
    ///
    /// - 2D: 长宽比大于 1.5 时旋转 ±15°, 否则 ±180°; 镜像轴 `[0, 1]`.
    /// - 3D: 最长轴超过第 0 轴的 3 倍时启用伪 2D 模式并绕第 0 轴旋转 ±180°,
    ///   否则三个轴都旋转 ±30°; 镜像轴 `[0, 1, 2]`.
    pub fn from_patch_size(patch_size: &[usize]) -> SegResult<Self> {
        let dim = patch_size.len();
        if !is_supported_spatial_dim(dim) || patch_size.contains(&0) {
            return Err(SegError::config(format!(
                "cannot plan augmentation for patch size {patch_size:?}"
            )));
        }
        let max = *patch_size.iter().max().unwrap_or(&1) as f64;
        let min = *patch_size.iter().min().unwrap_or(&1) as f64;

        let (rotation, dummy_2d) = if dim == 2 {
            let r = if max / min > 1.5 { deg(15.0) } else { deg(180.0) };
            (vec![(-r, r)], false)
        } else if max / patch_size[0] as f64 > DUMMY_2D_RATIO {
            (vec![(-deg(180.0), deg(180.0)), (0.0, 0.0), (0.0, 0.0)], true)
        } else {
            let r = deg(30.0);
            (vec![(-r, r); 3], false)
        };
        let mirror_axes = (0..dim).collect();
        Ok(Self::assemble(patch_size, rotation, dummy_2d, mirror_axes))
    }

    /// 由配置推断增强参数. 配置中显式给出的旋转范围和镜像轴优先.
    pub fn from_config(cfg: &SegConfig) -> SegResult<Self> {
        let auto = Self::from_patch_size(&cfg.patch_size)?;
        let rotation = cfg.rotation.clone().unwrap_or(auto.rotation);
        let mirror_axes = cfg.mirror_axes.clone().unwrap_or(auto.mirror_axes);
        Ok(Self::assemble(&cfg.patch_size, rotation, auto.dummy_2d, mirror_axes))
    }

    fn assemble(
        patch_size: &[usize],
        rotation: Vec<(f64, f64)>,
        dummy_2d: bool,
        mirror_axes: Vec<usize>,
    ) -> Self {
        let mut aug_patch_size = get_patch_size(patch_size, &rotation, PLAN_SCALE_RANGE);
        if dummy_2d {
            aug_patch_size[0] = patch_size[0];
        }
        log::debug!(
            "dummy 2d augmentation: {dummy_2d}, augmentation patch size: {aug_patch_size:?}"
        );
        Self {
            patch_size: patch_size.to_vec(),
            rotation,
            dummy_2d,
            aug_patch_size,
            mirror_axes,
        }
    }
}

/// 3D 坐标分别绕第 0, 1, 2 轴旋转的结果 (行向量右乘旋转矩阵).
fn rotate_3d(c: [f64; 3], axis: usize, a: f64) -> [f64; 3] {
    let (s, co) = a.sin_cos();
    match axis {
        0 => [c[0], c[1] * co + c[2] * s, -c[1] * s + c[2] * co],
        1 => [c[0] * co - c[2] * s, c[1], c[0] * s + c[2] * co],
        _ => [c[0] * co + c[1] * s, -c[0] * s + c[1] * co, c[2]],
    }
}

/// 2D 坐标旋转.
fn rotate_2d(c: [f64; 2], a: f64) -> [f64; 2] {
    let (s, co) = a.sin_cos();
    [c[0] * co + c[1] * s, -c[0] * s + c[1] * co]
}

/// 旋转缩放后仍能覆盖 `final_patch_size` 的最小 patch 形状.
///
/// 每个轴取旋转范围绝对值的最大值 (不超过 90°), 分别旋转 patch 的对角向量,
/// 取各轴的最大绝对值, 再除以缩放范围的下界.
pub fn get_patch_size(
    final_patch_size: &[usize],
    rotation: &[(f64, f64)],
    scale_range: (f64, f64),
) -> Vec<usize> {
    let angle = |i: usize| {
        rotation
            .get(i)
            .map_or(0.0, |(lo, hi)| lo.abs().max(hi.abs()))
            .min(deg(90.0))
    };
    let coords: Vec<f64> = final_patch_size.iter().map(|&s| s as f64).collect();
    let mut shape = coords.clone();
    let mut absorb = |rotated: &[f64]| {
        for (s, r) in shape.iter_mut().zip(rotated) {
            *s = s.max(r.abs());
        }
    };
    match coords.len() {
        3 => {
            let c = [coords[0], coords[1], coords[2]];
            for axis in 0..3 {
                absorb(rotate_3d(c, axis, angle(axis)).as_slice());
            }
        }
        2 => absorb(rotate_2d([coords[0], coords[1]], angle(0)).as_slice()),
        _ => {}
    }
    shape
        .into_iter()
        .map(|s| (s / scale_range.0) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isotropic_3d() {
        let plan = AugmentPlan::from_patch_size(&[128, 128, 128]).unwrap();
        assert!(!plan.dummy_2d);
        assert_eq!(plan.rotation.len(), 3);
        assert_eq!(plan.mirror_axes, vec![0, 1, 2]);
        // 128 * (cos 30° + sin 30°) / 0.85 = 205.7
        assert_eq!(plan.aug_patch_size, vec![205, 205, 205]);
    }

    #[test]
    fn test_dummy_2d() {
        let plan = AugmentPlan::from_patch_size(&[16, 128, 128]).unwrap();
        assert!(plan.dummy_2d);
        assert_eq!(plan.aug_patch_size[0], 16);
        assert!(plan.aug_patch_size[1] >= 128);
        assert_eq!(plan.rotation[1], (0.0, 0.0));
    }

    #[test]
    fn test_2d() {
        let plan = AugmentPlan::from_patch_size(&[64, 64]).unwrap();
        assert_eq!(plan.rotation, vec![(-PI, PI)]);
        assert_eq!(plan.mirror_axes, vec![0, 1]);
        // 旋转被截断到 90°, 不会放大.
        assert_eq!(plan.aug_patch_size, vec![75, 75]);

        let plan = AugmentPlan::from_patch_size(&[32, 128]).unwrap();
        assert!((plan.rotation[0].1 - deg(15.0)).abs() < 1e-12);
    }

    #[test]
    fn test_invalid() {
        assert!(AugmentPlan::from_patch_size(&[64]).is_err());
        assert!(AugmentPlan::from_patch_size(&[64, 0, 64]).is_err());
    }

    #[test]
    fn test_config_overrides() {
        let cfg = SegConfig {
            patch_size: vec![32, 32, 32],
            mirror_axes: Some(vec![2]),
            rotation: Some(vec![(0.0, 0.0); 3]),
            ..Default::default()
        };
        let plan = AugmentPlan::from_config(&cfg).unwrap();
        assert_eq!(plan.mirror_axes, vec![2]);
        // 无旋转时只除以缩放下界.
        assert_eq!(plan.aug_patch_size, vec![37, 37, 37]);
    }
}
