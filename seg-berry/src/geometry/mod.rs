//! 几何采样: 裁剪窗口的选取, 裁剪, 居中填充.
//!
//! 所有数组都按 `(c, 空间维度...)` 组织, 窗口只作用于空间维度.
//! 该模块不持有任何状态, 随机性全部来自调用者传入的 `rng`.
//!
//! 退化情形 (目标比原图大, 前景为空) 一律按既定策略静默回退, 不会报错:
//!
//! 1. 目标形状在某轴上不小于原图时, 该轴起点固定为 0;
//! 2. 所选前景通道没有前景体素时, 退回到随机窗口;
//! 3. 裁剪结果不足目标形状时, 用 0 居中填充.

use itertools::izip;
use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn, Slice};
use num::Zero;
use rand::Rng;

use crate::consts::label::FOREGROUND;
use crate::data::{ForegroundIndex, LabelMask, Volume};

pub mod interp;

/// 裁剪窗口: 空间维度上的起点和形状.
///
/// `start + shape <= source_shape` 不一定成立 (之后可能需要填充),
/// 但 `shape` 永远是请求的目标形状.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CropWindow {
    /// 起点.
    pub start: Vec<usize>,
    /// 形状.
    pub shape: Vec<usize>,
}

impl CropWindow {
    /// 以 `start` 为起点, `shape` 为形状构造窗口.
    ///
    /// 两者长度不同时程序 panic.
    #[inline]
    pub fn new(start: Vec<usize>, shape: &[usize]) -> Self {
        assert_eq!(start.len(), shape.len(), "窗口起点与形状维度不一致");
        Self {
            start,
            shape: shape.to_vec(),
        }
    }

    /// 窗口在第 `axis` 个空间轴上、被 `len` 截断后的范围.
    #[inline]
    fn clipped(&self, axis: usize, len: usize) -> Slice {
        let lo = self.start[axis].min(len);
        let hi = (self.start[axis] + self.shape[axis]).min(len);
        Slice::from(lo..hi)
    }
}

/// 随机窗口. 每个轴上独立地从 `[0, max(1, source - target))` 均匀抽取起点.
///
/// 若某轴上 `target >= source`, 该轴起点恒为 0.
/// 两个形状维度不同时程序 panic.
pub fn random_window<R: Rng + ?Sized>(
    source: &[usize],
    target: &[usize],
    rng: &mut R,
) -> Vec<usize> {
    assert_eq!(source.len(), target.len(), "原图与目标形状维度不一致");
    source
        .iter()
        .zip(target)
        .map(|(&s, &t)| rng.gen_range(0..s.saturating_sub(t).max(1)))
        .collect()
}

/// 强制包含 `anchor` 体素的窗口.
///
/// 每个轴上, 起点从 `[lower, upper]` 均匀抽取, 其中
/// `lower = max(0, anchor + margin + 1 - target)`,
/// `upper = max(lower, min(anchor - margin, source - target))`.
/// 可行时 (`target <= source` 且 `anchor` 距边界足够远),
/// `anchor` 一定位于 `[start + margin, start + target - margin)` 内;
/// 不可行时取 `lower`, 不会失败.
pub fn forced_window<R: Rng + ?Sized>(
    source: &[usize],
    target: &[usize],
    anchor: &[usize],
    margin: &[usize],
    rng: &mut R,
) -> Vec<usize> {
    assert!(
        source.len() == target.len()
            && target.len() == anchor.len()
            && anchor.len() == margin.len(),
        "窗口参数维度不一致"
    );
    izip!(source, target, anchor, margin)
        .map(|(&s, &t, &a, &m)| {
            let (s, t, a, m) = (s as i64, t as i64, a as i64, m as i64);
            let lower = (a + m + 1 - t).max(0);
            let upper = (a - m).min(s - t).max(lower);
            rng.gen_range(lower..=upper) as usize
        })
        .collect()
}

/// 在 `plane` 中值为 `value` 的体素里均匀随机选取一个. 不存在时返回 `None`.
///
/// 先计数再定位, 不收集全部坐标.
fn random_voxel<R: Rng + ?Sized>(
    plane: ArrayViewD<u8>,
    value: u8,
    rng: &mut R,
) -> Option<Vec<usize>> {
    let n = plane.iter().filter(|v| **v == value).count();
    if n == 0 {
        return None;
    }
    let k = rng.gen_range(0..n);
    plane
        .indexed_iter()
        .filter(|(_, v)| **v == value)
        .nth(k)
        .map(|(pos, _)| pos.slice().to_vec())
}

/// 以前景体素为锚点的窗口.
///
/// - 独热编码 (通道数大于 1): 均匀选取一个通道, 再在该通道值为 1
///   的体素中均匀选取锚点;
/// - 整数编码 (单通道): 在 `1..=max` 中均匀选取一个标签值, 再在等于该值的体素中选取锚点.
///
/// 所选通道 (或标签值) 没有体素时, 退回到 [`random_window`], 不会换一个通道重试.
pub fn foreground_window<R: Rng + ?Sized>(
    mask: &ArrayViewD<u8>,
    target: &[usize],
    margin: &[usize],
    rng: &mut R,
) -> Vec<usize> {
    let source = &mask.shape()[1..];
    let channels = mask.len_of(Axis(0));
    let anchor = if channels == 1 {
        let plane = mask.index_axis(Axis(0), 0);
        match plane.iter().copied().max() {
            Some(max) if max > 0 => {
                let value = rng.gen_range(1..=max);
                random_voxel(plane, value, rng)
            }
            _ => None,
        }
    } else {
        let c = rng.gen_range(0..channels);
        random_voxel(mask.index_axis(Axis(0), c), FOREGROUND, rng)
    };
    match anchor {
        Some(anchor) => forced_window(source, target, &anchor, margin, rng),
        None => random_window(source, target, rng),
    }
}

/// 与 [`foreground_window`] 相同, 但锚点取自预先计算好的前景索引, 无需扫描标签.
pub fn foreground_window_indexed<R: Rng + ?Sized>(
    index: &ForegroundIndex,
    source: &[usize],
    target: &[usize],
    margin: &[usize],
    rng: &mut R,
) -> Vec<usize> {
    let anchor = index.random_location(rng);
    match anchor {
        Some(anchor) => forced_window(source, target, &anchor, margin, rng),
        None => random_window(source, target, rng),
    }
}

/// 按 `window` 复制所有通道. 超出 `array` 的部分被截断, 因此结果可能小于窗口形状.
pub fn crop<T: Clone>(array: &ArrayViewD<T>, window: &CropWindow) -> ArrayD<T> {
    array
        .slice_each_axis(|ax| match ax.axis.index() {
            0 => Slice::from(..),
            i => window.clipped(i - 1, ax.len),
        })
        .to_owned()
}

/// 居中填充到 `target`, 填充值为 0.
///
/// 每个空间轴上, 前端填充 `max(0, (target - s) / 2)`, 其余不足部分全部补在后端.
/// 永远不裁剪: `s > target` 的轴保持原样.
pub fn centered_pad<T: Clone + Zero>(array: &ArrayViewD<T>, target: &[usize]) -> ArrayD<T> {
    let shape = array.shape();
    let spatial = &shape[1..];
    assert_eq!(spatial.len(), target.len(), "原图与目标形状维度不一致");

    let lead: Vec<usize> = spatial
        .iter()
        .zip(target)
        .map(|(&s, &t)| t.saturating_sub(s) / 2)
        .collect();
    let mut out_shape = Vec::with_capacity(shape.len());
    out_shape.push(shape[0]);
    out_shape.extend(spatial.iter().zip(target).map(|(&s, &t)| s.max(t)));

    let mut out = ArrayD::<T>::zeros(IxDyn(&out_shape));
    out.slice_each_axis_mut(|ax| match ax.axis.index() {
        0 => Slice::from(..),
        i => Slice::from(lead[i - 1]..lead[i - 1] + spatial[i - 1]),
    })
    .assign(array);
    out
}

/// 裁剪后若不足目标形状, 则同时居中填充图像与标签.
fn pad_if_needed(image: Volume, mask: LabelMask, target: &[usize]) -> (Volume, LabelMask) {
    if image.shape()[1..] == *target && mask.shape()[1..] == *target {
        (image, mask)
    } else {
        (
            centered_pad(&image.view(), target),
            centered_pad(&mask.view(), target),
        )
    }
}

/// 随机裁剪并在需要时填充, 得到恰好为 `target` 空间形状的 (图像, 标签) 对.
///
/// 以概率 `fg_rate` 选用前景窗口 (有 `fg` 时用预计算的前景索引),
/// 否则选用随机窗口. 结果是新分配的数组, 不会修改输入.
///
/// `image` 与 `mask` 的空间形状必须一致, 否则程序 panic.
pub fn crop_pad<R: Rng + ?Sized>(
    image: &ArrayViewD<f32>,
    mask: &ArrayViewD<u8>,
    target: &[usize],
    fg_rate: f64,
    margin: &[usize],
    fg: Option<&ForegroundIndex>,
    rng: &mut R,
) -> (Volume, LabelMask) {
    let source = &image.shape()[1..];
    assert_eq!(source, &mask.shape()[1..], "图像与标签空间形状不一致");

    let start = if fg_rate > 0.0 && rng.gen::<f64>() < fg_rate {
        match fg {
            Some(index) => foreground_window_indexed(index, source, target, margin, rng),
            None => foreground_window(mask, target, margin, rng),
        }
    } else {
        random_window(source, target, rng)
    };
    let window = CropWindow::new(start, target);
    pad_if_needed(crop(image, &window), crop(mask, &window), target)
}

/// 居中裁剪到 `target`; 不足的轴保持原样.
pub fn center_crop<T: Clone>(array: &ArrayViewD<T>, target: &[usize]) -> ArrayD<T> {
    let source = &array.shape()[1..];
    let start = source
        .iter()
        .zip(target)
        .map(|(&s, &t)| s.saturating_sub(t) / 2)
        .collect();
    crop(array, &CropWindow::new(start, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    /// 所有源/目标形状组合下, `centered_pad` 的输出形状.
    #[test]
    fn test_centered_pad_shape() {
        for s in 1..=6usize {
            for t in 1..=6usize {
                let a = ArrayD::<f32>::ones(IxDyn(&[2, s, 3, t]));
                let p = centered_pad(&a.view(), &[t, 3, s]);
                assert_eq!(p.shape(), &[2, s.max(t), 3, t.max(s)]);
            }
        }
    }

    #[test]
    fn test_centered_pad_content() {
        let a = ArrayD::<u8>::from_shape_vec(IxDyn(&[1, 3]), vec![1, 2, 3]).unwrap();
        // lead = (6 - 3) / 2 = 1, trail = 2.
        let p = centered_pad(&a.view(), &[6]);
        assert_eq!(p.as_slice().unwrap(), &[0, 1, 2, 3, 0, 0]);

        // 不裁剪.
        let p = centered_pad(&a.view(), &[2]);
        assert_eq!(p, a);
    }

    #[test]
    fn test_random_window_forced_zero() {
        let mut rng = rng();
        for _ in 0..100 {
            let s = random_window(&[4, 10, 1], &[4, 12, 5], &mut rng);
            assert_eq!(s, vec![0, 0, 0]);
            let s = random_window(&[20, 10], &[5, 10], &mut rng);
            assert!(s[0] < 15);
            assert_eq!(s[1], 0);
        }
    }

    /// 可行时, 锚点总是位于 margin 收缩后的窗口内.
    #[test]
    fn test_forced_window_contains_anchor() {
        let mut rng = rng();
        let source = [17usize, 9, 12];
        let target = [8usize, 9, 5];
        for a0 in 0..source[0] {
            for a2 in 0..source[2] {
                let anchor = [a0, 4, a2];
                let start = forced_window(&source, &target, &anchor, &[0, 0, 0], &mut rng);
                for k in 0..3 {
                    assert!(start[k] <= anchor[k] && anchor[k] < start[k] + target[k]);
                    assert!(start[k] + target[k] <= source[k]);
                }
            }
        }

        let margin = [2usize, 0, 1];
        for a0 in 2..15 {
            for a2 in 1..11 {
                let anchor = [a0, 4, a2];
                let start = forced_window(&source, &target, &anchor, &margin, &mut rng);
                for k in 0..3 {
                    assert!(start[k] + margin[k] <= anchor[k]);
                    assert!(anchor[k] < start[k] + target[k] - margin[k]);
                }
            }
        }
    }

    #[test]
    fn test_forced_window_degenerate() {
        let mut rng = rng();
        // 目标比原图大.
        let start = forced_window(&[3, 3], &[8, 8], &[2, 0], &[0, 0], &mut rng);
        assert_eq!(start, vec![0, 0]);
    }

    /// 任意源形状 (含单体素) 裁剪 + 填充后都恰好为目标形状.
    #[test]
    fn test_crop_pad_exact_shape() {
        let mut rng = rng();
        let target = [4usize, 5, 3];
        for shape in [[1usize, 1, 1], [4, 5, 3], [9, 2, 7], [3, 12, 1], [10, 10, 10]] {
            let full: Vec<usize> = std::iter::once(2).chain(shape).collect();
            let image = ArrayD::<f32>::ones(IxDyn(&full));
            let mut mask = ArrayD::<u8>::zeros(IxDyn(&full));
            mask[[1, 0, 0, 0].as_slice()] = 1;
            for fg_rate in [0.0, 1.0] {
                let (i, m) = crop_pad(
                    &image.view(),
                    &mask.view(),
                    &target,
                    fg_rate,
                    &[0, 0, 0],
                    None,
                    &mut rng,
                );
                assert_eq!(&i.shape()[1..], &target);
                assert_eq!(&m.shape()[1..], &target);
                assert_eq!(i.shape()[0], 2);
            }
        }
    }

    /// 前景窗口一定包含某个前景体素.
    #[test]
    fn test_foreground_window_hits_foreground() {
        let mut rng = rng();
        let mut mask = ArrayD::<u8>::zeros(IxDyn(&[2, 32, 32]));
        mask[[1, 30, 2].as_slice()] = 1;
        mask[[0, 5, 27].as_slice()] = 1;
        for _ in 0..50 {
            let start = foreground_window(&mask.view(), &[8, 8], &[0, 0], &mut rng);
            let w = CropWindow::new(start, &[8, 8]);
            let c = crop(&mask.view(), &w);
            assert!(c.iter().any(|v| *v == 1));
        }
    }

    #[test]
    fn test_foreground_window_empty_falls_back() {
        let mut rng = rng();
        let mask = ArrayD::<u8>::zeros(IxDyn(&[3, 6, 6]));
        let start = foreground_window(&mask.view(), &[4, 4], &[0, 0], &mut rng);
        assert!(start.iter().all(|s| *s < 2));
    }

    #[test]
    fn test_foreground_window_integer_labels() {
        let mut rng = rng();
        let mut mask = ArrayD::<u8>::zeros(IxDyn(&[1, 40]));
        mask[[0, 37].as_slice()] = 1;
        for _ in 0..20 {
            let start = foreground_window(&mask.view(), &[5], &[0], &mut rng);
            assert!((33..=35).contains(&start[0]));
        }
    }

    #[test]
    fn test_center_crop() {
        let a = ArrayD::<u8>::from_shape_fn(IxDyn(&[1, 7]), |i| i[1] as u8);
        let c = center_crop(&a.view(), &[3]);
        assert_eq!(c.as_slice().unwrap(), &[2, 3, 4]);
        let c = center_crop(&a.view(), &[9]);
        assert_eq!(c.shape(), &[1, 7]);
    }
}
