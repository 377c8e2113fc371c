//! 强度增强: 噪声, 模糊, 亮度, 对比度, 低分辨率模拟, gamma.
//!
//! 所有阶段都作用于图像键下 `(b, c, 空间维度...)` 的批量图像, 不修改标签.
//! 随机参数先在调用者线程中按样本顺序抽取, 之后再 (并行地) 逐平面应用,
//! 因此结果只取决于传入的随机数发生器, 与线程调度无关.

use ndarray::{ArrayBase, ArrayD, ArrayViewMutD, Axis, Data, IxDyn};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::augment::Transform;
use crate::consts::keys::IMAGE;
use crate::data::{Field, Record};
use crate::geometry::interp::{resize_linear, resize_nearest};
use crate::{SegError, SegResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 每个样本每个通道的参数; `None` 表示该平面不做变换.
type Params<P> = Vec<Vec<Option<P>>>;

/// 从 `[lo, hi]` 中均匀抽取; 区间退化时返回 `lo`.
#[inline]
fn uniform(rng: &mut StdRng, (lo, hi): (f64, f64)) -> f64 {
    if lo < hi {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

/// 围绕 1 抽取系数: 一半概率从 `[lo, 1]` 中抽取 (若 `lo < 1`), 否则从 `[max(lo, 1), hi]` 中抽取.
fn around_one(rng: &mut StdRng, (lo, hi): (f64, f64)) -> f64 {
    if rng.gen::<f64>() < 0.5 && lo < 1.0 {
        uniform(rng, (lo, 1.0))
    } else {
        uniform(rng, (lo.max(1.0), hi))
    }
}

/// 按样本顺序抽取参数.
///
/// 每个样本以 `p_sample` 的概率被选中; 选中的样本中每个通道再以 `p_channel` 的概率被选中.
/// `per_channel` 为假时同一样本的所有通道共享一组参数.
fn draw_params<P: Clone>(
    image: &ArrayD<f32>,
    p_sample: f64,
    p_channel: f64,
    per_channel: bool,
    rng: &mut StdRng,
    mut draw: impl FnMut(&mut StdRng) -> P,
) -> Params<P> {
    let (b, c) = (image.len_of(Axis(0)), image.len_of(Axis(1)));
    (0..b)
        .map(|_| {
            if rng.gen::<f64>() >= p_sample {
                return vec![None; c];
            }
            let shared = (!per_channel).then(|| draw(rng));
            (0..c)
                .map(|_| {
                    if rng.gen::<f64>() >= p_channel {
                        return None;
                    }
                    Some(match &shared {
                        Some(p) => p.clone(),
                        None => draw(rng),
                    })
                })
                .collect()
        })
        .collect()
}

/// 对每个被选中的 (样本, 通道) 平面调用 `f(通道号, 平面, 参数)`.
fn for_each_plane<P, F>(image: &mut ArrayD<f32>, params: &Params<P>, f: F)
where
    P: Sync,
    F: Fn(usize, ArrayViewMutD<f32>, &P) + Sync,
{
    let per_sample = |(mut sample, ps): (ArrayViewMutD<f32>, &Vec<Option<P>>)| {
        for (ch, (plane, p)) in sample.outer_iter_mut().zip(ps).enumerate() {
            if let Some(p) = p {
                f(ch, plane, p);
            }
        }
    };

    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            image
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(params.into_par_iter())
                .for_each(per_sample);
        } else {
            image
                .axis_iter_mut(Axis(0))
                .zip(params)
                .for_each(per_sample);
        }
    }
}

/// 取出批量图像, 调用 `f` 修改后放回.
fn with_image(mut record: Record, f: impl FnOnce(&mut ArrayD<f32>)) -> SegResult<Record> {
    let mut image = record.take_image(IMAGE)?;
    if image.ndim() < 3 {
        return Err(SegError::field(IMAGE, "expected a (b, c, spatial...) image"));
    }
    f(&mut image);
    record.insert(IMAGE, Field::Image(image));
    Ok(record)
}

/// 平面的均值与 (总体) 标准差.
fn mean_std<S: Data<Elem = f32>>(plane: &ArrayBase<S, IxDyn>) -> (f64, f64) {
    let n = plane.len().max(1) as f64;
    let mean = plane.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = plane.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// 平面的最小值与最大值. 空平面返回 `(0, 0)`.
fn min_max<S: Data<Elem = f32>>(plane: &ArrayBase<S, IxDyn>) -> (f32, f32) {
    let min = plane.iter().copied().map(OrderedFloat).min();
    let max = plane.iter().copied().map(OrderedFloat).max();
    match (min, max) {
        (Some(lo), Some(hi)) => (lo.0, hi.0),
        _ => (0.0, 0.0),
    }
}

/// 加性高斯噪声. 噪声标准差取抽到的 "方差" 值本身.
#[derive(Clone, Debug)]
pub struct GaussianNoise {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// 方差范围.
    pub variance: (f64, f64),
}

impl Default for GaussianNoise {
    fn default() -> Self {
        Self {
            p_per_sample: 0.1,
            variance: (0.0, 0.1),
        }
    }
}

impl Transform for GaussianNoise {
    fn name(&self) -> &'static str {
        "gaussian_noise"
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            // 逐体素的噪声在工作线程中由各自的种子生成.
            let params = draw_params(image, self.p_per_sample, 1.0, false, rng, |r| {
                (uniform(r, self.variance), r.gen::<u64>())
            });
            for_each_plane(image, &params, |ch, mut plane, &(std, seed)| {
                let Ok(normal) = Normal::new(0.0f32, std as f32) else {
                    return;
                };
                let mut local = StdRng::seed_from_u64(seed.wrapping_add(ch as u64));
                plane.iter_mut().for_each(|v| *v += normal.sample(&mut local));
            });
        })
    }
}

/// 半径为 `int(4σ + 0.5)` 的归一化高斯核.
fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (4.0 * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// 镜像延拓的下标: `d c b a | a b c d | d c b a`.
#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let m = i.rem_euclid(2 * n);
    (if m >= n { 2 * n - 1 - m } else { m }) as usize
}

/// 沿每个轴做一维卷积, 实现可分离的高斯模糊.
fn blur_plane(mut plane: ArrayViewMutD<f32>, sigma: f64) {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let mut buf = Vec::new();
    for axis in 0..plane.ndim() {
        let n = plane.len_of(Axis(axis));
        for mut lane in plane.lanes_mut(Axis(axis)) {
            buf.clear();
            buf.extend(lane.iter().copied());
            for (i, out) in lane.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * buf[reflect(i as isize + k as isize - radius, n)])
                    .sum();
            }
        }
    }
}

/// 高斯模糊. 每个通道的 σ 单独抽取.
#[derive(Clone, Debug)]
pub struct GaussianBlur {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// 通道被选中的概率.
    pub p_per_channel: f64,
    /// σ 的范围 (体素).
    pub sigma: (f64, f64),
}

impl Default for GaussianBlur {
    fn default() -> Self {
        Self {
            p_per_sample: 0.2,
            p_per_channel: 0.5,
            sigma: (0.5, 1.0),
        }
    }
}

impl Transform for GaussianBlur {
    fn name(&self) -> &'static str {
        "gaussian_blur"
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            let params = draw_params(image, self.p_per_sample, self.p_per_channel, true, rng, |r| {
                uniform(r, self.sigma)
            });
            for_each_plane(image, &params, |_, plane, &sigma| blur_plane(plane, sigma));
        })
    }
}

/// 亮度: 每个通道乘以一个随机系数.
#[derive(Clone, Debug)]
pub struct BrightnessMultiplicative {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// 系数范围.
    pub multiplier: (f64, f64),
}

impl Default for BrightnessMultiplicative {
    fn default() -> Self {
        Self {
            p_per_sample: 0.15,
            multiplier: (0.75, 1.25),
        }
    }
}

impl Transform for BrightnessMultiplicative {
    fn name(&self) -> &'static str {
        "brightness"
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            let params = draw_params(image, self.p_per_sample, 1.0, true, rng, |r| {
                uniform(r, self.multiplier) as f32
            });
            for_each_plane(image, &params, |_, mut plane, &m| plane.mapv_inplace(|v| v * m));
        })
    }
}

/// 对比度: `x = (x - 均值) * 系数 + 均值`, 可选地截断回原取值范围.
#[derive(Clone, Debug)]
pub struct ContrastAugmentation {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// 系数范围.
    pub range: (f64, f64),
    /// 是否截断到变换前的最小值与最大值之间.
    pub preserve_range: bool,
}

impl Default for ContrastAugmentation {
    fn default() -> Self {
        Self {
            p_per_sample: 0.15,
            range: (0.75, 1.25),
            preserve_range: true,
        }
    }
}

impl Transform for ContrastAugmentation {
    fn name(&self) -> &'static str {
        "contrast"
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            let params = draw_params(image, self.p_per_sample, 1.0, true, rng, |r| {
                around_one(r, self.range)
            });
            for_each_plane(image, &params, |_, mut plane, &factor| {
                let (mean, _) = mean_std(&plane);
                let (lo, hi) = min_max(&plane);
                plane.mapv_inplace(|v| {
                    let x = ((v as f64 - mean) * factor + mean) as f32;
                    if self.preserve_range {
                        x.clamp(lo, hi)
                    } else {
                        x
                    }
                });
            });
        })
    }
}

/// 低分辨率模拟: 最近邻降采样后再线性插值回原形状.
#[derive(Clone, Debug)]
pub struct SimulateLowResolution {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// 通道被选中的概率.
    pub p_per_channel: f64,
    /// 缩放系数范围.
    pub zoom: (f64, f64),
    /// 不做降采样的空间轴 (从 0 开始, 不计通道).
    pub ignore_axes: Vec<usize>,
}

impl Default for SimulateLowResolution {
    fn default() -> Self {
        Self {
            p_per_sample: 0.25,
            p_per_channel: 0.5,
            zoom: (0.5, 1.0),
            ignore_axes: Vec::new(),
        }
    }
}

impl SimulateLowResolution {
    /// 设置不做降采样的空间轴. 伪 2D 模式下通常为 `[0]`.
    pub fn ignore_axes(mut self, axes: Vec<usize>) -> Self {
        self.ignore_axes = axes;
        self
    }
}

impl Transform for SimulateLowResolution {
    fn name(&self) -> &'static str {
        "simulate_low_resolution"
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            let params = draw_params(image, self.p_per_sample, self.p_per_channel, true, rng, |r| {
                uniform(r, self.zoom)
            });
            for_each_plane(image, &params, |_, mut plane, &zoom| {
                let shape = plane.shape().to_vec();
                let low: Vec<usize> = shape
                    .iter()
                    .enumerate()
                    .map(|(axis, &s)| {
                        if self.ignore_axes.contains(&axis) {
                            s
                        } else {
                            ((s as f64 * zoom).round() as usize).max(1)
                        }
                    })
                    .collect();
                let down = resize_nearest(&plane.view(), &low);
                plane.assign(&resize_linear(&down.view(), &shape));
            });
        })
    }
}

/// gamma 变换: `((x - min) / range) ^ g * range + min`.
///
/// `invert` 为真时先对强度取反, 变换后再取反回来;
/// `retain_stats` 为真时变换后恢复原来的均值与标准差.
#[derive(Clone, Debug)]
pub struct Gamma {
    /// 样本被选中的概率.
    pub p_per_sample: f64,
    /// gamma 范围.
    pub range: (f64, f64),
    /// 是否取反.
    pub invert: bool,
    /// 是否保持均值与标准差.
    pub retain_stats: bool,
}

impl Default for Gamma {
    fn default() -> Self {
        Self {
            p_per_sample: 0.3,
            range: (0.7, 1.5),
            invert: false,
            retain_stats: true,
        }
    }
}

impl Gamma {
    /// 取反强度后做 gamma 变换, 概率为 0.1.
    pub fn inverted() -> Self {
        Self {
            p_per_sample: 0.1,
            invert: true,
            ..Self::default()
        }
    }

    fn apply_plane(&self, mut plane: ArrayViewMutD<f32>, gamma: f64) {
        if self.invert {
            plane.mapv_inplace(|v| -v);
        }
        let (mean, std) = mean_std(&plane);
        let (lo, hi) = min_max(&plane);
        let (lo, range) = (lo as f64, (hi - lo) as f64);
        plane.mapv_inplace(|v| {
            let x = ((v as f64 - lo) / (range + 1e-7)).max(0.0);
            (x.powf(gamma) * range + lo) as f32
        });
        if self.retain_stats {
            let (m, s) = mean_std(&plane);
            plane.mapv_inplace(|v| ((v as f64 - m) / (s + 1e-8) * std + mean) as f32);
        }
        if self.invert {
            plane.mapv_inplace(|v| -v);
        }
    }
}

impl Transform for Gamma {
    fn name(&self) -> &'static str {
        if self.invert {
            "gamma_inverted"
        } else {
            "gamma"
        }
    }

    fn apply(&self, record: Record, rng: &mut StdRng) -> SegResult<Record> {
        with_image(record, |image| {
            let params = draw_params(image, self.p_per_sample, 1.0, false, rng, |r| {
                around_one(r, self.range)
            });
            for_each_plane(image, &params, |_, plane, &g| self.apply_plane(plane, g));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::keys::MASK;

    fn record(image: ArrayD<f32>) -> Record {
        let mut shape = image.shape().to_vec();
        shape[1] = 1;
        Record::new()
            .with(IMAGE, Field::Image(image))
            .with(MASK, Field::Label(ArrayD::zeros(IxDyn(&shape))))
    }

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let mut i = 0.0;
        ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            i += 1.0;
            (i * 0.37f32).sin() * 50.0 + 100.0
        })
    }

    fn run(stage: &dyn Transform, image: ArrayD<f32>, seed: u64) -> ArrayD<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = stage.apply(record(image), &mut rng).unwrap();
        assert!(out.contains(MASK));
        out.take_image(IMAGE).unwrap()
    }

    #[test]
    fn test_probability_zero_is_identity() {
        let image = ramp(&[3, 2, 6, 7]);
        let stages: Vec<Box<dyn Transform>> = vec![
            Box::new(GaussianNoise {
                p_per_sample: 0.0,
                ..Default::default()
            }),
            Box::new(GaussianBlur {
                p_per_sample: 0.0,
                ..Default::default()
            }),
            Box::new(BrightnessMultiplicative {
                p_per_sample: 0.0,
                ..Default::default()
            }),
            Box::new(ContrastAugmentation {
                p_per_sample: 0.0,
                ..Default::default()
            }),
            Box::new(SimulateLowResolution {
                p_per_sample: 0.0,
                ..Default::default()
            }),
            Box::new(Gamma {
                p_per_sample: 0.0,
                ..Default::default()
            }),
        ];
        for stage in &stages {
            assert_eq!(run(stage.as_ref(), image.clone(), 1), image, "{}", stage.name());
        }
    }

    #[test]
    fn test_noise() {
        let image = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 16, 16]));
        let stage = GaussianNoise {
            p_per_sample: 1.0,
            variance: (0.05, 0.05),
        };
        let out = run(&stage, image, 2);
        let (mean, std) = mean_std(&out);
        assert!(mean.abs() < 0.01);
        assert!((std - 0.05).abs() < 0.01);
        // 不同通道的噪声不同.
        assert_ne!(out.index_axis(Axis(1), 0), out.index_axis(Axis(1), 1));
    }

    #[test]
    fn test_blur() {
        let stage = GaussianBlur {
            p_per_sample: 1.0,
            p_per_channel: 1.0,
            sigma: (1.0, 1.0),
        };
        let constant = ArrayD::from_elem(IxDyn(&[1, 1, 5, 6, 7]), 3.0f32);
        let out = run(&stage, constant, 3);
        assert!(out.iter().all(|v| (*v - 3.0).abs() < 1e-4));

        let mut impulse = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 9, 9]));
        impulse[[0, 0, 4, 4].as_slice()] = 1.0;
        let out = run(&stage, impulse, 3);
        let total: f32 = out.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(out[[0, 0, 4, 4].as_slice()] < 0.5);
        assert!(out[[0, 0, 4, 5].as_slice()] > 0.0);
    }

    #[test]
    fn test_reflect() {
        let idx: Vec<usize> = (-3..7).map(|i| reflect(i, 4)).collect();
        assert_eq!(idx, vec![2, 1, 0, 0, 1, 2, 3, 3, 2, 1]);
    }

    #[test]
    fn test_brightness() {
        let stage = BrightnessMultiplicative {
            p_per_sample: 1.0,
            multiplier: (2.0, 2.0),
        };
        let image = ramp(&[2, 1, 4, 4]);
        let out = run(&stage, image.clone(), 4);
        assert_eq!(out, image.mapv(|v| v * 2.0));
    }

    #[test]
    fn test_contrast_preserves_range() {
        let stage = ContrastAugmentation {
            p_per_sample: 1.0,
            range: (1.5, 1.5),
            ..Default::default()
        };
        let image = ramp(&[2, 2, 8, 8]);
        let out = run(&stage, image.clone(), 5);
        for (a, b) in image.outer_iter().zip(out.outer_iter()) {
            for (x, y) in a.outer_iter().zip(b.outer_iter()) {
                let lo = x.iter().copied().map(OrderedFloat).min().unwrap().0;
                let hi = x.iter().copied().map(OrderedFloat).max().unwrap().0;
                assert!(y.iter().all(|v| *v >= lo && *v <= hi));
            }
        }
        assert_ne!(out, image);
    }

    #[test]
    fn test_low_resolution() {
        let stage = SimulateLowResolution {
            p_per_sample: 1.0,
            p_per_channel: 1.0,
            zoom: (0.5, 0.5),
            ignore_axes: Vec::new(),
        };
        let constant = ArrayD::from_elem(IxDyn(&[2, 1, 4, 10, 10]), 7.0f32);
        let out = run(&stage, constant.clone(), 6);
        assert_eq!(out.shape(), constant.shape());
        assert!(out.iter().all(|v| (*v - 7.0).abs() < 1e-5));

        // 被忽略的轴上取值互不相同的数据保持不变.
        let stage = stage.ignore_axes(vec![0]);
        let layered = ArrayD::from_shape_fn(IxDyn(&[1, 1, 4, 6, 6]), |p| p[2] as f32);
        assert_eq!(run(&stage, layered.clone(), 7), layered);
    }

    #[test]
    fn test_gamma_keeps_extremes() {
        let stage = Gamma {
            p_per_sample: 1.0,
            range: (1.5, 1.5),
            retain_stats: false,
            invert: false,
        };
        let image = ramp(&[1, 1, 8, 8]);
        let out = run(&stage, image.clone(), 8);
        let (lo, hi) = min_max(&image);
        let (olo, ohi) = min_max(&out);
        assert!((lo - olo).abs() < 1e-3);
        assert!((hi - ohi).abs() < 1e-3);
        assert_ne!(out, image);
    }

    #[test]
    fn test_gamma_retains_stats() {
        let stages = [
            Gamma {
                p_per_sample: 1.0,
                ..Gamma::inverted()
            },
            Gamma {
                p_per_sample: 1.0,
                ..Gamma::default()
            },
        ];
        for stage in stages {
            let image = ramp(&[2, 1, 8, 8]);
            let out = run(&stage, image.clone(), 9);
            for (a, b) in image.outer_iter().zip(out.outer_iter()) {
                let (m0, s0) = mean_std(&a);
                let (m1, s1) = mean_std(&b);
                assert!((m0 - m1).abs() < 1e-2);
                assert!((s0 - s1).abs() < 1e-2);
            }
        }
        assert_eq!(Gamma::inverted().name(), "gamma_inverted");
    }
}
