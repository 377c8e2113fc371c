//! 管线中不改变强度的辅助阶段: 读取, 居中裁剪, 镜像, 标签映射, 重命名.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayD, Axis, Slice};
use rand::rngs::StdRng;
use rand::Rng;

use crate::augment::Transform;
use crate::consts::keys::{FOREGROUND, IMAGE, MASK};
use crate::data::io::ensure_channel_axis;
use crate::data::{Field, ForegroundIndex, ImageIo, LabelMask, Record, Volume};
use crate::{SegError, SegResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 去掉所有扩展名的文件名, 例如 `case_01.nii.gz` 得到 `case_01`.
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default()
        .to_owned()
}

/// 惰性加载: 把图像键与标签键下的路径列表解码为样本列表.
///
/// 读出的数组恰好有 `dim` 个维度时补上长度为 1 的通道轴;
/// 有 `dim + 1` 个维度时视为已经带有通道轴; 其余情况报错.
///
/// 设置了前景索引目录时, 还会为每个标签读取 (或构建并缓存) 前景索引,
/// 写入 [`FOREGROUND`] 键.
pub struct DataReader {
    io: Arc<dyn ImageIo>,
    dim: usize,
    fg_dir: Option<PathBuf>,
}

impl DataReader {
    /// 用 `io` 读取 `dim` 个空间维度的数据.
    pub fn new(io: Arc<dyn ImageIo>, dim: usize) -> Self {
        Self {
            io,
            dim,
            fg_dir: None,
        }
    }

    /// 设置前景索引缓存目录.
    pub fn with_foreground(mut self, fg_dir: Option<PathBuf>) -> Self {
        self.fg_dir = fg_dir;
        self
    }

    fn read_pair(&self, img: &Path, msk: &Path) -> SegResult<(Volume, LabelMask)> {
        let (image, _) = self.io.read(img)?;
        let (mask, _) = self.io.read_mask(msk)?;
        Ok((
            ensure_channel_axis(img, image, self.dim)?,
            ensure_channel_axis(msk, mask, self.dim)?,
        ))
    }

    fn foreground(&self, dir: &Path, msk: &Path, mask: &LabelMask) -> SegResult<ForegroundIndex> {
        let cache = dir.join(format!("{}.fg", file_stem(msk)));
        ForegroundIndex::load_or_build(cache, &mask.view())
    }
}

impl std::fmt::Debug for DataReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("dim", &self.dim)
            .field("fg_dir", &self.fg_dir)
            .finish()
    }
}

impl Transform for DataReader {
    fn name(&self) -> &'static str {
        "data_reader"
    }

    fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
        let images = record.take_paths(IMAGE)?;
        let masks = record.take_paths(MASK)?;
        if images.len() != masks.len() {
            return Err(SegError::ShapeMismatch {
                stage: self.name(),
                image: vec![images.len()],
                mask: vec![masks.len()],
            });
        }

        let read = |(img, msk): (&PathBuf, &PathBuf)| self.read_pair(img, msk);
        let pairs: Vec<(Volume, LabelMask)>;
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                pairs = images
                    .iter()
                    .zip(&masks)
                    .collect::<Vec<_>>()
                    .into_par_iter()
                    .map(read)
                    .collect::<SegResult<_>>()?;
            } else {
                pairs = images.iter().zip(&masks).map(read).collect::<SegResult<_>>()?;
            }
        }

        if let Some(dir) = &self.fg_dir {
            let fg = pairs
                .iter()
                .zip(&masks)
                .map(|((_, mask), path)| self.foreground(dir, path, mask).map(Arc::new))
                .collect::<SegResult<Vec<_>>>()?;
            record.insert(FOREGROUND, Field::Foreground(fg));
        }

        let (volumes, labels): (Vec<_>, Vec<_>) = pairs
            .into_iter()
            .map(|(v, m)| (Arc::new(v), Arc::new(m)))
            .unzip();
        record.insert(IMAGE, Field::Volumes(volumes));
        record.insert(MASK, Field::Masks(labels));
        Ok(record)
    }
}

/// 批量 `(b, c, 空间维度...)` 的居中裁剪窗口. 不足的轴保持原样.
fn center_slice<T>(array: &ArrayD<T>, patch: &[usize]) -> ArrayD<T>
where
    T: Clone,
{
    let spatial = &array.shape()[2..];
    array
        .slice_each_axis(|ax| match ax.axis.index() {
            0 | 1 => Slice::from(..),
            i => {
                let (s, t) = (spatial[i - 2], patch[i - 2]);
                let start = s.saturating_sub(t) / 2;
                Slice::from(start..start + s.min(t))
            }
        })
        .to_owned()
}

/// 对批量图像与批量标签做居中裁剪.
#[derive(Clone, Debug)]
pub struct CenterCrop {
    patch_size: Vec<usize>,
}

impl CenterCrop {
    /// 裁剪到 `patch_size`.
    pub fn new(patch_size: &[usize]) -> Self {
        Self {
            patch_size: patch_size.to_vec(),
        }
    }
}

impl Transform for CenterCrop {
    fn name(&self) -> &'static str {
        "center_crop"
    }

    fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
        let image = record.take_image(IMAGE)?;
        let label = record.take_label(MASK)?;
        if image.ndim() != self.patch_size.len() + 2 {
            return Err(SegError::field(IMAGE, "spatial rank differs from patch size"));
        }
        if image.shape()[2..] == *self.patch_size && label.shape()[2..] == *self.patch_size {
            record.insert(IMAGE, Field::Image(image));
            record.insert(MASK, Field::Label(label));
        } else {
            record.insert(IMAGE, Field::Image(center_slice(&image, &self.patch_size)));
            record.insert(MASK, Field::Label(center_slice(&label, &self.patch_size)));
        }
        Ok(record)
    }
}

/// 镜像: 对每个样本的每个镜像轴, 以 0.5 的概率同时翻转图像与标签.
#[derive(Clone, Debug)]
pub struct Mirror {
    axes: Vec<usize>,
}

impl Mirror {
    /// `axes` 为空间轴序号 (从 0 开始, 不计批量与通道轴).
    pub fn new(axes: Vec<usize>) -> Self {
        Self { axes }
    }
}

/// 按 `flips` 翻转第 `b` 个样本.
fn flip_sample<T: Clone>(array: &mut ArrayD<T>, b: usize, flips: &[usize]) {
    let mut src = array.index_axis(Axis(0), b).to_owned();
    for &axis in flips {
        src.invert_axis(Axis(axis + 1));
    }
    array.index_axis_mut(Axis(0), b).assign(&src);
}

impl Transform for Mirror {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn apply(&self, mut record: Record, rng: &mut StdRng) -> SegResult<Record> {
        let mut image = record.take_image(IMAGE)?;
        let mut label = record.take_label(MASK)?;
        let dim = image.ndim().saturating_sub(2);
        if let Some(bad) = self.axes.iter().find(|&&a| a >= dim) {
            return Err(SegError::config(format!(
                "mirror axis {bad} out of range for {dim} spatial axes"
            )));
        }

        for b in 0..image.len_of(Axis(0)) {
            let flips: Vec<usize> = self
                .axes
                .iter()
                .copied()
                .filter(|_| rng.gen::<f64>() < 0.5)
                .collect();
            if !flips.is_empty() {
                flip_sample(&mut image, b, &flips);
                flip_sample(&mut label, b, &flips);
            }
        }

        record.insert(IMAGE, Field::Image(image));
        record.insert(MASK, Field::Label(label));
        Ok(record)
    }
}

/// 把标签中的 `from` 替换为 `to`.
#[derive(Clone, Copy, Debug)]
pub struct RemapLabel {
    from: u8,
    to: u8,
}

impl RemapLabel {
    /// 构造阶段.
    pub fn new(from: u8, to: u8) -> Self {
        Self { from, to }
    }
}

impl Transform for RemapLabel {
    fn name(&self) -> &'static str {
        "remap_label"
    }

    fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
        let mut label = record.take_label(MASK)?;
        let (from, to) = (self.from, self.to);
        label.mapv_inplace(|v| if v == from { to } else { v });
        record.insert(MASK, Field::Label(label));
        Ok(record)
    }
}

/// 键重命名.
#[derive(Clone, Debug)]
pub struct Rename {
    from: String,
    to: String,
}

impl Rename {
    /// 把 `from` 改名为 `to`.
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }
}

impl Transform for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn apply(&self, mut record: Record, _rng: &mut StdRng) -> SegResult<Record> {
        let field = record.take(&self.from)?;
        record.insert(self.to.as_str(), field);
        Ok(record)
    }
}
