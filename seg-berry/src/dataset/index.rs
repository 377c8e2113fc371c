//! 样本索引: 决定哪些文件属于训练集, 验证集与测试集, 以及可选的整体预加载.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::augment::utility::file_stem;
use crate::config::SegConfig;
use crate::data::io::{ensure_channel_axis, Format};
use crate::data::{AdaptiveIo, ForegroundIndex, ImageIo, LabelMask, Volume};
use crate::dataset::FoldTable;
use crate::{SegError, SegResult};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 训练, 验证, 测试三个文件名列表, 以及图像和标签所在的目录.
///
/// 构造后不可修改, 以 `Arc` 在工作线程间共享.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndex {
    img_dir: PathBuf,
    msk_dir: PathBuf,
    train: Vec<String>,
    val: Vec<String>,
    test: Vec<String>,
}

impl SampleIndex {
    /// 由折表划分: 第 `fold` 折为验证集, 其余非保留折为训练集, 保留行为测试集.
    pub fn from_table(
        img_dir: impl Into<PathBuf>,
        msk_dir: impl Into<PathBuf>,
        table: &FoldTable,
        fold: usize,
    ) -> SegResult<Self> {
        let (train, val) = table.train_test_split(fold)?;
        let index = Self {
            img_dir: img_dir.into(),
            msk_dir: msk_dir.into(),
            train,
            val,
            test: table.test_set(),
        };
        log::info!(
            "current fold: {fold}, training set: {}, validation set: {}, testing set: {}",
            index.train.len(),
            index.val.len(),
            index.test.len()
        );
        Ok(index)
    }

    /// 没有折表时, 按文件名排序后把前 `round(val_split * n)` 个 (至少 1 个) 文件作为验证集.
    ///
    /// # 返回值
    ///
    /// 图像目录中没有文件时返回 [`SegError::Configuration`].
    pub fn from_dir(
        img_dir: impl Into<PathBuf>,
        msk_dir: impl Into<PathBuf>,
        val_split: f64,
    ) -> SegResult<Self> {
        let img_dir = img_dir.into();
        let mut all = Vec::new();
        for entry in std::fs::read_dir(&img_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    all.push(name.to_owned());
                }
            }
        }
        if all.is_empty() {
            return Err(SegError::config(format!(
                "no image found in {}",
                img_dir.display()
            )));
        }
        all.sort_unstable();

        let n_val = ((val_split * all.len() as f64).round() as usize).clamp(1, all.len());
        let train = all.split_off(n_val);
        log::info!(
            "{}: training set: {}, validation set: {}",
            img_dir.display(),
            train.len(),
            all.len()
        );
        Ok(Self {
            img_dir,
            msk_dir: msk_dir.into(),
            train,
            val: all,
            test: Vec::new(),
        })
    }

    /// 按配置构造: 有折表时用折表, 否则按目录划分.
    pub fn from_config(cfg: &SegConfig) -> SegResult<Self> {
        match &cfg.folds_csv {
            Some(csv) => {
                let table = FoldTable::from_csv(csv)?;
                Self::from_table(&cfg.img_dir, &cfg.msk_dir, &table, cfg.fold)
            }
            None => Self::from_dir(&cfg.img_dir, &cfg.msk_dir, cfg.val_split),
        }
    }

    /// 训练集文件名.
    #[inline]
    pub fn train_files(&self) -> &[String] {
        &self.train
    }

    /// 验证集文件名.
    #[inline]
    pub fn val_files(&self) -> &[String] {
        &self.val
    }

    /// 测试集文件名.
    #[inline]
    pub fn test_files(&self) -> &[String] {
        &self.test
    }

    /// 训练模式下为训练集, 否则为验证集.
    #[inline]
    pub fn files(&self, train: bool) -> &[String] {
        if train {
            &self.train
        } else {
            &self.val
        }
    }

    /// 同名的 (图像路径, 标签路径) 列表.
    pub fn pairs(&self, train: bool) -> Vec<(PathBuf, PathBuf)> {
        self.files(train)
            .iter()
            .map(|name| (self.img_dir.join(name), self.msk_dir.join(name)))
            .collect()
    }
}

/// 整体预加载到内存中的数据集. 样本以 `Arc` 共享, 取用时不复制.
#[derive(Debug, Clone, Default)]
pub struct EagerData {
    volumes: Vec<Arc<Volume>>,
    masks: Vec<Arc<LabelMask>>,
    foreground: Option<Vec<Arc<ForegroundIndex>>>,
}

impl EagerData {
    /// 读取所有 (图像, 标签) 对. 只接受 `.npy` 文件.
    ///
    /// 给出 `fg_dir` 时同时读取 (或构建并缓存) 每个标签的前景索引.
    pub fn load(
        pairs: &[(PathBuf, PathBuf)],
        dim: usize,
        fg_dir: Option<&Path>,
    ) -> SegResult<Self> {
        if let Some(path) = pairs
            .iter()
            .flat_map(|(i, m)| [i, m])
            .find(|p| Format::of(p) != Format::Npy)
        {
            return Err(SegError::config(format!(
                "eager loading only supports .npy files, got {}",
                path.display()
            )));
        }

        let read = |(img, msk): &(PathBuf, PathBuf)| -> SegResult<(Volume, LabelMask)> {
            let (image, _) = AdaptiveIo.read(img)?;
            let (mask, _) = AdaptiveIo.read_mask(msk)?;
            Ok((ensure_channel_axis(img, image, dim)?, ensure_channel_axis(msk, mask, dim)?))
        };
        let loaded: Vec<(Volume, LabelMask)>;
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                loaded = pairs.par_iter().map(read).collect::<SegResult<_>>()?;
            } else {
                loaded = pairs.iter().map(read).collect::<SegResult<_>>()?;
            }
        }

        let foreground = match fg_dir {
            Some(dir) => Some(
                loaded
                    .iter()
                    .zip(pairs)
                    .map(|((_, mask), (_, path))| {
                        let cache = dir.join(format!("{}.fg", file_stem(path)));
                        ForegroundIndex::load_or_build(cache, &mask.view()).map(Arc::new)
                    })
                    .collect::<SegResult<Vec<_>>>()?,
            ),
            None => None,
        };

        let (volumes, masks) = loaded
            .into_iter()
            .map(|(v, m)| (Arc::new(v), Arc::new(m)))
            .unzip();
        log::info!("{} samples loaded into memory", pairs.len());
        Ok(Self {
            volumes,
            masks,
            foreground,
        })
    }

    /// 由内存中的数组构造. 两个列表长度必须相同.
    pub fn from_arrays(volumes: Vec<Volume>, masks: Vec<LabelMask>) -> SegResult<Self> {
        if volumes.len() != masks.len() {
            return Err(SegError::config(format!(
                "{} volumes but {} masks",
                volumes.len(),
                masks.len()
            )));
        }
        Ok(Self {
            volumes: volumes.into_iter().map(Arc::new).collect(),
            masks: masks.into_iter().map(Arc::new).collect(),
            foreground: None,
        })
    }

    /// 样本个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// 第 `i` 个样本的图像与标签 (共享, 不复制).
    #[inline]
    pub fn get(&self, i: usize) -> Option<(Arc<Volume>, Arc<LabelMask>)> {
        Some((Arc::clone(self.volumes.get(i)?), Arc::clone(self.masks.get(i)?)))
    }

    /// 第 `i` 个样本的前景索引. 加载时没有给出索引目录则为 `None`.
    #[inline]
    pub fn foreground(&self, i: usize) -> Option<Arc<ForegroundIndex>> {
        self.foreground.as_ref()?.get(i).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("seg-berry-index-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_from_dir() {
        let dir = temp_dir("listing");
        for name in ["c.npy", "a.npy", "b.npy", "d.npy", "e.npy"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        std::fs::create_dir_all(dir.join("sub")).unwrap();

        let index = SampleIndex::from_dir(&dir, &dir, 0.25).unwrap();
        // round(0.25 * 5) = 1
        assert_eq!(index.val_files(), ["a.npy"]);
        assert_eq!(index.train_files(), ["b.npy", "c.npy", "d.npy", "e.npy"]);
        assert!(index.test_files().is_empty());

        // 比例过小时至少保留 1 个验证文件.
        let index = SampleIndex::from_dir(&dir, &dir, 0.0).unwrap();
        assert_eq!(index.files(false).len(), 1);
        assert_eq!(index.pairs(true)[0], (dir.join("b.npy"), dir.join("b.npy")));

        std::fs::remove_dir_all(&dir).unwrap();
        let empty = temp_dir("empty");
        assert!(matches!(
            SampleIndex::from_dir(&empty, &empty, 0.25),
            Err(SegError::Configuration(_))
        ));
        std::fs::remove_dir_all(&empty).unwrap();
    }

    #[test]
    fn test_from_table() {
        let rows = (0..10)
            .map(|i| crate::dataset::FoldRow::new(format!("{i}.npy"), i % 2))
            .collect();
        let table = FoldTable::from_rows(rows).unwrap();
        let index = SampleIndex::from_table("img", "msk", &table, 1).unwrap();
        assert_eq!(index.files(false).len(), 5);
        assert_eq!(index.pairs(false)[0], (PathBuf::from("img/1.npy"), PathBuf::from("msk/1.npy")));
        assert!(SampleIndex::from_table("img", "msk", &table, 2).is_err());
    }

    #[test]
    fn test_eager_load() {
        let img_dir = temp_dir("eager-img");
        let msk_dir = temp_dir("eager-msk");
        let fg_dir = temp_dir("eager-fg");
        for i in 0..3 {
            let name = format!("{i}.npy");
            let image = ArrayD::from_elem(IxDyn(&[4, 5, 6]), i as f32);
            let mut mask = ArrayD::<u8>::zeros(IxDyn(&[4, 5, 6]));
            mask[[i, 0, 0].as_slice()] = 1;
            ndarray_npy::write_npy(img_dir.join(&name), &image).unwrap();
            ndarray_npy::write_npy(msk_dir.join(&name), &mask).unwrap();
        }
        let index = SampleIndex::from_dir(&img_dir, &msk_dir, 0.0).unwrap();
        let data = EagerData::load(&index.pairs(true), 3, Some(&fg_dir)).unwrap();
        assert_eq!(data.len(), 2);
        let (v, m) = data.get(1).unwrap();
        assert_eq!(v.shape(), &[1, 4, 5, 6]);
        assert!(v.iter().all(|x| *x == 2.0));
        assert_eq!(m.shape(), &[1, 4, 5, 6]);
        assert_eq!(data.foreground(1).unwrap().locations(1), Some(vec![vec![2, 0, 0]]));
        assert!(data.get(2).is_none());

        let bad = vec![(PathBuf::from("a.nii.gz"), PathBuf::from("a.nii.gz"))];
        assert!(matches!(EagerData::load(&bad, 3, None), Err(SegError::Configuration(_))));

        for dir in [img_dir, msk_dir, fg_dir] {
            std::fs::remove_dir_all(dir).unwrap();
        }
    }
}
