//! 批量加载器: 按固定步数有放回地抽取样本, 组装成尚未增强的原始记录.
//!
//! 加载器是一个三状态的状态机:
//!
//! ```text
//! Uninitialized --reset()--> Running --步数用尽--> Exhausted --reset()--> Running
//! ```
//!
//! 多个工作线程各自持有一份加载器的副本 ([`BatchLoader::for_worker`]),
//! 第 `i` 个副本从第 `i` 步开始, 每次前进 `W` 步, 因此 `W` 个副本合计恰好产出 `total_steps` 个批量.

use std::path::PathBuf;
use std::sync::Arc;

use either::Either;
use rand::Rng;

use crate::config::SegConfig;
use crate::consts::keys::{FOREGROUND, IMAGE, MASK};
use crate::data::{Field, Record};
use crate::dataset::{EagerData, SampleIndex};
use crate::{SegError, SegResult};

/// 加载器状态.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderState {
    /// 尚未 `reset()`. 第一次索取时会自动 `reset()`.
    Uninitialized,
    /// 正在产出批量.
    Running,
    /// 步数已用尽, 需要 `reset()` 才能继续.
    Exhausted,
}

/// 样本来源: 惰性加载时为 (图像路径, 标签路径) 列表, 预加载时为内存中的数据.
pub type Samples = Either<Arc<Vec<(PathBuf, PathBuf)>>, Arc<EagerData>>;

/// 批量加载器.
///
/// 样本来源以 `Arc` 共享; 步数计数器与状态属于每个副本自己.
#[derive(Clone, Debug)]
pub struct BatchLoader {
    samples: Samples,
    batch_size: usize,
    total_steps: usize,
    offset: usize,
    stride: usize,
    position: usize,
    state: LoaderState,
}

impl BatchLoader {
    /// 构造单线程加载器.
    ///
    /// # 返回值
    ///
    /// 样本列表为空, 或 `batch_size` 为 0 时返回 [`SegError::Configuration`].
    pub fn new(samples: Samples, batch_size: usize, total_steps: usize) -> SegResult<Self> {
        let len = samples.as_ref().either(|p| p.len(), |d| d.len());
        if len == 0 {
            return Err(SegError::config("batch loader has an empty file list"));
        }
        if batch_size == 0 {
            return Err(SegError::config("batch_size must be positive"));
        }
        Ok(Self {
            samples,
            batch_size,
            total_steps,
            offset: 0,
            stride: 1,
            position: 0,
            state: LoaderState::Uninitialized,
        })
    }

    /// 惰性加载: 记录中只放路径, 由管线中的读取阶段解码.
    pub fn lazy(
        index: &SampleIndex,
        train: bool,
        batch_size: usize,
        total_steps: usize,
    ) -> SegResult<Self> {
        Self::new(Either::Left(Arc::new(index.pairs(train))), batch_size, total_steps)
    }

    /// 预加载: 记录中直接放入内存中的样本.
    pub fn eager(data: Arc<EagerData>, batch_size: usize, total_steps: usize) -> SegResult<Self> {
        Self::new(Either::Right(data), batch_size, total_steps)
    }

    /// 按配置构造. `cfg.load_data` 为真时预加载整个 (训练或验证) 集合.
    pub fn from_config(cfg: &SegConfig, index: &SampleIndex) -> SegResult<Self> {
        if cfg.load_data {
            let data = EagerData::load(&index.pairs(cfg.train), cfg.dim(), cfg.fg_dir.as_deref())?;
            Self::eager(Arc::new(data), cfg.batch_size, cfg.nbof_steps)
        } else {
            Self::lazy(index, cfg.train, cfg.batch_size, cfg.nbof_steps)
        }
    }

    /// 第 `id` 个 (共 `workers` 个) 工作线程使用的副本, 状态为 `Uninitialized`.
    pub fn for_worker(&self, id: usize, workers: usize) -> Self {
        let stride = workers.max(1);
        Self {
            offset: id % stride,
            stride,
            position: id % stride,
            state: LoaderState::Uninitialized,
            ..self.clone()
        }
    }

    /// 当前状态.
    #[inline]
    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// 样本个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.as_ref().either(|p| p.len(), |d| d.len())
    }

    /// 样本列表是否为空. 构造成功的加载器总是非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否为预加载模式.
    #[inline]
    pub fn is_eager(&self) -> bool {
        self.samples.is_right()
    }

    /// 所有副本合计的总步数.
    #[inline]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// 把步数计数器归位到本副本的起点, 进入 `Running`.
    pub fn reset(&mut self) {
        self.position = self.offset;
        self.state = LoaderState::Running;
    }

    /// 抽取下一个批量的样本下标 (有放回).
    ///
    /// # 返回值
    ///
    /// - `Ok(Some(下标))`: 正常产出;
    /// - `Ok(None)`: 步数用尽, 加载器进入 `Exhausted`;
    /// - `Err(SegError::Exhausted)`: 在 `Exhausted` 状态下没有 `reset()` 就继续索取.
    pub fn next_indices<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SegResult<Option<Vec<usize>>> {
        match self.state {
            LoaderState::Uninitialized => self.reset(),
            LoaderState::Exhausted => return Err(SegError::Exhausted),
            LoaderState::Running => {}
        }
        if self.position >= self.total_steps {
            self.state = LoaderState::Exhausted;
            return Ok(None);
        }
        self.position += self.stride;
        let n = self.len();
        Ok(Some((0..self.batch_size).map(|_| rng.gen_range(0..n)).collect()))
    }

    /// 组装下一个原始记录.
    ///
    /// 惰性模式下图像键与标签键下为路径列表; 预加载模式下为共享的样本列表,
    /// 若预加载时计算了前景索引, 还会放入前景键.
    pub fn next_batch<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SegResult<Option<Record>> {
        let Some(indices) = self.next_indices(rng)? else {
            return Ok(None);
        };
        let record = match &self.samples {
            Either::Left(pairs) => {
                let (images, masks) = indices.iter().map(|&i| pairs[i].clone()).unzip();
                Record::new()
                    .with(IMAGE, Field::Paths(images))
                    .with(MASK, Field::Paths(masks))
            }
            Either::Right(data) => {
                let mut volumes = Vec::with_capacity(indices.len());
                let mut masks = Vec::with_capacity(indices.len());
                let mut foreground = Vec::with_capacity(indices.len());
                for &i in &indices {
                    let (v, m) = data
                        .get(i)
                        .ok_or_else(|| SegError::config(format!("sample {i} out of range")))?;
                    volumes.push(v);
                    masks.push(m);
                    foreground.extend(data.foreground(i));
                }
                let mut record = Record::new()
                    .with(IMAGE, Field::Volumes(volumes))
                    .with(MASK, Field::Masks(masks));
                if foreground.len() == indices.len() {
                    record.insert(FOREGROUND, Field::Foreground(foreground));
                }
                record
            }
        };
        Ok(Some(record))
    }
}
