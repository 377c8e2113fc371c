//! 前景索引: 预先计算每个标签的前景体素坐标, 避免每次裁剪都扫描整个标签.
//!
//! 索引以 bincode 序列化后用 zlib 压缩存储, 通常与样本放在同一目录下.
//! 写入先落到同目录下的临时文件再改名, 读者不会看到写了一半的缓存.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{ArrayViewD, Axis, Dimension};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::consts::label::FOREGROUND;
use crate::SegResult;

/// 从标签值到该标签所有前景体素 (空间) 坐标的映射.
///
/// - 独热编码标签: 键为通道号, 值为该通道中等于 1 的体素. 通道号超过 255 的通道被忽略;
/// - 整数编码标签: 键为出现过的非零标签值.
///
/// 没有任何体素的标签不会出现在索引中.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundIndex {
    /// 空间维度个数.
    ndim: usize,

    /// 坐标按行主序展平存储, 每 `ndim` 个数构成一个坐标.
    locations: BTreeMap<u8, Vec<u32>>,
}

impl ForegroundIndex {
    /// 扫描 `(c, 空间维度...)` 标签构建索引.
    pub fn from_mask(mask: &ArrayViewD<u8>) -> Self {
        let ndim = mask.ndim() - 1;
        let channels = mask.len_of(Axis(0));
        let mut locations: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
        let mut push = |key: u8, pos: &[usize]| {
            locations
                .entry(key)
                .or_default()
                .extend(pos.iter().map(|&p| p as u32));
        };

        if channels == 1 {
            for (pos, &v) in mask.index_axis(Axis(0), 0).indexed_iter() {
                if v != 0 {
                    push(v, pos.slice());
                }
            }
        } else {
            if channels > usize::from(u8::MAX) + 1 {
                log::warn!("one-hot mask has {channels} channels, only the first 256 are indexed");
            }
            for (c, plane) in mask.axis_iter(Axis(0)).enumerate() {
                let Ok(key) = u8::try_from(c) else {
                    break;
                };
                for (pos, &v) in plane.indexed_iter() {
                    if v == FOREGROUND {
                        push(key, pos.slice());
                    }
                }
            }
        }
        Self { ndim, locations }
    }

    /// 空间维度个数.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// 索引中的所有标签, 按升序排列.
    #[inline]
    pub fn labels(&self) -> impl Iterator<Item = u8> + '_ {
        self.locations.keys().copied()
    }

    /// 索引是否为空 (标签中没有任何前景).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// 标签 `label` 的所有前景坐标. 标签不存在时返回 `None`.
    pub fn locations(&self, label: u8) -> Option<Vec<Vec<usize>>> {
        let flat = self.locations.get(&label)?;
        Some(
            flat.chunks_exact(self.ndim.max(1))
                .map(|c| c.iter().map(|&p| p as usize).collect())
                .collect(),
        )
    }

    /// 标签 `label` 的前景体素个数.
    pub fn count(&self, label: u8) -> usize {
        self.locations
            .get(&label)
            .map_or(0, |flat| flat.len() / self.ndim.max(1))
    }

    /// 均匀选取一个标签, 再在该标签的前景体素中均匀选取一个坐标. 索引为空时返回 `None`.
    pub fn random_location<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Vec<usize>> {
        let n = self.locations.len();
        if n == 0 || self.ndim == 0 {
            return None;
        }
        let flat = self.locations.values().nth(rng.gen_range(0..n))?;
        let k = rng.gen_range(0..flat.len() / self.ndim);
        Some(
            flat[k * self.ndim..(k + 1) * self.ndim]
                .iter()
                .map(|&p| p as usize)
                .collect(),
        )
    }

    /// 压缩后写入 `path`.
    ///
    /// 先写入同目录下的临时文件, 完成后改名为 `path`, 因此并发读者只会读到完整的旧文件或新文件.
    pub fn save(&self, path: impl AsRef<Path>) -> SegResult<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let written = self
            .write_to(&tmp)
            .and_then(|()| Ok(std::fs::rename(&tmp, path)?));
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        written
    }

    fn write_to(&self, path: &Path) -> SegResult<()> {
        let file = BufWriter::new(File::create(path)?);
        let mut e = ZlibEncoder::new(file, Compression::best());
        bincode::serialize_into(&mut e, self)?;
        e.finish()?.flush()?;
        Ok(())
    }

    /// 从 [`save`](Self::save) 写入的文件中读取索引.
    pub fn load(path: impl AsRef<Path>) -> SegResult<Self> {
        let mut d = ZlibDecoder::new(BufReader::new(File::open(path)?));
        let mut buf = Vec::new();
        d.read_to_end(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }

    /// 读取 `path` 处的缓存; 不存在或无法解码时用 `mask` 重新构建并写入缓存.
    pub fn load_or_build(path: impl AsRef<Path>, mask: &ArrayViewD<u8>) -> SegResult<Self> {
        let path = path.as_ref();
        if path.is_file() {
            match Self::load(path) {
                Ok(index) => return Ok(index),
                Err(e) => log::warn!("rebuilding foreground index {}: {e}", path.display()),
            }
        }
        let index = Self::from_mask(mask);
        index.save(path)?;
        log::debug!("foreground index cached at {}", path.display());
        Ok(index)
    }
}

/// `path` 同目录下, 本进程内唯一的临时文件名.
fn temp_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{n}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn one_hot() -> ArrayD<u8> {
        let mut m = ArrayD::<u8>::zeros(IxDyn(&[3, 4, 5, 6]));
        m[[1, 0, 1, 2].as_slice()] = 1;
        m[[1, 3, 4, 5].as_slice()] = 1;
        m[[2, 2, 2, 2].as_slice()] = 1;
        m
    }

    #[test]
    fn test_one_hot_index() {
        let m = one_hot();
        let index = ForegroundIndex::from_mask(&m.view());
        assert_eq!(index.ndim(), 3);
        assert_eq!(index.labels().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(index.count(1), 2);
        assert_eq!(
            index.locations(1).unwrap(),
            vec![vec![0, 1, 2], vec![3, 4, 5]]
        );
        assert!(index.locations(0).is_none());
    }

    #[test]
    fn test_integer_index() {
        let m = ArrayD::from_shape_vec(IxDyn(&[1, 2, 3]), vec![0, 2, 0, 5, 0, 2]).unwrap();
        let index = ForegroundIndex::from_mask(&m.view());
        assert_eq!(index.labels().collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(index.locations(2).unwrap(), vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(index.locations(5).unwrap(), vec![vec![1, 0]]);
    }

    #[test]
    fn test_random_location() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let m = one_hot();
        let index = ForegroundIndex::from_mask(&m.view());
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let loc = index.random_location(&mut rng).unwrap();
            assert!(
                loc == vec![0, 1, 2] || loc == vec![3, 4, 5] || loc == vec![2, 2, 2]
            );
        }
        assert!(ForegroundIndex::default().random_location(&mut rng).is_none());
    }

    #[test]
    fn test_cache_round_trip() {
        let m = one_hot();
        let index = ForegroundIndex::from_mask(&m.view());
        let path = std::env::temp_dir().join(format!("seg-berry-fg-{}.bin", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let built = ForegroundIndex::load_or_build(&path, &m.view()).unwrap();
        assert_eq!(built, index);
        let loaded = ForegroundIndex::load(&path).unwrap();
        assert_eq!(loaded, index);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_concurrent_load_or_build() {
        let m = one_hot();
        let index = ForegroundIndex::from_mask(&m.view());
        let dir = std::env::temp_dir().join(format!("seg-berry-fg-race-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("case.fg");

        let (shared_path, mask) = (&path, &m);
        for _ in 0..4 {
            let _ = std::fs::remove_file(&path);
            let results: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        s.spawn(move || {
                            ForegroundIndex::load_or_build(shared_path, &mask.view())
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for r in results {
                assert_eq!(r.unwrap(), index);
            }
        }
        assert_eq!(ForegroundIndex::load(&path).unwrap(), index);
        // 临时文件都已改名或删除.
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_cache_is_rebuilt() {
        let m = one_hot();
        let path =
            std::env::temp_dir().join(format!("seg-berry-fg-bad-{}.bin", std::process::id()));
        std::fs::write(&path, b"not a zlib stream").unwrap();
        assert!(ForegroundIndex::load(&path).is_err());

        let rebuilt = ForegroundIndex::load_or_build(&path, &m.view()).unwrap();
        assert_eq!(rebuilt, ForegroundIndex::from_mask(&m.view()));
        assert_eq!(ForegroundIndex::load(&path).unwrap(), rebuilt);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_wide_one_hot_keeps_low_channels() {
        let mut m = ArrayD::<u8>::zeros(IxDyn(&[300, 2]));
        m[[3, 1].as_slice()] = 1;
        m[[259, 0].as_slice()] = 1;
        let index = ForegroundIndex::from_mask(&m.view());
        assert_eq!(index.labels().collect::<Vec<_>>(), vec![3]);
        assert_eq!(index.locations(3).unwrap(), vec![vec![1]]);
    }
}
