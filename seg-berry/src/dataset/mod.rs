//! 数据集: 折表, 训练/验证/测试划分, 以及预加载到内存的数据.

use std::path::{Path, PathBuf};

pub mod folds;
pub mod index;

pub use folds::{DataSplits, FoldRow, FoldTable};
pub use index::{EagerData, SampleIndex};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}
