//! 对 `seg-berry` 配置的更一层封装. 从环境变量或用户主目录确定数据集位置.

use seg_berry::dataset::home_dataset_dir_with;
use seg_berry::SegConfig;
use std::env;
use std::path::PathBuf;

/// 获取实验数据集的基本路径.
///
/// 1. 若环境变量 `$SEG_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/seg`.
pub fn data_dir_from_env_or_home() -> PathBuf {
    match env::var("SEG_DATA_DIR") {
        Ok(d) if !d.is_empty() => PathBuf::from(d),
        _ => home_dataset_dir_with(["seg"]).unwrap_or_else(|| env::temp_dir().join("seg")),
    }
}

/// 图像目录, 即 `{基本路径}/img`.
#[inline]
pub fn img_dir_from_env_or_home() -> PathBuf {
    data_dir_from_env_or_home().join("img")
}

/// 标签目录, 即 `{基本路径}/msk`.
#[inline]
pub fn msk_dir_from_env_or_home() -> PathBuf {
    data_dir_from_env_or_home().join("msk")
}

/// 以给定目录为数据源的配置. 其余参数取默认值.
pub fn config_for(img_dir: PathBuf, msk_dir: PathBuf, patch_size: Vec<usize>) -> SegConfig {
    SegConfig {
        img_dir,
        msk_dir,
        patch_size,
        ..Default::default()
    }
}

/// 以 `$SEG_DATA_DIR` 或 `$HOME/dataset/seg` 为数据源的配置.
#[inline]
pub fn config_from_env_or_home(patch_size: Vec<usize>) -> SegConfig {
    config_for(img_dir_from_env_or_home(), msk_dir_from_env_or_home(), patch_size)
}
