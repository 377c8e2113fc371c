//! 运行时错误.

use std::path::PathBuf;

/// 数据管线的运行时错误.
///
/// 注意 "数据流结束" 不是错误: 加载器与生产者分别用 `Ok(None)`
/// 和迭代器的 `None` 表示.
#[derive(Debug, thiserror::Error)]
pub enum SegError {
    /// 某个变换阶段结束后, 图像与标签的空间形状不一致. 这是管线自身的 bug.
    #[error("stage `{stage}` broke image/mask pairing: image {image:?}, mask {mask:?}")]
    ShapeMismatch {
        /// 出错的阶段名.
        stage: &'static str,
        /// 图像空间形状.
        image: Vec<usize>,
        /// 标签空间形状.
        mask: Vec<usize>,
    },

    /// 构造期参数错误: 非法折号, 空折表, 空文件列表等.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 加载器已耗尽, 但调用者没有先 `reset()` 就继续索取.
    #[error("batch loader is exhausted, call `reset()` first")]
    Exhausted,

    /// 记录中缺少某个键, 或键对应的值类型不符合预期.
    #[error("record field `{key}`: {reason}")]
    Field {
        /// 键名.
        key: String,
        /// 原因.
        reason: &'static str,
    },

    /// 不支持的文件格式或数组维度.
    #[error("unsupported format for `{path}`: {reason}")]
    UnsupportedFormat {
        /// 文件路径.
        path: PathBuf,
        /// 原因.
        reason: String,
    },

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 读取 nifti 文件错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 读取 npy 文件错误.
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// 写入 npy 文件错误.
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// 读写 tif 等二维图像错误.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// 解析折表错误.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// 解析配置文件错误.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// 前景索引缓存 (反) 序列化错误.
    #[error(transparent)]
    Cache(#[from] bincode::Error),

    /// 某个工作线程 panic. 其余工作线程会被一并终止.
    ///
    /// 工作线程返回的普通错误按原样转交, 不包装成此变体.
    #[error("worker {worker} failed: {message}")]
    Worker {
        /// 工作线程编号.
        worker: usize,
        /// panic 信息.
        message: String,
    },

    /// 生产者已被取消.
    #[error("producer was cancelled")]
    Cancelled,
}

/// 数据管线运行时结果.
pub type SegResult<T> = Result<T, SegError>;

impl SegError {
    /// 构造 `Configuration` 错误的便捷方法.
    #[inline]
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// 构造 `Field` 错误的便捷方法.
    #[inline]
    pub(crate) fn field(key: &str, reason: &'static str) -> Self {
        Self::Field {
            key: key.to_owned(),
            reason,
        }
    }
}
