//! 通用常量.

/// 记录 (`Record`) 中的默认键名.
pub mod keys {
    /// 图像数据.
    pub const IMAGE: &str = "image";

    /// 与图像配对的标签.
    pub const MASK: &str = "mask";

    /// 重命名后的训练目标.
    pub const TARGET: &str = "target";

    /// 前景索引.
    pub const FOREGROUND: &str = "fg";
}

/// 标签值.
pub mod label {
    /// 背景.
    pub const BACKGROUND: u8 = 0;

    /// 前景. 独热编码标签的每个通道中, 前景体素的取值.
    pub const FOREGROUND: u8 = 1;

    /// 空间变换时, 落在原图之外的标签体素的填充值.
    /// 管线末尾会把它重新映射为 [`BACKGROUND`].
    pub const BORDER: u8 = u8::MAX;
}

/// 以前景为锚点裁剪的默认概率.
pub const DEFAULT_FG_RATE: f64 = 0.33;

/// 默认工作线程个数.
pub const DEFAULT_WORKERS: usize = 12;

/// 批量队列容量相对于工作线程数的默认倍率.
pub const DEFAULT_QUEUE_FACTOR: usize = 2;

/// 没有折表时, 默认划入验证集的比例.
pub const DEFAULT_VAL_SPLIT: f64 = 0.25;

/// 数组是否只有 2 或 3 个空间维度?
#[inline]
pub const fn is_supported_spatial_dim(dim: usize) -> bool {
    matches!(dim, 2 | 3)
}
