#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 为 3D/2D 生物医学图像分割训练提供 patch 采样, 数据增强,
//! deep supervision 目标降采样以及并发批量加载.
//!
//! 该 crate 只提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 所有数组都以 `(c, 空间维度...)` (单个样本) 或 `(b, c, 空间维度...)` (批量)
//!   组织, 空间维度为 2 或 3 个.
//! 2. 随机性全部来自显式播种的 `StdRng`, 由调用者或工作线程持有, 不存在全局随机状态.
//! 3. 非法参数在构造时以 [`SegError::Configuration`] 报告; 退化几何情形
//!   (前景为空, 目标比原图大) 按既定策略静默回退, 不会报错.
//!
//! # 开发计划
//!
//! ### 几何采样与 patch 提取 ✅
//!
//! 随机窗口, 强制包含锚点的窗口, 前景窗口, 居中填充.
//!
//! 实现位于 `seg-berry/src/geometry`.
//!
//! ### 数据增强管线 ✅
//!
//! 空间变换 (旋转, 缩放), 噪声, 模糊, 亮度, 对比度, 低分辨率模拟, gamma, 镜像,
//! 标签重映射. 各阶段共享 [`Transform`] 接口, 由 [`Compose`] 顺序执行.
//!
//! 实现位于 `seg-berry/src/augment`.
//!
//! ### Deep supervision 目标降采样 ✅
//!
//! 逐类别插值, 不会产生新的标签值.
//!
//! 实现位于 `seg-berry/src/downsample.rs`.
//!
//! ### 折表与样本索引 ✅
//!
//! 实现位于 `seg-berry/src/dataset`.
//!
//! ### 批量加载器与并发生产者 ✅
//!
//! 1. 有放回地均匀抽取样本, 步数固定. ✅
//! 2. 多个工作线程各自持有加载器与管线, 通过有界队列输出批量. ✅
//! 3. 任一工作线程失败时终止其余线程, 并把原始错误交给消费者. ✅
//!
//! 实现位于 `seg-berry/src/loader.rs` 与 `seg-berry/src/producer`.
//!
//! ### 前景索引缓存 ✅
//!
//! 实现位于 `seg-berry/src/data/foreground.rs`.
//!
//! ### 完善代码文档 ✅
//!
//! 给每个 public API 提供文档, 并视情况给 private
//! API 提供文档.

pub mod augment;
pub mod config;
pub mod consts;
pub mod data;
pub mod dataset;
pub mod downsample;
mod error;
pub mod geometry;
pub mod loader;
pub mod prelude;
pub mod producer;

pub use augment::{Compose, Transform};
pub use config::SegConfig;
pub use data::{Batch, Field, LabelMask, Record, Volume};
pub use error::{SegError, SegResult};
pub use loader::BatchLoader;
pub use producer::BatchStream;
