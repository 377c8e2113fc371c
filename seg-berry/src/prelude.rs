//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{SegError, SegResult};

pub use crate::consts::label::{BACKGROUND, BORDER, FOREGROUND};
pub use crate::consts::{keys, DEFAULT_FG_RATE, DEFAULT_WORKERS};

pub use crate::data::{
    AdaptiveIo, Batch, Field, ForegroundIndex, ImageIo, LabelMask, Record, Volume,
};

pub use crate::geometry::{centered_pad, crop_pad, CropWindow};

pub use crate::augment::plan::AugmentPlan;
pub use crate::augment::{training_transforms, validation_transforms, Compose, Transform};

pub use crate::downsample::{downsample_for_ds, DsScale};

pub use crate::dataset::{FoldTable, SampleIndex};

pub use crate::loader::{BatchLoader, LoaderState};

pub use crate::producer::{BatchStream, MultiThreadedProducer, SingleThreadedProducer};

pub use crate::config::SegConfig;
