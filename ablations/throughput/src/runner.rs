//! 程序运行函数.

use crate::profile::Profile;
use crate::result::AblationResult;
use seg_berry::prelude::*;
use std::sync::Arc;
use utils::{loader, synthetic};

/// 合成数据集的样本个数与形状.
const SYNTHETIC_CASES: usize = 8;
const SYNTHETIC_SHAPE: [usize; 3] = [48, 96, 96];

/// 找到数据集. 环境变量或主目录下没有时, 在临时目录中生成合成数据集.
fn prepare_config(patch_size: Vec<usize>) -> SegConfig {
    let img_dir = loader::img_dir_from_env_or_home();
    if img_dir.is_dir() {
        return loader::config_from_env_or_home(patch_size);
    }
    let dir = std::env::temp_dir().join("seg-berry-throughput");
    log::info!("no dataset at {}, writing a synthetic one to {}", img_dir.display(), dir.display());
    let (img_dir, msk_dir) = synthetic::write_dataset(&dir, SYNTHETIC_CASES, &SYNTHETIC_SHAPE, 0)
        .expect("Writing synthetic dataset error");
    loader::config_for(img_dir, msk_dir, patch_size)
}

/// 取完一个 epoch 并计时.
fn measure(cfg: &SegConfig) -> Profile {
    let mut profile = Profile::new();
    let mut stream =
        BatchStream::open(cfg, Arc::new(AdaptiveIo)).expect("Opening batch stream error");
    loop {
        profile.wait_start();
        match stream.next() {
            Some(batch) => profile.received(batch.expect("Batch production error").len()),
            None => break,
        }
    }
    profile.finish()
}

/// 实际运行.
pub fn run() -> AblationResult {
    let base = SegConfig {
        batch_size: 2,
        nbof_steps: 32,
        ..prepare_config(vec![32, 64, 64])
    };
    base.validate().expect("Invalid configuration");

    let cpus = utils::cpus();
    let mut settings = vec![(1, false), (cpus, false), (1, true), (cpus, true)];
    settings.dedup();

    println!("Running throughput ablation on {cpus} cpus...");
    settings
        .into_iter()
        .map(|(num_workers, load_data)| {
            let cfg = SegConfig {
                num_workers,
                load_data,
                ..base.clone()
            };
            let name = format!(
                "{} worker(s), {}",
                num_workers,
                if load_data { "eager" } else { "lazy" }
            );
            log::info!("measuring `{name}`");
            (name, measure(&cfg))
        })
        .collect()
}
