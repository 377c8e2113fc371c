//! 批量生产者: 把加载器与增强管线组合成一个批量的数据流.
//!
//! 单线程时在调用者线程里逐个生产; 多线程时见 [`MultiThreadedProducer`].
//! 无论哪种方式, 一个 epoch 恰好产出 `total_steps` 个批量.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::augment::{training_transforms, validation_transforms, AugmentPlan, Compose};
use crate::config::SegConfig;
use crate::data::{Batch, ImageIo};
use crate::dataset::SampleIndex;
use crate::loader::BatchLoader;
use crate::SegResult;

pub mod worker;

pub use worker::MultiThreadedProducer;

/// 管线工厂. 每个工作线程调用一次, 得到自己的管线实例.
pub type PipelineFactory = Arc<dyn Fn() -> Compose + Send + Sync>;

/// 在调用者线程中生产批量.
#[derive(Debug)]
pub struct SingleThreadedProducer {
    loader: BatchLoader,
    pipeline: Compose,
    rng: StdRng,
    finished: bool,
}

impl SingleThreadedProducer {
    pub fn new(loader: BatchLoader, pipeline: Compose, seed: u64) -> Self {
        Self {
            loader,
            pipeline,
            rng: StdRng::seed_from_u64(seed),
            finished: false,
        }
    }

    /// 开始新的 epoch.
    pub fn reset(&mut self) {
        self.loader.reset();
        self.finished = false;
    }
}

impl Iterator for SingleThreadedProducer {
    type Item = SegResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = match self.loader.next_batch(&mut self.rng) {
            Ok(Some(record)) => self.pipeline.run(record, &mut self.rng),
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if item.is_err() {
            self.finished = true;
        }
        Some(item)
    }
}

/// 单线程或多线程的批量数据流.
#[derive(Debug)]
pub enum BatchStream {
    Single(SingleThreadedProducer),
    Multi(MultiThreadedProducer),
}

impl BatchStream {
    /// `workers` 为 1 时在调用者线程中生产, 否则启动 `workers` 个工作线程.
    pub fn new(
        loader: BatchLoader,
        factory: PipelineFactory,
        workers: usize,
        capacity: usize,
        seed: u64,
    ) -> SegResult<Self> {
        if workers <= 1 {
            Ok(Self::Single(SingleThreadedProducer::new(loader, factory(), seed)))
        } else {
            MultiThreadedProducer::new(&loader, factory, workers, capacity, seed).map(Self::Multi)
        }
    }

    /// 按配置打开数据流: 划分数据集, 构造加载器, 按训练或验证模式组装管线.
    ///
    /// # 注意
    ///
    /// 惰性加载时由 `io` 读取文件; 预加载时 `io` 不会被使用.
    pub fn open(cfg: &SegConfig, io: Arc<dyn ImageIo>) -> SegResult<Self> {
        cfg.validate()?;
        let index = SampleIndex::from_config(cfg)?;
        let loader = BatchLoader::from_config(cfg, &index)?;
        let reader = if loader.is_eager() { None } else { Some(io) };

        let factory: PipelineFactory = if cfg.train {
            let plan = AugmentPlan::from_config(cfg)?;
            log::info!("augmentation plan: {plan:?}");
            let cfg = cfg.clone();
            Arc::new(move || training_transforms(&plan, &cfg, reader.clone()))
        } else {
            let cfg = cfg.clone();
            Arc::new(move || validation_transforms(&cfg, reader.clone()))
        };

        log::info!(
            "opening {} stream: {} samples, {} steps, {} worker(s)",
            if cfg.train { "training" } else { "validation" },
            loader.len(),
            loader.total_steps(),
            cfg.num_workers
        );
        Self::new(loader, factory, cfg.num_workers, cfg.capacity(), cfg.seed)
    }

    /// 停止生产. 多线程时等待所有工作线程退出.
    pub fn cancel(&mut self) {
        match self {
            Self::Single(p) => p.finished = true,
            Self::Multi(p) => p.cancel(),
        }
    }
}

impl Iterator for BatchStream {
    type Item = SegResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Single(p) => p.next(),
            Self::Multi(p) => p.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::Transform;
    use crate::data::{AdaptiveIo, Record};
    use crate::dataset::EagerData;
    use crate::{SegError, SegResult};
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn eager_loader(n: usize, batch_size: usize, steps: usize) -> BatchLoader {
        let volumes = (0..n)
            .map(|i| ArrayD::from_elem(IxDyn(&[1, 6, 6]), i as f32))
            .collect();
        let masks = (0..n).map(|_| ArrayD::zeros(IxDyn(&[1, 6, 6]))).collect();
        let data = EagerData::from_arrays(volumes, masks).unwrap();
        BatchLoader::eager(Arc::new(data), batch_size, steps).unwrap()
    }

    fn validation_factory() -> PipelineFactory {
        let cfg = SegConfig {
            patch_size: vec![4, 4],
            ..Default::default()
        };
        Arc::new(move || validation_transforms(&cfg, None))
    }

    /// 第 `after` 次调用时出错的阶段.
    struct FailAfter {
        after: usize,
        seen: AtomicUsize,
        panic: bool,
    }

    impl Transform for FailAfter {
        fn name(&self) -> &'static str {
            "fail_after"
        }

        fn apply(&self, record: Record, _rng: &mut StdRng) -> SegResult<Record> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                if self.panic {
                    panic!("broken stage");
                }
                return Err(SegError::config("broken stage"));
            }
            Ok(record)
        }
    }

    fn failing_factory(after: usize, panic: bool) -> PipelineFactory {
        let cfg = SegConfig {
            patch_size: vec![4, 4],
            ..Default::default()
        };
        Arc::new(move || {
            let mut pipeline = Compose::new().then(FailAfter {
                after,
                seen: AtomicUsize::new(0),
                panic,
            });
            pipeline.push(crate::augment::PatchTransform::new(&cfg.patch_size, 0.0, cfg.margin()));
            pipeline.push(crate::augment::Rename::new(
                crate::consts::keys::MASK,
                crate::consts::keys::TARGET,
            ));
            pipeline
        })
    }

    #[test]
    fn test_single_threaded() {
        let loader = eager_loader(3, 2, 5);
        let mut stream = BatchStream::new(loader, validation_factory(), 1, 1, 0).unwrap();
        assert!(matches!(stream, BatchStream::Single(_)));
        let batches: Vec<Batch> = stream.by_ref().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 5);
        assert_eq!(batches[0].image.shape(), &[2, 1, 4, 4]);
        assert!(stream.next().is_none());

        if let BatchStream::Single(p) = &mut stream {
            p.reset();
        }
        assert_eq!(stream.count(), 5);
    }

    #[test]
    fn test_workers_produce_exact_steps() {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
        let loader = eager_loader(5, 2, 40);
        for workers in [4, num_cpus::get().clamp(2, 8)] {
            let stream =
                BatchStream::new(loader.clone(), validation_factory(), workers, 2 * workers, 7)
                    .unwrap();
            assert!(matches!(stream, BatchStream::Multi(_)));
            assert_eq!(count_batches(stream), 40);
        }
    }

    fn count_batches(stream: BatchStream) -> usize {
        let mut n = 0;
        for batch in stream {
            let batch = batch.unwrap();
            assert_eq!(batch.image.shape(), &[2, 1, 4, 4]);
            assert_eq!(batch.target[0].shape(), &[2, 1, 4, 4]);
            n += 1;
        }
        n
    }

    #[test]
    fn test_worker_error_is_reported_once() {
        let loader = eager_loader(3, 1, 1000);
        let mut producer =
            MultiThreadedProducer::new(&loader, failing_factory(3, false), 3, 2, 0).unwrap();
        let mut errors = 0;
        let mut batches = 0;
        for item in producer.by_ref() {
            match item {
                Ok(_) => batches += 1,
                Err(SegError::Configuration(_)) => errors += 1,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert_eq!(errors, 1);
        assert!(batches < 1000);
        assert!(producer.next().is_none());
    }

    #[test]
    fn test_worker_panic_becomes_error() {
        let loader = eager_loader(3, 1, 100);
        let producer =
            MultiThreadedProducer::new(&loader, failing_factory(2, true), 2, 2, 0).unwrap();
        let errors: Vec<SegError> = producer.filter_map(Result::err).collect();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            SegError::Worker { message, .. } => assert!(message.contains("broken stage")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancel_unblocks_workers() {
        let loader = eager_loader(3, 1, 100_000);
        let mut producer =
            MultiThreadedProducer::new(&loader, validation_factory(), 4, 1, 0).unwrap();
        assert_eq!(producer.num_workers(), 4);
        assert!(producer.next().unwrap().is_ok());
        // 让工作线程把队列填满并阻塞在发送上.
        std::thread::sleep(Duration::from_millis(50));
        producer.cancel();
        assert!(producer.is_cancelled());
        assert!(matches!(producer.recv(), Err(SegError::Cancelled)));
        assert!(producer.next().is_none());
    }

    #[test]
    fn test_open_from_config() {
        let dir = std::env::temp_dir().join(format!("seg-berry-open-{}", std::process::id()));
        let img_dir = dir.join("img");
        let msk_dir = dir.join("msk");
        std::fs::create_dir_all(&img_dir).unwrap();
        std::fs::create_dir_all(&msk_dir).unwrap();
        for i in 0..4 {
            let name = format!("case_{i}.npy");
            let image = ArrayD::from_elem(IxDyn(&[10, 12]), i as f32);
            let mut mask = ArrayD::<u8>::zeros(IxDyn(&[10, 12]));
            mask[[5, 6].as_slice()] = 1;
            ndarray_npy::write_npy(img_dir.join(&name), &image).unwrap();
            ndarray_npy::write_npy(msk_dir.join(&name), &mask).unwrap();
        }

        for (load_data, workers) in [(false, 1), (true, 2)] {
            let cfg = SegConfig {
                img_dir: img_dir.clone(),
                msk_dir: msk_dir.clone(),
                patch_size: vec![8, 8],
                batch_size: 2,
                nbof_steps: 6,
                num_workers: workers,
                load_data,
                ..Default::default()
            };
            let stream = BatchStream::open(&cfg, Arc::new(AdaptiveIo)).unwrap();
            let batches: Vec<Batch> = stream.map(|b| b.unwrap()).collect();
            assert_eq!(batches.len(), 6);
            for batch in &batches {
                assert_eq!(batch.image.shape(), &[2, 1, 8, 8]);
                assert!(batch.target[0].iter().all(|v| *v <= 1));
            }
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
