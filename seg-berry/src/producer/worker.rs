//! 多线程生产者.
//!
//! 每个工作线程持有自己的加载器副本, 管线实例与随机数发生器, 只共享输出队列.
//! 队列有界: 队列满时工作线程阻塞, 队列空时消费者阻塞.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::augment::Compose;
use crate::data::Batch;
use crate::loader::BatchLoader;
use crate::producer::PipelineFactory;
use crate::{SegError, SegResult};

/// 用 `W` 个线程并行产出批量.
///
/// 第一个出错 (返回错误或 panic) 的工作线程会让其余线程一并停止,
/// 错误只向消费者报告一次. 所有工作线程都结束且队列取空之后, 数据流结束.
///
/// 调用 [`cancel`](Self::cancel) 或析构时, 设置停止标志, 关闭队列, 等待所有线程退出.
pub struct MultiThreadedProducer {
    workers: Vec<JoinHandle<()>>,
    output_rx: Option<Receiver<SegResult<Batch>>>,
    shutdown: Arc<AtomicBool>,
    cancelled: bool,
}

impl std::fmt::Debug for MultiThreadedProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiThreadedProducer")
            .field("workers", &self.workers.len())
            .field("open", &self.output_rx.is_some())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl MultiThreadedProducer {
    /// 启动 `workers` 个工作线程.
    ///
    /// 第 `i` 个线程使用 `loader.for_worker(i, workers)`, 一个新的 `factory()` 管线,
    /// 以及种子为 `seed + i` 的随机数发生器. `capacity` 为队列容量.
    pub fn new(
        loader: &BatchLoader,
        factory: PipelineFactory,
        workers: usize,
        capacity: usize,
        seed: u64,
    ) -> SegResult<Self> {
        if workers == 0 {
            return Err(SegError::config("producer needs at least one worker"));
        }
        if capacity == 0 {
            return Err(SegError::config("queue capacity must be positive"));
        }

        let (output_tx, output_rx) = bounded(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let loader = loader.for_worker(id, workers);
            let factory = Arc::clone(&factory);
            let output_tx = output_tx.clone();
            let shutdown_clone = Arc::clone(&shutdown);
            let rng = StdRng::seed_from_u64(seed.wrapping_add(id as u64));

            let spawned = thread::Builder::new()
                .name(format!("seg-berry-worker-{id}"))
                .spawn(move || {
                    log::debug!("worker {id} started");
                    let body = AssertUnwindSafe(|| {
                        let pipeline = factory();
                        run_worker(loader, &pipeline, rng, &output_tx, &shutdown_clone)
                    });
                    if let Err(payload) = panic::catch_unwind(body) {
                        shutdown_clone.store(true, Ordering::Release);
                        let err = SegError::Worker {
                            worker: id,
                            message: panic_message(payload.as_ref()),
                        };
                        let _ = output_tx.send(Err(err));
                    }
                    log::debug!("worker {id} finished");
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        // 只留工作线程持有发送端, 全部退出后队列自然断开.
        drop(output_tx);
        Ok(Self {
            workers: handles,
            output_rx: Some(output_rx),
            shutdown,
            cancelled: false,
        })
    }

    /// 工作线程个数.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// 取下一个批量, 必要时阻塞.
    ///
    /// # 返回值
    ///
    /// - `Ok(Some(批量))`;
    /// - `Ok(None)`: 所有工作线程都已结束且队列已空, 或此前已经报告过错误;
    /// - `Err(e)`: 某个工作线程的错误 (只报告一次);
    /// - `Err(SegError::Cancelled)`: 已被 [`cancel`](Self::cancel).
    pub fn recv(&mut self) -> SegResult<Option<Batch>> {
        let Some(rx) = self.output_rx.as_ref() else {
            return if self.cancelled {
                Err(SegError::Cancelled)
            } else {
                Ok(None)
            };
        };
        match rx.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(e)) => {
                self.shutdown();
                Err(e)
            }
            Err(_) => {
                self.shutdown();
                Ok(None)
            }
        }
    }

    /// 取消: 停止所有工作线程并等待其退出. 之后 [`recv`](Self::recv) 返回 `Cancelled`.
    pub fn cancel(&mut self) {
        if self.output_rx.is_some() {
            self.cancelled = true;
        }
        self.shutdown();
    }

    /// 是否已被取消.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // 关闭接收端, 阻塞在发送上的工作线程随即返回.
        self.output_rx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("a worker thread panicked outside the pipeline");
            }
        }
    }
}

impl Iterator for MultiThreadedProducer {
    type Item = SegResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.recv() {
            Ok(batch) => batch.map(Ok),
            Err(SegError::Cancelled) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for MultiThreadedProducer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 工作线程主循环. 出错时设置停止标志, 把错误送入队列后退出.
fn run_worker(
    mut loader: BatchLoader,
    pipeline: &Compose,
    mut rng: StdRng,
    output_tx: &Sender<SegResult<Batch>>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Acquire) {
        let item = match loader.next_batch(&mut rng) {
            Ok(Some(record)) => pipeline.run(record, &mut rng),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if failed {
            shutdown.store(true, Ordering::Release);
        }
        if output_tx.send(item).is_err() || failed {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_owned()
    }
}
