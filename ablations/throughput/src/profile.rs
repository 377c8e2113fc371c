//! 批量生产统计.

use std::time::{Duration, Instant};

/// 可暂停的累加计时器.
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时会视为已经开始计时.
    #[inline]
    fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    /// 开始计时.
    #[inline]
    fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加. 返回本轮计时时长.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    /// 获得累计时间 (以微秒为单位).
    #[inline]
    fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

/// 一次吞吐量测量的统计.
#[derive(Clone, Debug)]
pub struct Profile {
    /// 收到的批量个数.
    batches: u64,

    /// 收到的样本个数.
    samples: u64,

    /// 消费者等待批量的总时间.
    wait_time: AccTimer,

    /// 打开数据流到取完全部批量的总时间.
    real_time: AccTimer,

    /// 等待最久的一次.
    most: Option<Duration>,
}

impl Profile {
    /// 初始化, 并开始总计时.
    #[inline]
    pub fn new() -> Self {
        Self {
            batches: 0,
            samples: 0,
            wait_time: AccTimer::new(),
            real_time: AccTimer::new(),
            most: None,
        }
    }

    /// 开始等待下一个批量.
    #[inline]
    pub fn wait_start(&mut self) {
        self.wait_time.start();
    }

    /// 收到一个含 `samples` 个样本的批量.
    #[inline]
    pub fn received(&mut self, samples: usize) {
        let d = self.wait_time.elapsed();
        self.most = Some(self.most.map_or(d, |m| m.max(d)));
        self.batches += 1;
        self.samples += samples as u64;
    }

    /// 结束全部计时.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.real_time.elapsed();
        self
    }

    #[inline]
    pub fn get_batches(&self) -> u64 {
        self.batches
    }

    #[inline]
    pub fn get_samples(&self) -> u64 {
        self.samples
    }

    /// 以微秒为单位获得等待批量的总时间.
    #[inline]
    pub fn get_wait_time_us(&self) -> u64 {
        self.wait_time.get_total_us()
    }

    /// 以微秒为单位获得总时间.
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.get_total_us()
    }

    /// 每秒样本数. 没有计时数据时返回 `None`.
    pub fn get_samples_per_sec(&self) -> Option<f64> {
        match self.get_real_time_us() {
            0 => None,
            us => Some(self.samples as f64 * 1e6 / us as f64),
        }
    }

    /// 平均每个批量的等待时间 (微秒).
    pub fn get_avg_wait_us(&self) -> Option<f64> {
        match self.batches {
            0 => None,
            n => Some(self.get_wait_time_us() as f64 / n as f64),
        }
    }

    /// 等待最久的一次. 没有收到批量时返回 `None`.
    #[inline]
    pub fn get_longest_wait(&self) -> Option<Duration> {
        self.most
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
