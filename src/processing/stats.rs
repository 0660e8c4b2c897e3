//! 吞吐量统计 (Throughput statistics)
//! 固定长度滑动窗口的瞬时FPS采样, 每满一窗发布一次平均值

use std::collections::VecDeque;

/// 对外发布的统计快照
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    /// 最近一窗的平均FPS (每N个有效样本更新一次)
    pub average_fps: f64,
    /// 累计已处理帧数
    pub frames_processed: u64,
}

/// FPS滑动窗口统计器
///
/// 每次循环迭代调用一次 `update`:
/// - 仅当耗时为正时入队瞬时速率 `1000/elapsed_ms` 并累加样本计数
/// - 队列超过窗口长度时丢弃最旧样本
/// - 队列长度与样本计数同时到达窗口长度时, 清空队列求和取平均,
///   发布新平均值并将和与计数归零
/// - 无论耗时是否有效, 累计帧数都加一
pub struct FpsStats {
    window: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sample_count: usize,
    snapshot: StatsSnapshot,
}

impl FpsStats {
    pub fn new(capacity: usize) -> Self {
        // 配置可能给出0窗口, 0长度会让发布分支算 0/0
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity + 1),
            capacity,
            sum: 0.0,
            sample_count: 0,
            snapshot: StatsSnapshot::default(),
        }
    }

    pub fn update(&mut self, elapsed_ms: f64) {
        if elapsed_ms > 0.0 {
            self.window.push_back(1000.0 / elapsed_ms);
            self.sample_count += 1;
        }

        if self.window.len() > self.capacity {
            self.window.pop_front();
        }

        if self.window.len() == self.capacity && self.sample_count == self.capacity {
            while let Some(fps) = self.window.pop_front() {
                self.sum += fps;
            }
            self.snapshot.average_fps = self.sum / self.capacity as f64;
            self.sum = 0.0;
            self.sample_count = 0;
        }

        self.snapshot.frames_processed += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }
}
