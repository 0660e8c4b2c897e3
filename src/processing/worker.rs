//! 处理工作线程 (Processing worker thread)
//!
//! 每路视频流一个专属工作线程, 无限循环直到收到停止请求:
//! 停止检查 → 计时 → 加处理锁 → 取最新帧 → ROI裁剪 → 流水线 →
//! 解锁 → 推送结果与统计。
//!
//! 两把互相独立的锁:
//! - 停止锁: 只保护停止标志, 持有时间最短 (置位或查清)
//! - 处理锁: 保护配置通道与整个单帧流水线临界区, 配置变更
//!   要么完整落在某帧之前, 要么完整落在其之后, 绝不会撕裂到帧中间
//!
//! 取消是协作式的: 每次迭代边界轮询一次停止标志, 不打断进行中的
//! 阶段, 最坏停止延迟为一整趟流水线。

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::config::{ProcessFlags, ProcessSettings, StreamSetup};
use super::stages::{run_pipeline, DetectionSummary, Detectors};
use super::stats::{FpsStats, StatsSnapshot};
use crate::{Frame, Rect};

/// 帧源: 外部拥有的逐流帧槽的只读视图
///
/// `latest_frame` 返回当前最新可用帧, 从不阻塞等待新帧 ——
/// 没有新帧时重复返回上一帧的副本。
pub trait FrameSource: Send {
    fn latest_frame(&mut self) -> Frame;
}

/// 结果接收端: 每次迭代完成后同步收到三类通知
///
/// 推送发生在流水线完成之后、下一次迭代开始之前; 跨线程转发
/// 由接收端自行负责。
pub trait ResultSink: Send {
    fn on_frame(&mut self, frame: Frame);
    fn on_statistics(&mut self, stats: StatsSnapshot);
    fn on_detection_count(&mut self, count: usize);
}

/// 单槽帧源: 生产者随时覆写, 消费侧克隆取走
///
/// 取帧即克隆并立刻释放槽锁, 流水线运行期间不占用槽。
#[derive(Clone)]
pub struct FrameSlot {
    slot: Arc<Mutex<Frame>>,
}

impl FrameSlot {
    pub fn new(initial: Frame) -> Self {
        Self {
            slot: Arc::new(Mutex::new(initial)),
        }
    }

    /// 生产者写入最新帧 (覆盖旧帧)
    pub fn store(&self, frame: Frame) {
        *self.slot.lock().unwrap() = frame;
    }
}

impl FrameSource for FrameSlot {
    fn latest_frame(&mut self) -> Frame {
        self.slot.lock().unwrap().clone()
    }
}

/// 工作线程向外发布的事件
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Frame(Frame),
    Statistics(StatsSnapshot),
    DetectionCount(usize),
}

/// 基于crossbeam通道的结果接收端
pub struct ChannelSink {
    tx: Sender<WorkerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<WorkerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn on_frame(&mut self, frame: Frame) {
        let _ = self.tx.send(WorkerEvent::Frame(frame));
    }

    fn on_statistics(&mut self, stats: StatsSnapshot) {
        let _ = self.tx.send(WorkerEvent::Statistics(stats));
    }

    fn on_detection_count(&mut self, count: usize) {
        let _ = self.tx.send(WorkerEvent::DetectionCount(count));
    }
}

/// 处理锁保护的配置通道内容, 整体快照替换
#[derive(Clone, Copy, Debug)]
struct ProcState {
    flags: ProcessFlags,
    settings: ProcessSettings,
    roi: Rect,
}

struct Shared {
    stop: Mutex<bool>,
    proc: Mutex<ProcState>,
    /// ROI只读镜像: `roi()` 不必等待帧处理临界区
    roi_mirror: Mutex<Rect>,
}

/// 控制句柄 (可克隆, 线程安全)
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// 整套开关原子替换; 正在处理的帧不受影响, 下一帧生效
    pub fn set_flags(&self, flags: ProcessFlags) {
        self.shared.proc.lock().unwrap().flags = flags;
    }

    /// 整套参数原子替换
    pub fn set_settings(&self, settings: ProcessSettings) {
        self.shared.proc.lock().unwrap().settings = settings;
    }

    pub fn set_roi(&self, roi: Rect) {
        let mut state = self.shared.proc.lock().unwrap();
        state.roi = roi;
        *self.shared.roi_mirror.lock().unwrap() = roi;
    }

    /// 读取当前ROI, 不等待帧处理
    pub fn roi(&self) -> Rect {
        *self.shared.roi_mirror.lock().unwrap()
    }

    /// 请求停止: 置位即返回, 不等待循环真正退出; 重复调用幂等。
    /// 调用方需另行join线程; 最坏退出延迟为一整趟流水线。
    pub fn stop(&self) {
        *self.shared.stop.lock().unwrap() = true;
    }

    #[cfg(test)]
    fn stop_requested(&self) -> bool {
        *self.shared.stop.lock().unwrap()
    }
}

/// 单路视频流的处理工作者
pub struct ProcessingWorker {
    device_number: i32,
    setup: StreamSetup,
    detectors: Detectors,
    stats: FpsStats,
    shared: Arc<Shared>,
}

impl ProcessingWorker {
    pub fn new(device_number: i32, setup: StreamSetup) -> Self {
        let detectors = Detectors::from_setup(&setup);
        let stats = FpsStats::new(setup.fps_window);
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            proc: Mutex::new(ProcState {
                flags: ProcessFlags::default(),
                settings: ProcessSettings::default(),
                roi: setup.roi,
            }),
            roi_mirror: Mutex::new(setup.roi),
        });
        Self {
            device_number,
            setup,
            detectors,
            stats,
            shared,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 启动专属处理线程, 返回join句柄与控制句柄
    pub fn start(
        self,
        mut source: impl FrameSource + 'static,
        mut sink: impl ResultSink + 'static,
    ) -> Result<(JoinHandle<()>, WorkerHandle)> {
        let handle = self.handle();
        let name = format!("processing-{}", self.device_number);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut worker = self;
                worker.run(&mut source, &mut sink);
            })
            .context("处理线程创建失败")?;
        Ok((join, handle))
    }

    /// 工作循环主体 (阻塞当前线程直到停止请求被观察到)
    pub fn run(&mut self, source: &mut dyn FrameSource, sink: &mut dyn ResultSink) {
        println!("✅ 处理线程启动 (设备 {})", self.device_number);
        let mut timer = Instant::now();
        loop {
            // 停止检查: 观察到请求即清标志退出
            {
                let mut stop = self.shared.stop.lock().unwrap();
                if *stop {
                    *stop = false;
                    break;
                }
            }

            // 上一次迭代耗时 → 瞬时FPS样本
            let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
            timer = Instant::now();

            let outcome = self.process_one(source);

            self.stats.update(elapsed_ms);
            match outcome {
                Ok((frame, summary)) => {
                    sink.on_frame(frame);
                    sink.on_statistics(self.stats.snapshot());
                    sink.on_detection_count(summary.objects.len());
                }
                Err(e) => {
                    // 本帧作废, 流不中断
                    eprintln!("⚠️  跳过本帧 (设备 {}): {:#}", self.device_number, e);
                }
            }
        }
        println!("✅ 处理线程退出 (设备 {})", self.device_number);
    }

    /// 单帧临界区: 处理锁覆盖配置读取与整个流水线
    fn process_one(&mut self, source: &mut dyn FrameSource) -> Result<(Frame, DetectionSummary)> {
        let _guard = self.shared.proc.lock().unwrap();
        let state = *_guard;
        // 立即克隆, 不在流水线期间占用帧源内部锁
        let frame = source.latest_frame();
        let mut clipped = frame.clip(&state.roi)?;
        let summary = run_pipeline(
            &mut clipped,
            &state.flags,
            &state.settings,
            &self.setup,
            &self.detectors,
        )?;
        Ok((clipped, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;
    use std::time::Duration;

    fn small_setup(w: i32, h: i32) -> StreamSetup {
        StreamSetup {
            roi: Rect::new(0, 0, w, h),
            // 降级模式级联 (路径不存在)
            object_cascade: "/nonexistent/object.json".to_string(),
            part_cascade: "/nonexistent/part.json".to_string(),
            ..Default::default()
        }
    }

    fn recv_frames(rx: &Receiver<WorkerEvent>, n: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        while frames.len() < n {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(WorkerEvent::Frame(f)) => frames.push(f),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => panic!("等待帧超时"),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        frames
    }

    #[test]
    fn test_noop_pipeline_emits_clipped_input() {
        let source_frame = Frame::solid_rgb(64, 48, [10, 20, 30]);
        let slot = FrameSlot::new(source_frame.clone());
        let (sink, rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(0, small_setup(64, 48));
        let (join, handle) = worker.start(slot, sink).unwrap();

        handle.set_roi(Rect::new(8, 8, 16, 16));
        let expected = source_frame.clip(&Rect::new(8, 8, 16, 16)).unwrap();
        // 丢弃ROI生效前的帧
        let mut saw_clipped = false;
        for frame in recv_frames(&rx, 50) {
            if frame.width() == 16 {
                assert_eq!(frame, expected); // 全关闭流水线逐位一致
                saw_clipped = true;
                break;
            }
        }
        assert!(saw_clipped, "未观察到裁剪后的帧");
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        // 门控帧源把工作线程按在临界区里, 保证两次停止请求
        // 都先于下一次停止检查落地
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let source = GatedSource {
            entered: entered_tx,
            gate: gate_rx,
            first: true,
        };
        let (sink, _rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(1, small_setup(24, 24));
        let (join, handle) = worker.start(source, sink).unwrap();

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("工作线程未进入临界区");
        handle.stop();
        handle.stop();
        gate_tx.send(()).unwrap();
        join.join().unwrap();
        // 恰好一次退出, 标志已被清除确认
        assert!(!handle.stop_requested());
    }

    #[test]
    fn test_invalid_roi_skips_frames_without_crash() {
        let slot = FrameSlot::new(Frame::solid_rgb(32, 32, [0, 0, 0]));
        let (sink, rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(2, small_setup(32, 32));
        let (join, handle) = worker.start(slot, sink).unwrap();

        // 越界ROI: 帧被跳过但线程继续运行
        handle.set_roi(Rect::new(0, 0, 100, 100));
        std::thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        assert!(rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());

        // 恢复合法ROI后输出恢复
        handle.set_roi(Rect::new(0, 0, 16, 16));
        let frames = recv_frames(&rx, 1);
        assert_eq!(frames[0].width(), 16);
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_roi_read_does_not_wait_for_processing() {
        let slot = FrameSlot::new(Frame::solid_rgb(32, 32, [0, 0, 0]));
        let (sink, _rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(3, small_setup(32, 32));
        let (join, handle) = worker.start(slot, sink).unwrap();

        handle.set_roi(Rect::new(2, 2, 8, 8));
        assert_eq!(handle.roi(), Rect::new(2, 2, 8, 8));
        handle.stop();
        join.join().unwrap();
    }

    /// 门控帧源: 首次取帧时通知测试线程并阻塞等待放行,
    /// 此时工作线程正持有处理锁 → 并发配置修改必须排在本帧之后
    struct GatedSource {
        entered: Sender<()>,
        gate: Receiver<()>,
        first: bool,
    }

    impl FrameSource for GatedSource {
        fn latest_frame(&mut self) -> Frame {
            if self.first {
                self.first = false;
                let _ = self.entered.send(());
                let _ = self.gate.recv();
            }
            Frame::solid_rgb(24, 24, [50, 60, 70])
        }
    }

    #[test]
    fn test_config_change_never_splits_a_frame() {
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let source = GatedSource {
            entered: entered_tx,
            gate: gate_rx,
            first: true,
        };
        let (sink, rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(4, small_setup(24, 24));
        let (join, handle) = worker.start(source, sink).unwrap();

        // 等工作线程进入临界区 (已持处理锁, 阻塞在帧源上)
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("工作线程未进入临界区");

        // 在帧处理中途提交配置变更: 将在处理锁上排队
        let mutator = {
            let handle = handle.clone();
            thread::spawn(move || {
                handle.set_flags(ProcessFlags {
                    grayscale: true,
                    ..Default::default()
                });
            })
        };
        thread::sleep(Duration::from_millis(50));
        gate_tx.send(()).unwrap();
        mutator.join().unwrap();

        // 被门控的那一帧必须以变更前的快照完成 → 3通道输出
        let frames = recv_frames(&rx, 1);
        assert_eq!(frames[0].channels(), 3, "配置变更撕裂了进行中的帧");

        // 变更之后的帧最终全部变为灰度
        let mut saw_gray = false;
        for frame in recv_frames(&rx, 200) {
            if frame.channels() == 1 {
                saw_gray = true;
                break;
            }
        }
        assert!(saw_gray, "变更后的配置未生效");
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_detection_count_published_each_iteration() {
        let slot = FrameSlot::new(Frame::solid_rgb(32, 32, [128, 128, 128]));
        let (sink, rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(5, small_setup(32, 32));
        let (join, handle) = worker.start(slot, sink).unwrap();
        handle.set_flags(ProcessFlags {
            objects: true,
            ..Default::default()
        });

        // 降级模式级联 → 计数恒为0, 但事件每迭代都要到达
        let mut counts = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while counts < 3 && Instant::now() < deadline {
            if let Ok(WorkerEvent::DetectionCount(n)) =
                rx.recv_timeout(Duration::from_millis(100))
            {
                assert_eq!(n, 0);
                counts += 1;
            }
        }
        assert_eq!(counts, 3);
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_statistics_frames_processed_grows() {
        let slot = FrameSlot::new(Frame::solid_rgb(16, 16, [0, 0, 0]));
        let (sink, rx) = ChannelSink::new();
        let worker = ProcessingWorker::new(6, small_setup(16, 16));
        let (join, handle) = worker.start(slot, sink).unwrap();

        let mut last = 0;
        let mut seen = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen < 5 && Instant::now() < deadline {
            if let Ok(WorkerEvent::Statistics(s)) = rx.recv_timeout(Duration::from_millis(100)) {
                assert!(s.frames_processed > last);
                last = s.frames_processed;
                seen += 1;
            }
        }
        assert_eq!(seen, 5);
        handle.stop();
        join.join().unwrap();
    }
}
