//! 帧处理核心 (Frame processing core)
//!
//! 一路视频流对应一个处理工作者: 配置与统计在本模块的子模块间
//! 流转, 流水线阶段见 [`stages`], 线程与锁的编排见 [`worker`]。

pub mod config;
pub mod stages;
pub mod stats;
pub mod worker;

pub use config::{CameraIntrinsics, ProcessFlags, ProcessSettings, SmoothKernel, StreamSetup};
pub use stages::{run_pipeline, DetectionSummary, Detectors};
pub use stats::{FpsStats, StatsSnapshot};
pub use worker::{
    ChannelSink, FrameSlot, FrameSource, ProcessingWorker, ResultSink, WorkerEvent, WorkerHandle,
};
