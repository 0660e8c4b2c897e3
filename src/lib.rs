#![allow(clippy::type_complexity)]
//! 视频流处理核心 (Video stream processing core)
//!
//! 单线程工作循环架构:
//! - 采集线程: 向共享帧槽写入最新帧 (外部协作者)
//! - 处理线程: 取帧 → ROI裁剪 → 流水线处理 → 发布结果
//! - 消费线程: 接收处理结果 (外部协作者)
pub mod detect; // 检测模块 (级联分类器 + 标记检测 + 姿态估计)
pub mod frame; // 帧类型与ROI裁剪
pub mod processing; // 处理流水线与工作线程

pub use crate::detect::{CascadeDetector, MarkerDetector, MarkerHit, PartHit, Pose};
pub use crate::frame::Frame;
pub use crate::processing::{
    ChannelSink, DetectionSummary, FrameSlot, FrameSource, ProcessFlags, ProcessSettings,
    ProcessingWorker, ResultSink, SmoothKernel, StatsSnapshot, StreamSetup, WorkerEvent,
    WorkerHandle,
};

/// 轴对齐矩形 (ROI与检测框共用)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn xmax(&self) -> i32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// 判断两个矩形是否相互重叠
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.xmax()
            && other.x < self.xmax()
            && self.y < other.ymax()
            && other.y < self.ymax()
    }

    /// 判断是否完全落在 (0,0,width,height) 边界内
    pub fn inside(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.width >= 0
            && self.height >= 0
            && self.xmax() <= width as i32
            && self.ymax() <= height as i32
    }
}

/// 二维点 (标记角点)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Point2f {
    pub x: f32,
    pub y: f32,
}

impl Point2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_bounds() {
        let r = Rect::new(10, 20, 30, 40);
        assert_eq!(r.xmax(), 40);
        assert_eq!(r.ymax(), 60);
        assert_eq!(r.area(), 1200);
        assert_eq!(r.center(), (25, 40));
    }

    #[test]
    fn test_rect_inside() {
        let r = Rect::new(0, 0, 64, 48);
        assert!(r.inside(64, 48));
        assert!(!r.inside(63, 48));
        assert!(!Rect::new(-1, 0, 10, 10).inside(64, 48));
        assert!(!Rect::new(60, 0, 10, 10).inside(64, 48));
    }

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0, 0, 10, 10);
        assert!(a.intersects(&Rect::new(5, 5, 10, 10)));
        assert!(!a.intersects(&Rect::new(10, 0, 5, 5)));
        assert!(!a.intersects(&Rect::new(0, 20, 5, 5)));
    }
}
