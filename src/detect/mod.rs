//! 检测模块 (Detection modules)
//!
//! 三个逐帧查询的有状态模型:
//! - 主目标级联分类器 (整帧)
//! - 子目标级联分类器 (限定在主目标区域内)
//! - 基准标记检测 + 3D姿态估计
//!
//! 级联模型在构造时从文件惰性加载; 加载失败进入降级模式
//! (查询返回零检测, 不报错), 失败只在加载时记录一次。
pub mod cascade;
pub mod marker;
pub mod pose;

pub use cascade::{CascadeDetector, CascadeModel, DetectParams};
pub use marker::{MarkerDetector, MarkerDictionary};
pub use pose::{estimate_marker_pose, Pose};

use crate::{Point2f, Rect};

/// 子目标命中: 所属主目标区域索引 + 全帧坐标下的框
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartHit {
    pub parent: usize,
    pub rect: Rect,
}

/// 标记命中: 编号 + 2D角点 + 可选3D姿态
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerHit {
    pub id: u32,
    /// 角点顺序: 左上, 右上, 右下, 左下 (按解码方向旋转对齐)
    pub corners: [Point2f; 4],
    pub pose: Option<Pose>,
}
