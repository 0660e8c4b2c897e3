//! 流处理配置 (Stream processing configuration)
//! 处理开关 / 处理参数 / 流构造参数, 支持JSON文件加载

use serde::{Deserialize, Serialize};
use std::fs;

use crate::Rect;

/// 流水线阶段开关
///
/// 字段声明顺序与执行顺序无关, 流水线始终按固定阶段顺序执行,
/// 每个阶段仅在对应开关打开时运行。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFlags {
    pub grayscale: bool,
    pub smooth: bool,
    pub sharpen: bool,
    pub dilate: bool,
    pub erode: bool,
    pub flip: bool,
    pub canny: bool,
    /// 基准标记检测 + 3D姿态估计
    pub markers: bool,
    /// 主目标级联检测
    pub objects: bool,
    /// 子目标级联检测 (依赖主目标区域)
    pub parts: bool,
}

/// 平滑核 - 按核类型分支的参数集
///
/// 每种核有自己的命名参数, 不同核类型之间不存在参数复用。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SmoothKernel {
    /// 均值滤波
    Box { width: i32, height: i32 },
    /// 高斯滤波; sigma<=0 时按核宽度推导 (OpenCV惯例)
    Gaussian {
        width: i32,
        height: i32,
        sigma_x: f64,
        sigma_y: f64,
    },
    /// 中值滤波
    Median { aperture: i32 },
}

impl Default for SmoothKernel {
    fn default() -> Self {
        SmoothKernel::Box {
            width: 3,
            height: 3,
        }
    }
}

/// 各阶段数值参数
///
/// 参数不在此处校验: 关闭阶段的参数保持惰性, 非法值(如0或负的核尺寸)
/// 原样传给底层变换, 由工作循环按帧捕获失败。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessSettings {
    pub smooth: SmoothKernel,
    pub dilate_iterations: i32,
    pub erode_iterations: i32,
    /// 翻转方向: 0 垂直, >0 水平, <0 双向
    pub flip_code: i32,
    pub canny_threshold1: f64,
    pub canny_threshold2: f64,
    pub canny_aperture: i32,
    pub canny_l2_gradient: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            smooth: SmoothKernel::default(),
            dilate_iterations: 1,
            erode_iterations: 1,
            flip_code: 0,
            canny_threshold1: 10.0,
            canny_threshold2: 100.0,
            canny_aperture: 3,
            canny_l2_gradient: false,
        }
    }
}

/// 相机内参与畸变系数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// 3x3 内参矩阵, 行优先
    pub matrix: [[f64; 3]; 3],
    /// 畸变系数 (k1, k2, p1, p2, k3)
    pub dist_coeffs: [f64; 5],
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        // 默认网络摄像头标定值
        Self {
            matrix: [
                [6.4509151670288645e+02, 0.0, 3.3595607517914726e+02],
                [0.0, 6.4326487034230729e+02, 2.3680853197408831e+02],
                [0.0, 0.0, 1.0],
            ],
            dist_coeffs: [
                -2.5825073187425829e-02,
                3.3262700060646667e-02,
                -9.3844788935797275e-03,
                3.0333854776571413e-03,
                -9.9723801531059572e-02,
            ],
        }
    }
}

/// 流构造参数 - 工作线程创建时一次性传入
///
/// 标定常量与模型路径全部显式注入, 便于用合成数据做测试。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSetup {
    pub intrinsics: CameraIntrinsics,
    /// 标记物理边长 (米)
    pub marker_size_m: f64,
    /// 锐化卷积核, 3x3 行优先
    pub sharpen_kernel: [f64; 9],
    /// 主目标级联模型路径
    pub object_cascade: String,
    /// 子目标级联模型路径
    pub part_cascade: String,
    /// FPS滑动窗口长度
    pub fps_window: usize,
    /// 初始ROI
    pub roi: Rect,
}

impl Default for StreamSetup {
    fn default() -> Self {
        Self {
            intrinsics: CameraIntrinsics::default(),
            marker_size_m: 0.145,
            // 高通锐化核: 中心5, 四邻-1, 角0
            sharpen_kernel: [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0],
            object_cascade: "resources/object_cascade.json".to_string(),
            part_cascade: "resources/part_cascade.json".to_string(),
            fps_window: 32,
            roi: Rect::new(0, 0, 640, 480),
        }
    }
}

impl StreamSetup {
    /// 从JSON文件加载配置, 失败时回退到默认值
    pub fn load(path: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(setup) => {
                    println!("✅ 流配置已从 {} 加载", path);
                    setup
                }
                Err(e) => {
                    eprintln!("⚠️  流配置解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("⚠️  流配置读取失败: {}, 使用默认值", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_default() {
        let setup = StreamSetup::default();
        assert_eq!(setup.fps_window, 32);
        assert!((setup.marker_size_m - 0.145).abs() < 1e-9);
        assert_eq!(setup.sharpen_kernel[4], 5.0);
        assert_eq!(setup.intrinsics.matrix[2], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_smooth_kernel_tagged_json() {
        let json = r#"{"type":"Gaussian","width":5,"height":5,"sigma_x":1.5,"sigma_y":0.0}"#;
        let kernel: SmoothKernel = serde_json::from_str(json).unwrap();
        match kernel {
            SmoothKernel::Gaussian { width, sigma_x, .. } => {
                assert_eq!(width, 5);
                assert!((sigma_x - 1.5).abs() < 1e-9);
            }
            _ => panic!("应解析为高斯核"),
        }
    }

    #[test]
    fn test_setup_round_trip() {
        let setup = StreamSetup::default();
        let json = serde_json::to_string(&setup).unwrap();
        let back: StreamSetup = serde_json::from_str(&json).unwrap();
        assert_eq!(back, setup);
    }
}
