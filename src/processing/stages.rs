//! 流水线阶段执行器 (Pipeline stage executor)
//!
//! 按固定顺序对单帧执行各图像变换与检测阶段, 每个阶段受对应开关控制。
//! 输入为本次迭代独占的帧与配置快照, 输出为叠加后的帧与检测汇总。

use anyhow::{bail, Result};
use image::{GrayImage, Luma, Rgb, Rgba};
use imageproc::contrast::equalize_histogram;
use imageproc::distance_transform::Norm;
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::edges::canny;
use imageproc::filter::{box_filter, gaussian_blur_f32, median_filter};
use imageproc::morphology::{dilate, erode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::config::{ProcessFlags, ProcessSettings, SmoothKernel, StreamSetup};
use crate::detect::pose::draw_axis;
use crate::detect::{
    estimate_marker_pose, CascadeDetector, DetectParams, MarkerDetector, MarkerHit, PartHit,
};
use crate::{Frame, Rect};

/// 每帧检测汇总 - 在单次迭代内产生并交给结果接收端, 不跨帧保留
#[derive(Clone, Debug, Default)]
pub struct DetectionSummary {
    pub objects: Vec<Rect>,
    pub parts: Vec<PartHit>,
    pub markers: Vec<MarkerHit>,
}

/// 流的三个检测模型, 构造时一次性加载
pub struct Detectors {
    pub object: CascadeDetector,
    pub part: CascadeDetector,
    pub marker: MarkerDetector,
    marker_log_counter: AtomicU64,
}

/// 标记耗时日志节流间隔 (每N个含标记的帧打印一次)
const MARKER_LOG_INTERVAL: u64 = 30;

impl Detectors {
    pub fn new(object: CascadeDetector, part: CascadeDetector, marker: MarkerDetector) -> Self {
        Self {
            object,
            part,
            marker,
            marker_log_counter: AtomicU64::new(0),
        }
    }

    pub fn from_setup(setup: &StreamSetup) -> Self {
        Self::new(
            CascadeDetector::from_file("object", &setup.object_cascade),
            CascadeDetector::from_file("part", &setup.part_cascade),
            MarkerDetector::default(),
        )
    }

    /// 标记耗时日志节流: 首帧打印, 之后每隔固定帧数打印一次
    fn should_log_marker_timing(&self) -> bool {
        self.marker_log_counter.fetch_add(1, Ordering::Relaxed) % MARKER_LOG_INTERVAL == 0
    }
}

/// 对单帧执行完整流水线
///
/// 阶段顺序固定: 灰度 → 平滑 → 锐化 → 膨胀 → 腐蚀 → 翻转 → 边缘 →
/// 标记检测+姿态 → 主目标级联 → 子目标级联 → 主目标叠加。
/// 任何阶段失败只废弃本帧, 错误上抛由工作循环决定跳帧。
pub fn run_pipeline(
    frame: &mut Frame,
    flags: &ProcessFlags,
    settings: &ProcessSettings,
    setup: &StreamSetup,
    detectors: &Detectors,
) -> Result<DetectionSummary> {
    let mut summary = DetectionSummary::default();

    // 1. 灰度转换 (仅3/4通道帧, 已是1通道则无操作)
    if flags.grayscale {
        frame.make_gray();
    }

    // 2. 平滑
    if flags.smooth {
        smooth(frame, &settings.smooth)?;
    }

    // 3. 锐化 (固定3x3高通核)
    if flags.sharpen {
        convolve3x3(frame, &setup.sharpen_kernel);
    }

    // 4. 膨胀
    if flags.dilate && settings.dilate_iterations > 0 {
        let k = settings.dilate_iterations.min(255) as u8;
        for_each_plane(frame, |plane| dilate(plane, Norm::LInf, k));
    }

    // 5. 腐蚀
    if flags.erode && settings.erode_iterations > 0 {
        let k = settings.erode_iterations.min(255) as u8;
        for_each_plane(frame, |plane| erode(plane, Norm::LInf, k));
    }

    // 6. 翻转
    if flags.flip {
        frame.flip(settings.flip_code);
    }

    // 7. 边缘检测 (输出替换为1通道边缘图; 阈值取min/max, 与OpenCV一致)
    if flags.canny {
        let gray = frame.to_gray();
        let low = settings.canny_threshold1.min(settings.canny_threshold2) as f32;
        let mut high = settings.canny_threshold1.max(settings.canny_threshold2) as f32;
        if high <= low {
            high = low + 1e-3;
        }
        // 底层实现固定3x3 Sobel孔径与L2梯度, aperture/l2参数被钉死
        *frame = Frame::Gray(canny(&gray, low, high));
    }

    // 8. 标记检测 + 3D姿态估计 + 坐标轴叠加
    if flags.markers {
        let start = Instant::now();
        let gray = frame.to_gray();
        let mut markers = detectors.marker.detect(&gray);
        if !markers.is_empty() {
            for hit in &mut markers {
                draw_marker_outline(frame, hit);
                match estimate_marker_pose(&hit.corners, setup.marker_size_m, &setup.intrinsics) {
                    Ok(pose) => {
                        draw_axis(frame, &pose, 2.0 * setup.marker_size_m, &setup.intrinsics);
                        hit.pose = Some(pose);
                    }
                    Err(e) => eprintln!("⚠️  标记 {} 姿态估计失败: {}", hit.id, e),
                }
            }
            if detectors.should_log_marker_timing() {
                println!(
                    "🔍 标记检测: {}个 | {:.1} ms",
                    markers.len(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
        }
        summary.markers = markers;
    }

    // 9. 主目标级联 (子目标检测依赖主目标区域, 任一开关打开都要运行)
    if flags.objects || flags.parts {
        let gray = equalize_histogram(&frame.to_gray());
        let params = DetectParams {
            scale_factor: 1.1,
            min_neighbors: 2,
            // 最小目标取帧尺寸的1/8
            min_size: (frame.width() / 8, frame.height() / 8),
        };
        summary.objects = detectors.object.detect(&gray, &params);

        // 10. 子目标级联: 限定在每个主目标区域内, 每个命中画圆标记
        if flags.parts {
            let part_params = DetectParams {
                scale_factor: 1.1,
                min_neighbors: 2,
                min_size: (30, 30),
            };
            for (parent, obj) in summary.objects.iter().enumerate() {
                let sub = image::imageops::crop_imm(
                    &gray,
                    obj.x as u32,
                    obj.y as u32,
                    obj.width as u32,
                    obj.height as u32,
                )
                .to_image();
                for hit in detectors.part.detect(&sub, &part_params) {
                    let rect = Rect::new(obj.x + hit.x, obj.y + hit.y, hit.width, hit.height);
                    let radius = (rect.width + rect.height) / 4;
                    draw_circle(frame, rect.center(), radius, [0, 0, 255]);
                    summary.parts.push(PartHit { parent, rect });
                }
            }
        }
    }

    // 11. 主目标叠加: 仅在主目标开关打开时画框
    // (子目标单独打开时主目标列表照常填充, 但不画框)
    if flags.objects {
        for obj in &summary.objects {
            draw_rect(frame, obj, [255, 0, 255]);
        }
    }

    Ok(summary)
}

/// 平滑阶段: 核类型分派
fn smooth(frame: &mut Frame, kernel: &SmoothKernel) -> Result<()> {
    match *kernel {
        SmoothKernel::Box { width, height } => {
            if width <= 0 || height <= 0 {
                bail!("均值滤波核尺寸非法: {}x{}", width, height);
            }
            // 半径核: 实际窗口为2r+1
            let (rx, ry) = ((width / 2) as u32, (height / 2) as u32);
            for_each_plane(frame, |plane| box_filter(plane, rx, ry));
        }
        SmoothKernel::Gaussian {
            width,
            sigma_x,
            ..
        } => {
            let sigma = if sigma_x > 0.0 {
                sigma_x
            } else if width > 0 {
                // sigma未给定时按核宽度推导 (OpenCV惯例)
                0.3 * ((width as f64 - 1.0) * 0.5 - 1.0) + 0.8
            } else {
                bail!("高斯滤波参数非法: width={} sigma_x={}", width, sigma_x);
            };
            if sigma <= 0.0 {
                bail!("高斯滤波sigma非法: {}", sigma);
            }
            match frame {
                Frame::Gray(img) => *img = gaussian_blur_f32(img, sigma as f32),
                Frame::Rgb(img) => *img = gaussian_blur_f32(img, sigma as f32),
                Frame::Rgba(img) => *img = gaussian_blur_f32(img, sigma as f32),
            }
        }
        SmoothKernel::Median { aperture } => {
            if aperture <= 0 {
                bail!("中值滤波孔径非法: {}", aperture);
            }
            let r = (aperture / 2) as u32;
            match frame {
                Frame::Gray(img) => *img = median_filter(img, r, r),
                Frame::Rgb(img) => *img = median_filter(img, r, r),
                Frame::Rgba(img) => *img = median_filter(img, r, r),
            }
        }
    }
    Ok(())
}

/// 灰度滤波按通道面独立执行后重组
fn for_each_plane<F>(frame: &mut Frame, op: F)
where
    F: Fn(&GrayImage) -> GrayImage,
{
    let planes: Vec<GrayImage> = frame.planes().iter().map(|p| op(p)).collect();
    frame.merge_planes(&planes);
}

/// 3x3卷积, 边界reflect-101, 结果饱和到u8
fn convolve3x3(frame: &mut Frame, kernel: &[f64; 9]) {
    for_each_plane(frame, |plane| {
        let (w, h) = (plane.width() as i64, plane.height() as i64);
        let reflect = |v: i64, hi: i64| -> u32 {
            // reflect-101: -1 -> 1, hi -> hi-2
            let m = if v < 0 {
                -v
            } else if v >= hi {
                2 * hi - v - 2
            } else {
                v
            };
            m.clamp(0, hi - 1) as u32
        };
        GrayImage::from_fn(plane.width(), plane.height(), |x, y| {
            let mut acc = 0.0;
            for ky in 0..3i64 {
                for kx in 0..3i64 {
                    let px = reflect(x as i64 + kx - 1, w);
                    let py = reflect(y as i64 + ky - 1, h);
                    acc += kernel[(ky * 3 + kx) as usize]
                        * plane.get_pixel(px, py).0[0] as f64;
                }
            }
            Luma([acc.round().clamp(0.0, 255.0) as u8])
        })
    });
}

fn luma_of(color: [u8; 3]) -> u8 {
    ((color[0] as u32 * 299 + color[1] as u32 * 587 + color[2] as u32 * 114) / 1000) as u8
}

/// 画线段 (各通道数帧通用)
pub fn draw_segment(frame: &mut Frame, start: (f32, f32), end: (f32, f32), color: [u8; 3]) {
    match frame {
        Frame::Gray(img) => draw_line_segment_mut(img, start, end, Luma([luma_of(color)])),
        Frame::Rgb(img) => draw_line_segment_mut(img, start, end, Rgb(color)),
        Frame::Rgba(img) => {
            draw_line_segment_mut(img, start, end, Rgba([color[0], color[1], color[2], 255]))
        }
    }
}

fn draw_rect(frame: &mut Frame, rect: &Rect, color: [u8; 3]) {
    if rect.width <= 0 || rect.height <= 0 {
        return;
    }
    let r = imageproc::rect::Rect::at(rect.x, rect.y).of_size(rect.width as u32, rect.height as u32);
    match frame {
        Frame::Gray(img) => draw_hollow_rect_mut(img, r, Luma([luma_of(color)])),
        Frame::Rgb(img) => draw_hollow_rect_mut(img, r, Rgb(color)),
        Frame::Rgba(img) => {
            draw_hollow_rect_mut(img, r, Rgba([color[0], color[1], color[2], 255]))
        }
    }
}

fn draw_circle(frame: &mut Frame, center: (i32, i32), radius: i32, color: [u8; 3]) {
    if radius <= 0 {
        return;
    }
    match frame {
        Frame::Gray(img) => draw_hollow_circle_mut(img, center, radius, Luma([luma_of(color)])),
        Frame::Rgb(img) => draw_hollow_circle_mut(img, center, radius, Rgb(color)),
        Frame::Rgba(img) => {
            draw_hollow_circle_mut(img, center, radius, Rgba([color[0], color[1], color[2], 255]))
        }
    }
}

fn draw_marker_outline(frame: &mut Frame, hit: &MarkerHit) {
    for i in 0..4 {
        let a = hit.corners[i];
        let b = hit.corners[(i + 1) % 4];
        draw_segment(frame, (a.x, a.y), (b.x, b.y), [0, 255, 0]);
    }
}
