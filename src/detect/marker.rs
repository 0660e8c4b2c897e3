//! 基准标记检测 (Fiducial marker detection)
//! 二值化 → 轮廓提取 → 四边形拟合 → 投影采样 → 字典解码

use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::contrast::otsu_level;
use imageproc::geometric_transformations::Projection;
use imageproc::geometry::approximate_polygon_dp;
use imageproc::point::Point;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::MarkerHit;
use crate::Point2f;

/// 标记字典: 4x4编码位阵 + 一圈黑色边框
///
/// 每个编码16位, 行优先, 最高位为左上角单元; 1=白色单元。
/// 编码在4个旋转方向下互不冲突, 解码时同时得到编号与旋转方向。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDictionary {
    pub grid: u32,
    pub codes: Vec<u16>,
}

static BUILTIN_DICT: Lazy<MarkerDictionary> = Lazy::new(|| MarkerDictionary {
    grid: 4,
    codes: vec![
        0x9D41, 0x2B7C, 0xE1A6, 0x4F38, 0x71C5, 0xB82E, 0x15F3, 0xC69A, 0x3A57, 0xD80B, 0x6E94,
        0x07E9, 0xF24D, 0x8B16, 0x54A2, 0xA3D0,
    ],
});

impl MarkerDictionary {
    pub fn builtin() -> &'static MarkerDictionary {
        &BUILTIN_DICT
    }

    fn bit(code: u16, row: u32, col: u32) -> bool {
        (code >> (15 - (row * 4 + col))) & 1 == 1
    }

    /// 位阵顺时针旋转90°
    fn rotate(code: u16) -> u16 {
        let mut out = 0u16;
        for row in 0..4 {
            for col in 0..4 {
                if Self::bit(code, 3 - col, row) {
                    out |= 1 << (15 - (row * 4 + col));
                }
            }
        }
        out
    }

    /// 在4个旋转方向下查找编码, 返回 (编号, 旋转次数)
    pub fn identify(&self, bits: u16) -> Option<(u32, u32)> {
        let mut b = bits;
        for rotation in 0..4 {
            if let Some(id) = self.codes.iter().position(|&c| c == b) {
                return Some((id as u32, rotation));
            }
            b = Self::rotate(b);
        }
        None
    }

    /// 渲染标记图案 (黑边框 + 编码单元), 每单元 cell_px 像素
    pub fn render(&self, id: u32, cell_px: u32) -> GrayImage {
        let cells = self.grid + 2;
        let code = self.codes[id as usize];
        GrayImage::from_fn(cells * cell_px, cells * cell_px, |x, y| {
            let (row, col) = (y / cell_px, x / cell_px);
            let on_border =
                row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
            if !on_border && Self::bit(code, row - 1, col - 1) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}

/// 标记检测器
pub struct MarkerDetector {
    dict: MarkerDictionary,
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self {
            dict: MarkerDictionary::builtin().clone(),
        }
    }
}

impl MarkerDetector {
    pub fn new(dict: MarkerDictionary) -> Self {
        Self { dict }
    }

    /// 检测帧内所有可解码标记 (姿态字段留空, 由上层按需估计)
    pub fn detect(&self, gray: &GrayImage) -> Vec<MarkerHit> {
        let threshold = otsu_level(gray);
        // 标记为暗色图案: 不亮于阈值的像素视为前景
        // (otsu_level约定前景 > t, 双峰图上t可取到暗峰本身, 必须用<=)
        let binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y).0[0] <= threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let mut hits = Vec::new();
        for contour in find_contours::<i32>(&binary) {
            if contour.points.len() < 20 {
                continue;
            }
            let eps = 0.04 * perimeter(&contour.points);
            let poly = approximate_polygon_dp(&contour.points, eps, true);
            if poly.len() != 4 {
                continue;
            }
            let mut corners = [
                Point2f::new(poly[0].x as f32, poly[0].y as f32),
                Point2f::new(poly[1].x as f32, poly[1].y as f32),
                Point2f::new(poly[2].x as f32, poly[2].y as f32),
                Point2f::new(poly[3].x as f32, poly[3].y as f32),
            ];
            order_corners(&mut corners);
            if polygon_area(&corners) < 64.0 {
                continue;
            }
            if let Some((id, rotation, aligned)) = self.decode_quad(gray, threshold, &corners) {
                let mut corners = aligned;
                // 位阵顺时针转rotation次才对上字典, 即观察图案是规范方向
                // 逆时针转了rotation次: 规范左上角落在下标 (4-rotation)%4
                corners.rotate_left(((4 - rotation) % 4) as usize);
                hits.push(MarkerHit {
                    id,
                    corners,
                    pose: None,
                });
            }
        }
        hits
    }

    /// 按投影采样单元格并查字典
    fn decode_quad(
        &self,
        gray: &GrayImage,
        threshold: u8,
        corners: &[Point2f; 4],
    ) -> Option<(u32, u32, [Point2f; 4])> {
        let cells = self.dict.grid + 2;
        let cell = 16.0f32;
        let size = cells as f32 * cell;
        let projection = Projection::from_control_points(
            [(0.0, 0.0), (size, 0.0), (size, size), (0.0, size)],
            [
                (corners[0].x, corners[0].y),
                (corners[1].x, corners[1].y),
                (corners[2].x, corners[2].y),
                (corners[3].x, corners[3].y),
            ],
        )?;

        let mut bits = 0u16;
        for row in 0..cells {
            for col in 0..cells {
                let bright = self.sample_cell(gray, &projection, cell, row, col) > threshold;
                let on_border =
                    row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
                if on_border {
                    // 边框必须为暗色
                    if bright {
                        return None;
                    }
                } else if bright {
                    bits |= 1 << (15 - ((row - 1) * 4 + (col - 1)));
                }
            }
        }

        let (id, rotation) = self.dict.identify(bits)?;
        Some((id, rotation, *corners))
    }

    /// 单元中心3x3邻域平均灰度
    fn sample_cell(
        &self,
        gray: &GrayImage,
        projection: &Projection,
        cell: f32,
        row: u32,
        col: u32,
    ) -> u8 {
        let mut sum = 0u32;
        let mut n = 0u32;
        for dy in [-0.15f32, 0.0, 0.15] {
            for dx in [-0.15f32, 0.0, 0.15] {
                let u = (col as f32 + 0.5 + dx) * cell;
                let v = (row as f32 + 0.5 + dy) * cell;
                let (x, y) = *projection * (u, v);
                let (xi, yi) = (x.round() as i64, y.round() as i64);
                if xi >= 0 && yi >= 0 && (xi as u32) < gray.width() && (yi as u32) < gray.height()
                {
                    sum += gray.get_pixel(xi as u32, yi as u32).0[0] as u32;
                    n += 1;
                }
            }
        }
        if n == 0 {
            0
        } else {
            (sum / n) as u8
        }
    }
}

fn perimeter(points: &[Point<i32>]) -> f64 {
    let mut total = 0.0;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        let (dx, dy) = ((a.x - b.x) as f64, (a.y - b.y) as f64);
        total += (dx * dx + dy * dy).sqrt();
    }
    total
}

/// 角点排序: 质心角度排序后旋转至左上角优先, 保证顺时针(图像坐标系)
fn order_corners(corners: &mut [Point2f; 4]) {
    let cx = corners.iter().map(|p| p.x).sum::<f32>() / 4.0;
    let cy = corners.iter().map(|p| p.y).sum::<f32>() / 4.0;
    corners.sort_by(|a, b| {
        let aa = (a.y - cy).atan2(a.x - cx);
        let ab = (b.y - cy).atan2(b.x - cx);
        aa.partial_cmp(&ab).unwrap()
    });
    // 顺时针校验: (c1-c0)×(c2-c0) 在y向下坐标系中应为正
    let z = (corners[1].x - corners[0].x) * (corners[2].y - corners[0].y)
        - (corners[1].y - corners[0].y) * (corners[2].x - corners[0].x);
    if z < 0.0 {
        corners.swap(1, 3);
    }
    // 左上角(x+y最小)作为起点
    let start = (0..4)
        .min_by(|&a, &b| {
            let sa = corners[a].x + corners[a].y;
            let sb = corners[b].x + corners[b].y;
            sa.partial_cmp(&sb).unwrap()
        })
        .unwrap_or(0);
    corners.rotate_left(start);
}

fn polygon_area(corners: &[Point2f; 4]) -> f32 {
    let mut area = 0.0;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        area += a.x * b.y - b.x * a.y;
    }
    area.abs() / 2.0
}
