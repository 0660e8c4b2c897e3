//! 级联分类器 (Cascade classifier)
//! JSON模型 + 积分图 + 多尺度滑窗扫描 + 邻域合并

use anyhow::{Context, Result};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::Rect;

/// 矩形特征: 检测窗口坐标系内的加权矩形
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FeatureRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub weight: f64,
}

/// 桩分类器: 加权矩形均值之和与阈值比较, 输出pass/fail票值
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stump {
    pub rects: Vec<FeatureRect>,
    pub threshold: f64,
    pub fail: f64,
    pub pass: f64,
}

/// 级联阶段: 桩票值之和达到阶段阈值才进入下一阶段
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub stumps: Vec<Stump>,
}

/// 级联模型 (训练产物, JSON格式)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

impl CascadeModel {
    pub fn load(path: &str) -> Result<Self> {
        let json = fs::read_to_string(path).with_context(|| format!("读取模型文件 {}", path))?;
        let model: CascadeModel =
            serde_json::from_str(&json).with_context(|| format!("解析模型文件 {}", path))?;
        Ok(model)
    }
}

/// 扫描参数
#[derive(Clone, Copy, Debug)]
pub struct DetectParams {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    pub min_size: (u32, u32),
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 2,
            min_size: (24, 24),
        }
    }
}

/// 级联检测器
///
/// 构造时从模型文件加载; 加载失败只记录一次错误, 此后处于降级模式:
/// `detect` 返回空结果而不是错误, 帧输出不受影响。
pub struct CascadeDetector {
    name: String,
    model: Option<CascadeModel>,
}

impl CascadeDetector {
    /// 从文件加载; 失败进入降级模式
    pub fn from_file(name: &str, path: &str) -> Self {
        let model = match CascadeModel::load(path) {
            Ok(m) => {
                println!("✅ 级联模型加载成功: {} ({})", name, path);
                Some(m)
            }
            Err(e) => {
                eprintln!("❌ 级联模型加载失败: {} ({}): {:#}", name, path, e);
                None
            }
        };
        Self {
            name: name.to_string(),
            model,
        }
    }

    /// 直接注入模型 (测试用合成模型)
    pub fn with_model(name: &str, model: CascadeModel) -> Self {
        Self {
            name: name.to_string(),
            model: Some(model),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// 多尺度滑窗检测; 降级模式下恒返回空
    pub fn detect(&self, gray: &GrayImage, params: &DetectParams) -> Vec<Rect> {
        let model = match &self.model {
            Some(m) => m,
            None => return Vec::new(),
        };
        let integral = IntegralImage::new(gray);
        let (img_w, img_h) = (gray.width(), gray.height());

        let mut hits = Vec::new();
        // 起始尺度由最小窗口尺寸决定
        let mut scale = f64::max(
            1.0,
            f64::max(
                params.min_size.0 as f64 / model.window_width as f64,
                params.min_size.1 as f64 / model.window_height as f64,
            ),
        );
        loop {
            let win_w = (model.window_width as f64 * scale).round() as u32;
            let win_h = (model.window_height as f64 * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            let step = scale.round().max(1.0) as u32;
            let mut y = 0;
            while y + win_h <= img_h {
                let mut x = 0;
                while x + win_w <= img_w {
                    if self.evaluate_window(model, &integral, x, y, scale) {
                        hits.push(Rect::new(x as i32, y as i32, win_w as i32, win_h as i32));
                    }
                    x += step;
                }
                y += step;
            }
            scale *= params.scale_factor;
        }

        group_rects(&hits, params.min_neighbors)
    }

    fn evaluate_window(
        &self,
        model: &CascadeModel,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        scale: f64,
    ) -> bool {
        for stage in &model.stages {
            let mut votes = 0.0;
            for stump in &stage.stumps {
                let mut value = 0.0;
                for feat in &stump.rects {
                    let fx = x as i64 + (feat.x as f64 * scale).round() as i64;
                    let fy = y as i64 + (feat.y as f64 * scale).round() as i64;
                    let fw = ((feat.width as f64 * scale).round() as i64).max(1);
                    let fh = ((feat.height as f64 * scale).round() as i64).max(1);
                    let area = (fw * fh) as f64;
                    let mean = integral.sum(fx, fy, fw, fh) as f64 / area / 255.0;
                    value += feat.weight * mean;
                }
                votes += if value >= stump.threshold {
                    stump.pass
                } else {
                    stump.fail
                };
            }
            if votes < stage.threshold {
                return false;
            }
        }
        true
    }
}

/// 积分图: data[(y,x)] = 原图 [0,x) x [0,y) 区域像素和
struct IntegralImage {
    width: usize,
    data: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let width = w + 1;
        let mut data = vec![0u64; width * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0u64;
            for x in 0..w {
                row_sum += gray.get_pixel(x as u32, y as u32).0[0] as u64;
                data[(y + 1) * width + x + 1] = data[y * width + x + 1] + row_sum;
            }
        }
        Self { width, data }
    }

    /// (x,y)起始 w x h 矩形的像素和; 越界部分按0计
    fn sum(&self, x: i64, y: i64, w: i64, h: i64) -> u64 {
        let height = self.data.len() as i64 / self.width as i64 - 1;
        let clamp = |v: i64, hi: i64| v.clamp(0, hi) as usize;
        let x0 = clamp(x, self.width as i64 - 1);
        let y0 = clamp(y, height);
        let x1 = clamp(x + w, self.width as i64 - 1);
        let y1 = clamp(y + h, height);
        self.data[y1 * self.width + x1] + self.data[y0 * self.width + x0]
            - self.data[y0 * self.width + x1]
            - self.data[y1 * self.width + x0]
    }
}

/// 按邻域数合并重叠命中 (OpenCV groupRectangles 的简化版)
///
/// 位置与尺寸相近的命中归为一簇; 簇内命中数需超过 min_neighbors,
/// 输出簇内平均矩形。
fn group_rects(hits: &[Rect], min_neighbors: usize) -> Vec<Rect> {
    let mut labels = vec![usize::MAX; hits.len()];
    let mut n_clusters = 0;
    for i in 0..hits.len() {
        if labels[i] != usize::MAX {
            continue;
        }
        labels[i] = n_clusters;
        // 传播标签: 与簇内任一成员相似即归入
        let mut changed = true;
        while changed {
            changed = false;
            for j in 0..hits.len() {
                if labels[j] != usize::MAX {
                    continue;
                }
                let joins = (0..hits.len())
                    .any(|k| labels[k] == n_clusters && similar(&hits[k], &hits[j]));
                if joins {
                    labels[j] = n_clusters;
                    changed = true;
                }
            }
        }
        n_clusters += 1;
    }

    let mut grouped = Vec::new();
    for cluster in 0..n_clusters {
        let members: Vec<&Rect> = hits
            .iter()
            .zip(&labels)
            .filter(|(_, l)| **l == cluster)
            .map(|(r, _)| r)
            .collect();
        if members.len() <= min_neighbors {
            continue;
        }
        let n = members.len() as i64;
        grouped.push(Rect::new(
            (members.iter().map(|r| r.x as i64).sum::<i64>() / n) as i32,
            (members.iter().map(|r| r.y as i64).sum::<i64>() / n) as i32,
            (members.iter().map(|r| r.width as i64).sum::<i64>() / n) as i32,
            (members.iter().map(|r| r.height as i64).sum::<i64>() / n) as i32,
        ));
    }
    grouped
}

fn similar(a: &Rect, b: &Rect) -> bool {
    let delta = 0.2 * 0.5 * (a.width.min(b.width) + a.height.min(b.height)) as f64;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.xmax() - b.xmax()).abs() as f64 <= delta
        && (a.ymax() - b.ymax()).abs() as f64 <= delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// 上亮下暗模式的单阶段合成模型 (窗口8x8)
    fn synthetic_model() -> CascadeModel {
        CascadeModel {
            window_width: 8,
            window_height: 8,
            stages: vec![Stage {
                threshold: 0.5,
                stumps: vec![Stump {
                    rects: vec![
                        FeatureRect {
                            x: 0,
                            y: 0,
                            width: 8,
                            height: 4,
                            weight: 1.0,
                        },
                        FeatureRect {
                            x: 0,
                            y: 4,
                            width: 8,
                            height: 4,
                            weight: -1.0,
                        },
                    ],
                    threshold: 0.3,
                    fail: -1.0,
                    pass: 1.0,
                }],
            }],
        }
    }

    fn pattern_image() -> GrayImage {
        // 均匀暗背景, (8,8)处放8x8模式: 上半亮
        GrayImage::from_fn(32, 32, |x, y| {
            if (8..16).contains(&x) && (8..12).contains(&y) {
                Luma([220])
            } else {
                Luma([20])
            }
        })
    }

    #[test]
    fn test_integral_sum() {
        let img = GrayImage::from_pixel(4, 4, Luma([10]));
        let ii = IntegralImage::new(&img);
        assert_eq!(ii.sum(0, 0, 4, 4), 160);
        assert_eq!(ii.sum(1, 1, 2, 2), 40);
        // 越界部分按0计
        assert_eq!(ii.sum(-2, -2, 4, 4), 40);
        assert_eq!(ii.sum(2, 2, 10, 10), 40);
    }

    #[test]
    fn test_degraded_mode_returns_empty() {
        let detector = CascadeDetector::from_file("object", "/nonexistent/model.json");
        assert!(!detector.is_loaded());
        let gray = pattern_image();
        assert!(detector.detect(&gray, &DetectParams::default()).is_empty());
    }

    #[test]
    fn test_synthetic_detection() {
        let detector = CascadeDetector::with_model("object", synthetic_model());
        let gray = pattern_image();
        let params = DetectParams {
            scale_factor: 1.2,
            min_neighbors: 0,
            min_size: (8, 8),
        };
        let hits = detector.detect(&gray, &params);
        assert!(!hits.is_empty());
        // 命中中心应落在模式附近
        let best = hits
            .iter()
            .find(|r| {
                let (cx, cy) = r.center();
                (cx - 12).abs() <= 4 && (cy - 12).abs() <= 4
            })
            .cloned();
        assert!(best.is_some(), "未命中合成模式: {:?}", hits);
    }

    #[test]
    fn test_uniform_image_no_hits() {
        let detector = CascadeDetector::with_model("object", synthetic_model());
        let gray = GrayImage::from_pixel(32, 32, Luma([128]));
        let hits = detector.detect(
            &gray,
            &DetectParams {
                scale_factor: 1.2,
                min_neighbors: 0,
                min_size: (8, 8),
            },
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn test_group_rects_min_neighbors() {
        let hits = vec![
            Rect::new(10, 10, 20, 20),
            Rect::new(11, 11, 20, 20),
            Rect::new(12, 10, 20, 20),
            Rect::new(100, 100, 20, 20), // 孤立命中
        ];
        let grouped = group_rects(&hits, 2);
        assert_eq!(grouped.len(), 1);
        assert!((grouped[0].x - 11).abs() <= 1);
        // min_neighbors=0 时孤立命中也保留
        assert_eq!(group_rects(&hits, 0).len(), 2);
    }

    #[test]
    fn test_model_json_round_trip() {
        let model = synthetic_model();
        let json = serde_json::to_string(&model).unwrap();
        let back: CascadeModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.window_width, 8);
        assert_eq!(back.stages.len(), 1);
        assert_eq!(back.stages[0].stumps[0].rects.len(), 2);
    }
}
