//! 帧类型 (Frame)
//! 1/3/4通道图像的统一包装, 支持ROI裁剪与通道面拆分

use anyhow::{bail, Result};
use image::{imageops, GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

use crate::Rect;

/// 处理流水线操作的帧: 灰度(1通道) / RGB(3通道) / RGBA(4通道)
///
/// 每次循环迭代从帧源克隆一份, 工作线程在本次迭代内独占所有权,
/// 各阶段原地变换 (替换内部缓冲区)。
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Gray(GrayImage),
    Rgb(RgbImage),
    Rgba(RgbaImage),
}

impl Frame {
    pub fn width(&self) -> u32 {
        match self {
            Frame::Gray(img) => img.width(),
            Frame::Rgb(img) => img.width(),
            Frame::Rgba(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Frame::Gray(img) => img.height(),
            Frame::Rgb(img) => img.height(),
            Frame::Rgba(img) => img.height(),
        }
    }

    /// 通道数: 1 / 3 / 4
    pub fn channels(&self) -> u8 {
        match self {
            Frame::Gray(_) => 1,
            Frame::Rgb(_) => 3,
            Frame::Rgba(_) => 4,
        }
    }

    /// 按ROI裁剪出子帧
    ///
    /// 矩形必须完全落在帧边界内, 越界视为调用方错误, 返回Err由
    /// 工作循环按"跳过本帧"策略处理。
    pub fn clip(&self, roi: &Rect) -> Result<Frame> {
        if !roi.inside(self.width(), self.height()) {
            bail!(
                "ROI越界: roi=({},{},{}x{}) 帧={}x{}",
                roi.x,
                roi.y,
                roi.width,
                roi.height,
                self.width(),
                self.height()
            );
        }
        let (x, y) = (roi.x as u32, roi.y as u32);
        let (w, h) = (roi.width as u32, roi.height as u32);
        Ok(match self {
            Frame::Gray(img) => Frame::Gray(imageops::crop_imm(img, x, y, w, h).to_image()),
            Frame::Rgb(img) => Frame::Rgb(imageops::crop_imm(img, x, y, w, h).to_image()),
            Frame::Rgba(img) => Frame::Rgba(imageops::crop_imm(img, x, y, w, h).to_image()),
        })
    }

    /// 转换为灰度图副本 (帧本身不变)
    pub fn to_gray(&self) -> GrayImage {
        match self {
            Frame::Gray(img) => img.clone(),
            Frame::Rgb(img) => imageops::grayscale(img),
            Frame::Rgba(img) => imageops::grayscale(img),
        }
    }

    /// 原地灰度转换; 已是1通道时为无操作
    pub fn make_gray(&mut self) {
        if self.channels() != 1 {
            *self = Frame::Gray(self.to_gray());
        }
    }

    /// 翻转: code=0 垂直, code>0 水平, code<0 双向 (OpenCV约定)
    pub fn flip(&mut self, code: i32) {
        match self {
            Frame::Gray(img) => *img = flip_buf(img, code),
            Frame::Rgb(img) => *img = flip_buf(img, code),
            Frame::Rgba(img) => *img = flip_buf(img, code),
        }
    }

    /// 拆分为单通道面 (灰度滤波在各通道面上独立执行)
    pub fn planes(&self) -> Vec<GrayImage> {
        match self {
            Frame::Gray(img) => vec![img.clone()],
            Frame::Rgb(img) => (0..3)
                .map(|c| GrayImage::from_fn(img.width(), img.height(), |x, y| Luma([img.get_pixel(x, y).0[c]])))
                .collect(),
            Frame::Rgba(img) => (0..4)
                .map(|c| GrayImage::from_fn(img.width(), img.height(), |x, y| Luma([img.get_pixel(x, y).0[c]])))
                .collect(),
        }
    }

    /// 由通道面重组帧 (面数必须与当前通道数一致)
    pub fn merge_planes(&mut self, planes: &[GrayImage]) {
        match self {
            Frame::Gray(img) => {
                *img = planes[0].clone();
            }
            Frame::Rgb(img) => {
                *img = RgbImage::from_fn(planes[0].width(), planes[0].height(), |x, y| {
                    Rgb([
                        planes[0].get_pixel(x, y).0[0],
                        planes[1].get_pixel(x, y).0[0],
                        planes[2].get_pixel(x, y).0[0],
                    ])
                });
            }
            Frame::Rgba(img) => {
                *img = RgbaImage::from_fn(planes[0].width(), planes[0].height(), |x, y| {
                    Rgba([
                        planes[0].get_pixel(x, y).0[0],
                        planes[1].get_pixel(x, y).0[0],
                        planes[2].get_pixel(x, y).0[0],
                        planes[3].get_pixel(x, y).0[0],
                    ])
                });
            }
        }
    }

    /// 生成纯色测试帧
    pub fn solid_rgb(width: u32, height: u32, color: [u8; 3]) -> Frame {
        Frame::Rgb(RgbImage::from_pixel(width, height, Rgb(color)))
    }
}

fn flip_buf<P>(img: &image::ImageBuffer<P, Vec<P::Subpixel>>, code: i32) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel + 'static,
    P::Subpixel: 'static,
{
    match code {
        0 => imageops::flip_vertical(img),
        c if c > 0 => imageops::flip_horizontal(img),
        _ => imageops::rotate180(img),
    }
}
