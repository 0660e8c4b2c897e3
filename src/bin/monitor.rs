//! 流处理监视器 (Stream processing monitor)
//!
//! 演示用入口: 合成相机生产帧 → 处理线程跑流水线 → 本线程消费
//! 结果, 周期性打印统计并按需落盘快照。
//!
//! 运行示例:
//! cargo run --release --bin monitor -- --device 0 --flags grayscale,smooth
use clap::Parser;
use image::RgbImage;
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};

use cvstream_rs::{
    ChannelSink, Frame, FrameSlot, ProcessFlags, ProcessingWorker, StreamSetup, WorkerEvent,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(author, version, about = "视频流处理监视器")]
struct Args {
    /// 设备编号 (纯标识, 用于日志)
    #[arg(long, default_value_t = 0)]
    device: i32,

    /// 流配置JSON路径 (缺失时使用内置默认值)
    #[arg(long, default_value = "stream_setup.json")]
    config: String,

    /// 启用的阶段, 逗号分隔:
    /// grayscale,smooth,sharpen,dilate,erode,flip,canny,markers,objects,parts
    #[arg(long, default_value = "")]
    flags: String,

    /// 合成帧尺寸 (宽x高)
    #[arg(long, default_value = "640x480")]
    size: String,

    /// 运行秒数, 0表示直到Ctrl+C... 简化起见这里固定时长
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// 每N帧保存一张PNG快照, 0关闭
    #[arg(long, default_value_t = 0)]
    snapshot_every: u64,
}

fn parse_flags(list: &str) -> ProcessFlags {
    let mut flags = ProcessFlags::default();
    for name in list.split(',').filter(|s| !s.is_empty()) {
        match name.trim() {
            "grayscale" => flags.grayscale = true,
            "smooth" => flags.smooth = true,
            "sharpen" => flags.sharpen = true,
            "dilate" => flags.dilate = true,
            "erode" => flags.erode = true,
            "flip" => flags.flip = true,
            "canny" => flags.canny = true,
            "markers" => flags.markers = true,
            "objects" => flags.objects = true,
            "parts" => flags.parts = true,
            other => eprintln!("⚠️  未知阶段名: {}", other),
        }
    }
    flags
}

fn parse_size(value: &str) -> (u32, u32) {
    let mut parts = value.splitn(2, 'x');
    let w = parts.next().and_then(|s| s.parse().ok()).unwrap_or(640);
    let h = parts.next().and_then(|s| s.parse().ok()).unwrap_or(480);
    (w, h)
}

/// 合成噪声帧 (模拟相机输出)
fn noise_frame(width: u32, height: u32) -> Frame {
    let mut rng = rand::thread_rng();
    let mut img = RgbImage::new(width, height);
    for pixel in img.pixels_mut() {
        pixel.0 = [rng.gen(), rng.gen(), rng.gen()];
    }
    Frame::Rgb(img)
}

fn save_snapshot(frame: &Frame, index: u64) {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("snapshot_{}_{:06}.png", stamp, index);
    let result = match frame {
        Frame::Gray(img) => img.save(&path),
        Frame::Rgb(img) => img.save(&path),
        Frame::Rgba(img) => img.save(&path),
    };
    match result {
        Ok(_) => println!("📊 快照已保存: {}", path),
        Err(e) => eprintln!("❌ 快照保存失败: {}", e),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (width, height) = parse_size(&args.size);

    println!("🎯 流处理监视器启动");
    println!("   设备编号: {}", args.device);
    println!("   帧尺寸: {}x{}", width, height);

    let mut setup = StreamSetup::load(&args.config);
    setup.roi = cvstream_rs::Rect::new(0, 0, width as i32, height as i32);

    // 采集线程: 模拟相机不断覆写共享帧槽
    let slot = FrameSlot::new(noise_frame(width, height));
    let producer_slot = slot.clone();
    let producer = thread::spawn(move || {
        // 约30fps的生产节奏
        for _ in 0..u64::MAX {
            producer_slot.store(noise_frame(width, height));
            thread::sleep(Duration::from_millis(33));
        }
    });

    let worker = ProcessingWorker::new(args.device, setup);
    let (sink, events) = ChannelSink::new();
    let (join, handle) = worker.start(slot, sink)?;
    handle.set_flags(parse_flags(&args.flags));

    // 消费循环: 打印统计, 按需落盘
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut frame_index: u64 = 0;
    let mut last_report = Instant::now();
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(WorkerEvent::Frame(frame)) => {
                frame_index += 1;
                if args.snapshot_every > 0 && frame_index % args.snapshot_every == 0 {
                    save_snapshot(&frame, frame_index);
                }
            }
            Ok(WorkerEvent::Statistics(stats)) => {
                if last_report.elapsed() >= Duration::from_secs(1) {
                    println!(
                        "📊 已处理 {} 帧, 平均FPS {:.1}",
                        stats.frames_processed, stats.average_fps
                    );
                    last_report = Instant::now();
                }
            }
            Ok(WorkerEvent::DetectionCount(n)) => {
                if n > 0 {
                    println!("🔍 检测到 {} 个主目标", n);
                }
            }
            Err(_) => {}
        }
    }

    handle.stop();
    join.join().ok();
    drop(producer); // 生产线程随进程退出

    println!("✅ 监视器结束, 共消费 {} 帧", frame_index);
    Ok(())
}
