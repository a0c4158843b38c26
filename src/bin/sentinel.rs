// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 数字卫兵 (Digital Sentinel)
///
/// 多路摄像头智能监控
///
/// 系统架构:
/// 1. 采集线程: 每路摄像头一个读帧线程 (合成帧源)
/// 2. 流水线线程: 检测 → 跟踪 → 身份 → 行为分析 → 告警去重
/// 3. 推理线程: 共享模型串行推理 (回放检测脚本)
/// 4. 投递线程: 告警通知与事件落盘
/// 5. 主线程:   配置热加载、事件汇总与状态报告
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing_subscriber::EnvFilter;

use sentinel_rs::alert::{EventStore, JsonlEventStore, LogNotifier, NullEventStore};
use sentinel_rs::config::{ConfigStore, JsonConfigStore};
use sentinel_rs::input::{Step, SyntheticSource};
use sentinel_rs::models::{ReplayModel, ReplayScript};
use sentinel_rs::pipeline::{CameraState, PipelineEvent, SurveillanceManager};

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 多路摄像头智能监控", long_about = None)]
struct Args {
    /// 配置文件 (JSON)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// 回放检测脚本 (JSON Lines), 缺省时模型不输出任何目标
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// 事件/告警审计文件 (JSON Lines)
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// 每路摄像头帧数, 0 表示不停止
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// 合成帧率
    #[arg(long, default_value_t = 10.0)]
    fps: f64,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// 按帧率实时出帧 (否则尽快回放)
    #[arg(long, default_value_t = false)]
    realtime: bool,

    /// 运行时长上限 (秒)
    #[arg(long)]
    duration: Option<u64>,

    /// 配置文件重新加载间隔 (秒), 0 关闭
    #[arg(long, default_value_t = 5)]
    reload: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sentinel_rs=info".parse()?))
        .init();

    let args = Args::parse();
    tracing::info!("🚀 数字卫兵系统启动");

    let store = Arc::new(JsonConfigStore::new(&args.config));
    let config = store
        .load()
        .with_context(|| format!("load config {}", args.config.display()))?;

    let mut source = SyntheticSource::new(args.width, args.height, args.fps)
        .realtime(args.realtime)
        .endless(args.frames == 0);
    if args.frames > 0 {
        for camera in &config.cameras {
            source = source.script(camera.id.clone(), vec![Step::Frames(args.frames)]);
        }
    }

    let script = match &args.script {
        Some(path) => ReplayScript::load(path)?,
        None => {
            tracing::warn!("⚠️ no replay script, detector will see empty frames");
            ReplayScript::default()
        }
    };

    let event_store: Arc<dyn EventStore> = match &args.events {
        Some(path) => Arc::new(
            JsonlEventStore::open(path)
                .with_context(|| format!("open event log {}", path.display()))?,
        ),
        None => Arc::new(NullEventStore),
    };

    let mut manager = SurveillanceManager::builder(store.clone())
        .source(Arc::new(source))
        .object_model(Box::new(ReplayModel::new(script)))
        .notifier(Arc::new(LogNotifier))
        .event_store(event_store)
        .build()?;
    tracing::info!(capabilities = ?manager.capabilities(), "📦 capabilities");

    manager.start()?;
    tracing::info!("✅ 系统就绪,开始监控...");

    let feed = manager.feed();
    let started = Instant::now();
    let mut last_reload = Instant::now();
    let (mut events, mut alerts) = (0u64, 0u64);

    loop {
        match feed.recv_timeout(Duration::from_millis(200)) {
            Ok(PipelineEvent::Event(_)) => events += 1,
            Ok(PipelineEvent::Alert(_)) => alerts += 1,
            Ok(PipelineEvent::StateChanged { .. }) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if args.reload > 0 && last_reload.elapsed() >= Duration::from_secs(args.reload) {
            last_reload = Instant::now();
            if let Err(e) = store.reload() {
                tracing::warn!(error = %e, "⚠️ config reload rejected, keeping current config");
            }
        }

        if args.duration.is_some_and(|d| started.elapsed() >= Duration::from_secs(d)) {
            tracing::info!("⏱️ duration reached");
            break;
        }
        if manager
            .statuses()
            .iter()
            .all(|s| s.state == CameraState::Stopped)
            && feed.is_empty()
        {
            break;
        }
    }

    manager.stop();
    for status in manager.statuses() {
        tracing::info!(
            camera = %status.camera_id,
            state = %status.state,
            online = status.online,
            processed = status.stats.frames_processed,
            dropped = status.stats.frames_dropped,
            reconnects = status.stats.reconnects,
            alerts = status.alerts.emitted,
            suppressed = status.alerts.suppressed,
            "📊 camera summary"
        );
    }
    tracing::info!(events, alerts, "🏁 数字卫兵退出");
    Ok(())
}
