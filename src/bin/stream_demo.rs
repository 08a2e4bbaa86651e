//! Stream Client Demo
//!
//! Plays a generated tone through the in-process loopback service, first
//! with blocking writes and then in callback mode, and prints the stream
//! counters as JSON.

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_stream_client::{
    config::{ClientConfig, StreamConfig},
    constants::*,
    format::SampleFormat,
    ipc::loopback::{LoopbackOptions, LoopbackService},
    stream::{RenderMode, RendererInClient, StateChangeReason, StreamState},
};

const TONE_HZ: f32 = 440.0;
const PUSH_SECONDS: u32 = 1;
const PULL_BUFFERS: u32 = 50;

/// Interleaved S16 sine, continuing from `phase`
fn tone(frames: usize, channels: usize, phase: &mut f32) -> Vec<u8> {
    let step = TONE_HZ * std::f32::consts::TAU / DEFAULT_SAMPLE_RATE as f32;
    let mut out = Vec::with_capacity(frames * channels * 2);
    for _ in 0..frames {
        let sample = (phase.sin() * 0.25 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        *phase = (*phase + step) % std::f32::consts::TAU;
    }
    out
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting stream client demo");

    let config = ClientConfig::load_or_default().context("loading client config")?;
    let service = LoopbackService::new(LoopbackOptions::default());
    let renderer = RendererInClient::new(service.clone(), config)?;

    renderer.set_stream_callback(Arc::new(|state: StreamState, reason: StateChangeReason| {
        tracing::info!(%state, ?reason, "State changed");
    }));

    let stream_config = StreamConfig::playback(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, SampleFormat::S16Le);
    renderer.set_stream_info(&stream_config)?;
    let span_bytes = renderer.get_buffer_size()?;
    let channels = DEFAULT_CHANNELS as usize;
    let frame_bytes = stream_config.bytes_per_frame();

    let periods = Arc::new(AtomicU64::new(0));
    let period_counter = Arc::clone(&periods);
    renderer.set_renderer_period_position_callback(
        u64::from(DEFAULT_SAMPLE_RATE / 10),
        Arc::new(move |_frames: u64| {
            period_counter.fetch_add(1, Ordering::Relaxed);
        }),
    )?;
    renderer.set_renderer_position_callback(
        u64::from(DEFAULT_SAMPLE_RATE / 2),
        Arc::new(|position: u64| tracing::info!(position, "Half a second played")),
    )?;

    // Push mode
    let mut phase = 0.0f32;
    renderer.set_volume_with_ramp(1.0, 200)?;
    renderer.start()?;
    let spans = (DEFAULT_SAMPLE_RATE * PUSH_SECONDS) as usize * frame_bytes / span_bytes;
    for _ in 0..spans {
        let data = tone(span_bytes / frame_bytes, channels, &mut phase);
        let written = renderer.write(&data)?;
        if written < data.len() {
            tracing::warn!(written, requested = data.len(), "Short write");
        }
    }
    renderer.drain()?;
    renderer.stop()?;

    // Callback mode: the worker asks for buffers, this thread fills them
    renderer.set_render_mode(RenderMode::Callback)?;
    let (wanted_tx, wanted_rx) = unbounded();
    renderer.set_renderer_write_callback(Arc::new(move |length: usize| {
        let _ = wanted_tx.send(length);
    }))?;
    renderer.start()?;
    let mut queued = 0;
    while queued < PULL_BUFFERS {
        let length = wanted_rx
            .recv_timeout(Duration::from_secs(2))
            .context("worker stopped asking for data")?;
        let mut desc = renderer.get_buffer_desc()?;
        let data = tone(length / frame_bytes, channels, &mut phase);
        desc.buffer[..data.len()].copy_from_slice(&data);
        desc.data_length = data.len();
        renderer.enqueue(desc)?;
        queued += 1;
    }
    while renderer.get_buf_queue_state()?.num_buffers > 0 {
        std::thread::sleep(Duration::from_millis(10));
    }
    renderer.stop()?;

    let summary = serde_json::json!({
        "session_id": renderer.get_audio_session_id()?,
        "state": renderer.get_state(),
        "frames_written": renderer.get_frames_written(),
        "bytes_written": renderer.get_bytes_written(),
        "underflows": renderer.get_underflow_count(),
        "periods": periods.load(Ordering::Relaxed),
        "latency_us": renderer.get_latency()?,
        "audio_time": renderer.get_audio_time()?,
        "consumed_bytes": service.last_stream().map_or(0, |s| s.take_consumed().len()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    renderer.release()?;
    tracing::info!("Demo finished");
    Ok(())
}
