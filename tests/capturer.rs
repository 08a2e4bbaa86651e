//! Capturer read paths against the loopback service
#![cfg(feature = "loopback")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use audio_stream_client::config::{ClientConfig, StreamConfig};
use audio_stream_client::error::StreamError;
use audio_stream_client::format::SampleFormat;
use audio_stream_client::ipc::loopback::{LoopbackOptions, LoopbackService, LoopbackStream};
use audio_stream_client::stream::{CaptureMode, CapturerInClient, StreamState};

const SPAN_BYTES: usize = 240 * 4;

fn capturer(config: ClientConfig) -> (Arc<LoopbackStream>, CapturerInClient) {
    let service = LoopbackService::new(LoopbackOptions {
        span_frames: Some(240),
        ..LoopbackOptions::default()
    });
    let capturer = CapturerInClient::new(service.clone(), config).unwrap();
    capturer
        .set_stream_info(&StreamConfig::capture(48000, 2, SampleFormat::S16Le))
        .unwrap();
    (service.last_stream().unwrap(), capturer)
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        operation_timeout_ms: 200,
        read_timeout_ms: 200,
        ..ClientConfig::default()
    }
}

fn span(seed: u8) -> Vec<u8> {
    (0..SPAN_BYTES).map(|i| (i as u8) ^ seed).collect()
}

#[test]
fn test_capture_channel_limit() {
    let service = LoopbackService::new(LoopbackOptions::default());
    let capturer = CapturerInClient::new(service, fast_config()).unwrap();
    let config = StreamConfig::capture(48000, 8, SampleFormat::S16Le);
    assert!(matches!(
        capturer.set_stream_info(&config),
        Err(StreamError::InvalidParameter(_))
    ));
    assert_eq!(capturer.get_state(), StreamState::New);
}

#[test]
fn test_read_returns_captured_bytes_in_order() {
    let (stream, capturer) = capturer(fast_config());
    capturer.start().unwrap();

    let mut produced = span(1);
    produced.extend(span(2));
    assert_eq!(stream.push_capture(&produced).unwrap(), produced.len());

    let mut out = vec![0u8; 600];
    assert_eq!(capturer.read(&mut out, true).unwrap(), 600);
    assert_eq!(out, produced[..600]);

    let mut rest = vec![0u8; produced.len() - 600];
    assert_eq!(capturer.read(&mut rest, true).unwrap(), rest.len());
    assert_eq!(rest, produced[600..]);

    assert_eq!(capturer.get_bytes_read(), produced.len() as u64);
    assert_eq!(capturer.get_frames_read(), (produced.len() / 4) as u64);
    assert_eq!(stream.update_position_calls(), 2);
}

#[test]
fn test_non_blocking_read_returns_what_is_there() {
    let (stream, capturer) = capturer(fast_config());
    capturer.start().unwrap();

    let mut out = vec![0u8; SPAN_BYTES * 2];
    assert_eq!(capturer.read(&mut out, false).unwrap(), 0);

    stream.push_capture(&span(5)).unwrap();
    assert_eq!(capturer.read(&mut out, false).unwrap(), SPAN_BYTES);
    assert_eq!(out[..SPAN_BYTES], span(5)[..]);
}

#[test]
fn test_blocking_read_times_out_without_data() {
    let (_stream, capturer) = capturer(fast_config());
    capturer.start().unwrap();

    let mut out = vec![0u8; 64];
    let started = Instant::now();
    assert!(matches!(
        capturer.read(&mut out, true),
        Err(StreamError::RemoteTimeout {
            operation: "read",
            ..
        })
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[test]
fn test_blocking_read_wakes_when_data_arrives() {
    let (stream, capturer) = capturer(ClientConfig {
        read_timeout_ms: 5000,
        ..fast_config()
    });
    capturer.start().unwrap();

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stream.push_capture(&span(9)).unwrap();
    });
    let mut out = vec![0u8; SPAN_BYTES];
    assert_eq!(capturer.read(&mut out, true).unwrap(), SPAN_BYTES);
    assert_eq!(out, span(9));
    producer.join().unwrap();
}

#[test]
fn test_read_outside_running_is_illegal() {
    let (stream, capturer) = capturer(fast_config());
    stream.push_capture(&span(0)).unwrap();
    let mut out = vec![0u8; 16];
    assert!(matches!(
        capturer.read(&mut out, false),
        Err(StreamError::IllegalState { .. })
    ));

    capturer.start().unwrap();
    capturer.pause().unwrap();
    assert!(matches!(
        capturer.read(&mut out, true),
        Err(StreamError::IllegalState { .. })
    ));
}

#[test]
fn test_full_ring_counts_overflow() {
    let (stream, capturer) = capturer(fast_config());
    capturer.start().unwrap();
    let produced: Vec<u8> = (0..5).flat_map(span).collect();
    // four spans fit, the fifth overflows
    assert_eq!(stream.push_capture(&produced).unwrap(), SPAN_BYTES * 4);
    assert_eq!(capturer.get_overflow_count(), 1);
}

#[test]
fn test_callback_mode_hands_out_filled_buffers() {
    let (stream, capturer) = capturer(ClientConfig {
        read_timeout_ms: 5000,
        ..fast_config()
    });
    capturer.set_capture_mode(CaptureMode::Callback).unwrap();
    assert_eq!(capturer.get_capture_mode(), CaptureMode::Callback);

    let (tx, rx) = unbounded();
    capturer
        .set_capturer_read_callback(Arc::new(move |length: usize| {
            let _ = tx.send(length);
        }))
        .unwrap();
    capturer.start().unwrap();

    stream.push_capture(&span(3)).unwrap();
    stream.push_capture(&span(4)).unwrap();

    for seed in [3u8, 4] {
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(SPAN_BYTES));
        let desc = capturer.get_buffer_desc().unwrap();
        assert_eq!(desc.data_length, SPAN_BYTES);
        assert_eq!(desc.buffer[..desc.data_length], span(seed)[..]);
        capturer.enqueue(desc).unwrap();
    }
    assert_eq!(capturer.get_buf_queue_state().unwrap().num_buffers, 0);

    let started = Instant::now();
    capturer.release().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_flush_discards_cached_capture() {
    let (stream, capturer) = capturer(fast_config());
    capturer.start().unwrap();
    stream.push_capture(&span(1)).unwrap();

    // pulls the whole span into the cache, hands out half
    let mut half = vec![0u8; SPAN_BYTES / 2];
    assert_eq!(capturer.read(&mut half, false).unwrap(), half.len());

    capturer.flush().unwrap();
    let mut out = vec![0u8; SPAN_BYTES];
    assert_eq!(capturer.read(&mut out, false).unwrap(), 0);
}
