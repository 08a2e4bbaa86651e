//! Renderer driven over the framed control channel
#![cfg(all(unix, feature = "loopback"))]

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use audio_stream_client::config::{ClientConfig, StreamConfig};
use audio_stream_client::format::SampleFormat;
use audio_stream_client::ipc::loopback::{LoopbackOptions, LoopbackService};
use audio_stream_client::ipc::wire::{serve, BoxedReader, BoxedWriter, WireService};
use audio_stream_client::ipc::{AudioService, RenderRate};
use audio_stream_client::stream::{RendererInClient, StreamState};

fn wire_service(loopback: Arc<LoopbackService>) -> WireService {
    let service: Arc<dyn AudioService> = loopback;
    WireService::new(
        move || {
            let (client, server) = UnixStream::pair()?;
            let server_reader = server.try_clone()?;
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let _ = serve(Box::new(server_reader), Box::new(server), service);
            });
            let reader: BoxedReader = Box::new(client.try_clone()?);
            let writer: BoxedWriter = Box::new(client);
            Ok((reader, writer))
        },
        Duration::from_secs(2),
    )
}

#[test]
fn test_renderer_over_socket() {
    let loopback = LoopbackService::new(LoopbackOptions {
        span_frames: Some(240),
        file_backed: true,
        latency_us: 700,
        ..LoopbackOptions::default()
    });
    let wire = Arc::new(wire_service(Arc::clone(&loopback)));
    let renderer = RendererInClient::new(wire, ClientConfig::default()).unwrap();
    renderer
        .set_stream_info(&StreamConfig::playback(48000, 2, SampleFormat::S16Le))
        .unwrap();
    assert_eq!(renderer.get_buffer_size().unwrap(), 960);

    renderer.start().unwrap();
    assert_eq!(renderer.get_state(), StreamState::Running);

    let data: Vec<u8> = (0..960 * 3).map(|i| (i % 251) as u8).collect();
    assert_eq!(renderer.write(&data).unwrap(), data.len());

    let stream = loopback.last_stream().unwrap();
    assert_eq!(stream.update_position_calls(), 3);
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut consumed = Vec::new();
    while consumed.len() < data.len() && Instant::now() < deadline {
        consumed.extend(stream.take_consumed());
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(consumed, data);

    renderer.set_render_rate(RenderRate::Half).unwrap();
    assert_eq!(renderer.get_render_rate().unwrap(), RenderRate::Half);
    assert_eq!(renderer.get_latency().unwrap(), 700);

    renderer.stop().unwrap();
    renderer.release().unwrap();
    assert_eq!(renderer.get_state(), StreamState::Released);
}

#[test]
fn test_dead_connection_fails_fast() {
    let loopback = LoopbackService::new(LoopbackOptions {
        file_backed: true,
        ..LoopbackOptions::default()
    });
    let wire = Arc::new(wire_service(Arc::clone(&loopback)));
    let renderer = RendererInClient::new(wire, ClientConfig::default()).unwrap();
    renderer.set_stream_info(&StreamConfig::default()).unwrap();

    loopback.kill();
    let started = Instant::now();
    assert!(renderer.start().is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(renderer.get_state(), StreamState::Prepared);
}
