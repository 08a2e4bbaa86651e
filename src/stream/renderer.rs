//! Playback client
//!
//! Thin facade over the shared stream engine. Data reaches the service
//! either through [`RendererInClient::write`] (push) or through the
//! buffer queue of callback mode (pull).

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::callbacks::{PeriodPositionCallback, PositionCallback, StreamCallback, WriteCallback};
use super::core::{AudioTimestamp, StreamCore};
use super::pull::{BufferDesc, BufferQueueState, RenderMode};
use super::state::StreamState;
use crate::config::{ClientConfig, StreamConfig, StreamRole};
use crate::dsp::speed::check_speed;
use crate::dsp::{ChannelBlendMode, LinearSpeed, SpeedTransform};
use crate::error::StreamError;
use crate::ipc::{AudioEffectMode, AudioService, PrivacyType, RenderRate, ServiceRegistry};

/// Audio renderer bound to one remote playback stream
pub struct RendererInClient {
    core: Arc<StreamCore>,
}

impl RendererInClient {
    /// Create a renderer against an explicit service
    pub fn new(service: Arc<dyn AudioService>, config: ClientConfig) -> Result<Self, StreamError> {
        Ok(Self {
            core: StreamCore::new(StreamRole::Renderer, service, config)?,
        })
    }

    /// Create a renderer against the process-wide service
    pub fn create(config: ClientConfig) -> Result<Self, StreamError> {
        let service = ServiceRegistry::global().service()?;
        Self::new(service, config)
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Negotiate the stream with the service. NEW → PREPARED.
    pub fn set_stream_info(&self, config: &StreamConfig) -> Result<(), StreamError> {
        self.core.set_stream_info(config)
    }

    pub fn get_audio_stream_info(&self) -> Result<StreamConfig, StreamError> {
        self.core.stream_config()
    }

    pub fn get_state(&self) -> StreamState {
        self.core.state()
    }

    pub fn start(&self) -> Result<(), StreamError> {
        self.core.start()
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        self.core.pause()
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.core.stop()
    }

    /// Discard everything queued locally and on the service side
    pub fn flush(&self) -> Result<(), StreamError> {
        self.core.flush()
    }

    /// Push out the cached tail and wait until the service played it
    pub fn drain(&self) -> Result<(), StreamError> {
        self.core.drain()
    }

    pub fn release(&self) -> Result<(), StreamError> {
        self.core.release()
    }

    // ── push mode ────────────────────────────────────────────────────────

    /// Write interleaved PCM. Returns the number of input bytes accepted,
    /// which is less than `data.len()` only when the service stalled.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let bytes_per_frame = self.core.check_write(data)?.bytes_per_frame;

        let transformed = {
            let mut speed = self.core.speed_slot().lock();
            match speed.as_mut() {
                Some(transform) if is_active(transform.speed()) => {
                    let mut output = Vec::with_capacity(data.len() * 4);
                    transform.process(data, &mut output);
                    Some(output)
                }
                _ => None,
            }
        };

        match transformed {
            None => self.core.write(data),
            // interpolation may hold the last frame back for the next call
            Some(output) if output.is_empty() => Ok(data.len()),
            Some(output) => {
                let written = self.core.write(&output)?;
                if written == output.len() {
                    return Ok(data.len());
                }
                let consumed = input_share(written, output.len(), data.len(), bytes_per_frame);
                warn!(written, produced = output.len(), consumed, "Speed output only partly written");
                Ok(consumed)
            }
        }
    }

    // ── callback mode ────────────────────────────────────────────────────

    pub fn set_render_mode(&self, mode: RenderMode) -> Result<(), StreamError> {
        self.core.set_pull_mode(mode == RenderMode::Callback)
    }

    pub fn get_render_mode(&self) -> RenderMode {
        if self.core.is_pull_mode() {
            RenderMode::Callback
        } else {
            RenderMode::Normal
        }
    }

    /// Called from the worker whenever a buffer can be filled
    pub fn set_renderer_write_callback(
        &self,
        callback: Arc<dyn WriteCallback>,
    ) -> Result<(), StreamError> {
        if !self.core.is_pull_mode() {
            return Err(StreamError::InvalidParameter(
                "write callback requires callback render mode".into(),
            ));
        }
        self.core.callbacks().set_write_callback(Some(callback));
        Ok(())
    }

    /// Borrow a free buffer to fill
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        self.core
            .with_pull("get_buffer_desc", |worker| worker.get_buffer_desc())
    }

    /// Queue a filled buffer; `data_length` must be whole frames
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), StreamError> {
        self.core.with_pull("enqueue", |worker| worker.enqueue(desc))
    }

    pub fn get_buf_queue_state(&self) -> Result<BufferQueueState, StreamError> {
        self.core
            .with_pull("get_buf_queue_state", |worker| Ok(worker.queue_state()))
    }

    /// Drop every queued buffer that has not been written yet
    pub fn clear(&self) -> Result<(), StreamError> {
        self.core.with_pull("clear", |worker| {
            worker.clear();
            Ok(())
        })
    }

    // ── processing ───────────────────────────────────────────────────────

    /// Set volume immediately, cancelling any ramp in progress
    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        self.core.set_volume(volume)
    }

    /// Ramp linearly to `volume` over `duration_ms`
    pub fn set_volume_with_ramp(&self, volume: f32, duration_ms: u32) -> Result<(), StreamError> {
        self.core.set_volume_with_ramp(volume, duration_ms)
    }

    pub fn get_volume(&self) -> f32 {
        self.core.volume()
    }

    pub fn set_speed(&self, speed: f32) -> Result<(), StreamError> {
        check_speed(speed)?;
        let config = self.core.stream_config()?;
        let mut slot = self.core.speed_slot().lock();
        match slot.as_mut() {
            Some(transform) => transform.set_speed(speed)?,
            None if is_active(speed) => {
                let mut transform = LinearSpeed::new(config.format, config.channels as usize);
                transform.set_speed(speed)?;
                *slot = Some(Box::new(transform));
            }
            None => {}
        }
        debug!(speed, "Renderer speed changed");
        Ok(())
    }

    /// Replace the speed transform, e.g. with a pitch-preserving one.
    /// `None` goes back to unprocessed output.
    pub fn set_speed_transform(&self, transform: Option<Box<dyn SpeedTransform>>) {
        self.core.set_speed_transform(transform);
    }

    pub fn get_speed(&self) -> f32 {
        self.core
            .speed_slot()
            .lock()
            .as_ref()
            .map_or(1.0, |transform| transform.speed())
    }

    pub fn set_channel_blend_mode(&self, mode: ChannelBlendMode) -> Result<(), StreamError> {
        self.core.set_channel_blend_mode(mode)
    }

    pub fn set_renderer_sampling_rate(&self, rate: u32) -> Result<(), StreamError> {
        self.core.set_renderer_sampling_rate(rate)
    }

    pub fn get_renderer_sampling_rate(&self) -> Result<u32, StreamError> {
        self.core.renderer_sampling_rate()
    }

    // ── service-side settings ────────────────────────────────────────────

    pub fn set_render_rate(&self, rate: RenderRate) -> Result<(), StreamError> {
        self.core.ipc("set_render_rate")?.set_rate(rate)?;
        info!(?rate, "Render rate changed");
        Ok(())
    }

    pub fn get_render_rate(&self) -> Result<RenderRate, StreamError> {
        Ok(self.core.ipc("get_render_rate")?.get_rate()?)
    }

    pub fn set_low_power_volume(&self, volume: f32) -> Result<(), StreamError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(StreamError::InvalidParameter(format!(
                "low power volume {volume} outside 0..=1"
            )));
        }
        Ok(self
            .core
            .ipc("set_low_power_volume")?
            .set_low_power_volume(volume)?)
    }

    pub fn get_low_power_volume(&self) -> Result<f32, StreamError> {
        Ok(self
            .core
            .ipc("get_low_power_volume")?
            .get_low_power_volume()?)
    }

    pub fn set_audio_effect_mode(&self, mode: AudioEffectMode) -> Result<(), StreamError> {
        Ok(self
            .core
            .ipc("set_audio_effect_mode")?
            .set_audio_effect_mode(mode)?)
    }

    pub fn get_audio_effect_mode(&self) -> Result<AudioEffectMode, StreamError> {
        Ok(self
            .core
            .ipc("get_audio_effect_mode")?
            .get_audio_effect_mode()?)
    }

    pub fn set_privacy_type(&self, privacy: PrivacyType) -> Result<(), StreamError> {
        Ok(self.core.ipc("set_privacy_type")?.set_privacy_type(privacy)?)
    }

    pub fn get_privacy_type(&self) -> Result<PrivacyType, StreamError> {
        Ok(self.core.ipc("get_privacy_type")?.get_privacy_type()?)
    }

    /// Offload streams get the long control timeout
    pub fn set_offload_mode(&self) {
        self.core.set_offload_mode(true);
    }

    pub fn unset_offload_mode(&self) {
        self.core.set_offload_mode(false);
    }

    pub fn is_offload(&self) -> bool {
        self.core.is_offload()
    }

    // ── callbacks ────────────────────────────────────────────────────────

    pub fn set_stream_callback(&self, callback: Arc<dyn StreamCallback>) {
        self.core.callbacks().set_stream_callback(Some(callback));
    }

    /// Fire `callback` once when `mark` frames have been written
    pub fn set_renderer_position_callback(
        &self,
        mark: u64,
        callback: Arc<dyn PositionCallback>,
    ) -> Result<(), StreamError> {
        self.core.set_mark_position(mark, callback)
    }

    pub fn unset_renderer_position_callback(&self) {
        self.core.unset_mark_position();
    }

    /// Fire `callback` every `period` frames written
    pub fn set_renderer_period_position_callback(
        &self,
        period: u64,
        callback: Arc<dyn PeriodPositionCallback>,
    ) -> Result<(), StreamError> {
        self.core.set_period_position(period, callback)
    }

    pub fn unset_renderer_period_position_callback(&self) {
        self.core.unset_period_position();
    }

    // ── queries ──────────────────────────────────────────────────────────

    pub fn get_audio_session_id(&self) -> Result<u32, StreamError> {
        self.core.session_id()
    }

    pub fn get_audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        self.core.audio_time()
    }

    /// End-to-end latency in microseconds
    pub fn get_latency(&self) -> Result<u64, StreamError> {
        self.core.latency()
    }

    /// Bytes per span
    pub fn get_buffer_size(&self) -> Result<usize, StreamError> {
        self.core.buffer_size()
    }

    /// Frames per span
    pub fn get_frame_count(&self) -> Result<u32, StreamError> {
        self.core.frame_count()
    }

    pub fn get_frames_written(&self) -> u64 {
        self.core.total_frames()
    }

    pub fn get_bytes_written(&self) -> u64 {
        self.core.total_bytes()
    }

    pub fn get_underflow_count(&self) -> u32 {
        self.core.underflow_count()
    }

    /// Bytes sitting in the local cache, not yet handed to the service
    pub fn cached_bytes(&self) -> usize {
        self.core.cache_readable()
    }
}

fn is_active(speed: f32) -> bool {
    (speed - 1.0).abs() > f32::EPSILON
}

/// Input bytes, in whole frames, that account for `written` of `produced`
/// transformed bytes
fn input_share(written: usize, produced: usize, input: usize, bytes_per_frame: usize) -> usize {
    if produced == 0 || bytes_per_frame == 0 {
        return 0;
    }
    let share = (written as u128 * input as u128 / produced as u128) as usize;
    share - share % bytes_per_frame
}

impl Drop for RendererInClient {
    fn drop(&mut self) {
        if self.core.state() != StreamState::Released {
            if let Err(e) = self.core.release() {
                debug!("Release on drop failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for RendererInClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererInClient")
            .field("state", &self.core.state())
            .field("frames_written", &self.core.total_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_share_scales_and_aligns() {
        // half of the doubled output maps back to half the input
        assert_eq!(input_share(960, 1920, 960, 4), 480);
        assert_eq!(input_share(1000, 1920, 960, 4), 500);
        assert_eq!(input_share(1001, 1920, 960, 4), 500);
        assert_eq!(input_share(0, 1920, 960, 4), 0);
        assert_eq!(input_share(10, 0, 960, 4), 0);
        assert_eq!(input_share(10, 20, 960, 0), 0);
    }
}
