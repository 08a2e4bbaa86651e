//! Remote stream proxy, service interface and the process-wide registry

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::protocol::{AudioEffectMode, Operation, PrivacyType, RenderRate};
use crate::buffer::{HandleInfo, SharedRingBuffer};
use crate::config::{StreamConfig, StreamRole};
use crate::error::IpcError;

/// Receives acks and notices from the service
pub trait StreamListener: Send + Sync {
    fn on_operation_handled(&self, operation: Operation, result: i64);
}

/// Proxy for one stream living in the audio service.
///
/// Lifecycle requests (`start` .. `release`) return as soon as the request
/// is accepted; completion arrives later through the registered listener.
/// Everything else is a plain synchronous call.
pub trait IpcStream: Send + Sync {
    fn register_stream_listener(&self, listener: Arc<dyn StreamListener>) -> Result<(), IpcError>;

    /// Obtain the shared ring buffer negotiated for this stream
    fn resolve_buffer(&self) -> Result<Arc<SharedRingBuffer>, IpcError>;

    /// Fire-and-forget notice that a cursor moved
    fn update_position(&self) -> Result<(), IpcError>;

    fn start(&self) -> Result<(), IpcError>;
    fn pause(&self) -> Result<(), IpcError>;
    fn stop(&self) -> Result<(), IpcError>;
    fn flush(&self) -> Result<(), IpcError>;
    fn drain(&self) -> Result<(), IpcError>;
    fn release(&self) -> Result<(), IpcError>;

    fn get_audio_time(&self) -> Result<HandleInfo, IpcError>;

    /// Service-side latency in microseconds
    fn get_latency(&self) -> Result<u64, IpcError>;

    fn set_rate(&self, rate: RenderRate) -> Result<(), IpcError>;
    fn get_rate(&self) -> Result<RenderRate, IpcError>;
    fn set_low_power_volume(&self, volume: f32) -> Result<(), IpcError>;
    fn get_low_power_volume(&self) -> Result<f32, IpcError>;
    fn set_audio_effect_mode(&self, mode: AudioEffectMode) -> Result<(), IpcError>;
    fn get_audio_effect_mode(&self) -> Result<AudioEffectMode, IpcError>;
    fn set_privacy_type(&self, privacy: PrivacyType) -> Result<(), IpcError>;
    fn get_privacy_type(&self) -> Result<PrivacyType, IpcError>;
}

/// A stream proxy together with the session id the service assigned
#[derive(Clone)]
pub struct StreamHandle {
    pub stream: Arc<dyn IpcStream>,
    pub session_id: u32,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

pub trait AudioService: Send + Sync {
    fn create_stream(&self, config: &StreamConfig, role: StreamRole) -> Result<StreamHandle, IpcError>;

    /// False once the service is known to be gone
    fn is_alive(&self) -> bool;
}

/// Produces a fresh service proxy
pub trait ServiceConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn AudioService>, IpcError>;
}

impl<F> ServiceConnector for F
where
    F: Fn() -> Result<Arc<dyn AudioService>, IpcError> + Send + Sync,
{
    fn connect(&self) -> Result<Arc<dyn AudioService>, IpcError> {
        self()
    }
}

#[derive(Default)]
struct RegistryState {
    connector: Option<Arc<dyn ServiceConnector>>,
    cached: Option<Arc<dyn AudioService>>,
}

/// Lazily connected, cached service proxy. A dead proxy is dropped and
/// reconnected on the next `service()` call; streams created through the
/// old proxy are not recovered.
#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
}

static GLOBAL_REGISTRY: OnceLock<ServiceRegistry> = OnceLock::new();

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ServiceRegistry {
        GLOBAL_REGISTRY.get_or_init(ServiceRegistry::new)
    }

    /// Set how the service is reached. Drops any cached proxy.
    pub fn install(&self, connector: Arc<dyn ServiceConnector>) {
        let mut state = self.state.lock();
        state.connector = Some(connector);
        state.cached = None;
    }

    pub fn service(&self) -> Result<Arc<dyn AudioService>, IpcError> {
        let mut state = self.state.lock();
        if let Some(service) = &state.cached {
            if service.is_alive() {
                return Ok(Arc::clone(service));
            }
            warn!("Audio service died, reconnecting");
            state.cached = None;
        }

        let connector = state
            .connector
            .clone()
            .ok_or_else(|| IpcError::ServiceUnavailable("no service connector installed".into()))?;
        let service = connector.connect()?;
        if !service.is_alive() {
            return Err(IpcError::ServiceUnavailable("connected service is not alive".into()));
        }
        info!("Connected to audio service");
        state.cached = Some(Arc::clone(&service));
        Ok(service)
    }

    /// Forget the cached proxy (remote death notice)
    pub fn invalidate(&self) {
        if self.state.lock().cached.take().is_some() {
            info!("Audio service proxy invalidated");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .cached
            .as_ref()
            .map_or(false, |service| service.is_alive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct DeadEnd {
        alive: AtomicBool,
    }

    impl AudioService for DeadEnd {
        fn create_stream(&self, _: &StreamConfig, _: StreamRole) -> Result<StreamHandle, IpcError> {
            Err(IpcError::ServiceUnavailable("test".into()))
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_unconfigured_registry_fails_fast() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.service(),
            Err(IpcError::ServiceUnavailable(_))
        ));
        assert!(!registry.is_connected());
    }

    #[test]
    fn test_dead_service_reconnects() {
        let connects = Arc::new(AtomicUsize::new(0));
        let last: Arc<Mutex<Option<Arc<DeadEnd>>>> = Arc::new(Mutex::new(None));

        let registry = ServiceRegistry::new();
        let counter = Arc::clone(&connects);
        let slot = Arc::clone(&last);
        registry.install(Arc::new(move || -> Result<Arc<dyn AudioService>, IpcError> {
            counter.fetch_add(1, Ordering::SeqCst);
            let service = Arc::new(DeadEnd {
                alive: AtomicBool::new(true),
            });
            *slot.lock() = Some(Arc::clone(&service));
            Ok(service as Arc<dyn AudioService>)
        }));

        registry.service().unwrap();
        registry.service().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        if let Some(service) = last.lock().as_ref() {
            service.alive.store(false, Ordering::SeqCst);
        }
        assert!(!registry.is_connected());
        registry.service().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        registry.invalidate();
        registry.service().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }
}
