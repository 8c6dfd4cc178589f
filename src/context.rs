//! The single monitored interface
//!
//! Owned by the embedding application and passed where needed; at most one
//! interface is monitored at a time. Registered as a `ConfigWatcher`, the
//! context picks up reloaded configuration: the filter and Ethernet
//! conversion apply to the live interface, everything else to the next one
//! attached.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

use crate::config::{CaptureConfig, ConfigWatcher};
use crate::filter::FilterUpdate;
use crate::mode::ModeController;
use crate::vdev::PktCaptureVdev;
use crate::{PktCaptureError, Result};

#[derive(Debug)]
struct Session {
    id: Uuid,
    attached_at: DateTime<Utc>,
    vdev: Arc<PktCaptureVdev>,
}

/// Capture context of the device
pub struct MonitorContext {
    config: RwLock<CaptureConfig>,
    controller: Arc<dyn ModeController>,
    session: Mutex<Option<Session>>,
}

impl MonitorContext {
    pub fn new(config: CaptureConfig, controller: Arc<dyn ModeController>) -> Self {
        Self {
            config: RwLock::new(config),
            controller,
            session: Mutex::new(None),
        }
    }

    /// Configuration the next attached interface will use
    pub fn config(&self) -> CaptureConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Attach capture to a newly created interface
    pub fn on_vdev_create(&self, vdev_id: u8) -> Result<Arc<PktCaptureVdev>> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = session.as_ref() {
            return Err(PktCaptureError::AlreadyMonitoring(existing.vdev.vdev_id()));
        }

        let vdev = Arc::new(PktCaptureVdev::new(vdev_id, &self.config(), Arc::clone(&self.controller))?);
        let id = Uuid::new_v4();
        log::info!("monitor session {} started on vdev {}", id, vdev_id);
        *session = Some(Session {
            id,
            attached_at: Utc::now(),
            vdev: Arc::clone(&vdev),
        });
        Ok(vdev)
    }

    /// Detach capture from an interface being destroyed; idempotent
    pub fn on_vdev_destroy(&self, vdev_id: u8) -> Result<()> {
        let detached = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            match session.as_ref() {
                Some(current) if current.vdev.vdev_id() == vdev_id => session.take(),
                _ => None,
            }
        };

        match detached {
            Some(session) => {
                log::info!(
                    "monitor session {} on vdev {} ended after {}s",
                    session.id,
                    vdev_id,
                    (Utc::now() - session.attached_at).num_seconds()
                );
                session.vdev.shutdown()
            }
            None => {
                log::debug!("vdev {} is not monitored", vdev_id);
                Ok(())
            }
        }
    }

    /// The monitored interface
    pub fn current(&self) -> Result<Arc<PktCaptureVdev>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| Arc::clone(&session.vdev))
            .ok_or(PktCaptureError::NotMonitoring)
    }

    pub fn is_monitoring(&self) -> bool {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.id)
    }
}

impl Drop for MonitorContext {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            if let Err(e) = session.vdev.shutdown() {
                log::warn!("vdev {}: {}", session.vdev.vdev_id(), e);
            }
        }
    }
}

impl ConfigWatcher for MonitorContext {
    fn on_config_changed(&self, old_config: &CaptureConfig, new_config: &CaptureConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config.clone();

        let Ok(vdev) = self.current() else {
            return;
        };
        if old_config.default_filter != new_config.default_filter {
            if let Err(e) = vdev.set_filter(FilterUpdate::all(new_config.default_filter)) {
                log::warn!("vdev {}: reloaded filter not applied: {}", vdev.vdev_id(), e);
            }
        }
        if old_config.convert_ethernet != new_config.convert_ethernet {
            vdev.set_convert_ethernet(new_config.convert_ethernet);
        }
        log::info!("vdev {}: configuration reloaded", vdev.vdev_id());
    }

    fn name(&self) -> &str {
        "monitor-context"
    }
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("config", &self.config())
            .field("session", &self.session_id())
            .finish()
    }
}
