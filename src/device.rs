//! Compute device registry.
//!
//! Solver stages bind a device at configure time. A binding is exclusive
//! unless the registry is pooled; the lease is returned when the stage is
//! dropped.

use crate::config::ClampPolicy;
use crate::error::{ReconError, Result};
use std::sync::{Arc, Mutex};

/// Tracks which devices are bound.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    pooled: bool,
    bound: Arc<Mutex<Vec<usize>>>,
}

impl DeviceRegistry {
    /// Registry with `count` exclusive devices.
    pub fn new(count: usize) -> Self {
        Self {
            pooled: false,
            bound: Arc::new(Mutex::new(vec![0; count])),
        }
    }

    /// Registry whose devices may be shared between stages.
    pub fn pooled(count: usize) -> Self {
        Self {
            pooled: true,
            ..Self::new(count)
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Number of live leases on `id`.
    pub fn leases(&self, id: usize) -> usize {
        self.lock().get(id).copied().unwrap_or(0)
    }

    /// Bind device `id`.
    ///
    /// An id past the device count is reduced modulo the count under
    /// [`ClampPolicy::Clamp`] and rejected under [`ClampPolicy::Reject`].
    pub fn bind(&self, id: i64, policy: ClampPolicy) -> Result<DeviceLease> {
        let mut bound = self.lock();
        let count = bound.len();
        if count == 0 {
            return Err(ReconError::Resource("no compute devices available".into()));
        }

        let resolved = if id >= 0 && (id as usize) < count {
            id as usize
        } else {
            match policy {
                ClampPolicy::Reject => {
                    return Err(ReconError::config(format!(
                        "device_id {} out of range (0..{})",
                        id, count
                    )))
                }
                ClampPolicy::Clamp => {
                    let clamped = id.rem_euclid(count as i64) as usize;
                    tracing::warn!(
                        "device_id {} out of range, using device {} of {}",
                        id,
                        clamped,
                        count
                    );
                    clamped
                }
            }
        };

        if bound[resolved] > 0 && !self.pooled {
            return Err(ReconError::Resource(format!(
                "device {} is already bound",
                resolved
            )));
        }
        bound[resolved] += 1;
        tracing::debug!("Bound device {}", resolved);

        Ok(DeviceLease {
            id: resolved,
            bound: Arc::clone(&self.bound),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<usize>> {
        // A poisoned registry still holds valid counters.
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A bound device. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    id: usize,
    bound: Arc<Mutex<Vec<usize>>>,
}

impl DeviceLease {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = bound.get_mut(self.id) {
            *n = n.saturating_sub(1);
        }
        tracing::trace!("Released device {}", self.id);
    }
}
