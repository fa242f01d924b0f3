//! Single-owner registry for serial consoles.
//!
//! Named pipes do not support safe multi-reader fan-out, so at most one
//! consumer (a terminal session, the bootstrap routine, a command runner)
//! may hold a VM's console at a time. Anything that opens a console takes
//! the registry explicitly; there is no global instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use ember_core::VmId;

use crate::ExecutorError;

/// Bookkeeping for one held console.
#[derive(Debug, Clone)]
pub struct ClaimEntry {
    /// Who holds the console, e.g. `"terminal"` or `"bootstrap"`.
    pub holder: String,
    /// When the console was claimed.
    pub claimed_at: Instant,
}

/// Thread-safe map of VM id to the consumer currently holding its console.
#[derive(Debug, Default)]
pub struct ConsoleRegistry {
    entries: RwLock<HashMap<VmId, ClaimEntry>>,
}

impl ConsoleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the console of `vm_id` for `holder`.
    ///
    /// The returned [`ConsoleClaim`] releases the entry when dropped.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ConsoleBusy`] if the console is already held.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    pub fn claim(
        self: &Arc<Self>,
        vm_id: &VmId,
        holder: impl Into<String>,
    ) -> Result<ConsoleClaim, ExecutorError> {
        let holder = holder.into();
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut entries = self
            .entries
            .write()
            .expect("console registry write lock poisoned");

        if let Some(existing) = entries.get(vm_id) {
            return Err(ExecutorError::ConsoleBusy {
                vm_id: vm_id.clone(),
                holder: existing.holder.clone(),
            });
        }
        entries.insert(
            vm_id.clone(),
            ClaimEntry {
                holder: holder.clone(),
                claimed_at: Instant::now(),
            },
        );
        tracing::debug!(vm_id = %vm_id, %holder, "serial console claimed");

        Ok(ConsoleClaim {
            registry: Arc::clone(self),
            vm_id: vm_id.clone(),
        })
    }

    /// Return the current holder of `vm_id`'s console, if any.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn holder(&self, vm_id: &VmId) -> Option<ClaimEntry> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let entries = self
            .entries
            .read()
            .expect("console registry read lock poisoned");
        entries.get(vm_id).cloned()
    }

    /// Return `true` if the console of `vm_id` is currently held.
    #[must_use]
    pub fn is_claimed(&self, vm_id: &VmId) -> bool {
        self.holder(vm_id).is_some()
    }

    /// Return the number of held consoles.
    ///
    /// # Panics
    /// Panics if the internal `RwLock` is poisoned.
    #[must_use]
    pub fn active_count(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let entries = self
            .entries
            .read()
            .expect("console registry read lock poisoned");
        entries.len()
    }

    fn release(&self, vm_id: &VmId) {
        // Runs from Drop; a poisoned lock must not turn into a double panic.
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.remove(vm_id).is_some() {
            tracing::debug!(vm_id = %vm_id, "serial console released");
        }
    }
}

/// Proof of exclusive access to one VM's console.
///
/// Releases the registry entry on drop.
#[derive(Debug)]
pub struct ConsoleClaim {
    registry: Arc<ConsoleRegistry>,
    vm_id: VmId,
}

impl ConsoleClaim {
    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }
}

impl Drop for ConsoleClaim {
    fn drop(&mut self) {
        self.registry.release(&self.vm_id);
    }
}
