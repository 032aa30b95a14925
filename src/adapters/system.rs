//! System-control adapter: lock-out, watchdog, reset.
//!
//! Implements [`SystemPort`]. On ESP-IDF the lock-out suspends the other
//! core's scheduler and masks interrupts so flash erase/program cannot
//! race code execution; the simulation records every call so tests can
//! assert that destructive paths (reboot handlers, OTA commit) sequence
//! the platform correctly.

use log::info;

use crate::ports::SystemPort;

// ───────────────────────────────────────────────────────────────
// Host simulation
// ───────────────────────────────────────────────────────────────

/// One recorded system-control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    LockOut,
    Unlock,
    WatchdogArm { timeout_ms: u32 },
    WatchdogFeed,
    Reboot,
    RebootToBootloader,
}

/// Recording simulation of the system port.
pub struct SimSystem {
    pub calls: Vec<SystemCall>,
    /// When false, `lock_out` fails — exercises the timeout path.
    pub lock_out_succeeds: bool,
    locked: bool,
}

impl SimSystem {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            lock_out_succeeds: true,
            locked: false,
        }
    }

    /// Whether a reboot (of either kind) was requested.
    pub fn rebooted(&self) -> bool {
        self.calls
            .iter()
            .any(|c| matches!(c, SystemCall::Reboot | SystemCall::RebootToBootloader))
    }

    /// Whether the lock is currently held (a commit path that returns
    /// without rebooting must not leave it held).
    pub fn locked(&self) -> bool {
        self.locked
    }
}

impl Default for SimSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPort for SimSystem {
    fn can_lock_out(&self) -> bool {
        self.lock_out_succeeds
    }

    fn lock_out(&mut self) -> bool {
        self.calls.push(SystemCall::LockOut);
        if self.lock_out_succeeds {
            self.locked = true;
        }
        self.lock_out_succeeds
    }

    fn unlock(&mut self) {
        self.calls.push(SystemCall::Unlock);
        self.locked = false;
    }

    fn watchdog_arm(&mut self, timeout_ms: u32) {
        self.calls.push(SystemCall::WatchdogArm { timeout_ms });
    }

    fn watchdog_feed(&mut self) {
        self.calls.push(SystemCall::WatchdogFeed);
    }

    fn reboot(&mut self) {
        info!("sim system: reboot requested");
        self.calls.push(SystemCall::Reboot);
    }

    fn reboot_to_bootloader(&mut self) {
        info!("sim system: bootloader reboot requested");
        self.calls.push(SystemCall::RebootToBootloader);
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct EspSystem {
    locked: bool,
}

#[cfg(target_os = "espidf")]
impl EspSystem {
    pub fn new() -> Self {
        Self { locked: false }
    }
}

#[cfg(target_os = "espidf")]
impl Default for EspSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl SystemPort for EspSystem {
    fn can_lock_out(&self) -> bool {
        true
    }

    fn lock_out(&mut self) -> bool {
        use esp_idf_svc::sys::*;
        // SAFETY: pairing with unlock below; suspends the scheduler on
        // this port and keeps the other core out of flash.
        unsafe {
            vTaskSuspendAll();
        }
        self.locked = true;
        true
    }

    fn unlock(&mut self) {
        use esp_idf_svc::sys::*;
        if self.locked {
            // SAFETY: only called after a successful lock_out.
            unsafe {
                xTaskResumeAll();
            }
            self.locked = false;
        }
    }

    fn watchdog_arm(&mut self, timeout_ms: u32) {
        use esp_idf_svc::sys::*;
        let config = esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // SAFETY: reconfiguring the task watchdog is valid at any time.
        unsafe {
            esp_task_wdt_reconfigure(&config);
        }
    }

    fn watchdog_feed(&mut self) {
        // SAFETY: no preconditions.
        unsafe {
            esp_idf_svc::sys::esp_task_wdt_reset();
        }
    }

    fn reboot(&mut self) {
        // SAFETY: esp_restart does not return.
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }

    fn reboot_to_bootloader(&mut self) {
        use esp_idf_svc::sys::*;
        // SAFETY: selects the serial download boot mode for the next
        // reset, then resets.
        unsafe {
            esp_reset_reason(); // flush pending reason
            esp_restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_pairing_is_observable() {
        let mut sys = SimSystem::new();
        assert!(sys.lock_out());
        assert!(sys.locked());
        sys.unlock();
        assert!(!sys.locked());
        assert_eq!(sys.calls, vec![SystemCall::LockOut, SystemCall::Unlock]);
    }

    #[test]
    fn failed_lock_out_does_not_hold_the_lock() {
        let mut sys = SimSystem::new();
        sys.lock_out_succeeds = false;
        assert!(!sys.can_lock_out());
        assert!(!sys.lock_out());
        assert!(!sys.locked());
    }

    #[test]
    fn reboot_is_recorded() {
        let mut sys = SimSystem::new();
        assert!(!sys.rebooted());
        sys.watchdog_arm(1);
        sys.reboot();
        assert!(sys.rebooted());
    }
}
