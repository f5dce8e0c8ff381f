// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform hooks and legacy device capabilities.

use thiserror::Error;

/// A wall clock time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Seconds since the epoch.
    pub tv_sec: i64,
    /// Nanoseconds within the second.
    pub tv_nsec: i64,
}

/// Error setting the wall clock.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WallclockError {
    /// There is no clock to write.
    #[error("no real-time clock")]
    Unsupported,
}

/// Whether an i8042 keyboard controller may be present.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum I8042State {
    /// Probe for the controller.
    ExpectedPresent,
    /// Firmware reported that there is no controller.
    FirmwareAbsent,
    /// The platform cannot have a controller.
    PlatformAbsent,
}

/// Legacy PC devices the platform provides.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LegacyFeatures {
    /// The i8042 keyboard controller.
    pub i8042: I8042State,
    /// The CMOS real-time clock.
    pub rtc: bool,
    /// Warm reset through the CMOS shutdown byte.
    pub warm_reset: bool,
    /// The BIOS regions below 1MB need to be reserved.
    pub reserve_bios_regions: bool,
    /// Plug-and-play BIOS devices.
    pub pnpbios: bool,
}

impl Default for LegacyFeatures {
    fn default() -> Self {
        Self {
            i8042: I8042State::ExpectedPresent,
            rtc: true,
            warm_reset: true,
            reserve_bios_regions: true,
            pnpbios: true,
        }
    }
}

/// The platform hook table consulted during boot.
///
/// The surrounding kernel provides a table of its defaults, and
/// [`PlatformPolicy::apply_vtl_overrides`] produces the table for VTL2.
#[derive(Copy, Clone)]
pub struct PlatformPolicy {
    /// Reserves low memory for the real mode trampoline.
    pub realmode_reserve: fn(),
    /// Sets up the real mode trampoline.
    pub realmode_init: fn(),
    /// Interrupt setup that precedes the vector table.
    pub pre_vector_init: fn(),
    /// Sets up the legacy timer.
    pub timer_init: fn(),
    /// Probes for option ROMs.
    pub probe_roms: fn(),
    /// Searches for the BIOS MP tables.
    pub find_mptable: fn(),
    /// Parses the BIOS MP tables.
    pub early_parse_smp_cfg: fn(),
    /// Reads the wall clock.
    pub get_wallclock: fn() -> Timespec,
    /// Writes the wall clock.
    pub set_wallclock: fn(&Timespec) -> Result<(), WallclockError>,
    /// Returns the reason for the last NMI.
    pub get_nmi_reason: fn() -> u8,
    /// Legacy devices.
    pub legacy: LegacyFeatures,
    /// Whether the interrupt controller supports extended destination IDs in
    /// MSI messages.
    pub msi_ext_dest_id: fn() -> bool,
}

impl core::fmt::Debug for PlatformPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PlatformPolicy")
            .field("legacy", &self.legacy)
            .field("msi_ext_dest_id", &(self.msi_ext_dest_id)())
            .finish_non_exhaustive()
    }
}

/// A hook that does nothing.
pub fn init_noop() {}

fn get_wallclock_noop() -> Timespec {
    Timespec::default()
}

fn set_wallclock_noop(_now: &Timespec) -> Result<(), WallclockError> {
    Err(WallclockError::Unsupported)
}

/// There is no legacy NMI status port under the hypervisor.
fn hv_get_nmi_reason() -> u8 {
    0
}

fn vtl_msi_ext_dest_id() -> bool {
    true
}

impl PlatformPolicy {
    /// Replaces the hooks and capabilities that assume BIOS firmware or
    /// legacy PC hardware.
    pub fn apply_vtl_overrides(mut self) -> Self {
        tracing::info!("Linux runs in Hyper-V Virtual Trust Level");

        self.realmode_reserve = init_noop;
        self.realmode_init = init_noop;
        self.pre_vector_init = init_noop;
        self.timer_init = init_noop;
        self.probe_roms = init_noop;

        // Avoid searching for BIOS MP tables
        self.find_mptable = init_noop;
        self.early_parse_smp_cfg = init_noop;

        self.get_wallclock = get_wallclock_noop;
        self.set_wallclock = set_wallclock_noop;
        self.get_nmi_reason = hv_get_nmi_reason;

        self.legacy = LegacyFeatures {
            i8042: I8042State::PlatformAbsent,
            rtc: false,
            warm_reset: false,
            reserve_bios_regions: false,
            pnpbios: false,
        };

        self.msi_ext_dest_id = vtl_msi_ext_dest_id;
        self
    }
}
