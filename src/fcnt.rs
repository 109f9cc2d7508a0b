//! Frame-counter management
//!
//! Uplink counters arrive with only their 16 LSBs on air; the stored counter is 32 bits.
//! Downlink counters are allocated here and stored as the *next* value to use.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lorawan::{DevAddr, MacVersion};

/// Largest counter gap still considered plausible when several activations share a DevAddr.
pub const MAX_FCNT_GAP: u32 = 16384;

/// Per-activation counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameCounters {
    /// Highest uplink counter seen, `None` until the first uplink.
    pub f_cnt_up: Option<u32>,
    /// Next network downlink counter (1.0.x: every downlink).
    pub n_f_cnt_down: u32,
    /// Next application downlink counter (1.1, FPort > 0).
    pub a_f_cnt_down: u32,
}

/// Which downlink counter an allocation consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkCounter {
    Network,
    Application,
}

/// Rebuild the full 32-bit counter from the 16 bits seen on air.
///
/// Picks the value nearest to `previous` whose low 16 bits equal `on_air`.
pub fn reconstruct(previous: u32, on_air: u16) -> u32 {
    let base = previous & 0xFFFF_0000;
    let candidate = base | u32::from(on_air);

    // Compare against the neighbouring 16-bit epochs and keep the nearest.
    let mut best = candidate;
    let mut best_dist = previous.abs_diff(candidate);
    if let Some(next) = candidate.checked_add(0x1_0000) {
        let d = previous.abs_diff(next);
        if d < best_dist {
            best = next;
            best_dist = d;
        }
    }
    if let Some(prev) = candidate.checked_sub(0x1_0000) {
        if previous.abs_diff(prev) < best_dist {
            best = prev;
        }
    }
    best
}

/// Validate an uplink counter against the highest one seen.
///
/// Returns the reconstructed 32-bit counter to store.
pub fn validate_uplink(
    dev_addr: DevAddr,
    last: Option<u32>,
    received: u32,
    skip_check: bool,
) -> Result<u32> {
    let Some(last) = last else {
        return Ok(received);
    };

    let fcnt = reconstruct(last, (received & 0xFFFF) as u16);
    if skip_check {
        return Ok(fcnt);
    }

    if fcnt == last {
        return Err(Error::DuplicateFrame { dev_addr, fcnt });
    }
    if fcnt < last {
        return Err(Error::FCntReplay {
            dev_addr,
            received: fcnt,
            last,
        });
    }
    Ok(fcnt)
}

/// Whether `received` plausibly follows `last` (used to pick between activations).
pub fn is_plausible(last: Option<u32>, received: u32) -> bool {
    match last {
        None => true,
        Some(last) => {
            let fcnt = reconstruct(last, (received & 0xFFFF) as u16);
            fcnt > last && fcnt - last < MAX_FCNT_GAP
        }
    }
}

impl FrameCounters {
    /// Allocate the next downlink counter for a frame on `f_port`.
    ///
    /// 1.0.x devices share one downlink counter; 1.1 devices use AFCntDown for
    /// application ports and NFCntDown for FPort 0.
    pub fn allocate_downlink(
        &mut self,
        mac_version: MacVersion,
        f_port: u8,
    ) -> Result<(u32, DownlinkCounter)> {
        let (counter, kind) = if mac_version.is_legacy() || f_port == 0 {
            (&mut self.n_f_cnt_down, DownlinkCounter::Network)
        } else {
            (&mut self.a_f_cnt_down, DownlinkCounter::Application)
        };

        let allocated = *counter;
        *counter = allocated.checked_add(1).ok_or(Error::CounterExhausted)?;
        Ok((allocated, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: DevAddr = DevAddr([1, 2, 3, 4]);

    #[test]
    fn test_reconstruct_rollover_sequence() {
        let mut last = 65530u32;
        let mut seen = Vec::new();
        for on_air in [65534u32, 65535, 0, 1] {
            let fcnt = validate_uplink(ADDR, Some(last), on_air, false).unwrap();
            seen.push(fcnt);
            last = fcnt;
        }
        assert_eq!(seen, vec![65534, 65535, 65536, 65537]);
    }

    #[test]
    fn test_reconstruct_nearest() {
        assert_eq!(reconstruct(0, 5), 5);
        assert_eq!(reconstruct(0x0001_0002, 0xFFFF), 0x0000_FFFF);
        assert_eq!(reconstruct(0x0001_FFFE, 0x0001), 0x0002_0001);
        assert_eq!(reconstruct(u32::MAX - 1, 0xFFFF), u32::MAX);
    }

    #[test]
    fn test_replay_rejected_unless_skipped() {
        let err = validate_uplink(ADDR, Some(100), 99, false).unwrap_err();
        assert!(matches!(err, Error::FCntReplay { received: 99, last: 100, .. }));
        assert_eq!(validate_uplink(ADDR, Some(100), 99, true).unwrap(), 99);
    }

    #[test]
    fn test_duplicate_frame() {
        let err = validate_uplink(ADDR, Some(12), 12, false).unwrap_err();
        assert_eq!(err, Error::DuplicateFrame { dev_addr: ADDR, fcnt: 12 });
    }

    #[test]
    fn test_first_uplink_accepted() {
        assert_eq!(validate_uplink(ADDR, None, 70000, false).unwrap(), 70000);
    }

    #[test]
    fn test_plausibility_window() {
        assert!(is_plausible(None, 10));
        assert!(is_plausible(Some(10), 11));
        assert!(!is_plausible(Some(10), 10));
        assert!(!is_plausible(Some(10), 10 + MAX_FCNT_GAP));
    }

    #[test]
    fn test_allocate_downlink_legacy() {
        let mut c = FrameCounters {
            n_f_cnt_down: 12,
            ..Default::default()
        };
        assert_eq!(
            c.allocate_downlink(MacVersion::V1_0_3, 10).unwrap(),
            (12, DownlinkCounter::Network)
        );
        assert_eq!(c.n_f_cnt_down, 13);
        assert_eq!(c.a_f_cnt_down, 0);
    }

    #[test]
    fn test_allocate_downlink_1_1_uses_app_counter() {
        let mut c = FrameCounters {
            n_f_cnt_down: 3,
            a_f_cnt_down: 7,
            ..Default::default()
        };
        assert_eq!(
            c.allocate_downlink(MacVersion::V1_1_0, 10).unwrap(),
            (7, DownlinkCounter::Application)
        );
        assert_eq!(
            c.allocate_downlink(MacVersion::V1_1_0, 0).unwrap(),
            (3, DownlinkCounter::Network)
        );
    }

    #[test]
    fn test_allocate_downlink_exhausted() {
        let mut c = FrameCounters {
            n_f_cnt_down: u32::MAX,
            ..Default::default()
        };
        assert_eq!(
            c.allocate_downlink(MacVersion::V1_0_2, 1).unwrap_err(),
            Error::CounterExhausted
        );
        assert_eq!(c.n_f_cnt_down, u32::MAX);
    }
}
