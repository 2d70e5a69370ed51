// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

/// A second shutter edge within this window is swallowed.
pub const SHOT_DEBOUNCE_MS: u64 = 2000;

/// The scheduled actions composing one capture shot. The zero-offset work
/// (focus lock, stamp, image name arming) runs synchronously at the press.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimelineAction {
    LightsOut,
    FlashOn,
    StillCapture,
    SpectralData,
    AmbientOn,
    ReleaseFocusLock,
}

/// Delay in milliseconds from the shutter press to each timeline action.
pub const SHOT_TIMELINE: &[(u64, TimelineAction)] = &[
    (100, TimelineAction::LightsOut),
    (200, TimelineAction::FlashOn),
    (2000, TimelineAction::StillCapture),
    (3600, TimelineAction::SpectralData),
    (3800, TimelineAction::LightsOut),
    (4000, TimelineAction::AmbientOn),
    (4000, TimelineAction::ReleaseFocusLock),
];

/// Swallows shutter edges until the debounce window timer clears it again.
#[derive(Default, Debug)]
pub struct ShotDebounce {
    active: bool,
}

impl ShotDebounce {
    /// Report an edge; true when a new shot timeline should start.
    pub fn press(&mut self) -> bool {
        if self.active {
            false
        } else {
            self.active = true;
            true
        }
    }

    pub fn clear(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn edges_within_the_window_yield_one_timeline() {
        let mut debounce = ShotDebounce::default();

        assert!(debounce.press());
        assert!(!debounce.press());
        assert!(!debounce.press());

        debounce.clear();
        assert!(debounce.press());
    }

    #[test]
    fn timeline_is_ordered_and_ends_with_the_release() {
        let mut previous = 0;
        for &(offset, _) in SHOT_TIMELINE {
            assert!(offset >= previous);
            previous = offset;
        }

        assert_eq!(
            SHOT_TIMELINE.last(),
            Some(&(4000, TimelineAction::ReleaseFocusLock)),
        );

        // The focus lock taken at the press is released within the window
        // the capture needs.
        assert!(previous <= 4000);
    }

    #[test]
    fn spectral_run_starts_inside_the_flash_window() {
        let flash_on = SHOT_TIMELINE
            .iter()
            .find(|(_, action)| *action == TimelineAction::FlashOn)
            .map(|(offset, _)| *offset)
            .unwrap();
        let lights_out = SHOT_TIMELINE
            .iter()
            .rev()
            .find(|(_, action)| *action == TimelineAction::LightsOut)
            .map(|(offset, _)| *offset)
            .unwrap();
        let spectral = SHOT_TIMELINE
            .iter()
            .find(|(_, action)| *action == TimelineAction::SpectralData)
            .map(|(offset, _)| *offset)
            .unwrap();

        assert!(flash_on < spectral && spectral < lights_out);
    }
}
