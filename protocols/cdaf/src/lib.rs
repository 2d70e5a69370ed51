// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Continuous contrast-detection autofocus for the spectral camera.
//!
//! The crate includes the finite state machine which hunts the best lens
//! position by comparing sharpness samples taken at stepped focus indices,
//! then watches for focus drift once a peak is confirmed. Each admitted
//! frame drives the machine by exactly one tick.

use glib::Error;

/// The lowest focus index the voice coil accepts.
pub const MIN_FOCUS_INDEX: u16 = 50;

/// The highest focus index the voice coil accepts.
pub const MAX_FOCUS_INDEX: u16 = 900;

/// The index step used while transiting between scan start points.
pub const TRANSIT_STEP: i32 = 10;

/// The focus index commanded before the first frame is admitted.
pub const INITIAL_FOCUS_INDEX: u16 = 280;

const COARSE_SCAN_STEP: i32 = 10;
const DETAIL_SCAN_STEP: i32 = 2;
const DRIFT_SCAN_STEP: i32 = 5;

// A drift scan gives up after this many samples without a usable peak.
const DRIFT_SCAN_LIMIT: usize = 50;

/// Clamp an index computation into the range the voice coil accepts.
pub fn clamp_focus_index(index: i32) -> u16 {
    if index < MIN_FOCUS_INDEX as i32 {
        MIN_FOCUS_INDEX
    } else if index > MAX_FOCUS_INDEX as i32 {
        MAX_FOCUS_INDEX
    } else {
        index as u16
    }
}

/// The operation to command the lens voice coil position.
pub trait FocusActuator {
    fn set_focus(&mut self, index: u16) -> Result<(), Error>;
}

/// The notifications the machine raises towards the frame gate.
pub trait FocusObserver {
    /// Focus is confirmed; the sample of the current frame becomes the
    /// reference sharpness.
    fn focus_achieved(&mut self);

    /// Whether the machine is scanning, and the cadence at which it wants
    /// the next focus frame.
    fn set_scanning(&mut self, scanning: bool, timeout_ms: u32);
}

/// One scanning pass; focus indices paired with the sharpness sampled there.
#[derive(Default, Debug, Clone)]
pub struct FocusRun {
    indices: Vec<u16>,
    values: Vec<f32>,
}

impl FocusRun {
    fn push(&mut self, index: u16, value: f32) {
        self.indices.push(index);
        self.values.push(value);
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn index_at(&self, pos: usize) -> u16 {
        self.indices[pos]
    }

    /// The position of the largest sampled value. Ties resolve to the
    /// earliest position.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (pos, value) in self.values.iter().enumerate() {
            match best {
                Some(b) if self.values[b] >= *value => (),
                _ => best = Some(pos),
            }
        }
        best
    }
}

/// The state of the focus hunt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FocusState {
    Transit,
    StartScanFocusIn,
    ScanFocusIn,
    StartScanFocusOut,
    ScanFocusOut,
    StartDetailScan,
    DetailScan,
    SetFocus,
    GrabFocusValue,
    StartDriftScanning,
    ConfirmDriftDirection,
    DriftScanForPeak,
}

impl Default for FocusState {
    fn default() -> Self {
        Self::Transit
    }
}

/// The autofocus machine. One call to [`FocusMachine::run_focus`] per
/// admitted frame advances the active state and writes the resulting index
/// to the actuator.
#[derive(Debug, Clone)]
pub struct FocusMachine {
    state: FocusState,
    focus_index: i32,
    focus_step: i32,
    boundary: bool,
    transit_to: i32,
    transit_to_detail: bool,
    detail_scan_min: i32,
    detail_scan_max: i32,
    chase_focus: u32,
    moving_focus_in: bool,
    scan_in: FocusRun,
    scan_out: FocusRun,
}

impl Default for FocusMachine {
    fn default() -> Self {
        Self {
            state: FocusState::default(),
            focus_index: INITIAL_FOCUS_INDEX as i32,
            focus_step: COARSE_SCAN_STEP,
            boundary: false,
            transit_to: MAX_FOCUS_INDEX as i32,
            transit_to_detail: false,
            detail_scan_min: MIN_FOCUS_INDEX as i32,
            detail_scan_max: MAX_FOCUS_INDEX as i32,
            chase_focus: 0,
            moving_focus_in: true,
            scan_in: Default::default(),
            scan_out: Default::default(),
        }
    }
}

impl FocusMachine {
    pub fn state(&self) -> FocusState {
        self.state
    }

    /// The index the lens is currently commanded to.
    pub fn focus_index(&self) -> u16 {
        clamp_focus_index(self.focus_index)
    }

    /// Advance the machine by one frame tick and actuate the result.
    pub fn run_focus(
        &mut self,
        sample: f32,
        observer: &mut impl FocusObserver,
        actuator: &mut impl FocusActuator,
    ) -> Result<(), Error> {
        self.advance(sample, observer);
        actuator.set_focus(clamp_focus_index(self.focus_index))
    }

    fn advance(&mut self, sample: f32, observer: &mut impl FocusObserver) {
        match self.state {
            FocusState::Transit => self.transit(observer),
            FocusState::StartScanFocusIn => self.start_scan_focus_in(observer),
            FocusState::ScanFocusIn => self.scan_focus_in(sample),
            FocusState::StartScanFocusOut => self.start_scan_focus_out(observer),
            FocusState::ScanFocusOut => self.scan_focus_out(sample),
            FocusState::StartDetailScan => self.start_detail_scan(observer),
            FocusState::DetailScan => self.detail_scan(sample),
            FocusState::SetFocus => self.set_focus(observer),
            FocusState::GrabFocusValue => self.grab_focus_value(observer),
            FocusState::StartDriftScanning => self.start_drift_scanning(observer),
            FocusState::ConfirmDriftDirection => self.confirm_drift_direction(sample),
            FocusState::DriftScanForPeak => self.drift_scan_for_peak(sample, observer),
        }
    }

    // Step the lens towards the pending target, then branch to the scan the
    // target was staged for.
    fn transit(&mut self, observer: &mut impl FocusObserver) {
        observer.set_scanning(false, 250);

        let travel_remaining = self.transit_to - self.focus_index;
        if travel_remaining.abs() > TRANSIT_STEP {
            if travel_remaining > 0 {
                self.focus_index += TRANSIT_STEP;
            } else {
                self.focus_index -= TRANSIT_STEP;
            }
        } else {
            self.focus_index = self.transit_to;
            self.state = if self.transit_to_detail {
                FocusState::StartDetailScan
            } else {
                FocusState::StartScanFocusIn
            };
        }
    }

    fn start_scan_focus_in(&mut self, observer: &mut impl FocusObserver) {
        self.scan_in.clear();
        self.focus_step = COARSE_SCAN_STEP;
        self.focus_index = MAX_FOCUS_INDEX as i32;
        self.boundary = false;
        observer.set_scanning(true, 100);
        self.state = FocusState::ScanFocusIn;
    }

    fn scan_focus_in(&mut self, sample: f32) {
        self.scan_in.push(self.focus_index as u16, sample);

        if !self.boundary {
            self.focus_index -= self.focus_step;
        } else {
            self.state = FocusState::StartScanFocusOut;
            self.focus_index = MIN_FOCUS_INDEX as i32;
        }

        if self.focus_index <= MIN_FOCUS_INDEX as i32 {
            self.boundary = true;
            self.focus_index = MIN_FOCUS_INDEX as i32;
        }
    }

    fn start_scan_focus_out(&mut self, observer: &mut impl FocusObserver) {
        self.scan_out.clear();
        self.focus_step = COARSE_SCAN_STEP;
        self.focus_index = MIN_FOCUS_INDEX as i32;
        self.boundary = false;
        observer.set_scanning(true, 100);
        self.state = FocusState::ScanFocusOut;
    }

    // The outward pass closes the coarse hunt; the two peaks bracket the
    // window the detail scan refines.
    fn scan_focus_out(&mut self, sample: f32) {
        self.scan_out.push(self.focus_index as u16, sample);

        if !self.boundary {
            self.focus_index += self.focus_step;
        } else {
            let in_peak = self
                .scan_in
                .argmax()
                .map(|pos| self.scan_in.index_at(pos) as i32)
                .unwrap_or(MAX_FOCUS_INDEX as i32);
            let out_peak = self
                .scan_out
                .argmax()
                .map(|pos| self.scan_out.index_at(pos) as i32)
                .unwrap_or(MIN_FOCUS_INDEX as i32);

            self.detail_scan_max = (in_peak + 10).min(MAX_FOCUS_INDEX as i32);
            self.detail_scan_min = (out_peak - 10).max(MIN_FOCUS_INDEX as i32);

            self.transit_to = self.detail_scan_max;
            self.transit_to_detail = true;
            self.state = FocusState::Transit;
            self.focus_index = MAX_FOCUS_INDEX as i32;
        }

        if self.focus_index >= MAX_FOCUS_INDEX as i32 {
            self.boundary = true;
            self.focus_index = MAX_FOCUS_INDEX as i32;
        }
    }

    fn start_detail_scan(&mut self, observer: &mut impl FocusObserver) {
        self.scan_in.clear();
        self.scan_out.clear();
        self.focus_step = DETAIL_SCAN_STEP;
        self.focus_index = self.detail_scan_max;
        self.boundary = false;
        observer.set_scanning(true, 150);
        self.state = FocusState::DetailScan;
    }

    fn detail_scan(&mut self, sample: f32) {
        self.scan_in.push(self.focus_index as u16, sample);

        if !self.boundary {
            self.focus_index -= self.focus_step;
        } else {
            self.state = FocusState::SetFocus;
            self.focus_index = self.detail_scan_min;
        }

        if self.focus_index <= self.detail_scan_min {
            self.boundary = true;
            self.focus_index = self.detail_scan_min;
        }
    }

    // A peak at either edge of the detail window means the best index lies
    // outside it; chase the peak by shifting the window, up to two times
    // before falling back to a full restart.
    fn set_focus(&mut self, observer: &mut impl FocusObserver) {
        let pos = match self.scan_in.argmax() {
            Some(pos) => pos,
            None => return,
        };
        let peak_index = self.scan_in.index_at(pos) as i32;

        if pos == 0 || pos == self.scan_in.len() - 1 {
            self.chase_focus += 1;

            if pos == 0 {
                self.detail_scan_max = peak_index + 40;
                self.detail_scan_min = peak_index;
            } else {
                self.detail_scan_max = peak_index;
                self.detail_scan_min = peak_index - 40;
            }
        } else {
            self.chase_focus = 0;
            self.detail_scan_max = peak_index + 20;
            self.detail_scan_min = peak_index - 20;
        }

        if self.detail_scan_max > MAX_FOCUS_INDEX as i32 {
            self.detail_scan_max = MAX_FOCUS_INDEX as i32;
        }
        if self.detail_scan_min < MIN_FOCUS_INDEX as i32 {
            self.detail_scan_min = MIN_FOCUS_INDEX as i32;
        }

        self.focus_index = peak_index;

        if self.chase_focus == 0 {
            observer.set_scanning(true, 300);
            self.state = FocusState::GrabFocusValue;
        } else if self.chase_focus > 2 {
            self.chase_focus = 0;
            self.transit_to_detail = false;
            self.transit_to = MAX_FOCUS_INDEX as i32;
            self.state = FocusState::Transit;
        } else {
            self.state = FocusState::StartDetailScan;
        }
    }

    fn grab_focus_value(&mut self, observer: &mut impl FocusObserver) {
        observer.focus_achieved();
        observer.set_scanning(false, 250);
        self.state = FocusState::StartDriftScanning;
    }

    fn start_drift_scanning(&mut self, observer: &mut impl FocusObserver) {
        self.scan_in.clear();
        self.scan_out.clear();
        self.focus_step = DRIFT_SCAN_STEP;
        self.boundary = false;
        self.moving_focus_in = true;
        observer.set_scanning(true, 150);
        self.state = FocusState::ConfirmDriftDirection;
    }

    // Probe inward first; if sharpness only worsened over the first five
    // samples the drift went the other way, so flip and scan fresh.
    fn confirm_drift_direction(&mut self, sample: f32) {
        self.scan_in.push(self.focus_index as u16, sample);

        if self.scan_in.len() >= 5 {
            let max_at_start = self.scan_in.argmax().map(|pos| pos <= 2).unwrap_or(false);
            if max_at_start {
                self.moving_focus_in = false;
                self.scan_in.clear();
            }
            self.state = FocusState::DriftScanForPeak;
        }

        self.focus_index -= self.focus_step;
        if self.focus_index < MIN_FOCUS_INDEX as i32 {
            self.focus_index = MIN_FOCUS_INDEX as i32;
            self.transit_to_detail = false;
            self.transit_to = MAX_FOCUS_INDEX as i32;
            self.state = FocusState::Transit;
        }
    }

    // Keep stepping while the maximum stays recent; once the peak is five
    // samples behind, it is the focus. Hitting a range boundary or running
    // past the sample limit abandons the drift scan for a full restart.
    fn drift_scan_for_peak(&mut self, sample: f32, observer: &mut impl FocusObserver) {
        self.scan_in.push(self.focus_index as u16, sample);

        let pos = match self.scan_in.argmax() {
            Some(pos) => pos,
            None => return,
        };
        let since_peak = self.scan_in.len() - pos;

        if since_peak < 5 {
            if self.moving_focus_in {
                self.focus_index -= self.focus_step;
                if self.focus_index < MIN_FOCUS_INDEX as i32 {
                    self.boundary = true;
                    self.focus_index = MIN_FOCUS_INDEX as i32;
                }
            } else {
                self.focus_index += self.focus_step;
                if self.focus_index > MAX_FOCUS_INDEX as i32 {
                    self.boundary = true;
                    self.focus_index = MAX_FOCUS_INDEX as i32;
                }
            }

            if self.scan_in.len() > DRIFT_SCAN_LIMIT || self.boundary {
                self.transit_to_detail = false;
                self.transit_to = MAX_FOCUS_INDEX as i32;
                self.state = FocusState::Transit;
            }
        } else {
            self.focus_index = self.scan_in.index_at(pos) as i32;
            observer.set_scanning(true, 300);
            self.state = FocusState::GrabFocusValue;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct TestGate {
        scanning: bool,
        timeout_ms: u32,
        achieved: u32,
    }

    impl FocusObserver for TestGate {
        fn focus_achieved(&mut self) {
            self.achieved += 1;
        }

        fn set_scanning(&mut self, scanning: bool, timeout_ms: u32) {
            self.scanning = scanning;
            self.timeout_ms = timeout_ms;
        }
    }

    #[derive(Default)]
    struct TestLens {
        writes: Vec<u16>,
    }

    impl FocusActuator for TestLens {
        fn set_focus(&mut self, index: u16) -> Result<(), Error> {
            self.writes.push(index);
            Ok(())
        }
    }

    fn sharpness_peaked_at(peak: i32) -> impl Fn(u16) -> f32 {
        move |index| 2000.0 - (index as i32 - peak).abs() as f32
    }

    fn drive_until(
        machine: &mut FocusMachine,
        gate: &mut TestGate,
        lens: &mut TestLens,
        target: FocusState,
        sharpness: &dyn Fn(u16) -> f32,
        limit: usize,
    ) -> bool {
        for _ in 0..limit {
            let sample = sharpness(machine.focus_index());
            machine.run_focus(sample, gate, lens).unwrap();
            if machine.state() == target {
                return true;
            }
        }
        false
    }

    #[test]
    fn clamp_focus_index_bounds() {
        assert_eq!(clamp_focus_index(30), MIN_FOCUS_INDEX);
        assert_eq!(clamp_focus_index(1000), MAX_FOCUS_INDEX);
        assert_eq!(clamp_focus_index(560), 560);
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        let mut run = FocusRun::default();
        run.push(100, 1.0);
        run.push(110, 3.0);
        run.push(120, 3.0);
        run.push(130, 2.0);
        assert_eq!(run.argmax(), Some(1));
    }

    #[test]
    fn transit_steps_and_snaps_to_target() {
        let mut machine = FocusMachine::default();
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        let sharpness = sharpness_peaked_at(420);

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::StartScanFocusIn,
            &sharpness,
            62,
        ));
        assert_eq!(machine.focus_index(), MAX_FOCUS_INDEX);
        assert!(!gate.scanning);
    }

    #[test]
    fn coarse_scan_covers_every_index_once() {
        let mut machine = FocusMachine::default();
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        let sharpness = sharpness_peaked_at(420);

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::StartScanFocusOut,
            &sharpness,
            200,
        ));

        let expected: Vec<u16> = (0..)
            .map(|i| MAX_FOCUS_INDEX - 10 * i)
            .take_while(|&i| i >= MIN_FOCUS_INDEX)
            .collect();
        assert_eq!(machine.scan_in.indices, expected);
        assert_eq!(machine.scan_in.len(), 86);
    }

    #[test]
    fn cold_focus_finds_single_peak() {
        let mut machine = FocusMachine::default();
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        let sharpness = sharpness_peaked_at(420);

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::GrabFocusValue,
            &sharpness,
            500,
        ));

        assert_eq!(machine.focus_index(), 420);
        assert_eq!(machine.detail_scan_max, 440);
        assert_eq!(machine.detail_scan_min, 400);
        assert!(!machine.scan_in.is_empty());
        assert!(gate.scanning);
        assert_eq!(gate.timeout_ms, 300);

        // The tick in GrabFocusValue raises the notification exactly once.
        let sample = sharpness(machine.focus_index());
        machine.run_focus(sample, &mut gate, &mut lens).unwrap();
        assert_eq!(gate.achieved, 1);
        assert_eq!(machine.state(), FocusState::StartDriftScanning);
        assert!(!gate.scanning);
        assert_eq!(gate.timeout_ms, 250);

        assert!(lens.writes.iter().all(|&index| {
            index >= MIN_FOCUS_INDEX && index <= MAX_FOCUS_INDEX
        }));
    }

    #[test]
    fn boundary_peak_chases_then_restarts() {
        let mut machine = FocusMachine::default();
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        // Sharpest at the low stop; every detail window argmax lands on an
        // edge, so the chase count runs out.
        let sharpness = sharpness_peaked_at(MIN_FOCUS_INDEX as i32);

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::ScanFocusOut,
            &sharpness,
            300,
        ));

        // The machine must come back around to a fresh coarse scan without
        // ever confirming focus.
        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::ScanFocusIn,
            &sharpness,
            500,
        ));
        assert_eq!(gate.achieved, 0);
        assert_eq!(machine.chase_focus, 0);
    }

    #[test]
    fn detail_edge_peak_shifts_window() {
        let mut machine = FocusMachine::default();
        machine.state = FocusState::SetFocus;
        machine.scan_in.push(460, 5.0);
        machine.scan_in.push(458, 4.0);
        machine.scan_in.push(456, 3.0);
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();

        machine.run_focus(0.0, &mut gate, &mut lens).unwrap();

        assert_eq!(machine.chase_focus, 1);
        assert_eq!(machine.detail_scan_min, 460);
        assert_eq!(machine.detail_scan_max, 500);
        assert_eq!(machine.focus_index(), 460);
        assert_eq!(machine.state(), FocusState::StartDetailScan);
    }

    #[test]
    fn detail_interior_peak_confirms_focus() {
        let mut machine = FocusMachine::default();
        machine.state = FocusState::SetFocus;
        machine.scan_in.push(424, 3.0);
        machine.scan_in.push(422, 4.0);
        machine.scan_in.push(420, 5.0);
        machine.scan_in.push(418, 4.5);
        machine.scan_in.push(416, 3.5);
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();

        machine.run_focus(0.0, &mut gate, &mut lens).unwrap();

        assert_eq!(machine.chase_focus, 0);
        assert_eq!(machine.detail_scan_min, 400);
        assert_eq!(machine.detail_scan_max, 440);
        assert_eq!(machine.state(), FocusState::GrabFocusValue);
        assert!(gate.scanning);
        assert_eq!(gate.timeout_ms, 300);
        assert_eq!(lens.writes, vec![420]);
    }

    #[test]
    fn drift_scan_flips_direction_and_finds_peak() {
        let mut machine = FocusMachine::default();
        machine.state = FocusState::StartDriftScanning;
        machine.focus_index = 400;
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        // The peak sits above the start point, so the initial inward probe
        // is the wrong way.
        let sharpness = sharpness_peaked_at(420);

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::GrabFocusValue,
            &sharpness,
            50,
        ));
        assert!(!machine.moving_focus_in);
        assert_eq!(machine.focus_index(), 420);
    }

    #[test]
    fn drift_scan_gives_up_at_boundary() {
        let mut machine = FocusMachine::default();
        machine.state = FocusState::DriftScanForPeak;
        machine.moving_focus_in = false;
        machine.focus_index = 880;
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        // Monotone towards the high stop keeps the maximum on the newest
        // sample until the boundary is hit.
        let sharpness = |index: u16| index as f32;

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::Transit,
            &sharpness,
            20,
        ));
        assert_eq!(machine.transit_to, MAX_FOCUS_INDEX as i32);
        assert!(!machine.transit_to_detail);
        assert_eq!(gate.achieved, 0);
    }

    #[test]
    fn drift_scan_gives_up_after_sample_limit() {
        let mut machine = FocusMachine::default();
        machine.state = FocusState::DriftScanForPeak;
        machine.moving_focus_in = true;
        machine.focus_index = MAX_FOCUS_INDEX as i32;
        let mut gate = TestGate::default();
        let mut lens = TestLens::default();
        // Sharpness keeps improving inward, so no peak ever falls behind.
        let sharpness = |index: u16| 2000.0 - index as f32;

        assert!(drive_until(
            &mut machine,
            &mut gate,
            &mut lens,
            FocusState::Transit,
            &sharpness,
            60,
        ));
        assert_eq!(machine.scan_in.len(), DRIFT_SCAN_LIMIT + 1);
        assert_eq!(machine.transit_to, MAX_FOCUS_INDEX as i32);
    }
}
