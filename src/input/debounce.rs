// Button debounce and hold logic as a pure state machine
//
// Fed with raw edges and timer wake-ups, it returns the intents they produce.
// The multiplexer thread owns one instance; tests drive it with synthetic
// instants.

use std::time::{Duration, Instant};

use super::{Button, InputTiming, Intent, ShutdownRequest, WifiRequest};

#[derive(Debug, Default, Clone)]
struct Track {
    /// Debounced level
    level: bool,
    /// Last raw level seen
    raw: bool,
    /// When `level` last changed
    accepted_at: Option<Instant>,
    /// Debounce window end for a deferred edge
    recheck_at: Option<Instant>,
    /// When the current press was accepted
    pressed_at: Option<Instant>,
}

impl Track {
    fn held_for(&self, now: Instant) -> Option<Duration> {
        self.pressed_at.map(|t| now.saturating_duration_since(t))
    }
}

#[derive(Debug, Clone)]
pub struct InputState {
    timing: InputTiming,
    tracks: [Track; 4],

    /// Cancellation window end after an armed power release
    shutdown_deadline: Option<Instant>,
    /// The press that cancelled shutdown; its release must not re-arm
    swallow_power_release: bool,
    shutdown_confirmed: bool,

    wifi_on: bool,
    wifi_hold_fired: bool,
    wifi_off_deadline: Option<Instant>,

    low_battery_latched: bool,
}

fn index(button: Button) -> usize {
    match button {
        Button::Power => 0,
        Button::Hour => 1,
        Button::Wifi => 2,
        Button::LowBattery => 3,
    }
}

const BUTTONS: [Button; 4] = [Button::Power, Button::Hour, Button::Wifi, Button::LowBattery];

impl InputState {
    pub fn new(timing: InputTiming) -> Self {
        Self {
            timing,
            tracks: Default::default(),
            shutdown_deadline: None,
            swallow_power_release: false,
            shutdown_confirmed: false,
            wifi_on: false,
            wifi_hold_fired: false,
            wifi_off_deadline: None,
            low_battery_latched: false,
        }
    }

    pub fn wifi_on(&self) -> bool {
        self.wifi_on
    }

    /// Tell the state machine the Wi-Fi state changed elsewhere
    /// (e.g. the access point was already up at boot)
    pub fn set_wifi_on(&mut self, on: bool) {
        self.wifi_on = on;
    }

    pub fn shutdown_deadline(&self) -> Option<Instant> {
        self.shutdown_deadline
    }

    /// Raw level change from a button
    pub fn on_edge(&mut self, button: Button, pressed: bool, now: Instant) -> Vec<Intent> {
        let debounce = self.timing.debounce;
        let track = &mut self.tracks[index(button)];
        track.raw = pressed;
        if pressed == track.level {
            return Vec::new();
        }
        if let Some(accepted) = track.accepted_at {
            if now.saturating_duration_since(accepted) < debounce {
                // Re-read the level when the window closes
                track.recheck_at = Some(accepted + debounce);
                return Vec::new();
            }
        }
        self.accept(button, pressed, now)
    }

    /// Fire every timer due at `now`
    pub fn on_timer(&mut self, now: Instant) -> Vec<Intent> {
        let mut out = Vec::new();

        for button in BUTTONS {
            let track = &mut self.tracks[index(button)];
            match track.recheck_at {
                Some(at) if at <= now => {
                    track.recheck_at = None;
                    if track.raw != track.level {
                        let raw = track.raw;
                        out.extend(self.accept(button, raw, now));
                    }
                }
                _ => {}
            }
        }

        if let Some(at) = self.wifi_hold_due() {
            if at <= now {
                self.wifi_hold_fired = true;
                if self.wifi_off_deadline.take().is_some() {
                    out.push(Intent::Wifi(WifiRequest::OffCancelled));
                } else if !self.wifi_on {
                    self.wifi_on = true;
                    out.push(Intent::Wifi(WifiRequest::On));
                }
            }
        }

        if let Some(at) = self.low_battery_due() {
            if at <= now {
                self.low_battery_latched = true;
                out.push(Intent::LowBatteryLatched);
            }
        }

        if let Some(at) = self.shutdown_deadline {
            if at <= now {
                self.shutdown_deadline = None;
                self.shutdown_confirmed = true;
                out.push(Intent::Shutdown(ShutdownRequest::Confirmed));
            }
        }

        if let Some(at) = self.wifi_off_deadline {
            if at <= now {
                self.wifi_off_deadline = None;
                self.wifi_on = false;
                out.push(Intent::Wifi(WifiRequest::Off));
            }
        }

        out
    }

    /// Earliest pending timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        let rechecks = self.tracks.iter().filter_map(|t| t.recheck_at);
        rechecks
            .chain(self.wifi_hold_due())
            .chain(self.low_battery_due())
            .chain(self.shutdown_deadline)
            .chain(self.wifi_off_deadline)
            .min()
    }

    fn wifi_hold_due(&self) -> Option<Instant> {
        if self.wifi_hold_fired {
            return None;
        }
        let track = &self.tracks[index(Button::Wifi)];
        track.pressed_at.map(|t| t + self.timing.hold)
    }

    fn low_battery_due(&self) -> Option<Instant> {
        if self.low_battery_latched {
            return None;
        }
        let track = &self.tracks[index(Button::LowBattery)];
        track.pressed_at.map(|t| t + self.timing.low_battery_hold)
    }

    /// Debounced transition
    fn accept(&mut self, button: Button, pressed: bool, now: Instant) -> Vec<Intent> {
        let track = &mut self.tracks[index(button)];
        let held = track.held_for(now);
        track.level = pressed;
        track.accepted_at = Some(now);
        track.pressed_at = if pressed { Some(now) } else { None };

        match button {
            Button::Hour => vec![Intent::HourOverride(pressed)],
            Button::Power => self.power(pressed, held, now),
            Button::Wifi => self.wifi(pressed, now),
            Button::LowBattery => Vec::new(),
        }
    }

    fn power(&mut self, pressed: bool, held: Option<Duration>, now: Instant) -> Vec<Intent> {
        if self.shutdown_confirmed {
            return Vec::new();
        }
        if pressed {
            if self.shutdown_deadline.take().is_some() {
                self.swallow_power_release = true;
                return vec![Intent::Shutdown(ShutdownRequest::Cancelled)];
            }
            return Vec::new();
        }

        if std::mem::take(&mut self.swallow_power_release) {
            return Vec::new();
        }
        if held.map_or(false, |h| h >= self.timing.power_hold) {
            let deadline = now + self.timing.cancel_window;
            self.shutdown_deadline = Some(deadline);
            return vec![Intent::Shutdown(ShutdownRequest::Armed { deadline })];
        }
        Vec::new()
    }

    fn wifi(&mut self, pressed: bool, now: Instant) -> Vec<Intent> {
        if pressed {
            self.wifi_hold_fired = false;
            return Vec::new();
        }
        // Released before the hold registered: a tap does nothing
        if !std::mem::take(&mut self.wifi_hold_fired) || !self.wifi_on {
            return Vec::new();
        }
        let deadline = now + self.timing.wifi_off_delay;
        self.wifi_off_deadline = Some(deadline);
        vec![Intent::Wifi(WifiRequest::OffAfterDelay { deadline })]
    }
}
