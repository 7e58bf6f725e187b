// Operator input: turns button edges from the GPIO layer into an ordered
// stream of intents for the supervisor

mod debounce;

pub use debounce::InputState;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Raw edges queued between the GPIO threads and the multiplexer
const EDGE_QUEUE: usize = 256;
/// Intents queued for the supervisor
const INTENT_QUEUE: usize = 64;
/// Longest the worker sleeps without a pending timer
const IDLE_WAKE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Power,
    Hour,
    Wifi,
    LowBattery,
}

impl Button {
    pub fn name(&self) -> &'static str {
        match self {
            Button::Power => "power",
            Button::Hour => "hour",
            Button::Wifi => "wifi",
            Button::LowBattery => "low-battery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiRequest {
    On,
    /// Button released; Wi-Fi goes off at `deadline` unless held again
    OffAfterDelay { deadline: Instant },
    OffCancelled,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Power button released after a hold; confirms at `deadline`
    Armed { deadline: Instant },
    Cancelled,
    Confirmed,
    /// Signal or keyboard interrupt; shuts the recorder down, not the OS
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    HourOverride(bool),
    Wifi(WifiRequest),
    Shutdown(ShutdownRequest),
    LowBatteryLatched,
}

/// Debounce and hold durations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputTiming {
    pub debounce: Duration,
    pub hold: Duration,
    pub power_hold: Duration,
    pub low_battery_hold: Duration,
    pub cancel_window: Duration,
    pub wifi_off_delay: Duration,
}

/// One-way flags shared between the input side and the supervisor
#[derive(Debug, Default)]
pub struct Latches {
    shutdown: AtomicBool,
    low_battery: AtomicBool,
}

impl Latches {
    pub fn latch_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn latch_low_battery(&self) {
        self.low_battery.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn low_battery(&self) -> bool {
        self.low_battery.load(Ordering::SeqCst)
    }
}

enum RawEvent {
    Edge { button: Button, pressed: bool },
    External,
    Wake,
}

// ============================================================================
// Producer side
// ============================================================================

/// Cloneable handle given to GPIO threads and the signal listener.
/// Never blocks.
#[derive(Clone)]
pub struct InputHandle {
    tx: Sender<RawEvent>,
    latches: Arc<Latches>,
}

impl InputHandle {
    /// Report a raw level change. Returns false if the queue was full and the
    /// edge was dropped.
    pub fn button_changed(&self, button: Button, pressed: bool) -> bool {
        match self.tx.try_send(RawEvent::Edge { button, pressed }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Input queue full, dropped {} edge", button.name());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// External cancellation (SIGINT/SIGTERM). The latch is set directly so
    /// it holds even if the queue is full.
    pub fn request_external_shutdown(&self) {
        self.latches.latch_shutdown();
        let _ = self.tx.try_send(RawEvent::External);
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Build an intent queue without a worker thread, for callers that produce
/// intents themselves
pub fn intent_channel() -> (Sender<Intent>, IntentReceiver) {
    let (tx, rx) = bounded(INTENT_QUEUE);
    (tx, IntentReceiver { rx })
}

/// The supervisor's end of the intent stream
pub struct IntentReceiver {
    rx: Receiver<Intent>,
}

impl IntentReceiver {
    /// Everything queued right now, in arrival order
    pub fn drain(&self) -> Vec<Intent> {
        self.rx.try_iter().collect()
    }

    /// Block up to `timeout` for the next intent
    pub fn wait(&self, timeout: Duration) -> Option<Intent> {
        match self.rx.recv_timeout(timeout) {
            Ok(intent) => Some(intent),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // No producers left: behave like a plain sleep
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct InputMultiplexer {
    stop_flag: Arc<AtomicBool>,
    wake: Sender<RawEvent>,
    handle: Option<JoinHandle<()>>,
    latches: Arc<Latches>,
}

impl InputMultiplexer {
    /// Start the worker thread. `wifi_on` seeds the multiplexer's view of the
    /// access point.
    pub fn spawn(
        timing: InputTiming,
        wifi_on: bool,
        latches: Arc<Latches>,
    ) -> std::io::Result<(Self, InputHandle, IntentReceiver)> {
        let (edge_tx, edge_rx) = bounded(EDGE_QUEUE);
        let (intent_tx, intents) = intent_channel();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let mut state = InputState::new(timing);
        state.set_wifi_on(wifi_on);

        let worker_stop = stop_flag.clone();
        let worker_latches = latches.clone();
        let handle = std::thread::Builder::new()
            .name("trafficcam-input".into())
            .spawn(move || {
                run_worker(state, edge_rx, intent_tx, worker_latches, worker_stop);
            })?;

        let input = InputHandle {
            tx: edge_tx.clone(),
            latches: latches.clone(),
        };
        Ok((
            Self {
                stop_flag,
                wake: edge_tx,
                handle: Some(handle),
                latches,
            },
            input,
            intents,
        ))
    }

    pub fn latches(&self) -> Arc<Latches> {
        self.latches.clone()
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(RawEvent::Wake);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InputMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut state: InputState,
    edges: Receiver<RawEvent>,
    intents: Sender<Intent>,
    latches: Arc<Latches>,
    stop_flag: Arc<AtomicBool>,
) {
    log::debug!("Input multiplexer started");

    while !stop_flag.load(Ordering::SeqCst) {
        let wake_at = state
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE)
            .min(Instant::now() + IDLE_WAKE);

        let mut produced = match edges.recv_deadline(wake_at) {
            Ok(RawEvent::Edge { button, pressed }) => {
                log::debug!(
                    "{} button {}",
                    button.name(),
                    if pressed { "pressed" } else { "released" }
                );
                state.on_edge(button, pressed, Instant::now())
            }
            Ok(RawEvent::External) => vec![Intent::Shutdown(ShutdownRequest::External)],
            Ok(RawEvent::Wake) => Vec::new(),
            Err(RecvTimeoutError::Timeout) => state.on_timer(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        // Timers must not starve behind a stream of edges
        let now = Instant::now();
        if state.next_deadline().map_or(false, |d| d <= now) {
            produced.extend(state.on_timer(now));
        }

        for intent in produced {
            // The shutdown latch belongs to the supervisor (and the signal
            // path): setting it here would race the Confirmed intent
            if intent == Intent::LowBatteryLatched {
                latches.latch_low_battery();
            }
            log::info!("Operator intent: {:?}", intent);
            if !deliver(&intents, intent, &stop_flag) {
                log::debug!("Intent receiver gone, input multiplexer exiting");
                return;
            }
        }
    }

    log::debug!("Input multiplexer stopped");
}

/// Blocking send that still honours the stop flag. Blocking is fine here:
/// this is not a hardware callback thread.
fn deliver(intents: &Sender<Intent>, intent: Intent, stop_flag: &AtomicBool) -> bool {
    let mut pending = intent;
    loop {
        match intents.send_timeout(pending, IDLE_WAKE) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop_flag.load(Ordering::SeqCst) {
                    return false;
                }
                pending = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
