//! Console input listener for development boxes without the hangup
//! button or volume rocker wired up.
//!
//! Captures keyboard events system-wide using `rdev`: space acts as the
//! hangup button, arrow up/down as the volume rocker. The GPIO driver
//! publishes the same bus events on real hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rdev::{listen, Event, EventType, Key};
use tracing::{info, warn};

use crate::bus::{EventBus, EventPayload};

const SENDER: &str = "console-input";

/// Background keyboard listener publishing device events.
pub struct InputListener {
    running: Arc<AtomicBool>,
}

impl InputListener {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start listening in a background thread.
    pub fn start(&self, bus: EventBus) {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        info!("console input listener started (space = hangup, arrows = volume)");

        thread::spawn(move || {
            let callback = move |event: Event| {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                if let EventType::KeyPress(key) = event.event_type {
                    match key {
                        Key::Space => bus.publish(SENDER, EventPayload::HangupInput),
                        Key::UpArrow => bus.publish(SENDER, EventPayload::VolumeCtrlUp),
                        Key::DownArrow => bus.publish(SENDER, EventPayload::VolumeCtrlDown),
                        _ => {}
                    }
                }
            };

            if let Err(e) = listen(callback) {
                warn!("console input listener error: {:?}", e);
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for InputListener {
    fn default() -> Self {
        Self::new()
    }
}
