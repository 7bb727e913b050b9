//! Device state coordinator.
//!
//! Subscribes to the event bus and coalesces subsystem transitions into
//! device-visible feedback: LED colour, speakerphone call state, and
//! playback volume. The actual GPIO/HID drivers live outside the core;
//! they implement [`LedDriver`] and [`Speakerphone`], and the defaults
//! here just trace.

pub mod volume;

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::bus::{EventBus, EventKind, EventPayload};

use volume::VolumeControl;

const SENDER: &str = "device-coordinator";

/// LED ring colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Off,
    Red,
    Blue,
    /// Brightness follows the speaker meter level.
    Green { brightness: u8 },
    LightGreen,
    Orange,
    Yellow,
    White,
}

/// Aggregated device-visible state flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFlags {
    pub shutdown: bool,
    pub error: bool,
    pub function_invoking: bool,
    pub talk_level: Option<u8>,
    pub listening: bool,
    pub wake_word_detected: bool,
    pub noise_detected: bool,
    pub night_mode: bool,
}

/// Resolve the LED colour for the current flags. Highest priority wins.
pub fn led_color(flags: &DeviceFlags, default: LedColor) -> LedColor {
    if flags.shutdown {
        LedColor::Off
    } else if flags.error {
        LedColor::Red
    } else if flags.function_invoking {
        LedColor::Blue
    } else if let Some(level) = flags.talk_level {
        LedColor::Green { brightness: level }
    } else if flags.listening {
        LedColor::LightGreen
    } else if flags.wake_word_detected {
        LedColor::Orange
    } else if flags.noise_detected {
        LedColor::Yellow
    } else if flags.night_mode {
        LedColor::Off
    } else {
        default
    }
}

/// LED ring driver surface.
pub trait LedDriver: Send + Sync {
    fn set_color(&self, color: LedColor);
}

/// USB-HID speakerphone driver surface.
pub trait Speakerphone: Send + Sync {
    fn set_call_active(&self, active: bool);
}

/// Tracing-only LED driver used when no GPIO hardware is wired up.
pub struct LogLedDriver;

impl LedDriver for LogLedDriver {
    fn set_color(&self, color: LedColor) {
        debug!(?color, "led colour");
    }
}

/// Tracing-only speakerphone driver.
pub struct LogSpeakerphone;

impl Speakerphone for LogSpeakerphone {
    fn set_call_active(&self, active: bool) {
        debug!(active, "speakerphone call state");
    }
}

struct CoordinatorInner {
    flags: Mutex<DeviceFlags>,
    /// Idle colour; adjustable at runtime (eye-colour tool).
    default_color: Mutex<LedColor>,
    led: Box<dyn LedDriver>,
    phone: Box<dyn Speakerphone>,
    volume: Box<dyn VolumeControl>,
}

impl CoordinatorInner {
    fn refresh_led(&self) {
        let flags = self.flags.lock().unwrap().clone();
        let default = *self.default_color.lock().unwrap();
        self.led.set_color(led_color(&flags, default));
    }

    fn update<F: FnOnce(&mut DeviceFlags)>(&self, f: F) {
        {
            let mut flags = self.flags.lock().unwrap();
            f(&mut flags);
        }
        self.refresh_led();
    }
}

/// Maps bus events to LED colour, call state, and volume.
#[derive(Clone)]
pub struct DeviceCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DeviceCoordinator {
    pub fn new(
        led: Box<dyn LedDriver>,
        phone: Box<dyn Speakerphone>,
        volume: Box<dyn VolumeControl>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                flags: Mutex::new(DeviceFlags::default()),
                default_color: Mutex::new(LedColor::White),
                led,
                phone,
                volume,
            }),
        }
    }

    /// Subscribe to every event the coordinator reacts to.
    pub fn start(&self, bus: &EventBus) {
        let inner = Arc::clone(&self.inner);
        let handler: crate::bus::Handler = Arc::new(move |event| {
            match &event.payload {
                EventPayload::Shutdown => {
                    inner.phone.set_call_active(false);
                    inner.update(|f| f.shutdown = true);
                }
                EventPayload::SystemError { .. } => inner.update(|f| f.error = true),
                EventPayload::SystemOk => inner.update(|f| f.error = false),
                EventPayload::FunctionInvoking { .. } => {
                    inner.update(|f| f.function_invoking = true)
                }
                EventPayload::FunctionInvoked { .. } => {
                    inner.update(|f| f.function_invoking = false)
                }
                EventPayload::TalkLevel(level) => {
                    let level = *level;
                    inner.update(|f| f.talk_level = level);
                }
                EventPayload::StartListening => {
                    inner.phone.set_call_active(true);
                    inner.update(|f| {
                        f.listening = true;
                        f.wake_word_detected = false;
                    });
                }
                EventPayload::StopListening => {
                    inner.phone.set_call_active(false);
                    inner.update(|f| {
                        f.listening = false;
                        f.wake_word_detected = false;
                        f.talk_level = None;
                    });
                }
                EventPayload::WakeWordDetected { .. } => {
                    inner.update(|f| f.wake_word_detected = true)
                }
                EventPayload::NoiseDetected => inner.update(|f| f.noise_detected = true),
                EventPayload::SilenceDetected => inner.update(|f| f.noise_detected = false),
                EventPayload::NightModeActivated => inner.update(|f| f.night_mode = true),
                EventPayload::NightModeDeactivated => inner.update(|f| f.night_mode = false),
                EventPayload::VolumeCtrlUp => {
                    let level = inner.volume.get_playback_volume();
                    inner.volume.set_playback_volume((level + 1).min(10));
                    info!(level = level + 1, "volume up");
                }
                EventPayload::VolumeCtrlDown => {
                    let level = inner.volume.get_playback_volume();
                    inner.volume.set_playback_volume(level.saturating_sub(1));
                    info!(level = level.saturating_sub(1), "volume down");
                }
                EventPayload::ConfigChanged | EventPayload::HangupInput => {}
            }
        });

        for kind in [
            EventKind::Shutdown,
            EventKind::SystemError,
            EventKind::SystemOk,
            EventKind::FunctionInvoking,
            EventKind::FunctionInvoked,
            EventKind::TalkLevel,
            EventKind::StartListening,
            EventKind::StopListening,
            EventKind::WakeWordDetected,
            EventKind::NoiseDetected,
            EventKind::SilenceDetected,
            EventKind::NightModeActivated,
            EventKind::NightModeDeactivated,
            EventKind::VolumeCtrlUp,
            EventKind::VolumeCtrlDown,
        ] {
            bus.subscribe(kind, handler.clone());
        }
    }

    /// Apply boot-time state: startup volume and the idle LED colour.
    pub fn apply_startup(&self, startup_volume: u8) {
        self.inner.volume.set_playback_volume(startup_volume.min(10));
        self.inner.refresh_led();
        info!(volume = startup_volume, "startup state applied");
    }

    /// Logical playback volume, for the system tool.
    pub fn volume_level(&self) -> u8 {
        self.inner.volume.get_playback_volume()
    }

    /// Set logical playback volume directly (system tool).
    pub fn set_volume_level(&self, level: u8) {
        self.inner.volume.set_playback_volume(level.min(10));
    }

    /// Current hardware gain fraction for wiring into the speaker.
    pub fn gain(&self) -> f32 {
        self.inner.volume.gain()
    }

    /// Change the idle LED colour (eye-colour tool).
    pub fn set_default_color(&self, color: LedColor) {
        *self.inner.default_color.lock().unwrap() = color;
        self.inner.refresh_led();
    }

    pub fn default_color(&self) -> LedColor {
        *self.inner.default_color.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use volume::SoftwareVolume;

    #[test]
    fn priority_table() {
        let mut flags = DeviceFlags {
            shutdown: true,
            error: true,
            function_invoking: true,
            talk_level: Some(100),
            listening: true,
            wake_word_detected: true,
            noise_detected: true,
            night_mode: true,
        };

        assert_eq!(led_color(&flags, LedColor::White), LedColor::Off);
        flags.shutdown = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::Red);
        flags.error = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::Blue);
        flags.function_invoking = false;
        assert_eq!(
            led_color(&flags, LedColor::White),
            LedColor::Green { brightness: 100 }
        );
        flags.talk_level = None;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::LightGreen);
        flags.listening = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::Orange);
        flags.wake_word_detected = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::Yellow);
        flags.noise_detected = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::Off);
        flags.night_mode = false;
        assert_eq!(led_color(&flags, LedColor::White), LedColor::White);
    }

    struct RecordingLed(Mutex<Vec<LedColor>>);

    impl LedDriver for Arc<RecordingLed> {
        fn set_color(&self, color: LedColor) {
            self.0.lock().unwrap().push(color);
        }
    }

    struct RecordingPhone(Mutex<Vec<bool>>);

    impl Speakerphone for Arc<RecordingPhone> {
        fn set_call_active(&self, active: bool) {
            self.0.lock().unwrap().push(active);
        }
    }

    fn wired() -> (EventBus, DeviceCoordinator, Arc<RecordingLed>, Arc<RecordingPhone>) {
        let bus = EventBus::new();
        let led = Arc::new(RecordingLed(Mutex::new(Vec::new())));
        let phone = Arc::new(RecordingPhone(Mutex::new(Vec::new())));
        let coordinator = DeviceCoordinator::new(
            Box::new(led.clone()),
            Box::new(phone.clone()),
            Box::new(SoftwareVolume::new()),
        );
        coordinator.start(&bus);
        (bus, coordinator, led, phone)
    }

    #[test]
    fn listening_turns_call_on_and_led_light_green() {
        let (bus, _coordinator, led, phone) = wired();

        bus.publish("test", EventPayload::StartListening);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::LightGreen);
        assert_eq!(*phone.0.lock().unwrap(), vec![true]);

        bus.publish("test", EventPayload::StopListening);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::White);
        assert_eq!(*phone.0.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn talk_level_overrides_listening() {
        let (bus, _coordinator, led, _phone) = wired();

        bus.publish("test", EventPayload::StartListening);
        bus.publish("test", EventPayload::TalkLevel(Some(42)));
        assert_eq!(
            *led.0.lock().unwrap().last().unwrap(),
            LedColor::Green { brightness: 42 }
        );

        bus.publish("test", EventPayload::TalkLevel(None));
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::LightGreen);
    }

    #[test]
    fn error_persists_until_system_ok() {
        let (bus, _coordinator, led, _phone) = wired();

        bus.publish("test", EventPayload::SystemError {
            message: "boom".into(),
        });
        bus.publish("test", EventPayload::StartListening);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::Red);

        bus.publish("test", EventPayload::SystemOk);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::LightGreen);
    }

    #[test]
    fn volume_events_step_the_mixer() {
        let (bus, coordinator, _led, _phone) = wired();
        coordinator.apply_startup(5);
        bus.publish("test", EventPayload::VolumeCtrlUp);
        assert_eq!(coordinator.volume_level(), 6);
        bus.publish("test", EventPayload::VolumeCtrlDown);
        bus.publish("test", EventPayload::VolumeCtrlDown);
        assert_eq!(coordinator.volume_level(), 4);
    }

    #[test]
    fn shutdown_wins_over_everything() {
        let (bus, _coordinator, led, phone) = wired();
        bus.publish("test", EventPayload::StartListening);
        bus.publish("test", EventPayload::Shutdown);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::Off);
        assert_eq!(*phone.0.lock().unwrap().last().unwrap(), false);
    }

    #[test]
    fn eye_colour_changes_idle_default() {
        let (bus, coordinator, led, _phone) = wired();
        coordinator.set_default_color(LedColor::Blue);
        bus.publish("test", EventPayload::SystemOk);
        assert_eq!(*led.0.lock().unwrap().last().unwrap(), LedColor::Blue);
    }
}
