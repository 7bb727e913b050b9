//! Always-listening voice assistant core.
//!
//! Wake-word detection gates a realtime speech-to-speech session: the
//! supervisor idles on the wake stage, then hands the microphone to the
//! realtime agent, which streams utterances up and plays responses back,
//! tolerating barge-in. Subsystem transitions flow over a typed event
//! bus and are coalesced into LED/speakerphone state by the device
//! coordinator.

pub mod audio;
pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod input;
pub mod memory;
pub mod realtime;
pub mod supervisor;
pub mod tools;
pub mod vad;
pub mod wake;
