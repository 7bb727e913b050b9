//! The closed plugin set.
//!
//! Each variant carries what it needs to run; dispatch is a plain match,
//! no runtime reflection. Network-backed plugins (GeoIp, Weather) talk
//! to public endpoints and surface failures as tool errors.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::bus::{EventBus, EventPayload};
use crate::config::ToolFlags;
use crate::device::{DeviceCoordinator, LedColor};
use crate::memory::MemoryStore;

use super::{arg_f64, arg_str, FunctionSpec, ParamSpec};

const SENDER: &str = "plugin";

/// Format an f64 without a trailing `.0` for whole values.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Closed set of plugins the assistant can call.
pub enum Plugin {
    Calculator,
    DateTime,
    GeoIp(GeoIpPlugin),
    Weather(WeatherPlugin),
    Memory(MemoryPlugin),
    System(SystemPlugin),
    Eyes(EyesPlugin),
}

impl Plugin {
    pub fn name(&self) -> &'static str {
        match self {
            Plugin::Calculator => "Calculator",
            Plugin::DateTime => "DateTime",
            Plugin::GeoIp(_) => "GeoIp",
            Plugin::Weather(_) => "Weather",
            Plugin::Memory(_) => "Memory",
            Plugin::System(_) => "System",
            Plugin::Eyes(_) => "Eyes",
        }
    }

    pub fn enabled(&self, flags: &ToolFlags) -> bool {
        match self {
            Plugin::Calculator => flags.calculator,
            Plugin::DateTime => flags.date_time,
            Plugin::GeoIp(_) => flags.geo_ip,
            Plugin::Weather(_) => flags.weather,
            Plugin::Memory(_) => flags.memory,
            Plugin::System(_) => flags.system,
            Plugin::Eyes(_) => flags.eyes,
        }
    }

    pub fn functions(&self) -> &'static [FunctionSpec] {
        match self {
            Plugin::Calculator => &[
                FunctionSpec {
                    name: "Add",
                    description: "Add two numbers.",
                    parameters: &[
                        ParamSpec { name: "a", description: "First operand", required: true },
                        ParamSpec { name: "b", description: "Second operand", required: true },
                    ],
                },
                FunctionSpec {
                    name: "Subtract",
                    description: "Subtract the second number from the first.",
                    parameters: &[
                        ParamSpec { name: "a", description: "First operand", required: true },
                        ParamSpec { name: "b", description: "Second operand", required: true },
                    ],
                },
                FunctionSpec {
                    name: "Multiply",
                    description: "Multiply two numbers.",
                    parameters: &[
                        ParamSpec { name: "a", description: "First operand", required: true },
                        ParamSpec { name: "b", description: "Second operand", required: true },
                    ],
                },
                FunctionSpec {
                    name: "Divide",
                    description: "Divide the first number by the second.",
                    parameters: &[
                        ParamSpec { name: "a", description: "Dividend", required: true },
                        ParamSpec { name: "b", description: "Divisor", required: true },
                    ],
                },
            ],
            Plugin::DateTime => &[FunctionSpec {
                name: "CurrentDateTime",
                description: "Get the current local date, time and weekday.",
                parameters: &[],
            }],
            Plugin::GeoIp(_) => &[FunctionSpec {
                name: "CurrentLocation",
                description: "Get the device's approximate location from its public IP address.",
                parameters: &[],
            }],
            Plugin::Weather(_) => &[FunctionSpec {
                name: "CurrentWeather",
                description: "Get the current weather at the device's location.",
                parameters: &[],
            }],
            Plugin::Memory(_) => &[
                FunctionSpec {
                    name: "Remember",
                    description: "Store a fact about the user under a short unique key.",
                    parameters: &[
                        ParamSpec { name: "key", description: "Short unique key", required: true },
                        ParamSpec { name: "content", description: "The fact to store", required: true },
                    ],
                },
                FunctionSpec {
                    name: "Recall",
                    description: "Look up a stored fact by its exact key.",
                    parameters: &[ParamSpec {
                        name: "key",
                        description: "Key to look up",
                        required: true,
                    }],
                },
                FunctionSpec {
                    name: "Search",
                    description: "Find stored facts semantically related to a query.",
                    parameters: &[ParamSpec {
                        name: "query",
                        description: "What to search for",
                        required: true,
                    }],
                },
                FunctionSpec {
                    name: "Forget",
                    description: "Delete a stored fact by key.",
                    parameters: &[ParamSpec {
                        name: "key",
                        description: "Key to delete",
                        required: true,
                    }],
                },
            ],
            Plugin::System(_) => &[
                FunctionSpec {
                    name: "NotifyConversationStopRequested",
                    description: "End the current conversation when the user says goodbye or asks to stop.",
                    parameters: &[],
                },
                FunctionSpec {
                    name: "SetVolume",
                    description: "Set the speaker volume on a 0-10 scale.",
                    parameters: &[ParamSpec {
                        name: "level",
                        description: "Volume level 0-10",
                        required: true,
                    }],
                },
                FunctionSpec {
                    name: "GetVolume",
                    description: "Get the current speaker volume on a 0-10 scale.",
                    parameters: &[],
                },
            ],
            Plugin::Eyes(_) => &[
                FunctionSpec {
                    name: "SetEyeColor",
                    description: "Change the idle eye (LED) colour. One of: white, red, blue, orange, yellow, off.",
                    parameters: &[ParamSpec {
                        name: "color",
                        description: "Colour name",
                        required: true,
                    }],
                },
                FunctionSpec {
                    name: "GetEyeColor",
                    description: "Get the current idle eye (LED) colour.",
                    parameters: &[],
                },
            ],
        }
    }

    pub async fn invoke(
        &self,
        function: &str,
        args: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        match self {
            Plugin::Calculator => invoke_calculator(function, args),
            Plugin::DateTime => invoke_date_time(function),
            Plugin::GeoIp(p) => p.invoke(function).await,
            Plugin::Weather(p) => p.invoke(function).await,
            Plugin::Memory(p) => p.invoke(function, args).await,
            Plugin::System(p) => p.invoke(function, args),
            Plugin::Eyes(p) => p.invoke(function, args),
        }
    }
}

fn invoke_calculator(function: &str, args: &Map<String, Value>) -> anyhow::Result<Value> {
    let a = arg_f64(args, "a")?;
    let b = arg_f64(args, "b")?;
    let result = match function {
        "Add" => a + b,
        "Subtract" => a - b,
        "Multiply" => a * b,
        "Divide" => {
            if b == 0.0 {
                anyhow::bail!("division by zero");
            }
            a / b
        }
        other => anyhow::bail!("unknown calculator function: {other}"),
    };
    Ok(Value::String(format_number(result)))
}

fn invoke_date_time(function: &str) -> anyhow::Result<Value> {
    match function {
        "CurrentDateTime" => {
            let now = chrono::Local::now();
            Ok(Value::String(now.format("%A, %Y-%m-%d %H:%M:%S").to_string()))
        }
        other => anyhow::bail!("unknown datetime function: {other}"),
    }
}

/// Location result shared with the weather plugin.
#[derive(Debug, Clone)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub city: String,
    pub country: String,
}

pub struct GeoIpPlugin {
    client: reqwest::Client,
}

impl GeoIpPlugin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Resolve the device's public-IP location.
    pub async fn lookup(&self) -> anyhow::Result<GeoLocation> {
        let body: Value = self
            .client
            .get("http://ip-api.com/json")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("geoip request failed: {e}"))?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("geoip response parse: {e}"))?;

        if body.get("status").and_then(|s| s.as_str()) != Some("success") {
            anyhow::bail!("geoip lookup unsuccessful");
        }

        Ok(GeoLocation {
            latitude: body["lat"].as_f64().unwrap_or(0.0),
            longitude: body["lon"].as_f64().unwrap_or(0.0),
            city: body["city"].as_str().unwrap_or("unknown").to_string(),
            country: body["country"].as_str().unwrap_or("unknown").to_string(),
        })
    }

    async fn invoke(&self, function: &str) -> anyhow::Result<Value> {
        match function {
            "CurrentLocation" => {
                let loc = self.lookup().await?;
                Ok(json!({
                    "city": loc.city,
                    "country": loc.country,
                    "latitude": loc.latitude,
                    "longitude": loc.longitude,
                }))
            }
            other => anyhow::bail!("unknown geoip function: {other}"),
        }
    }
}

impl Default for GeoIpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WeatherPlugin {
    client: reqwest::Client,
    geo: GeoIpPlugin,
}

impl WeatherPlugin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            geo: GeoIpPlugin::new(),
        }
    }

    async fn invoke(&self, function: &str) -> anyhow::Result<Value> {
        match function {
            "CurrentWeather" => {
                let loc = self.geo.lookup().await?;
                let url = format!(
                    "https://api.open-meteo.com/v1/forecast?latitude={}&longitude={}&current_weather=true&hourly=temperature_2m",
                    loc.latitude, loc.longitude
                );
                let body: Value = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("weather request failed: {e}"))?
                    .json()
                    .await
                    .map_err(|e| anyhow::anyhow!("weather response parse: {e}"))?;

                let current = &body["current_weather"];
                let code = current["weathercode"].as_i64().unwrap_or(-1);
                Ok(json!({
                    "location": format!("{}, {}", loc.city, loc.country),
                    "temperature_c": current["temperature"],
                    "wind_speed_kmh": current["windspeed"],
                    "conditions": weather_code_text(code),
                }))
            }
            other => anyhow::bail!("unknown weather function: {other}"),
        }
    }
}

impl Default for WeatherPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// WMO weather interpretation codes, abbreviated.
fn weather_code_text(code: i64) -> &'static str {
    match code {
        0 => "clear sky",
        1..=3 => "partly cloudy",
        45 | 48 => "fog",
        51..=57 => "drizzle",
        61..=67 => "rain",
        71..=77 => "snow",
        80..=82 => "rain showers",
        85 | 86 => "snow showers",
        95..=99 => "thunderstorm",
        _ => "unknown",
    }
}

pub struct MemoryPlugin {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryPlugin {
    pub fn new(store: Arc<Mutex<MemoryStore>>) -> Self {
        Self { store }
    }

    async fn invoke(&self, function: &str, args: &Map<String, Value>) -> anyhow::Result<Value> {
        match function {
            "Remember" => {
                let key = arg_str(args, "key")?;
                let content = arg_str(args, "content")?;
                self.store.lock().await.remember(key, content).await?;
                Ok(Value::String(format!("Remembered '{key}'.")))
            }
            "Recall" => {
                let key = arg_str(args, "key")?;
                match self.store.lock().await.recall(key)? {
                    Some(content) => Ok(Value::String(content)),
                    None => Ok(Value::String(format!("Nothing stored under '{key}'."))),
                }
            }
            "Search" => {
                let query = arg_str(args, "query")?;
                let results = self.store.lock().await.search(query, 5).await?;
                if results.is_empty() {
                    Ok(Value::String("No related memories found.".to_string()))
                } else {
                    Ok(json!(results
                        .into_iter()
                        .map(|(key, content)| json!({ "key": key, "content": content }))
                        .collect::<Vec<_>>()))
                }
            }
            "Forget" => {
                let key = arg_str(args, "key")?;
                let removed = self.store.lock().await.forget(key)?;
                Ok(Value::String(if removed {
                    format!("Forgot '{key}'.")
                } else {
                    format!("Nothing stored under '{key}'.")
                }))
            }
            other => anyhow::bail!("unknown memory function: {other}"),
        }
    }
}

pub struct SystemPlugin {
    bus: EventBus,
    coordinator: DeviceCoordinator,
}

impl SystemPlugin {
    pub fn new(bus: EventBus, coordinator: DeviceCoordinator) -> Self {
        Self { bus, coordinator }
    }

    fn invoke(&self, function: &str, args: &Map<String, Value>) -> anyhow::Result<Value> {
        match function {
            "NotifyConversationStopRequested" => {
                debug!("conversation stop requested via tool");
                self.bus.publish(SENDER, EventPayload::HangupInput);
                Ok(Value::String("Goodbye.".to_string()))
            }
            "SetVolume" => {
                let level = arg_f64(args, "level")?;
                if !(0.0..=10.0).contains(&level) {
                    anyhow::bail!("volume must be between 0 and 10");
                }
                self.coordinator.set_volume_level(level.round() as u8);
                Ok(Value::String(format!("Volume set to {}.", level.round())))
            }
            "GetVolume" => Ok(Value::String(self.coordinator.volume_level().to_string())),
            other => anyhow::bail!("unknown system function: {other}"),
        }
    }
}

pub struct EyesPlugin {
    coordinator: DeviceCoordinator,
}

impl EyesPlugin {
    pub fn new(coordinator: DeviceCoordinator) -> Self {
        Self { coordinator }
    }

    fn invoke(&self, function: &str, args: &Map<String, Value>) -> anyhow::Result<Value> {
        match function {
            "SetEyeColor" => {
                let name = arg_str(args, "color")?;
                let color = parse_color(name)
                    .ok_or_else(|| anyhow::anyhow!("unknown colour: {name}"))?;
                self.coordinator.set_default_color(color);
                Ok(Value::String(format!("Eye colour set to {name}.")))
            }
            "GetEyeColor" => Ok(Value::String(
                color_name(self.coordinator.default_color()).to_string(),
            )),
            other => anyhow::bail!("unknown eyes function: {other}"),
        }
    }
}

fn parse_color(name: &str) -> Option<LedColor> {
    match name.to_lowercase().as_str() {
        "white" => Some(LedColor::White),
        "red" => Some(LedColor::Red),
        "blue" => Some(LedColor::Blue),
        "orange" => Some(LedColor::Orange),
        "yellow" => Some(LedColor::Yellow),
        "lightgreen" | "light green" => Some(LedColor::LightGreen),
        "off" => Some(LedColor::Off),
        _ => None,
    }
}

fn color_name(color: LedColor) -> &'static str {
    match color {
        LedColor::Off => "off",
        LedColor::Red => "red",
        LedColor::Blue => "blue",
        LedColor::Green { .. } => "green",
        LedColor::LightGreen => "lightgreen",
        LedColor::Orange => "orange",
        LedColor::Yellow => "yellow",
        LedColor::White => "white",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::device::{LogLedDriver, LogSpeakerphone};
    use crate::device::volume::SoftwareVolume;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> DeviceCoordinator {
        DeviceCoordinator::new(
            Box::new(LogLedDriver),
            Box::new(LogSpeakerphone),
            Box::new(SoftwareVolume::new()),
        )
    }

    #[test]
    fn number_formatting_trims_whole_values() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-3.0), "-3");
    }

    #[test]
    fn calculator_operations() {
        let args = |a: f64, b: f64| {
            let mut m = Map::new();
            m.insert("a".into(), json!(a));
            m.insert("b".into(), json!(b));
            m
        };
        assert_eq!(
            invoke_calculator("Subtract", &args(7.0, 2.0)).unwrap(),
            json!("5")
        );
        assert_eq!(
            invoke_calculator("Divide", &args(5.0, 2.0)).unwrap(),
            json!("2.5")
        );
        assert!(invoke_calculator("Divide", &args(1.0, 0.0)).is_err());
        assert!(invoke_calculator("Modulo", &args(1.0, 1.0)).is_err());
    }

    #[test]
    fn weather_codes_map_to_text() {
        assert_eq!(weather_code_text(0), "clear sky");
        assert_eq!(weather_code_text(63), "rain");
        assert_eq!(weather_code_text(96), "thunderstorm");
        assert_eq!(weather_code_text(-1), "unknown");
    }

    #[tokio::test]
    async fn memory_plugin_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(
            MemoryStore::open(dir.path().join("memories.json"), 10, None).unwrap(),
        ));
        let plugin = MemoryPlugin::new(store);

        let mut args = Map::new();
        args.insert("key".into(), json!("pet"));
        args.insert("content".into(), json!("a grey cat"));
        plugin.invoke("Remember", &args).await.unwrap();

        let mut recall_args = Map::new();
        recall_args.insert("key".into(), json!("pet"));
        let result = plugin.invoke("Recall", &recall_args).await.unwrap();
        assert_eq!(result, json!("a grey cat"));
    }

    #[test]
    fn stop_request_publishes_hangup() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            EventKind::HangupInput,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let plugin = SystemPlugin::new(bus, coordinator());
        plugin
            .invoke("NotifyConversationStopRequested", &Map::new())
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eye_colour_round_trip() {
        let plugin = EyesPlugin::new(coordinator());
        let mut args = Map::new();
        args.insert("color".into(), json!("blue"));
        plugin.invoke("SetEyeColor", &args).unwrap();
        assert_eq!(
            plugin.invoke("GetEyeColor", &Map::new()).unwrap(),
            json!("blue")
        );

        args.insert("color".into(), json!("chartreuse"));
        assert!(plugin.invoke("SetEyeColor", &args).is_err());
    }

    #[test]
    fn volume_bounds_are_enforced() {
        let plugin = SystemPlugin::new(EventBus::new(), coordinator());
        let mut args = Map::new();
        args.insert("level".into(), json!(11));
        assert!(plugin.invoke("SetVolume", &args).is_err());
        args.insert("level".into(), json!(7));
        plugin.invoke("SetVolume", &args).unwrap();
        assert_eq!(plugin.invoke("GetVolume", &Map::new()).unwrap(), json!("7"));
    }
}
