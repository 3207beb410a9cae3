use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub enhancement: EnhancementConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub satellite: SatelliteConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_api_path")]
    pub api_path: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub pipeline: Option<String>,
    /// "wake_word" waits for the remote wake-word stage; "stt" starts
    /// a turn listening immediately.
    #[serde(default = "default_start_stage")]
    pub start_stage: String,
    #[serde(default)]
    pub wake_buffer_seconds: f32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            api_path: default_api_path(),
            token: String::new(),
            pipeline: None,
            start_stage: default_start_stage(),
            wake_buffer_seconds: 0.0,
        }
    }
}

fn default_start_stage() -> String {
    "wake_word".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    8123
}
fn default_api_path() -> String {
    "/api".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_samples_per_chunk")]
    pub samples_per_chunk: usize,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
            samples_per_chunk: default_samples_per_chunk(),
            channels: default_channels(),
        }
    }
}

fn default_device() -> String {
    "default".to_string()
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_samples_per_chunk() -> usize {
    480
}
fn default_channels() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EnhancementConfig {
    /// 0 disables, 1-4 increase suppression strength.
    #[serde(default)]
    pub noise_suppression: u8,
    /// 0 disables, 1-31 raise the gain target.
    #[serde(default)]
    pub auto_gain: u8,
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f32,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            noise_suppression: 0,
            auto_gain: 0,
            volume_multiplier: default_volume_multiplier(),
        }
    }
}

fn default_volume_multiplier() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VadConfig {
    /// One of "disabled", "energy", "silero".
    #[serde(default = "default_detector")]
    pub detector: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_trigger_level")]
    pub trigger_level: u32,
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            detector: default_detector(),
            model_path: None,
            threshold: default_threshold(),
            trigger_level: default_trigger_level(),
            buffer_chunks: default_buffer_chunks(),
        }
    }
}

fn default_detector() -> String {
    "disabled".to_string()
}
fn default_threshold() -> f32 {
    0.5
}
fn default_trigger_level() -> u32 {
    3
}
fn default_buffer_chunks() -> usize {
    40
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlaybackConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_playback_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_ducking_volume")]
    pub ducking_volume: f32,
    #[serde(default)]
    pub echo_cancel: bool,
    #[serde(default)]
    pub awake_sound: Option<String>,
    #[serde(default)]
    pub done_sound: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_playback_rate(),
            volume: default_volume(),
            ducking_volume: default_ducking_volume(),
            echo_cancel: false,
            awake_sound: None,
            done_sound: None,
        }
    }
}

fn default_playback_rate() -> u32 {
    22050
}
fn default_volume() -> f32 {
    1.0
}
fn default_ducking_volume() -> f32 {
    0.2
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SatelliteConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    30000
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_seconds")]
    pub connect_seconds: u64,
    /// Silence budget while listening before the turn is forced to
    /// move on without an explicit end-of-speech from the server.
    #[serde(default = "default_listening_seconds")]
    pub listening_seconds: u64,
    #[serde(default = "default_socket_connect_timeout")]
    pub socket_connect_seconds: u64,
    #[serde(default = "default_socket_operation_timeout")]
    pub socket_operation_seconds: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_seconds: default_connect_seconds(),
            listening_seconds: default_listening_seconds(),
            socket_connect_seconds: default_socket_connect_timeout(),
            socket_operation_seconds: default_socket_operation_timeout(),
        }
    }
}

fn default_connect_seconds() -> u64 {
    10
}
fn default_listening_seconds() -> u64 {
    8
}
fn default_socket_connect_timeout() -> u64 {
    5
}
fn default_socket_operation_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BufferConfig {
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_playback_queue")]
    pub playback_queue: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
            playback_queue: default_playback_queue(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    64
}
fn default_playback_queue() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_commands_per_second")]
    pub commands_per_second: u32,
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            commands_per_second: default_commands_per_second(),
            burst_capacity: default_burst_capacity(),
            enabled: default_rate_limit_enabled(),
        }
    }
}

fn default_commands_per_second() -> u32 {
    10
}
fn default_burst_capacity() -> u32 {
    20
}
fn default_rate_limit_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecordingConfig {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_record_raw")]
    pub raw: bool,
    #[serde(default)]
    pub gated: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            raw: default_record_raw(),
            gated: false,
        }
    }
}

fn default_record_raw() -> bool {
    true
}

pub fn load_config() -> Result<Config> {
    let config_path = get_config_path();

    if !config_path.exists() {
        tracing::info!("Config file not found at {:?}, using defaults", config_path);
        return Ok(Config::default());
    }

    tracing::info!("Loading config from {:?}", config_path);
    let config_str = std::fs::read_to_string(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

    let config: Config = toml::from_str(&config_str)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;

    tracing::info!("Config loaded successfully");
    Ok(config)
}

fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .expect("Failed to get config directory")
        .join("farfield")
        .join("config.toml")
}
