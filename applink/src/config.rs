//! Runtime configuration for the protocol engine and application manager.
//!
//! These structs carry the head-unit profile values the engines depend on.
//! They are injected at construction; there is no global profile state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of the protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Upper bound for a declared payload length. Larger headers are malformed.
    pub maximum_payload_size: usize,
    /// Maximum size of a single on-wire frame, header included.
    pub maximum_frame_size: usize,
    /// Sliding window for the flood meter. Zero disables metering.
    pub message_frequency_time: Duration,
    /// Frames allowed per connection within `message_frequency_time`.
    pub message_max_frequency: usize,
    /// When false, the first malformed occurrence trips the callback.
    pub malformed_message_filtering: bool,
    /// Sliding window for the malformed-message meter.
    pub malformed_message_frequency_time: Duration,
    /// Malformed occurrences allowed within the window before the callback.
    pub malformed_message_max_frequency: usize,
    /// Per-session idle timeout driving heartbeats. `None` disables them
    /// (and caps the advertised protocol version at 2).
    pub heart_beat_timeout: Option<Duration>,
    /// Advertise protocol version 4 in StartServiceAck.
    pub enable_protocol_4: bool,
    /// Capacity of each directional frame queue.
    pub queue_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            maximum_payload_size: 1459,
            maximum_frame_size: 1500,
            message_frequency_time: Duration::from_secs(1),
            message_max_frequency: 100,
            malformed_message_filtering: true,
            malformed_message_frequency_time: Duration::from_secs(1),
            malformed_message_max_frequency: 10,
            heart_beat_timeout: Some(Duration::from_secs(7)),
            enable_protocol_4: false,
            queue_capacity: 1024,
        }
    }
}

/// Configuration of the application manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Pending request ceiling per application. Zero disables the check.
    pub pending_requests_amount: usize,
    /// Window for the global per-application request burst meter.
    pub app_request_time_scale: Duration,
    /// Requests allowed per application within `app_request_time_scale`.
    /// Zero disables the check.
    pub app_time_scale_max_requests: usize,
    /// Window for requests issued while the application sits in HMI None.
    pub none_level_time_scale: Duration,
    /// Requests allowed in HMI None within the window. Zero disables.
    pub none_level_max_requests: usize,
    /// Default deadline applied to mobile requests awaiting an HMI answer.
    pub default_request_timeout: Duration,
    /// How long to wait for EndServiceAck on streaming teardown before the
    /// application is force-unregistered.
    pub stop_streaming_timeout: Duration,
    /// Capacity of each of the manager's message queues.
    pub queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pending_requests_amount: 40,
            app_request_time_scale: Duration::from_secs(10),
            app_time_scale_max_requests: 100,
            none_level_time_scale: Duration::from_secs(60),
            none_level_max_requests: 5,
            default_request_timeout: Duration::from_secs(10),
            stop_streaming_timeout: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}
