//! The registered-application record and its activity attributes.

use crate::interfaces::DeviceInfo;
use crate::protocol::packet::Version;
use crate::session::ConnectionKey;

/// HMI activity tier of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HmiLevel {
    #[default]
    None,
    Background,
    Limited,
    Full,
}

impl HmiLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Background => "BACKGROUND",
            Self::Limited => "LIMITED",
            Self::Full => "FULL",
        }
    }

    /// Maps a policy-table level string; unknown or absent means None.
    #[must_use]
    pub fn from_policy_str(value: Option<&str>) -> Self {
        match value {
            Some("FULL") => Self::Full,
            Some("LIMITED") => Self::Limited,
            Some("BACKGROUND") => Self::Background,
            _ => Self::None,
        }
    }

    /// Whether the level grants audio or streaming activity.
    #[must_use]
    pub const fn is_audible_tier(self) -> bool {
        matches!(self, Self::Full | Self::Limited)
    }
}

/// Audio output state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioStreamingState {
    #[default]
    NotAudible,
    Attenuated,
    Audible,
}

impl AudioStreamingState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAudible => "NOT_AUDIBLE",
            Self::Attenuated => "ATTENUATED",
            Self::Audible => "AUDIBLE",
        }
    }
}

/// System context reported with HMI status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemContext {
    #[default]
    Main,
    VrSession,
    Menu,
    HmiObscured,
    Alert,
}

impl SystemContext {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "MAIN",
            Self::VrSession => "VRSESSION",
            Self::Menu => "MENU",
            Self::HmiObscured => "HMI_OBSCURED",
            Self::Alert => "ALERT",
        }
    }
}

/// Audio exclusivity classes: at most one Limited app per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioClass {
    Media,
    Voice,
    Navi,
}

/// Application type flags declared at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppTypes {
    pub is_media: bool,
    pub is_navi: bool,
    pub is_voice_communication: bool,
}

impl AppTypes {
    #[must_use]
    pub fn classes(self) -> Vec<AudioClass> {
        let mut classes = Vec::with_capacity(3);
        if self.is_media {
            classes.push(AudioClass::Media);
        }
        if self.is_voice_communication {
            classes.push(AudioClass::Voice);
        }
        if self.is_navi {
            classes.push(AudioClass::Navi);
        }
        classes
    }

    #[must_use]
    pub fn in_class(self, class: AudioClass) -> bool {
        match class {
            AudioClass::Media => self.is_media,
            AudioClass::Voice => self.is_voice_communication,
            AudioClass::Navi => self.is_navi,
        }
    }
}

/// Desired API version range declared by the mobile side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: i64,
    pub minor: i64,
}

/// A registered mobile application.
#[derive(Debug, Clone)]
pub struct Application {
    /// Internal id: the connection key of the owning session.
    pub app_id: ConnectionKey,
    /// Stable across resume; random and non-zero.
    pub hmi_app_id: u32,
    /// Vendor-provided application id string.
    pub policy_app_id: String,
    pub name: String,
    pub device: DeviceInfo,
    pub language: i64,
    pub ui_language: i64,
    pub api_version: ApiVersion,
    pub protocol_version: Version,
    pub grammar_id: u32,
    pub types: AppTypes,
    pub hmi_level: HmiLevel,
    pub audio_state: AudioStreamingState,
    pub system_context: SystemContext,
    /// Streaming permission; granted while the app sits in Full/Limited.
    pub streaming_allowed: bool,
}

impl Application {
    /// Whether the application participates in audio arbitration at all.
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.types.is_media || self.types.is_navi || self.types.is_voice_communication
    }

    /// Whether the application may hold the audio or video service.
    #[must_use]
    pub fn may_stream(&self) -> bool {
        self.types.is_navi && self.streaming_allowed && self.hmi_level.is_audible_tier()
    }
}
