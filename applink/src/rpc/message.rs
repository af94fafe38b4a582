//! RPC message envelope and the identifiers the core routes by.
//!
//! Only the functions the core itself acts on are named here; everything
//! else is routed opaquely by numeric id.

use bytes::Bytes;

use crate::protocol::packet::Version;
use crate::rpc::value::RpcValue;
use crate::session::ConnectionKey;

/// Kind of an RPC envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcMessageType {
    Request = 0x0,
    Response = 0x1,
    Notification = 0x2,
}

impl TryFrom<u8> for RpcMessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Request),
            0x1 => Ok(Self::Response),
            0x2 => Ok(Self::Notification),
            other => Err(other),
        }
    }
}

/// Numeric RPC function identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Reserved id for functions this head unit cannot name.
    pub const UNKNOWN: Self = Self(0);

    pub const REGISTER_APP_INTERFACE: Self = Self(1);
    pub const UNREGISTER_APP_INTERFACE: Self = Self(2);
    pub const PERFORM_AUDIO_PASS_THRU: Self = Self(16);
    pub const END_AUDIO_PASS_THRU: Self = Self(17);
    pub const GENERIC_RESPONSE: Self = Self(31);

    pub const ON_HMI_STATUS: Self = Self(32768);
    pub const ON_APP_INTERFACE_UNREGISTERED: Self = Self(32769);
    pub const ON_AUDIO_PASS_THRU: Self = Self(32777);

    /// Function name for the named subset, used in v1 payloads and in
    /// policy permission checks.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::REGISTER_APP_INTERFACE => "RegisterAppInterface",
            Self::UNREGISTER_APP_INTERFACE => "UnregisterAppInterface",
            Self::PERFORM_AUDIO_PASS_THRU => "PerformAudioPassThru",
            Self::END_AUDIO_PASS_THRU => "EndAudioPassThru",
            Self::GENERIC_RESPONSE => "GenericResponse",
            Self::ON_HMI_STATUS => "OnHMIStatus",
            Self::ON_APP_INTERFACE_UNREGISTERED => "OnAppInterfaceUnregistered",
            Self::ON_AUDIO_PASS_THRU => "OnAudioPassThru",
            _ => return None,
        })
    }

    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "RegisterAppInterface" => Self::REGISTER_APP_INTERFACE,
            "UnregisterAppInterface" => Self::UNREGISTER_APP_INTERFACE,
            "PerformAudioPassThru" => Self::PERFORM_AUDIO_PASS_THRU,
            "EndAudioPassThru" => Self::END_AUDIO_PASS_THRU,
            "GenericResponse" => Self::GENERIC_RESPONSE,
            "OnHMIStatus" => Self::ON_HMI_STATUS,
            "OnAppInterfaceUnregistered" => Self::ON_APP_INTERFACE_UNREGISTERED,
            "OnAudioPassThru" => Self::ON_AUDIO_PASS_THRU,
            _ => Self::UNKNOWN,
        }
    }

    /// Identifier string used for policy checks: the name when known,
    /// the decimal id otherwise.
    #[must_use]
    pub fn policy_name(self) -> String {
        self.name().map_or_else(|| self.0.to_string(), str::to_owned)
    }
}

/// Result code carried by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    InvalidData,
    UnsupportedVersion,
    TooManyPendingRequests,
    ApplicationNotRegistered,
    ApplicationRegisteredAlready,
    TimedOut,
    Disallowed,
    UserDisallowed,
    OutOfMemory,
    GenericError,
    Aborted,
    InvalidEnum,
}

impl ResultCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidData => "INVALID_DATA",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::TooManyPendingRequests => "TOO_MANY_PENDING_REQUESTS",
            Self::ApplicationNotRegistered => "APPLICATION_NOT_REGISTERED",
            Self::ApplicationRegisteredAlready => "APPLICATION_REGISTERED_ALREADY",
            Self::TimedOut => "TIMED_OUT",
            Self::Disallowed => "DISALLOWED",
            Self::UserDisallowed => "USER_DISALLOWED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::GenericError => "GENERIC_ERROR",
            Self::Aborted => "ABORTED",
            Self::InvalidEnum => "INVALID_ENUM",
        }
    }
}

/// Reason attached to an OnAppInterfaceUnregistered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisteredReason {
    TooManyRequests,
    RequestWhileInNoneHmiLevel,
    ProtocolViolation,
    AppUnauthorized,
}

impl UnregisteredReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::RequestWhileInNoneHmiLevel => "REQUEST_WHILE_IN_NONE_HMI_LEVEL",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::AppUnauthorized => "APP_UNAUTHORIZED",
        }
    }
}

/// A decoded RPC envelope, mobile- or HMI-facing.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub key: ConnectionKey,
    pub function_id: FunctionId,
    pub correlation_id: u32,
    pub message_type: RpcMessageType,
    pub version: Version,
    pub params: RpcValue,
    pub binary: Option<Bytes>,
}

impl RpcMessage {
    /// A response with `success=false` and the given result code.
    #[must_use]
    pub fn negative_response(
        key: ConnectionKey,
        function_id: FunctionId,
        correlation_id: u32,
        version: Version,
        code: ResultCode,
    ) -> Self {
        let mut params = RpcValue::object();
        params.set("success", false);
        params.set("resultCode", code.as_str());
        Self {
            key,
            function_id,
            correlation_id,
            message_type: RpcMessageType::Response,
            version,
            params,
            binary: None,
        }
    }

    /// A notification envelope; notifications carry no correlation id.
    #[must_use]
    pub fn notification(
        key: ConnectionKey,
        function_id: FunctionId,
        version: Version,
        params: RpcValue,
    ) -> Self {
        Self {
            key,
            function_id,
            correlation_id: 0,
            message_type: RpcMessageType::Notification,
            version,
            params,
            binary: None,
        }
    }

    /// The result code parameter, when present and recognizable.
    #[must_use]
    pub fn result_code_str(&self) -> Option<&str> {
        self.params.get("resultCode").and_then(RpcValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionId;

    #[test]
    fn function_name_roundtrip() {
        for id in [
            FunctionId::REGISTER_APP_INTERFACE,
            FunctionId::UNREGISTER_APP_INTERFACE,
            FunctionId::ON_HMI_STATUS,
        ] {
            assert_eq!(FunctionId::from_name(id.name().unwrap()), id);
        }
        assert_eq!(FunctionId::from_name("MakeToast"), FunctionId::UNKNOWN);
    }

    #[test]
    fn negative_response_shape() {
        let key = ConnectionKey::from_pair(ConnectionId::new(1), 1);
        let response = RpcMessage::negative_response(
            key,
            FunctionId::REGISTER_APP_INTERFACE,
            42,
            Version::V2,
            ResultCode::TooManyPendingRequests,
        );
        assert_eq!(response.message_type, RpcMessageType::Response);
        assert_eq!(response.params.get("success").unwrap().as_bool(), Some(false));
        assert_eq!(
            response.result_code_str(),
            Some("TOO_MANY_PENDING_REQUESTS")
        );
    }
}
