// Probe service message protocol using JSON envelopes.
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::ImageConfig;

/// Message kinds shared with the service.
///
/// Codes are part of the wire contract: new kinds are appended, existing ones
/// are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    // Client -> service
    RegisterClient = 1,
    UnregisterClient = 2,
    ConfigureImage = 3,
    AskScanArea = 4,
    AskProbeInfo = 5,
    RunUserFunction = 6,
    AskDepth = 8,
    AskGain = 9,
    RequestRawRange = 10,
    AskPatientInfo = 11,
    SetPartnerPackage = 12,
    AskFreeze = 13,
    SetPatientInfo = 14,
    SetSettingsInfo = 15,
    CompleteExam = 16,
    CopyRawCapture = 17,

    // Service -> client
    ReturnStatus = 101,
    FreezeChanged = 102,
    NewProcessedImage = 103,
    ButtonEvent = 104,
    ScanAreaChanged = 105,
    ScanAreaReturned = 106,
    ProbeInfoReturned = 107,
    NoLicense = 108,
    Error = 111,
    LicenseChanged = 112,
    DepthChanged = 113,
    DepthReturned = 114,
    GainChanged = 115,
    GainReturned = 116,
    RawRangeReturned = 117,
    RawRangeProgress = 118,
    PowerEvent = 119,
    PatientInfoReturned = 120,
    FreezeReturned = 121,
    RawCaptureAvailable = 122,
    RawCaptureCopied = 123,
}

/// Which side of the channel originates a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToService,
    ToClient,
}

impl MessageKind {
    pub const ALL: [MessageKind; 37] = [
        Self::RegisterClient,
        Self::UnregisterClient,
        Self::ConfigureImage,
        Self::AskScanArea,
        Self::AskProbeInfo,
        Self::RunUserFunction,
        Self::AskDepth,
        Self::AskGain,
        Self::RequestRawRange,
        Self::AskPatientInfo,
        Self::SetPartnerPackage,
        Self::AskFreeze,
        Self::SetPatientInfo,
        Self::SetSettingsInfo,
        Self::CompleteExam,
        Self::CopyRawCapture,
        Self::ReturnStatus,
        Self::FreezeChanged,
        Self::NewProcessedImage,
        Self::ButtonEvent,
        Self::ScanAreaChanged,
        Self::ScanAreaReturned,
        Self::ProbeInfoReturned,
        Self::NoLicense,
        Self::Error,
        Self::LicenseChanged,
        Self::DepthChanged,
        Self::DepthReturned,
        Self::GainChanged,
        Self::GainReturned,
        Self::RawRangeReturned,
        Self::RawRangeProgress,
        Self::PowerEvent,
        Self::PatientInfoReturned,
        Self::FreezeReturned,
        Self::RawCaptureAvailable,
        Self::RawCaptureCopied,
    ];

    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn direction(self) -> Direction {
        if self.code() < 100 {
            Direction::ToService
        } else {
            Direction::ToClient
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RegisterClient => "register-client",
            Self::UnregisterClient => "unregister-client",
            Self::ConfigureImage => "configure-image",
            Self::AskScanArea => "ask-scan-area",
            Self::AskProbeInfo => "ask-probe-info",
            Self::RunUserFunction => "run-user-function",
            Self::AskDepth => "ask-depth",
            Self::AskGain => "ask-gain",
            Self::RequestRawRange => "request-raw-range",
            Self::AskPatientInfo => "ask-patient-info",
            Self::SetPartnerPackage => "set-partner-package",
            Self::AskFreeze => "ask-freeze",
            Self::SetPatientInfo => "set-patient-info",
            Self::SetSettingsInfo => "set-settings-info",
            Self::CompleteExam => "complete-exam",
            Self::CopyRawCapture => "copy-raw-capture",
            Self::ReturnStatus => "return-status",
            Self::FreezeChanged => "freeze-changed",
            Self::NewProcessedImage => "new-processed-image",
            Self::ButtonEvent => "button-event",
            Self::ScanAreaChanged => "scan-area-changed",
            Self::ScanAreaReturned => "scan-area-returned",
            Self::ProbeInfoReturned => "probe-info-returned",
            Self::NoLicense => "no-license",
            Self::Error => "error",
            Self::LicenseChanged => "license-changed",
            Self::DepthChanged => "depth-changed",
            Self::DepthReturned => "depth-returned",
            Self::GainChanged => "gain-changed",
            Self::GainReturned => "gain-returned",
            Self::RawRangeReturned => "raw-range-returned",
            Self::RawRangeProgress => "raw-range-progress",
            Self::PowerEvent => "power-event",
            Self::PatientInfoReturned => "patient-info-returned",
            Self::FreezeReturned => "freeze-returned",
            Self::RawCaptureAvailable => "raw-capture-available",
            Self::RawCaptureCopied => "raw-capture-copied",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Payload field names.
pub mod keys {
    pub const IMAGE_SIZE: &str = "size";
    pub const COMPRESSION_TYPE: &str = "compressionType";
    pub const COMPRESSION_QUALITY: &str = "compressionQuality";
    pub const SEPARATE_OVERLAYS: &str = "separateOverlays";
    pub const IMAGE_DATA: &str = "data";
    pub const IMAGE_INFO: &str = "info";
    pub const POS_INFO: &str = "pos";
    pub const BUTTON_INFO: &str = "info";
    pub const POWER_INFO: &str = "info";
    pub const B_IMAGE_AREA: &str = "bImageArea";
    pub const PROBE_INFO: &str = "probeInfo";
    pub const PATIENT_INFO: &str = "patientInfo";
    pub const SETTINGS_INFO: &str = "settingsInfo";
    pub const COMPLETE_EXAM: &str = "completeExam";
    pub const USER_FN: &str = "userFn";
    pub const USER_PARAM: &str = "userParam";
    pub const PACKAGE_NAME: &str = "packageName";
    pub const FREEZE: &str = "freeze";
    pub const DEPTH_CM: &str = "depthCm";
    pub const GAIN: &str = "gain";
    pub const ERROR_MESSAGE: &str = "errorMessage";
    pub const START_FRAME: &str = "startFrame";
    pub const END_FRAME: &str = "endFrame";
    pub const WRITABLE_URI: &str = "writableUri";
    pub const PACKAGE_SIZE: &str = "packageSize";
    pub const PACKAGE_EXTENSION: &str = "packageExtension";
    pub const AVAILABLE: &str = "available";
    pub const CAPTURE_ID: &str = "captureId";
    pub const FILE_NAME: &str = "fileName";
    pub const SIZE_BYTES: &str = "sizeBytes";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("{kind}: missing required field '{field}'")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("{kind}: invalid field '{field}': {reason}")]
    InvalidField {
        kind: MessageKind,
        field: &'static str,
        reason: String,
    },
    #[error("Malformed envelope: {0}")]
    Json(String),
}

/// One message as it travels on the channel.
///
/// `arg1` carries the correlation tag, `arg2` small scalar results
/// (return status, progress), `data` the named payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub what: i32,
    #[serde(default)]
    pub arg1: i32,
    #[serde(default)]
    pub arg2: i32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            what: kind.code(),
            arg1: 0,
            arg2: 0,
            data: Map::new(),
            reply_to: None,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_i32(self.what)
    }

    pub fn with_arg1(mut self, arg1: i32) -> Self {
        self.arg1 = arg1;
        self
    }

    pub fn with_arg2(mut self, arg2: i32) -> Self {
        self.arg2 = arg2;
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Insert a payload field.
    pub fn put<T: Serialize + ?Sized>(
        &mut self,
        field: &str,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.data
            .insert(field.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Parse an envelope from bytes (for length-prefixed framing).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))
    }

    /// Serialize the envelope to bytes (for length-prefixed framing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn fields(&self, kind: MessageKind) -> Fields<'_> {
        Fields {
            kind,
            data: &self.data,
        }
    }
}

/// Typed, fail-closed access to an envelope's payload.
struct Fields<'a> {
    kind: MessageKind,
    data: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn required<T: DeserializeOwned>(&self, field: &'static str) -> Result<T, DecodeError> {
        match self.data.get(field) {
            None | Some(Value::Null) => Err(DecodeError::MissingField {
                kind: self.kind,
                field,
            }),
            Some(value) => T::deserialize(value).map_err(|e| self.invalid(field, e)),
        }
    }

    fn optional<T: DeserializeOwned>(&self, field: &'static str) -> Result<Option<T>, DecodeError> {
        match self.data.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| self.invalid(field, e)),
        }
    }

    fn flag(&self, field: &'static str) -> Result<bool, DecodeError> {
        let value: Value = self.required(field)?;
        flag_value(&value).ok_or_else(|| DecodeError::InvalidField {
            kind: self.kind,
            field,
            reason: format!("expected boolean or 0/1, got {}", value),
        })
    }

    fn invalid(&self, field: &'static str, e: impl fmt::Display) -> DecodeError {
        DecodeError::InvalidField {
            kind: self.kind,
            field,
            reason: e.to_string(),
        }
    }
}

fn flag_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Boolean fields accept a native boolean or the 0/1 integer fallback.
mod flag {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = Value::deserialize(deserializer)?;
        flag_value(&value).ok_or_else(|| {
            de::Error::custom(format!("expected boolean or 0/1, got {}", value))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Jpeg,
    Png,
}

/// Screen rectangle in pixels, origin top left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeInfo {
    /// 1 = first generation, 2 = HD.
    pub version: i32,
    pub elements: i32,
    pub pitch: i32,
    /// Radius in mm.
    pub radius: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedImageInfo {
    pub width: i32,
    pub height: i32,
    pub bits_per_pixel: i32,
    pub microns_per_pixel: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub tm: i64,
    #[serde(deserialize_with = "flag::deserialize")]
    pub overlay: bool,
}

/// Positional sample attached to a processed image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosInfo {
    /// Timestamp in nanoseconds.
    pub tm: i64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub mx: f64,
    pub my: f64,
    pub mz: f64,
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonInfo {
    pub id: i32,
    pub clicks: i32,
    /// 0 = short click, 1 = long press.
    pub long_press: i32,
}

impl ButtonInfo {
    pub const BUTTON_UP: i32 = 1;
    pub const BUTTON_DOWN: i32 = 2;

    pub fn is_long_press(&self) -> bool {
        self.long_press != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub id: String,
    /// "lastName,firstName".
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsInfo {
    #[serde(deserialize_with = "flag::deserialize")]
    pub auto_connect: bool,
    #[serde(deserialize_with = "flag::deserialize")]
    pub auto_scan: bool,
    /// Cine capture length in seconds, 1 to 30.
    pub cine_length: i32,
    /// Seconds before freezing once no-contact mode starts.
    pub auto_freeze: i32,
    /// Minutes to keep the scanner powered while not imaging.
    pub keep_awake: i32,
    /// One of the `BUTTON_*` functions.
    pub button_up: i32,
    pub button_down: i32,
}

impl SettingsInfo {
    pub const BUTTON_DISABLED: i32 = 0;
    /// On-probe freeze.
    pub const BUTTON_FREEZE: i32 = 1;
    /// Forwarded to the client as a button event.
    pub const BUTTON_USER: i32 = 2;
}

impl Default for SettingsInfo {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_scan: true,
            cine_length: 3,
            auto_freeze: 30,
            keep_awake: 15,
            button_up: Self::BUTTON_USER,
            button_down: Self::BUTTON_FREEZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerInfo {
    #[serde(rename = "type")]
    pub kind: i32,
    pub time: i32,
}

impl PowerInfo {
    pub const POWER_OFF_IDLE: i32 = 1;
    pub const POWER_OFF_BATTERY: i32 = 2;
    pub const POWER_OFF_TEMPERATURE: i32 = 3;
    pub const POWER_OFF_BUTTON: i32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CompleteExam {
    /// Store all captured data.
    Finish = 0,
    /// Discard captured data.
    Discard = 1,
    /// Shelve the exam for later.
    Shelve = 2,
}

impl CompleteExam {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Finish),
            1 => Some(Self::Discard),
            2 => Some(Self::Shelve),
            _ => None,
        }
    }
}

/// Predefined functions the service can run on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFunction {
    ToggleFreeze,
    CaptureImage,
    CaptureCine,
    DepthDecrease,
    DepthIncrease,
    GainDecrease,
    GainIncrease,
    ToggleAutoGain,
    ToggleZoom,
    ToggleFlip,
    ToggleCinePlay,
    ModeB,
    ModeM,
    ModeColorDoppler,
    ModePowerDoppler,
    ModePwDoppler,
    ModeNeedleEnhance,
    ModeElastography,
    ModeRf,
    /// Parameter: target depth in cm, clipped by the service.
    SetDepth,
    /// Parameter: central TGC in [-20, 20], or gamma in [-0.5, 0.5] with auto gain.
    SetGain,
}

const USER_FUNCTION_NAMES: [(UserFunction, &str); 21] = [
    (UserFunction::ToggleFreeze, "freeze"),
    (UserFunction::CaptureImage, "capture image"),
    (UserFunction::CaptureCine, "capture cine"),
    (UserFunction::DepthDecrease, "decrease depth"),
    (UserFunction::DepthIncrease, "increase depth"),
    (UserFunction::GainDecrease, "decrease gain"),
    (UserFunction::GainIncrease, "increase gain"),
    (UserFunction::ToggleAutoGain, "toggle auto gain"),
    (UserFunction::ToggleZoom, "toggle zoom"),
    (UserFunction::ToggleFlip, "toggle flip"),
    (UserFunction::ToggleCinePlay, "play/stop cine"),
    (UserFunction::ModeB, "b mode"),
    (UserFunction::ModeM, "m mode"),
    (UserFunction::ModeColorDoppler, "color doppler"),
    (UserFunction::ModePowerDoppler, "power doppler"),
    (UserFunction::ModePwDoppler, "pw doppler"),
    (UserFunction::ModeNeedleEnhance, "needle enhance"),
    (UserFunction::ModeElastography, "elastography"),
    (UserFunction::ModeRf, "rf mode"),
    (UserFunction::SetDepth, "set depth"),
    (UserFunction::SetGain, "set gain"),
];

impl UserFunction {
    pub fn as_str(self) -> &'static str {
        USER_FUNCTION_NAMES
            .iter()
            .find(|(function, _)| *function == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }
}

impl FromStr for UserFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        USER_FUNCTION_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(function, _)| *function)
            .ok_or_else(|| format!("unknown user function '{}'", s))
    }
}

/// A capture the service announced as ready for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub capture_id: String,
    pub file_name: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    /// Compressed pixel bytes (jpeg or png), not interpreted by the engine.
    pub data: Vec<u8>,
    pub info: ProcessedImageInfo,
    pub positions: Option<Vec<PosInfo>>,
}

/// Terminal reply to a raw range request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRangeReply {
    Ready {
        available: bool,
        package_size: i64,
        package_extension: String,
    },
    Failed(String),
}

/// Commands sent from the client to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RegisterClient,
    UnregisterClient,
    ConfigureImage(ImageConfig),
    AskScanArea,
    AskProbeInfo,
    AskPatientInfo,
    AskFreeze,
    AskDepth,
    AskGain,
    RunUserFunction {
        function: UserFunction,
        param: f64,
    },
    SetPatientInfo(PatientInfo),
    SetSettingsInfo(SettingsInfo),
    SetPartnerPackage {
        package_name: String,
    },
    CompleteExam(CompleteExam),
    CopyRawCapture {
        capture_id: String,
        writable_uri: String,
    },
    RequestRawRange {
        start_frame: i64,
        end_frame: i64,
        writable_uri: String,
    },
}

impl Command {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RegisterClient => MessageKind::RegisterClient,
            Self::UnregisterClient => MessageKind::UnregisterClient,
            Self::ConfigureImage(_) => MessageKind::ConfigureImage,
            Self::AskScanArea => MessageKind::AskScanArea,
            Self::AskProbeInfo => MessageKind::AskProbeInfo,
            Self::AskPatientInfo => MessageKind::AskPatientInfo,
            Self::AskFreeze => MessageKind::AskFreeze,
            Self::AskDepth => MessageKind::AskDepth,
            Self::AskGain => MessageKind::AskGain,
            Self::RunUserFunction { .. } => MessageKind::RunUserFunction,
            Self::SetPatientInfo(_) => MessageKind::SetPatientInfo,
            Self::SetSettingsInfo(_) => MessageKind::SetSettingsInfo,
            Self::SetPartnerPackage { .. } => MessageKind::SetPartnerPackage,
            Self::CompleteExam(_) => MessageKind::CompleteExam,
            Self::CopyRawCapture { .. } => MessageKind::CopyRawCapture,
            Self::RequestRawRange { .. } => MessageKind::RequestRawRange,
        }
    }

    /// True when the service answers with a generic return-status rather than
    /// a dedicated reply kind.
    pub fn expects_status(&self) -> bool {
        matches!(
            self,
            Self::RegisterClient
                | Self::UnregisterClient
                | Self::ConfigureImage(_)
                | Self::RunUserFunction { .. }
                | Self::SetPatientInfo(_)
                | Self::SetSettingsInfo(_)
                | Self::SetPartnerPackage { .. }
                | Self::CompleteExam(_)
        )
    }

    /// Encode the payload; tag and reply address are stamped by the session.
    pub fn encode(&self) -> Result<Envelope, serde_json::Error> {
        let mut envelope = Envelope::new(self.kind());
        match self {
            Self::RegisterClient
            | Self::UnregisterClient
            | Self::AskScanArea
            | Self::AskProbeInfo
            | Self::AskPatientInfo
            | Self::AskFreeze
            | Self::AskDepth
            | Self::AskGain => {}
            Self::ConfigureImage(config) => {
                envelope.put(
                    keys::IMAGE_SIZE,
                    &ImageSize {
                        width: config.width,
                        height: config.height,
                    },
                )?;
                envelope.put(keys::COMPRESSION_TYPE, &config.compression_type)?;
                envelope.put(keys::COMPRESSION_QUALITY, &config.compression_quality)?;
                envelope.put(keys::SEPARATE_OVERLAYS, &config.separate_overlays)?;
            }
            Self::RunUserFunction { function, param } => {
                envelope.put(keys::USER_FN, function.as_str())?;
                envelope.put(keys::USER_PARAM, param)?;
            }
            Self::SetPatientInfo(info) => envelope.put(keys::PATIENT_INFO, info)?,
            Self::SetSettingsInfo(info) => envelope.put(keys::SETTINGS_INFO, info)?,
            Self::SetPartnerPackage { package_name } => {
                envelope.put(keys::PACKAGE_NAME, package_name)?
            }
            Self::CompleteExam(exam) => envelope.put(keys::COMPLETE_EXAM, &(*exam as i32))?,
            Self::CopyRawCapture {
                capture_id,
                writable_uri,
            } => {
                envelope.put(keys::CAPTURE_ID, capture_id)?;
                envelope.put(keys::WRITABLE_URI, writable_uri)?;
            }
            Self::RequestRawRange {
                start_frame,
                end_frame,
                writable_uri,
            } => {
                envelope.put(keys::START_FRAME, start_frame)?;
                envelope.put(keys::END_FRAME, end_frame)?;
                envelope.put(keys::WRITABLE_URI, writable_uri)?;
            }
        }
        Ok(envelope)
    }

    /// Decode a client -> service envelope. Returns `None` for kinds that are
    /// not commands or unknown to this version.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, DecodeError> {
        let Some(kind) = envelope.kind() else {
            return Ok(None);
        };
        let fields = envelope.fields(kind);

        let command = match kind {
            MessageKind::RegisterClient => Self::RegisterClient,
            MessageKind::UnregisterClient => Self::UnregisterClient,
            MessageKind::AskScanArea => Self::AskScanArea,
            MessageKind::AskProbeInfo => Self::AskProbeInfo,
            MessageKind::AskPatientInfo => Self::AskPatientInfo,
            MessageKind::AskFreeze => Self::AskFreeze,
            MessageKind::AskDepth => Self::AskDepth,
            MessageKind::AskGain => Self::AskGain,
            MessageKind::ConfigureImage => {
                let size: ImageSize = fields.required(keys::IMAGE_SIZE)?;
                Self::ConfigureImage(ImageConfig {
                    width: size.width,
                    height: size.height,
                    compression_type: fields.required(keys::COMPRESSION_TYPE)?,
                    compression_quality: fields.required(keys::COMPRESSION_QUALITY)?,
                    separate_overlays: fields.flag(keys::SEPARATE_OVERLAYS)?,
                })
            }
            MessageKind::RunUserFunction => {
                let name: String = fields.required(keys::USER_FN)?;
                let function = name
                    .parse()
                    .map_err(|reason| DecodeError::InvalidField {
                        kind,
                        field: keys::USER_FN,
                        reason,
                    })?;
                Self::RunUserFunction {
                    function,
                    param: fields.required(keys::USER_PARAM)?,
                }
            }
            MessageKind::SetPatientInfo => Self::SetPatientInfo(fields.required(keys::PATIENT_INFO)?),
            MessageKind::SetSettingsInfo => {
                Self::SetSettingsInfo(fields.required(keys::SETTINGS_INFO)?)
            }
            MessageKind::SetPartnerPackage => Self::SetPartnerPackage {
                package_name: fields.required(keys::PACKAGE_NAME)?,
            },
            MessageKind::CompleteExam => {
                let value: i32 = fields.required(keys::COMPLETE_EXAM)?;
                let exam =
                    CompleteExam::from_i32(value).ok_or_else(|| DecodeError::InvalidField {
                        kind,
                        field: keys::COMPLETE_EXAM,
                        reason: format!("unknown exam completion {}", value),
                    })?;
                Self::CompleteExam(exam)
            }
            MessageKind::CopyRawCapture => Self::CopyRawCapture {
                capture_id: fields.required(keys::CAPTURE_ID)?,
                writable_uri: fields.required(keys::WRITABLE_URI)?,
            },
            MessageKind::RequestRawRange => Self::RequestRawRange {
                start_frame: fields.required(keys::START_FRAME)?,
                end_frame: fields.required(keys::END_FRAME)?,
                writable_uri: fields.required(keys::WRITABLE_URI)?,
            },
            MessageKind::ReturnStatus
            | MessageKind::FreezeChanged
            | MessageKind::NewProcessedImage
            | MessageKind::ButtonEvent
            | MessageKind::ScanAreaChanged
            | MessageKind::ScanAreaReturned
            | MessageKind::ProbeInfoReturned
            | MessageKind::NoLicense
            | MessageKind::Error
            | MessageKind::LicenseChanged
            | MessageKind::DepthChanged
            | MessageKind::DepthReturned
            | MessageKind::GainChanged
            | MessageKind::GainReturned
            | MessageKind::RawRangeReturned
            | MessageKind::RawRangeProgress
            | MessageKind::PowerEvent
            | MessageKind::PatientInfoReturned
            | MessageKind::FreezeReturned
            | MessageKind::RawCaptureAvailable
            | MessageKind::RawCaptureCopied => return Ok(None),
        };

        Ok(Some(command))
    }
}

/// Events and replies sent from the service to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ReturnStatus { tag: i32, status: i32 },
    FreezeChanged(bool),
    FreezeReturned(bool),
    DepthChanged(f64),
    DepthReturned(f64),
    GainChanged(f64),
    GainReturned(f64),
    NewProcessedImage(ProcessedImage),
    ButtonEvent(ButtonInfo),
    ScanAreaChanged(Rect),
    ScanAreaReturned(Rect),
    ProbeInfoReturned(ProbeInfo),
    PatientInfoReturned(PatientInfo),
    NoLicense,
    LicenseChanged(bool),
    Error(String),
    PowerEvent(PowerInfo),
    RawCaptureAvailable(RawCapture),
    RawCaptureCopied {
        capture_id: String,
        error: Option<String>,
    },
    RawRangeProgress(i32),
    RawRangeReturned(RawRangeReply),
}

impl Event {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ReturnStatus { .. } => MessageKind::ReturnStatus,
            Self::FreezeChanged(_) => MessageKind::FreezeChanged,
            Self::FreezeReturned(_) => MessageKind::FreezeReturned,
            Self::DepthChanged(_) => MessageKind::DepthChanged,
            Self::DepthReturned(_) => MessageKind::DepthReturned,
            Self::GainChanged(_) => MessageKind::GainChanged,
            Self::GainReturned(_) => MessageKind::GainReturned,
            Self::NewProcessedImage(_) => MessageKind::NewProcessedImage,
            Self::ButtonEvent(_) => MessageKind::ButtonEvent,
            Self::ScanAreaChanged(_) => MessageKind::ScanAreaChanged,
            Self::ScanAreaReturned(_) => MessageKind::ScanAreaReturned,
            Self::ProbeInfoReturned(_) => MessageKind::ProbeInfoReturned,
            Self::PatientInfoReturned(_) => MessageKind::PatientInfoReturned,
            Self::NoLicense => MessageKind::NoLicense,
            Self::LicenseChanged(_) => MessageKind::LicenseChanged,
            Self::Error(_) => MessageKind::Error,
            Self::PowerEvent(_) => MessageKind::PowerEvent,
            Self::RawCaptureAvailable(_) => MessageKind::RawCaptureAvailable,
            Self::RawCaptureCopied { .. } => MessageKind::RawCaptureCopied,
            Self::RawRangeProgress(_) => MessageKind::RawRangeProgress,
            Self::RawRangeReturned(_) => MessageKind::RawRangeReturned,
        }
    }

    pub fn encode(&self) -> Result<Envelope, serde_json::Error> {
        let mut envelope = Envelope::new(self.kind());
        match self {
            Self::ReturnStatus { tag, status } => {
                envelope.arg1 = *tag;
                envelope.arg2 = *status;
            }
            Self::FreezeChanged(frozen) | Self::FreezeReturned(frozen) => {
                envelope.put(keys::FREEZE, frozen)?
            }
            Self::DepthChanged(cm) | Self::DepthReturned(cm) => envelope.put(keys::DEPTH_CM, cm)?,
            Self::GainChanged(gain) | Self::GainReturned(gain) => envelope.put(keys::GAIN, gain)?,
            Self::NewProcessedImage(image) => {
                envelope.put(keys::IMAGE_DATA, &image.data)?;
                envelope.put(keys::IMAGE_INFO, &image.info)?;
                if let Some(positions) = &image.positions {
                    envelope.put(keys::POS_INFO, positions)?;
                }
            }
            Self::ButtonEvent(info) => envelope.put(keys::BUTTON_INFO, info)?,
            Self::ScanAreaChanged(rect) | Self::ScanAreaReturned(rect) => {
                envelope.put(keys::B_IMAGE_AREA, rect)?
            }
            Self::ProbeInfoReturned(info) => envelope.put(keys::PROBE_INFO, info)?,
            Self::PatientInfoReturned(info) => envelope.put(keys::PATIENT_INFO, info)?,
            Self::NoLicense => {}
            Self::LicenseChanged(licensed) => envelope.arg1 = i32::from(*licensed),
            Self::Error(message) => envelope.put(keys::ERROR_MESSAGE, message)?,
            Self::PowerEvent(info) => envelope.put(keys::POWER_INFO, info)?,
            Self::RawCaptureAvailable(capture) => {
                envelope.put(keys::CAPTURE_ID, &capture.capture_id)?;
                envelope.put(keys::FILE_NAME, &capture.file_name)?;
                envelope.put(keys::SIZE_BYTES, &capture.size_bytes)?;
            }
            Self::RawCaptureCopied { capture_id, error } => {
                envelope.put(keys::CAPTURE_ID, capture_id)?;
                if let Some(error) = error {
                    envelope.put(keys::ERROR_MESSAGE, error)?;
                }
            }
            Self::RawRangeProgress(percent) => envelope.arg2 = *percent,
            Self::RawRangeReturned(RawRangeReply::Failed(message)) => {
                envelope.put(keys::ERROR_MESSAGE, message)?
            }
            Self::RawRangeReturned(RawRangeReply::Ready {
                available,
                package_size,
                package_extension,
            }) => {
                envelope.put(keys::AVAILABLE, available)?;
                envelope.put(keys::PACKAGE_SIZE, package_size)?;
                envelope.put(keys::PACKAGE_EXTENSION, package_extension)?;
            }
        }
        Ok(envelope)
    }

    /// Decode a service -> client envelope.
    ///
    /// Unknown kinds and client -> service kinds yield `Ok(None)`; a missing
    /// required field is an error, never a default.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, DecodeError> {
        let Some(kind) = envelope.kind() else {
            return Ok(None);
        };
        let fields = envelope.fields(kind);

        let event = match kind {
            MessageKind::ReturnStatus => Self::ReturnStatus {
                tag: envelope.arg1,
                status: envelope.arg2,
            },
            MessageKind::FreezeChanged => Self::FreezeChanged(fields.flag(keys::FREEZE)?),
            MessageKind::FreezeReturned => Self::FreezeReturned(fields.flag(keys::FREEZE)?),
            MessageKind::DepthChanged => Self::DepthChanged(fields.required(keys::DEPTH_CM)?),
            MessageKind::DepthReturned => Self::DepthReturned(fields.required(keys::DEPTH_CM)?),
            MessageKind::GainChanged => Self::GainChanged(fields.required(keys::GAIN)?),
            MessageKind::GainReturned => Self::GainReturned(fields.required(keys::GAIN)?),
            MessageKind::NewProcessedImage => Self::NewProcessedImage(ProcessedImage {
                data: fields.required(keys::IMAGE_DATA)?,
                info: fields.required(keys::IMAGE_INFO)?,
                positions: fields.optional(keys::POS_INFO)?,
            }),
            MessageKind::ButtonEvent => Self::ButtonEvent(fields.required(keys::BUTTON_INFO)?),
            MessageKind::ScanAreaChanged => {
                Self::ScanAreaChanged(fields.required(keys::B_IMAGE_AREA)?)
            }
            MessageKind::ScanAreaReturned => {
                Self::ScanAreaReturned(fields.required(keys::B_IMAGE_AREA)?)
            }
            MessageKind::ProbeInfoReturned => {
                Self::ProbeInfoReturned(fields.required(keys::PROBE_INFO)?)
            }
            MessageKind::PatientInfoReturned => {
                Self::PatientInfoReturned(fields.required(keys::PATIENT_INFO)?)
            }
            MessageKind::NoLicense => Self::NoLicense,
            MessageKind::LicenseChanged => Self::LicenseChanged(envelope.arg1 == 1),
            MessageKind::Error => Self::Error(fields.required(keys::ERROR_MESSAGE)?),
            MessageKind::PowerEvent => Self::PowerEvent(fields.required(keys::POWER_INFO)?),
            MessageKind::RawCaptureAvailable => Self::RawCaptureAvailable(RawCapture {
                capture_id: fields.required(keys::CAPTURE_ID)?,
                file_name: fields.required(keys::FILE_NAME)?,
                size_bytes: fields.required(keys::SIZE_BYTES)?,
            }),
            MessageKind::RawCaptureCopied => Self::RawCaptureCopied {
                capture_id: fields.required(keys::CAPTURE_ID)?,
                error: fields.optional(keys::ERROR_MESSAGE)?,
            },
            MessageKind::RawRangeProgress => Self::RawRangeProgress(envelope.arg2),
            MessageKind::RawRangeReturned => {
                match fields.optional::<String>(keys::ERROR_MESSAGE)? {
                    Some(message) => Self::RawRangeReturned(RawRangeReply::Failed(message)),
                    None => Self::RawRangeReturned(RawRangeReply::Ready {
                        available: fields.flag(keys::AVAILABLE)?,
                        package_size: fields.required(keys::PACKAGE_SIZE)?,
                        package_extension: fields.required(keys::PACKAGE_EXTENSION)?,
                    }),
                }
            }
            MessageKind::RegisterClient
            | MessageKind::UnregisterClient
            | MessageKind::ConfigureImage
            | MessageKind::AskScanArea
            | MessageKind::AskProbeInfo
            | MessageKind::RunUserFunction
            | MessageKind::AskDepth
            | MessageKind::AskGain
            | MessageKind::RequestRawRange
            | MessageKind::AskPatientInfo
            | MessageKind::SetPartnerPackage
            | MessageKind::AskFreeze
            | MessageKind::SetPatientInfo
            | MessageKind::SetSettingsInfo
            | MessageKind::CompleteExam
            | MessageKind::CopyRawCapture => return Ok(None),
        };

        Ok(Some(event))
    }
}
