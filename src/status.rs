//! The CTAP status byte taxonomy (CTAP 2.0 §8.3).

/// A CTAP response status code.
///
/// Every CTAP response begins with a single status byte (see
/// [`crate::error::CtapError`]). `0x00` is success and is represented
/// elsewhere as `Ok`; every other value surfaces through this enum.
/// Ranges the CTAP 2.0 spec reserves but does not name are preserved as
/// their numeric value so no status byte is ever unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtapStatus {
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSeq,
    Timeout,
    ChannelBusy,
    LockRequired,
    InvalidChannel,
    CborUnexpectedType,
    InvalidCbor,
    MissingParameter,
    LimitExceeded,
    UnsupportedExtension,
    CredentialExcluded,
    Processing,
    InvalidCredential,
    UserActionPending,
    OperationPending,
    NoOperations,
    UnsupportedAlgorithm,
    OperationDenied,
    KeyStoreFull,
    NotBusy,
    NoOperationPending,
    UnsupportedOption,
    InvalidOption,
    KeepaliveCancel,
    NoCredentials,
    UserActionTimeout,
    NotAllowed,
    PinInvalid,
    PinBlocked,
    PinAuthInvalid,
    PinAuthBlocked,
    PinNotSet,
    PinRequired,
    PinPolicyViolation,
    PinTokenExpired,
    RequestTooLarge,
    ActionTimeout,
    UpRequired,
    UvBlocked,
    IntegrityFailure,
    InvalidSubcommand,
    UvInvalid,
    UnauthorizedPermission,
    Other,
    Spec(u8),
    Extension(u8),
    Vendor(u8),
    Unknown(u8),
}

impl CtapStatus {
    /// Decode a raw CTAP status byte. `0x00` is success and is not
    /// representable by this type — callers check the status byte for
    /// zero before constructing a `CtapStatus`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::InvalidCommand,
            0x02 => Self::InvalidParameter,
            0x03 => Self::InvalidLength,
            0x04 => Self::InvalidSeq,
            0x05 => Self::Timeout,
            0x06 => Self::ChannelBusy,
            0x0A => Self::LockRequired,
            0x0B => Self::InvalidChannel,
            0x11 => Self::CborUnexpectedType,
            0x12 => Self::InvalidCbor,
            0x14 => Self::MissingParameter,
            0x15 => Self::LimitExceeded,
            0x16 => Self::UnsupportedExtension,
            0x19 => Self::CredentialExcluded,
            0x21 => Self::Processing,
            0x22 => Self::InvalidCredential,
            0x23 => Self::UserActionPending,
            0x24 => Self::OperationPending,
            0x25 => Self::NoOperations,
            0x26 => Self::UnsupportedAlgorithm,
            0x27 => Self::OperationDenied,
            0x28 => Self::KeyStoreFull,
            0x29 => Self::NotBusy,
            0x2A => Self::NoOperationPending,
            0x2B => Self::UnsupportedOption,
            0x2C => Self::InvalidOption,
            0x2D => Self::KeepaliveCancel,
            0x2E => Self::NoCredentials,
            0x2F => Self::UserActionTimeout,
            0x30 => Self::NotAllowed,
            0x31 => Self::PinInvalid,
            0x32 => Self::PinBlocked,
            0x33 => Self::PinAuthInvalid,
            0x34 => Self::PinAuthBlocked,
            0x35 => Self::PinNotSet,
            0x36 => Self::PinRequired,
            0x37 => Self::PinPolicyViolation,
            0x38 => Self::PinTokenExpired,
            0x39 => Self::RequestTooLarge,
            0x3A => Self::ActionTimeout,
            0x3B => Self::UpRequired,
            0x3C => Self::UvBlocked,
            0x3D => Self::IntegrityFailure,
            0x3E => Self::InvalidSubcommand,
            0x3F => Self::UvInvalid,
            0x40 => Self::UnauthorizedPermission,
            0x7F => Self::Other,
            0xDF => Self::Spec(byte),
            0xE0..=0xEF => Self::Extension(byte),
            0xF0..=0xFF => Self::Vendor(byte),
            _ => Self::Unknown(byte),
        }
    }

    /// The raw wire value for this status.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::InvalidCommand => 0x01,
            Self::InvalidParameter => 0x02,
            Self::InvalidLength => 0x03,
            Self::InvalidSeq => 0x04,
            Self::Timeout => 0x05,
            Self::ChannelBusy => 0x06,
            Self::LockRequired => 0x0A,
            Self::InvalidChannel => 0x0B,
            Self::CborUnexpectedType => 0x11,
            Self::InvalidCbor => 0x12,
            Self::MissingParameter => 0x14,
            Self::LimitExceeded => 0x15,
            Self::UnsupportedExtension => 0x16,
            Self::CredentialExcluded => 0x19,
            Self::Processing => 0x21,
            Self::InvalidCredential => 0x22,
            Self::UserActionPending => 0x23,
            Self::OperationPending => 0x24,
            Self::NoOperations => 0x25,
            Self::UnsupportedAlgorithm => 0x26,
            Self::OperationDenied => 0x27,
            Self::KeyStoreFull => 0x28,
            Self::NotBusy => 0x29,
            Self::NoOperationPending => 0x2A,
            Self::UnsupportedOption => 0x2B,
            Self::InvalidOption => 0x2C,
            Self::KeepaliveCancel => 0x2D,
            Self::NoCredentials => 0x2E,
            Self::UserActionTimeout => 0x2F,
            Self::NotAllowed => 0x30,
            Self::PinInvalid => 0x31,
            Self::PinBlocked => 0x32,
            Self::PinAuthInvalid => 0x33,
            Self::PinAuthBlocked => 0x34,
            Self::PinNotSet => 0x35,
            Self::PinRequired => 0x36,
            Self::PinPolicyViolation => 0x37,
            Self::PinTokenExpired => 0x38,
            Self::RequestTooLarge => 0x39,
            Self::ActionTimeout => 0x3A,
            Self::UpRequired => 0x3B,
            Self::UvBlocked => 0x3C,
            Self::IntegrityFailure => 0x3D,
            Self::InvalidSubcommand => 0x3E,
            Self::UvInvalid => 0x3F,
            Self::UnauthorizedPermission => 0x40,
            Self::Other => 0x7F,
            Self::Spec(b) | Self::Extension(b) | Self::Vendor(b) | Self::Unknown(b) => b,
        }
    }
}

impl std::fmt::Display for CtapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidCommand => "CTAP1_ERR_INVALID_COMMAND",
            Self::InvalidParameter => "CTAP1_ERR_INVALID_PARAMETER",
            Self::InvalidLength => "CTAP1_ERR_INVALID_LENGTH",
            Self::InvalidSeq => "CTAP1_ERR_INVALID_SEQ",
            Self::Timeout => "CTAP1_ERR_TIMEOUT",
            Self::ChannelBusy => "CTAP1_ERR_CHANNEL_BUSY",
            Self::LockRequired => "CTAP1_ERR_LOCK_REQUIRED",
            Self::InvalidChannel => "CTAP1_ERR_INVALID_CHANNEL",
            Self::CborUnexpectedType => "CTAP2_ERR_CBOR_UNEXPECTED_TYPE",
            Self::InvalidCbor => "CTAP2_ERR_INVALID_CBOR",
            Self::MissingParameter => "CTAP2_ERR_MISSING_PARAMETER",
            Self::LimitExceeded => "CTAP2_ERR_LIMIT_EXCEEDED",
            Self::UnsupportedExtension => "CTAP2_ERR_UNSUPPORTED_EXTENSION",
            Self::CredentialExcluded => "CTAP2_ERR_CREDENTIAL_EXCLUDED",
            Self::Processing => "CTAP2_ERR_PROCESSING",
            Self::InvalidCredential => "CTAP2_ERR_INVALID_CREDENTIAL",
            Self::UserActionPending => "CTAP2_ERR_USER_ACTION_PENDING",
            Self::OperationPending => "CTAP2_ERR_OPERATION_PENDING",
            Self::NoOperations => "CTAP2_ERR_NO_OPERATIONS",
            Self::UnsupportedAlgorithm => "CTAP2_ERR_UNSUPPORTED_ALGORITHM",
            Self::OperationDenied => "CTAP2_ERR_OPERATION_DENIED",
            Self::KeyStoreFull => "CTAP2_ERR_KEY_STORE_FULL",
            Self::NotBusy => "CTAP2_ERR_NOT_BUSY",
            Self::NoOperationPending => "CTAP2_ERR_NO_OPERATION_PENDING",
            Self::UnsupportedOption => "CTAP2_ERR_UNSUPPORTED_OPTION",
            Self::InvalidOption => "CTAP2_ERR_INVALID_OPTION",
            Self::KeepaliveCancel => "CTAP2_ERR_KEEPALIVE_CANCEL",
            Self::NoCredentials => "CTAP2_ERR_NO_CREDENTIALS",
            Self::UserActionTimeout => "CTAP2_ERR_USER_ACTION_TIMEOUT",
            Self::NotAllowed => "CTAP2_ERR_NOT_ALLOWED",
            Self::PinInvalid => "CTAP2_ERR_PIN_INVALID",
            Self::PinBlocked => "CTAP2_ERR_PIN_BLOCKED",
            Self::PinAuthInvalid => "CTAP2_ERR_PIN_AUTH_INVALID",
            Self::PinAuthBlocked => "CTAP2_ERR_PIN_AUTH_BLOCKED",
            Self::PinNotSet => "CTAP2_ERR_PIN_NOT_SET",
            Self::PinRequired => "CTAP2_ERR_PIN_REQUIRED",
            Self::PinPolicyViolation => "CTAP2_ERR_PIN_POLICY_VIOLATION",
            Self::PinTokenExpired => "CTAP2_ERR_PIN_TOKEN_EXPIRED",
            Self::RequestTooLarge => "CTAP2_ERR_REQUEST_TOO_LARGE",
            Self::ActionTimeout => "CTAP2_ERR_ACTION_TIMEOUT",
            Self::UpRequired => "CTAP2_ERR_UP_REQUIRED",
            Self::UvBlocked => "CTAP2_ERR_UV_BLOCKED",
            Self::IntegrityFailure => "CTAP2_ERR_INTEGRITY_FAILURE",
            Self::InvalidSubcommand => "CTAP2_ERR_INVALID_SUBCOMMAND",
            Self::UvInvalid => "CTAP2_ERR_UV_INVALID",
            Self::UnauthorizedPermission => "CTAP2_ERR_UNAUTHORIZED_PERMISSION",
            Self::Other => "CTAP1_ERR_OTHER",
            Self::Spec(_) => "CTAP2_ERR_SPEC_LAST",
            Self::Extension(_) => "CTAP2_ERR_EXTENSION",
            Self::Vendor(_) => "CTAP2_ERR_VENDOR",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{name} (0x{:02X})", self.to_byte())
    }
}
