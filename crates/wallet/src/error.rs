use std::fmt;

use fluxd_primitives::encoding::DecodeError;
use fluxd_storage::StoreError;
use serde::Serialize;

use crate::chain::ChainError;

/// Categorical error codes reported to RPC callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RpcErrorCode {
    MiscError,
    TypeError,
    WalletError,
    InvalidAddressOrKey,
    InvalidParameter,
    DeserializationError,
    MethodNotFound,
}

impl RpcErrorCode {
    pub const fn code(self) -> i32 {
        match self {
            RpcErrorCode::MiscError => -1,
            RpcErrorCode::TypeError => -3,
            RpcErrorCode::WalletError => -4,
            RpcErrorCode::InvalidAddressOrKey => -5,
            RpcErrorCode::InvalidParameter => -8,
            RpcErrorCode::DeserializationError => -22,
            RpcErrorCode::MethodNotFound => -32601,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(RpcErrorCode::MiscError),
            -3 => Some(RpcErrorCode::TypeError),
            -4 => Some(RpcErrorCode::WalletError),
            -5 => Some(RpcErrorCode::InvalidAddressOrKey),
            -8 => Some(RpcErrorCode::InvalidParameter),
            -22 => Some(RpcErrorCode::DeserializationError),
            -32601 => Some(RpcErrorCode::MethodNotFound),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum WalletError {
    Rpc {
        code: RpcErrorCode,
        message: String,
    },
    Store(StoreError),
    Io(std::io::Error),
    Decode(DecodeError),
    Chain(ChainError),
    InvalidData(&'static str),
    NetworkMismatch {
        expected: &'static str,
        found: &'static str,
    },
    LockPoisoned,
}

impl WalletError {
    pub fn rpc(code: RpcErrorCode, message: impl Into<String>) -> Self {
        WalletError::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn misc(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::MiscError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::TypeError, message)
    }

    pub fn wallet(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::WalletError, message)
    }

    pub fn invalid_address_or_key(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::InvalidAddressOrKey, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::InvalidParameter, message)
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::rpc(RpcErrorCode::DeserializationError, message)
    }

    pub fn code(&self) -> RpcErrorCode {
        match self {
            WalletError::Rpc { code, .. } => *code,
            WalletError::Decode(_) => RpcErrorCode::DeserializationError,
            WalletError::Chain(_) | WalletError::LockPoisoned => RpcErrorCode::MiscError,
            WalletError::Store(_)
            | WalletError::Io(_)
            | WalletError::InvalidData(_)
            | WalletError::NetworkMismatch { .. } => RpcErrorCode::WalletError,
        }
    }

    pub fn is_rpc(&self, code: RpcErrorCode, message: &str) -> bool {
        matches!(self, WalletError::Rpc { code: c, message: m } if *c == code && m == message)
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::Rpc { message, .. } => write!(f, "{message}"),
            WalletError::Store(err) => write!(f, "wallet store error: {err}"),
            WalletError::Io(err) => write!(f, "{err}"),
            WalletError::Decode(err) => write!(f, "{err}"),
            WalletError::Chain(err) => write!(f, "{err}"),
            WalletError::InvalidData(message) => write!(f, "{message}"),
            WalletError::NetworkMismatch { expected, found } => write!(
                f,
                "wallet network mismatch (expected {expected}, found {found})"
            ),
            WalletError::LockPoisoned => write!(f, "wallet lock poisoned"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        WalletError::Store(err)
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        WalletError::Io(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Decode(err)
    }
}

impl From<ChainError> for WalletError {
    fn from(err: ChainError) -> Self {
        WalletError::Chain(err)
    }
}

/// Structured failure attached to one item of a batch result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RpcFailure {
    pub code: i32,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<RpcErrorCode> {
        RpcErrorCode::from_code(self.code)
    }
}

impl From<&WalletError> for RpcFailure {
    fn from(err: &WalletError) -> Self {
        RpcFailure::new(err.code(), err.to_string())
    }
}

impl From<WalletError> for RpcFailure {
    fn from(err: WalletError) -> Self {
        RpcFailure::from(&err)
    }
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
