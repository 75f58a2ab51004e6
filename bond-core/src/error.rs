//! Ledger Error Codes Registry
//!
//! Error code format: BL-{module}-{sequence}
//! - BL-VAL: Validation errors (rejected before any transaction opens)
//! - BL-AUTH: Caller resolution and role errors
//! - BL-FUND: Balance errors
//! - BL-INV: Bond inventory errors
//! - BL-CONF: State conflicts (pending requests, inactive holdings)
//! - BL-STORE: Storage failures (never partially applied)
//! - BL-INT: Invariant violations

use thiserror::Error;

use crate::types::Amount;

/// Ledger Result type
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error taxonomy used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    InsufficientFunds,
    InsufficientInventory,
    Conflict,
    StorageFailure,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "VALIDATION"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::InsufficientFunds => write!(f, "INSUFFICIENT_FUNDS"),
            Self::InsufficientInventory => write!(f, "INSUFFICIENT_INVENTORY"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::StorageFailure => write!(f, "STORAGE_FAILURE"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Ledger Error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // ============================================================
    // Validation Errors (BL-VAL-*)
    // ============================================================
    /// [BL-VAL-001] Purchase amount outside product rules
    #[error("[BL-VAL-001] Invalid purchase amount {amount}: {reason}")]
    InvalidAmount { amount: Amount, reason: String },

    /// [BL-VAL-002] Tenor not offered
    #[error("[BL-VAL-002] Unsupported tenor {tenor_days} days")]
    UnsupportedTenor { tenor_days: u32 },

    /// [BL-VAL-003] Bond issue rejected
    #[error("[BL-VAL-003] Invalid bond issue: {reason}")]
    InvalidBond { reason: String },

    /// [BL-VAL-004] Interest rate record rejected
    #[error("[BL-VAL-004] Invalid interest rate: {reason}")]
    InvalidRate { reason: String },

    /// [BL-VAL-005] Withdrawal or deposit amount must be positive
    #[error("[BL-VAL-005] Invalid transfer amount {amount}")]
    InvalidTransferAmount { amount: Amount },

    /// [BL-VAL-006] Account not found
    #[error("[BL-VAL-006] Account {user_id} not found")]
    AccountNotFound { user_id: String },

    /// [BL-VAL-007] Holding not found for this user
    #[error("[BL-VAL-007] Holding {holding_id} not found")]
    HoldingNotFound { holding_id: String },

    /// [BL-VAL-008] Withdrawal request not found
    #[error("[BL-VAL-008] Withdrawal request {request_id} not found")]
    WithdrawalNotFound { request_id: String },

    // ============================================================
    // Caller Errors (BL-AUTH-*)
    // ============================================================
    /// [BL-AUTH-001] Credential did not resolve to a caller
    #[error("[BL-AUTH-001] Caller could not be authenticated")]
    Unauthenticated,

    /// [BL-AUTH-002] Caller lacks the role for this operation
    #[error("[BL-AUTH-002] Operation {operation} requires role {required}")]
    Forbidden { operation: String, required: String },

    // ============================================================
    // Funds Errors (BL-FUND-*)
    // ============================================================
    /// [BL-FUND-001] Balance below requested amount
    #[error("[BL-FUND-001] Insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    // ============================================================
    // Inventory Errors (BL-INV-*)
    // ============================================================
    /// [BL-INV-001] Eligible bonds cannot cover the request
    #[error("[BL-INV-001] Insufficient bond inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: Amount, available: Amount },

    // ============================================================
    // Conflict Errors (BL-CONF-*)
    // ============================================================
    /// [BL-CONF-001] A withdrawal request is already outstanding
    #[error("[BL-CONF-001] User {user_id} already has a pending withdrawal request")]
    RequestAlreadyPending { user_id: String },

    /// [BL-CONF-002] Holding already redeemed or matured
    #[error("[BL-CONF-002] Holding {holding_id} is no longer active")]
    HoldingNotActive { holding_id: String },

    /// [BL-CONF-003] Holding passed its maturity date and awaits settlement
    #[error("[BL-CONF-003] Holding {holding_id} has matured and awaits settlement")]
    HoldingMatured { holding_id: String },

    /// [BL-CONF-004] Withdrawal request already resolved
    #[error("[BL-CONF-004] Withdrawal request {request_id} already resolved")]
    WithdrawalAlreadyResolved { request_id: String },

    /// [BL-CONF-005] No interest rate record exists
    #[error("[BL-CONF-005] No interest rate has been published")]
    NoInterestRate,

    /// [BL-CONF-006] Account already exists
    #[error("[BL-CONF-006] Account {user_id} already exists")]
    AccountExists { user_id: String },

    // ============================================================
    // Storage Errors (BL-STORE-*)
    // ============================================================
    /// [BL-STORE-001] Transaction could not commit
    #[error("[BL-STORE-001] Storage failure: {message}")]
    Storage { message: String, retryable: bool },

    // ============================================================
    // Internal Errors (BL-INT-*)
    // ============================================================
    /// [BL-INT-001] Ledger invariant violated
    #[error("[BL-INT-001] Invariant violation ({invariant}): {details}")]
    InvariantViolation { invariant: String, details: String },

    /// [BL-INT-002] Arithmetic could not be represented
    #[error("[BL-INT-002] Arithmetic overflow in {context}")]
    ArithmeticOverflow { context: String },
}

impl LedgerError {
    /// Create an invariant violation error
    pub fn invariant(invariant: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvariantViolation {
            invariant: invariant.into(),
            details: details.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>, retryable: bool) -> Self {
        Self::Storage {
            message: message.into(),
            retryable,
        }
    }

    /// Create an overflow error
    pub fn overflow(context: impl Into<String>) -> Self {
        Self::ArithmeticOverflow {
            context: context.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount { .. }
            | Self::UnsupportedTenor { .. }
            | Self::InvalidBond { .. }
            | Self::InvalidRate { .. }
            | Self::InvalidTransferAmount { .. }
            | Self::AccountNotFound { .. }
            | Self::HoldingNotFound { .. }
            | Self::WithdrawalNotFound { .. } => ErrorKind::Validation,
            Self::Unauthenticated | Self::Forbidden { .. } => ErrorKind::Unauthorized,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InsufficientInventory { .. } => ErrorKind::InsufficientInventory,
            Self::RequestAlreadyPending { .. }
            | Self::HoldingNotActive { .. }
            | Self::HoldingMatured { .. }
            | Self::WithdrawalAlreadyResolved { .. }
            | Self::NoInterestRate
            | Self::AccountExists { .. } => ErrorKind::Conflict,
            Self::Storage { .. } => ErrorKind::StorageFailure,
            Self::InvariantViolation { .. } | Self::ArithmeticOverflow { .. } => ErrorKind::Internal,
        }
    }

    /// Registry code, e.g. "BL-FUND-001"
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "BL-VAL-001",
            Self::UnsupportedTenor { .. } => "BL-VAL-002",
            Self::InvalidBond { .. } => "BL-VAL-003",
            Self::InvalidRate { .. } => "BL-VAL-004",
            Self::InvalidTransferAmount { .. } => "BL-VAL-005",
            Self::AccountNotFound { .. } => "BL-VAL-006",
            Self::HoldingNotFound { .. } => "BL-VAL-007",
            Self::WithdrawalNotFound { .. } => "BL-VAL-008",
            Self::Unauthenticated => "BL-AUTH-001",
            Self::Forbidden { .. } => "BL-AUTH-002",
            Self::InsufficientFunds { .. } => "BL-FUND-001",
            Self::InsufficientInventory { .. } => "BL-INV-001",
            Self::RequestAlreadyPending { .. } => "BL-CONF-001",
            Self::HoldingNotActive { .. } => "BL-CONF-002",
            Self::HoldingMatured { .. } => "BL-CONF-003",
            Self::WithdrawalAlreadyResolved { .. } => "BL-CONF-004",
            Self::NoInterestRate => "BL-CONF-005",
            Self::AccountExists { .. } => "BL-CONF-006",
            Self::Storage { .. } => "BL-STORE-001",
            Self::InvariantViolation { .. } => "BL-INT-001",
            Self::ArithmeticOverflow { .. } => "BL-INT-002",
        }
    }

    /// Whether the caller may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { retryable: true, .. })
    }
}
