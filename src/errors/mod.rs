//! Structured error codes.
//!
//! Every failure that ends up on a result record carries a numeric code so
//! that CI pipelines and dashboards can act on the class of failure without
//! parsing free-form messages.
//!
//! Code ranges by category:
//!
//! | Range  | Category    | Meaning                                   |
//! |--------|-------------|-------------------------------------------|
//! | E1xxx  | Selector    | Bad IP/label expression from the operator |
//! | E2xxx  | Connection  | Transport, handshake or authentication    |
//! | E3xxx  | Execution   | Remote command ran but did not succeed    |
//! | E4xxx  | Transfer    | SFTP, local filesystem, inventory         |
//! | E5xxx  | Internal    | Bug in pssh itself                        |

use std::fmt;

// ============================================================================
// ERROR CODE
// ============================================================================

/// Four-digit error code; the first digit selects the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: selector expressions
    // ========================================================================
    // Operator mistakes. These surface as hard errors before any connection
    // is opened, never as per-host results.

    /// IP expression failed to parse.
    pub const INVALID_IP_EXPRESSION: Self = Self(1001);

    /// Octet value outside 0..=255.
    pub const INVALID_OCTET: Self = Self(1002);

    /// Range with start above end.
    pub const REVERSED_RANGE: Self = Self(1003);

    /// CIDR prefix above /32.
    pub const INVALID_CIDR: Self = Self(1004);

    /// Malformed `[..]` field enumeration.
    pub const MALFORMED_FIELD_SPEC: Self = Self(1005);

    // ========================================================================
    // E2xxx: connection and authentication
    // ========================================================================

    /// TCP connect or handshake exceeded the connect timeout.
    pub const CONNECT_TIMEOUT: Self = Self(2001);

    /// TCP connect refused or host unresolvable.
    pub const CONNECT_FAILED: Self = Self(2002);

    /// SSH handshake failed after the TCP connect succeeded.
    pub const HANDSHAKE_FAILED: Self = Self(2003);

    /// Server rejected every offered authentication method.
    pub const AUTH_FAILED: Self = Self(2004);

    /// Private key material could not be read or decoded.
    pub const KEY_LOAD_FAILED: Self = Self(2005);

    /// Recorded host key no longer matches the server's key.
    pub const HOST_KEY_CHANGED: Self = Self(2006);

    // ========================================================================
    // E3xxx: command execution
    // ========================================================================

    /// Remote command exited with a non-zero status.
    pub const NON_ZERO_EXIT: Self = Self(3001);

    /// Command did not finish within the command timeout.
    pub const COMMAND_TIMEOUT: Self = Self(3002);

    /// Channel closed without reporting an exit status.
    pub const MISSING_EXIT_STATUS: Self = Self(3003);

    /// Session channel could not be opened or used.
    pub const CHANNEL_FAILED: Self = Self(3004);

    /// Task was cancelled by stop-on-error propagation.
    pub const CANCELLED: Self = Self(3005);

    // ========================================================================
    // E4xxx: transfers and local environment
    // ========================================================================

    /// Local file or directory does not exist.
    pub const LOCAL_PATH_MISSING: Self = Self(4001);

    /// Remote path could not be created or opened over SFTP.
    pub const REMOTE_PATH_FAILED: Self = Self(4002);

    /// Transfer aborted mid-stream.
    pub const TRANSFER_FAILED: Self = Self(4003);

    /// Unknown variable in a download naming template.
    pub const TEMPLATE_VARIABLE: Self = Self(4004);

    /// Inventory file missing or unreadable.
    pub const INVENTORY_FILE: Self = Self(4005);

    /// Inventory contents failed validation.
    pub const INVENTORY_INVALID: Self = Self(4006);

    // ========================================================================
    // E5xxx: internal
    // ========================================================================

    /// Unexpected internal failure; please report.
    pub const INTERNAL: Self = Self(5001);

    /// A per-host task panicked; the scheduler recovered it.
    pub const TASK_PANIC: Self = Self(5002);

    // ========================================================================
    // METHODS
    // ========================================================================

    /// Numeric code, e.g. `ErrorCode::AUTH_FAILED.code() == 2004`.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Code with the `E` prefix, e.g. `"E2004"`.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Category derived from the leading digit.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Selector,
            2 => ErrorCategory::Connection,
            3 => ErrorCategory::Execution,
            4 => ErrorCategory::Transfer,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Short description for logs and summaries.
    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Invalid IP expression",
            1002 => "Octet out of range",
            1003 => "Reversed address range",
            1004 => "Invalid CIDR prefix",
            1005 => "Malformed field enumeration",
            2001 => "Connect timeout",
            2002 => "Connection failed",
            2003 => "SSH handshake failed",
            2004 => "Authentication failed",
            2005 => "Private key unusable",
            2006 => "Host key changed",
            3001 => "Non-zero exit",
            3002 => "Command timeout",
            3003 => "Missing exit status",
            3004 => "Channel failure",
            3005 => "Cancelled",
            4001 => "Local path missing",
            4002 => "Remote path failure",
            4003 => "Transfer failed",
            4004 => "Unknown template variable",
            4005 => "Inventory file unreadable",
            4006 => "Inventory validation failed",
            5001 => "Internal error",
            5002 => "Task panicked",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// ERROR CATEGORY
// ============================================================================

/// Category keyed from the first digit of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// E1xxx: selector expression problems.
    Selector,
    /// E2xxx: transport and authentication.
    Connection,
    /// E3xxx: remote command execution.
    Execution,
    /// E4xxx: transfers, inventory and local filesystem.
    Transfer,
    /// E5xxx: internal faults.
    Internal,
    /// Code outside the known ranges.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector => write!(f, "Selector"),
            Self::Connection => write!(f, "Connection"),
            Self::Execution => write!(f, "Execution"),
            Self::Transfer => write!(f, "Transfer"),
            Self::Internal => write!(f, "Internal"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// ============================================================================
// STRUCTURED ERROR
// ============================================================================

/// Error with a code, a detail message and optional host context.
///
/// This is the shape that lands in a result record's `error` field, via
/// [`StructuredError::user_message`].
#[derive(Debug)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub host: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            host: None,
        }
    }

    /// Attaches the host the error belongs to.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// `[E2004] permission denied (host: web-1)`.
    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);
        if let Some(host) = &self.host {
            msg.push_str(&format!(" (host: {})", host));
        }
        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}

// ============================================================================
// TESTS
// ============================================================================
