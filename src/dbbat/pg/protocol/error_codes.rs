// Postgres error codes (SQLSTATE) used by the proxy.
// Class 08 — Connection Exception
pub const CONNECTION_FAILURE: &str = "08006"; // connection_failure
pub const PROTOCOL_VIOLATION: &str = "08P01"; // protocol_violation
// Class 0A — Feature Not Supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000"; // feature_not_supported
// Class 28 — Invalid Authorization Specification
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000"; // invalid_authorization_specification
pub const INVALID_PASSWORD: &str = "28P01"; // invalid_password
// Class 42 — Syntax Error or Access Rule Violation
pub const SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION: &str = "42000"; // syntax_error_or_access_rule_violation
pub const INSUFFICIENT_PRIVILEGE: &str = "42501"; // insufficient_privilege
// Class 53 — Insufficient Resources
pub const TOO_MANY_CONNECTIONS: &str = "53300"; // too_many_connections
// Class 57 — Operator Intervention
pub const ADMIN_SHUTDOWN: &str = "57P01"; // admin_shutdown
pub const CANNOT_CONNECT_NOW: &str = "57P03"; // cannot_connect_now
