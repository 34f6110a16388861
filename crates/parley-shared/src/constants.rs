/// Protocol version reported by `/info` and the `authenticated` frame
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Separator between the two sorted user ids of a direct conversation id
pub const DIRECT_ID_DELIMITER: char = ':';

/// Prefix of generated group conversation ids
pub const GROUP_ID_PREFIX: &str = "group-";

/// Maximum text content length in characters
pub const MAX_MESSAGE_LEN: usize = 4096;

/// History page size when the caller does not ask for one
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Upper bound on a single history page
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// Typing indicators expire after this long without a refresh
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 5_000;

/// Depth of each connection's outbound event queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Maximum group size, creator included
pub const MAX_GROUP_MEMBERS: usize = 256;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
