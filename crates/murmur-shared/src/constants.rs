/// Default HTTP + WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Capacity of each connection's outbound event queue
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Minimum number of invitees when creating a group
pub const MIN_GROUP_INVITEES: usize = 2;

/// Maximum message body length in characters
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Minimum username length
pub const MIN_USERNAME_LEN: usize = 3;

/// Header carrying the authenticated user id, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";
