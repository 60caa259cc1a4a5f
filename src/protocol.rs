//! Shared protocol constants for the dirsend control and data channels

// Mode tokens sent by the receiver on the control channel
pub const MODE_START: &str = "start";
pub const MODE_CONTINUE: &str = "continue";

// Data channel end-of-connection record (fileLength = -1, no path, no payload)
pub const END_MARKER: i64 = -1;

// Largest string the u16 length prefix can carry
pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

// Upper bound on entries in a receiver state map; rejects garbage counts
pub const MAX_STATE_ENTRIES: usize = 10_000_000;

// Upper bound on the connection count a receiver may request
pub const MAX_CONNECTIONS: i32 = 64;

pub mod defaults {
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 9031;

    // 1MB chunks; both sides must agree, nothing on the wire carries it
    pub const CHUNK_SIZE: usize = 1024 * 1024;
    pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

    // Connection spinner bounds from the receiver UI
    pub const MIN_CONNECTIONS: usize = 1;
    pub const MAX_CONNECTIONS: usize = 12;

    // Sender: how long to keep the listener open for a returning receiver
    pub const RECONNECT_WAIT_SECS: u64 = 300;

    // Receiver: automatic resume attempts and back-off between them
    pub const MAX_RECONNECTS: u32 = 5;
    pub const RECONNECT_DELAY_MS: u64 = 500;

    // Progress display refresh (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;
}
