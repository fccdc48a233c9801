mod log_buffer_pool;

pub use log_buffer_pool::{BufferPoolStats, BufferPoolStatsSnapshot, LogBuffer, LogBufferPool};
