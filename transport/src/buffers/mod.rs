pub mod buffer_pool;
pub mod packet_buffer;
