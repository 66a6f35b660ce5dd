pub mod async_map;
pub mod concat_all;
pub mod into_stream;
pub mod retry_delayed;
