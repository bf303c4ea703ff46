pub mod dispatch;
pub mod envelope;
pub mod gateway;
pub mod requests;
pub mod spatial_index;
