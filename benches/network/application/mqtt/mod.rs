pub mod codec;
pub mod registry;
