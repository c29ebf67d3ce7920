//! Codecs turning cached entities into the bytes stored in the remote cache.
//!
//! Implementations of [`CacheCodec`](crate::traits::CacheCodec); the default
//! is JSON so cached values stay readable from `redis-cli`.

mod json;
pub use json::JsonCodec;
