// sync/mod.rs - bidirectional sync engine: push, pull, LWW, conflict log

pub mod client;
pub mod conflict;
pub mod lww;
pub mod pull;
pub mod push;
pub mod wire;

pub use client::SyncClient;
pub use pull::PullOutcome;
pub use push::PushOutcome;
