//! clawchat core library — config, backend clients, frame decoders, the
//! chat storage contract, and the stream orchestrator used by the CLI.

pub mod chat;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod store;
