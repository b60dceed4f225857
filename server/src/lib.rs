//! `VoiceChat` Policy Build Tool
//!
//! Compiles every guild's policy sources into module snapshots, merges
//! them, and writes the guild snapshots the chat server loads at startup.

pub mod build;
pub mod config;
