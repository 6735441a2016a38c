// src/lib.rs

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod security;
pub mod telegram;
pub mod terminal;
