// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod dispatcher;
mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;
