//! Chat request handler for the support portal: conversations between client
//! organizations and support staff, agent assignment, and conversion of chats
//! into support tickets, served behind a single `chat-api` endpoint.

pub mod actions;
pub mod app;
pub mod auth;
pub mod config;
pub mod conversation;
pub mod error;
pub mod store;
pub mod templates;
pub mod types;
