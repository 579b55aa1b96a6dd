pub mod admin;
pub mod health;
pub mod realtime;
pub mod webhook;
