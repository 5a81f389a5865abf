pub mod config;
pub mod cpal_audio;
pub mod openai_adapter;
pub mod trigger;
pub mod weather;
