//! copilot-speaker: reads code-assistant suggestions aloud.
//!
//! Suggestions flow from a [`source::SuggestionSource`] through the
//! [`normalizer`] into a [`speech::SpeechAdapter`], all driven by
//! [`service::SpeakerService`].

pub mod api;
pub mod config;
pub mod error;
pub mod normalizer;
pub mod service;
pub mod source;
pub mod speech;

#[cfg(test)]
mod test_support;

pub use error::{Result, SpeakerError};
