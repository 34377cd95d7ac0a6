//! Consumer-facing seam between the engine and the device channel.
//!
//! The engine executes against [`DevicePort`] rather than the concrete
//! dispatcher, so tests and offline previews can substitute scripted
//! behavior without a transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::protocol::ImageMatchResult;

/// Abstracts how a resolved command reaches the device and how an image
/// match is requested.
#[async_trait]
pub trait DevicePort: Send + Sync {
    /// Sends one command and awaits its correlated output.
    async fn dispatch(&self, command: &str, cancel: &CancellationToken) -> Result<String, ChannelError>;

    /// Requests an on-screen template match and awaits its result.
    async fn match_image(
        &self,
        template_path: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ImageMatchResult, ChannelError>;
}

/// Offline port that echoes commands and reports every match as found.
///
/// Used by the CLI rehearsal mode and by tests that exercise engine control
/// flow without a device.
#[derive(Debug, Default)]
pub struct EchoPort;

#[async_trait]
impl DevicePort for EchoPort {
    async fn dispatch(&self, command: &str, cancel: &CancellationToken) -> Result<String, ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Stopped);
        }
        Ok(format!("echo: {command}"))
    }

    async fn match_image(
        &self,
        _template_path: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ImageMatchResult, ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Stopped);
        }
        Ok(ImageMatchResult {
            success: true,
            message: None,
            confidence: Some(1.0),
        })
    }
}
