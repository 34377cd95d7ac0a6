//! Wire messages exchanged with the device over the command channel.
//!
//! Field names are camelCase on the wire (`requestId`, `templatePath`);
//! incoming frames carry no type tag and are discriminated by field shape,
//! so the untagged variant order below is load-bearing: an output frame has
//! `requestId` + `output`, a debug frame `requestId` + `message`, and an
//! image-match result `success`.

use serde::{Deserialize, Serialize};

/// Outgoing command request, correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Fully resolved command string.
    pub command: String,
    /// Correlation id generated by the dispatcher.
    pub request_id: String,
}

/// Outgoing request to match a template image against the device screen.
///
/// The match protocol carries no correlation id; at most one match is in
/// flight at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchRequest {
    /// Path of the template image to look for.
    pub template_path: String,
    /// How long the device should keep looking, in milliseconds.
    pub timeout_ms: u64,
}

/// Result of an image match request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchResult {
    /// Whether the template was found on screen.
    pub success: bool,
    /// Optional detail from the matcher.
    #[serde(default)]
    pub message: Option<String>,
    /// Match confidence in `[0, 1]` when reported.
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A frame sent to the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutgoingMessage {
    /// A command to execute.
    Command(CommandRequest),
    /// An image match to start.
    ImageMatch(ImageMatchRequest),
}

/// A frame received from the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IncomingMessage {
    /// Terminal response for a dispatched command.
    #[serde(rename_all = "camelCase")]
    CommandOutput {
        /// Correlation id echoed from the request.
        request_id: String,
        /// Collected command output.
        output: String,
    },
    /// Informational frame for a dispatched command; never resolves the
    /// pending call.
    #[serde(rename_all = "camelCase")]
    CommandDebug {
        /// Correlation id echoed from the request.
        request_id: String,
        /// Progress or diagnostic text.
        message: String,
    },
    /// Result of the image match currently in flight.
    ImageMatch(ImageMatchResult),
}
