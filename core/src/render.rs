//! Presentation boundary. The core only says *when* something changed;
//! layout belongs to the front end.

use crate::agents::ProviderId;
use crate::transcript::Turn;

pub trait RenderSink: Send + Sync {
    /// Called after the placeholder turn is appended and again after it settles.
    fn transcript_changed(&self, turns: &[Turn]);

    /// Called when a submission was refused for lack of API keys.
    fn credentials_required(&self, missing: &[ProviderId]);
}

/// Sink for callers that have nothing to draw.
pub struct NullSink;

impl RenderSink for NullSink {
    fn transcript_changed(&self, _turns: &[Turn]) {}

    fn credentials_required(&self, _missing: &[ProviderId]) {}
}
