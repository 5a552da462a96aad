// Media layer hooks
//
// The capture/transport library is an external collaborator. The core only
// forwards negotiated payloads to it and never looks inside them; readiness
// and failure come back through `Rendezvous::mark_ready` and
// `Rendezvous::report_media_failure`.

use crate::signal::SignalMessage;

/// Callback interface implemented by the media layer
#[cfg_attr(test, mockall::automock)]
pub trait MediaHooks: Send + Sync {
    /// An Offer was relayed to `recipient`; its media layer should answer
    fn place_call(&self, recipient: &str, offer: &SignalMessage);
    /// An Answer was relayed to `recipient`
    fn answer_call(&self, recipient: &str, answer: &SignalMessage);
    /// A reachability candidate was relayed to `recipient`
    fn add_candidate(&self, recipient: &str, candidate: &SignalMessage);
}

/// Hooks that do nothing; used when clients run their own media stack
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMedia;

impl MediaHooks for NoopMedia {
    fn place_call(&self, _recipient: &str, _offer: &SignalMessage) {}
    fn answer_call(&self, _recipient: &str, _answer: &SignalMessage) {}
    fn add_candidate(&self, _recipient: &str, _candidate: &SignalMessage) {}
}
