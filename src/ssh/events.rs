//! Observer interfaces injected into a session at construction

/// Receives terminal output, auth prompts and notices, in arrival order
pub trait OutputSink: Send + Sync {
    fn on_output(&self, data: &[u8]);
}

/// Notified when the interactive channel goes away without a local `disconnect()`
pub trait LossListener: Send + Sync {
    fn on_unexpected_loss(&self);
}

impl<F> OutputSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_output(&self, data: &[u8]) {
        self(data)
    }
}

/// Listener for callers that do not care about loss
pub struct IgnoreLoss;

impl LossListener for IgnoreLoss {
    fn on_unexpected_loss(&self) {}
}

/// Loss listener backed by a closure
pub struct LossFn<F>(pub F);

impl<F> LossListener for LossFn<F>
where
    F: Fn() + Send + Sync,
{
    fn on_unexpected_loss(&self) {
        (self.0)()
    }
}
