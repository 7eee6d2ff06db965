use bulwark_core::{CallerId, CorrelationId};

/// Caller context for a request, inserted by the admission middleware.
///
/// Present on every route behind admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    caller_id: CallerId,
    correlation_id: CorrelationId,
}

impl CallerContext {
    pub fn new(caller_id: CallerId, correlation_id: CorrelationId) -> Self {
        Self {
            caller_id,
            correlation_id,
        }
    }

    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}
