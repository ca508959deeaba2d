use crate::model::{InvalidTransition, RequestId, RequestState, SlotId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    RequestNotFound(RequestId),
    SlotNotFound(SlotId),
    InvalidTransition {
        request_id: RequestId,
        from: RequestState,
        to: RequestState,
    },
    LimitExceeded(&'static str),
}

impl EngineError {
    pub(crate) fn transition(request_id: RequestId, e: InvalidTransition) -> Self {
        EngineError::InvalidTransition {
            request_id,
            from: e.from,
            to: e.to,
        }
    }

    /// Not-found and invalid-transition are ordinary "no" answers to a caller;
    /// only limit violations are malformed input.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::LimitExceeded(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::RequestNotFound(id) => write!(f, "request not found: {id}"),
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::InvalidTransition { request_id, from, to } => {
                write!(f, "invalid transition for request {request_id}: {from} -> {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
