use serde::{Deserialize, Serialize};

/// Request-scoped identity passed explicitly through every operation.
///
/// Carries the authenticated tenant/user pair and the correlation id that is
/// propagated end-to-end as the `X-Request-ID` transport header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: String,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Context for control-plane-internal work (watchdogs, schedulers).
    pub fn system(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, "system")
    }
}
