//! Rate limit driver interface. The core only asks "may this action proceed";
//! accounting strategy and backing store are the driver's business.

use async_trait::async_trait;

use crate::errors::RegistryV2Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitedAction {
    PullBlob,
    PushBlob,
    PullManifest,
    PushManifest,
    AnycastPullBlob,
}

#[async_trait]
pub trait RateLimitDriver: Send + Sync {
    fn plugin_type_id(&self) -> &'static str;

    /// Returns whether the action is allowed right now for the given account.
    async fn rate_limit_allows(
        &self,
        account_name: &str,
        action: RateLimitedAction,
        amount: u64,
    ) -> Result<bool, RegistryV2Error>;
}

/// Driver used when no rate limiting is configured: everything is allowed.
pub struct NoopRateLimitDriver;

#[async_trait]
impl RateLimitDriver for NoopRateLimitDriver {
    fn plugin_type_id(&self) -> &'static str {
        "noop"
    }

    async fn rate_limit_allows(
        &self,
        _account_name: &str,
        _action: RateLimitedAction,
        _amount: u64,
    ) -> Result<bool, RegistryV2Error> {
        Ok(true)
    }
}
