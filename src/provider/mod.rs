//! Resource provider integration.
//!
//! A [`Provider`] realizes resources on a control plane. The apply engine
//! only talks to this trait; [`HttpProvider`] drives a JSON gateway and
//! [`SimulatedProvider`] keeps everything in memory.

mod client;
mod memory;
mod traits;
mod types;
mod wait;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigParser, ProviderConfig, ProviderKind};
use crate::error::Result;

pub use client::HttpProvider;
pub use memory::{CallCounts, Fault, SimulatedProvider};
pub use traits::Provider;
#[cfg(test)]
pub use traits::MockProvider;
pub use types::{CreateRequest, ProviderResource, ProviderStatus};
pub use wait::{WaitConfig, wait_until};

/// Builds the provider selected by the plan's provider section.
///
/// # Errors
///
/// Returns an error if the http provider lacks an endpoint or token.
pub fn from_config(
    config: &ProviderConfig,
    region: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Simulated => {
            let provider = region.map_or_else(SimulatedProvider::new, |r| SimulatedProvider::new().with_region(r));
            Ok(Arc::new(provider))
        }
        ProviderKind::Http => {
            let token = ConfigParser::get_api_token()?;
            let provider = HttpProvider::from_config(config, &token)?.with_cancellation(cancel.clone());
            Ok(Arc::new(provider))
        }
    }
}
