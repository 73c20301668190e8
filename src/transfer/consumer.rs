//! Inbound Consumer
//!
//! Receiving side of a push: remembers which site is sending to this node and
//! applies incoming chunks through the cache's write pipeline.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{InvocationContext, WriteFlags, WritePipeline, XSiteState};
use crate::error::{Error, Result};

/// Applies state received from a remote site
pub struct InboundConsumer {
    pipeline: Arc<dyn WritePipeline>,
    sending_site: Mutex<Option<String>>,
}

impl InboundConsumer {
    pub fn new(pipeline: Arc<dyn WritePipeline>) -> Self {
        Self {
            pipeline,
            sending_site: Mutex::new(None),
        }
    }

    /// Mark this node as receiving from `site` and start tracking its writes.
    ///
    /// Repeating the call for the same site is harmless; a different site is
    /// rejected because a node cannot take two full pushes at once.
    pub fn start_state_transfer(&self, site: &str) -> Result<()> {
        let mut current = self.slot();
        match current.as_deref() {
            None => {
                *current = Some(site.to_string());
                drop(current);
                self.pipeline.start_tracking();
                tracing::info!("Receiving state from site {}", site);
                Ok(())
            }
            Some(active) if active == site => {
                tracing::debug!("Already receiving state from site {}", site);
                Ok(())
            }
            Some(active) => {
                tracing::error!(
                    "Rejecting state from site {}: already receiving from site {}",
                    site,
                    active
                );
                Err(Error::ConcurrentReceive {
                    current: active.to_string(),
                    requested: site.to_string(),
                })
            }
        }
    }

    /// Stop receiving from `site`. Stale or mismatched signals are ignored.
    pub fn end_state_transfer(&self, site: &str) -> bool {
        let mut current = self.slot();
        if current.as_deref() != Some(site) {
            tracing::debug!(
                "Ignoring end of state transfer from {} (receiving from {:?})",
                site,
                *current
            );
            return false;
        }
        *current = None;
        drop(current);
        self.pipeline.stop_tracking();
        tracing::info!("Finished receiving state from site {}", site);
        true
    }

    /// Site this node is receiving from
    pub fn sending_site(&self) -> Option<String> {
        self.slot().clone()
    }

    /// Apply one chunk.
    ///
    /// With transactions the chunk is applied atomically; without them each
    /// record is written in turn through one reused context.
    pub async fn apply_state(&self, chunk: &[XSiteState]) -> Result<()> {
        tracing::debug!("Applying {} received entries", chunk.len());

        match self.pipeline.transactions() {
            Some(tm) => {
                let mut ctx = tm.begin().await?;
                for state in chunk {
                    if let Err(e) = self.pipeline.put(&mut ctx, state, WriteFlags::XSITE_STATE_TRANSFER).await {
                        tracing::warn!("Rolling back received chunk of {} entries: {}", chunk.len(), e);
                        if let Err(rollback) = tm.rollback(ctx).await {
                            tracing::error!("Rollback failed: {}", rollback);
                        }
                        return Err(e);
                    }
                }
                tm.commit(ctx).await
            }
            None => {
                let mut ctx = InvocationContext::non_transactional();
                for state in chunk {
                    self.pipeline.put(&mut ctx, state, WriteFlags::XSITE_STATE_TRANSFER).await?;
                }
                Ok(())
            }
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.sending_site.lock().unwrap_or_else(|e| e.into_inner())
    }
}
