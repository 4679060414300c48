//! New-member synchronization hook

use async_trait::async_trait;

use super::Group;
use crate::error::Result;

/// Pulls existing cluster state for a group into a node that just joined it.
///
/// Every registered synchronizer runs on each join; a failure in one does not
/// affect the others or the join itself.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn sync(&self, group: &Group) -> Result<()>;
}
