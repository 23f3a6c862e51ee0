//! Master server client contract.
//!
//! The master coordinates range placement across the cluster. This node only
//! needs to report completed splits so the split-off half can be reassigned;
//! everything else the master does is out of scope here.

use std::path::Path;

use crate::error::Result;
use crate::types::{RangeSpec, TableIdentifier};

/// Contract for reporting range events to the master.
pub trait MasterClient: Send + Sync + 'static {
    /// Report that `split_off` was carved out of `old`. The transfer log at
    /// `transfer_log` holds the half's exported cells plus any writes
    /// buffered while the split was pending.
    fn report_split(
        &self,
        table: &TableIdentifier,
        old: &RangeSpec,
        split_off: &RangeSpec,
        transfer_log: &Path,
    ) -> Result<()>;
}

/// Master client for single-node deployments: records the report and moves on.
pub struct LogOnlyMaster;

impl MasterClient for LogOnlyMaster {
    fn report_split(
        &self,
        table: &TableIdentifier,
        old: &RangeSpec,
        split_off: &RangeSpec,
        transfer_log: &Path,
    ) -> Result<()> {
        tracing::info!(
            table = %table.name,
            old = %old,
            split_off = %split_off,
            transfer_log = %transfer_log.display(),
            "reported range split"
        );
        Ok(())
    }
}
