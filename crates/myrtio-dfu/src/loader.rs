//! Boot-time application of a registered image.
//!
//! Runs before the application starts. A pending image is verified again
//! and copied from staging into the app partition; the update counter is
//! finished only after the copy succeeded, so losing power half way through
//! simply repeats the copy on the next boot.

use log::{error, info};

use crate::digest::DigestEngine;
use crate::error::DfuError;
use crate::manager::DfuManager;
use crate::storage::DfuStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Nothing was pending
    NoUpdate,
    /// Payload of `size` bytes copied into the app partition
    Applied { size: u32 },
    /// Pending image could not be applied, app partition left as is
    Failed(DfuError),
}

pub fn boot<S: DfuStorage, D: DigestEngine>(dfu: &mut DfuManager<S, D>) -> BootOutcome {
    match dfu.has_update() {
        Ok(false) => return BootOutcome::NoUpdate,
        Ok(true) => {}
        Err(e) => {
            error!("dfu: cannot read update counter: {}", e);
            return BootOutcome::Failed(e);
        }
    }

    let size = match dfu.apply_update() {
        Ok(size) => size,
        Err(e) => {
            error!("dfu: update failed: {}", e);
            if let Err(e) = dfu.record_error() {
                error!("dfu: cannot record error: {}", e);
            }
            return BootOutcome::Failed(e);
        }
    };

    if let Err(e) = dfu.finish() {
        error!("dfu: cannot finish update: {}", e);
        return BootOutcome::Failed(e);
    }
    info!(
        "dfu: update #{} applied",
        dfu.count().unwrap_or_default()
    );
    BootOutcome::Applied { size }
}
