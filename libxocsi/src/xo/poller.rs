//! Attach completion polling.
//!
//! `vm.attachDisk` can report success before the new VBD is plugged and has
//! a device name. [`wait_for_attachment`] re-queries the VBD on a fixed
//! interval until it is ready or an overall deadline passes.
//!
//! The wait is an ordinary future: dropping it (because the RPC that owns it
//! was abandoned) stops the polling.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Vbd, XoApi, XoError};

/// Polling schedule for attach completion. `interval` must be non-zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AttachPoll {
    /// Delay between two queries.
    #[serde(with = "secs", rename = "interval_secs")]
    pub interval: Duration,
    /// Overall deadline.
    #[serde(with = "secs", rename = "timeout_secs")]
    pub timeout: Duration,
}

impl Default for AttachPoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Wait until the VBD binding `vdi_id` to `vm_id` is plugged and carries a
/// device name.
///
/// Lookup failures while waiting are logged and retried; only the deadline
/// ends the wait with [`XoError::Timeout`].
pub async fn wait_for_attachment<A>(
    api: &A,
    vdi_id: &str,
    vm_id: &str,
    poll: AttachPoll,
) -> Result<Vbd, XoError>
where
    A: XoApi + ?Sized,
{
    let timeout = || XoError::Timeout {
        vdi: vdi_id.to_owned(),
        vm: vm_id.to_owned(),
        secs: poll.timeout.as_secs(),
    };
    let deadline = Instant::now() + poll.timeout;
    let mut tick = tokio::time::interval_at(Instant::now() + poll.interval, poll.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Err(timeout()),
            _ = tick.tick() => {
                // A hanging lookup must not outlive the deadline.
                let lookup = tokio::time::timeout_at(deadline, api.get_vbd(vdi_id, vm_id))
                    .await
                    .map_err(|_| timeout())?;
                match lookup {
                    Ok(vbd) if vbd.is_ready() => {
                        info!(vbd = %vbd.id, vm = vm_id, device = vbd.device_name(), "disk is now attached");
                        return Ok(vbd);
                    }
                    Ok(vbd) => {
                        debug!(vbd = %vbd.id, attached = vbd.attached, "disk not yet attached, waiting");
                    }
                    Err(e) => {
                        warn!(vdi = vdi_id, vm = vm_id, error = %e, "failed to get VBD while waiting for attach");
                    }
                }
            }
        }
    }
}
