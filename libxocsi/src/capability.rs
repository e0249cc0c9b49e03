//! Volume capability validation.
//!
//! Only filesystem (mount) access with the single-node-writer access mode is
//! supported. Block access and every multi-node or read-only mode are
//! rejected.

use tracing::debug;

use crate::types::{AccessMode, AccessType, VolumeCapability};

/// Return `true` if `cap` is present and requests mount access with the
/// single-node-writer mode.
pub fn is_valid_capability(cap: Option<&VolumeCapability>) -> bool {
    let Some(cap) = cap else {
        debug!("volume capability missing");
        return false;
    };

    if let AccessType::Block = cap.access_type {
        debug!("block access type is not supported");
        return false;
    }

    match cap.access_mode {
        AccessMode::SingleNodeWriter => true,
        mode => {
            debug!(?mode, "access mode is not supported");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_single_node_writer_mount() {
        assert!(is_valid_capability(Some(&VolumeCapability::mount("ext4"))));
        assert!(is_valid_capability(Some(&VolumeCapability::default())));
    }

    #[test]
    fn rejects_block_and_missing() {
        assert!(!is_valid_capability(None));
        assert!(!is_valid_capability(Some(&VolumeCapability::block())));
    }

    #[test]
    fn rejects_other_access_modes() {
        for mode in [
            AccessMode::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly,
            AccessMode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter,
            AccessMode::SingleNodeSingleWriter,
            AccessMode::SingleNodeMultiWriter,
        ] {
            let cap = VolumeCapability {
                access_mode: mode,
                ..VolumeCapability::default()
            };
            assert!(!is_valid_capability(Some(&cap)), "{mode:?} must be rejected");
        }
    }
}
