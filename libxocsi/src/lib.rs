//! # libxocsi — Xen Orchestra block-volume CSI plugin
//!
//! `libxocsi` attaches pre-existing Xen Orchestra VDIs to the VMs that act
//! as cluster nodes, formats and mounts them once per node, and bind-mounts
//! them into workloads. Requests arrive as [`CsiMessage`] values over QUIC
//! (via [`quinn`]); the hypervisor is driven through its JSON-RPC API.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, requests, publish-context keys. |
//! | [`error`] | [`CsiError`] and the status [`error::Code`] it maps to. |
//! | [`capability`] | Which volume capabilities the plugin accepts. |
//! | [`lock`] | Per-volume / per-path async locks. |
//! | [`xo`] | Xen Orchestra client and attach-completion poller. |
//! | [`mount`] | Mount table parsing and the Linux mounter. |
//! | [`node_metadata`] | Node id, pool and host discovery. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait — attach / detach. |
//! | [`node`] | [`CsiNode`] trait — stage, publish, unpublish, unstage. |
//! | [`backend`] | The Xen Orchestra implementation of the three traits. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`config`] | YAML configuration with environment overrides. |
//! | [`version`] | Build metadata. |

pub mod backend;
pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod mount;
pub mod node;
pub mod node_metadata;
pub mod transport;
pub mod types;
pub mod version;
pub mod xo;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::xenorchestra::XoCsiDriver;
pub use config::DriverConfig;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
