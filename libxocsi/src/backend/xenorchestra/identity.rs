use async_trait::async_trait;

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

/// Plugin name and version as reported to the orchestrator.
#[derive(Debug, Clone)]
pub struct XoIdentity {
    name: String,
    version: String,
}

impl XoIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[async_trait]
impl CsiIdentity for XoIdentity {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        if self.name.is_empty() {
            return Err(CsiError::Unavailable("driver name not configured".into()));
        }
        if self.version.is_empty() {
            return Err(CsiError::Unavailable("driver version not configured".into()));
        }
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }
}
