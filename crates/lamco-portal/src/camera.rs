//! Camera portal integration

use ashpd::desktop::camera::Camera;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, info};

use crate::broker::{from_ashpd, BrokerResponse};
use crate::error::Result;

/// Camera portal manager
#[derive(Debug, Default)]
pub struct CameraManager;

impl CameraManager {
    pub fn new() -> Self {
        Self
    }

    /// IsCameraPresent property
    pub async fn is_present(&self) -> Result<bool> {
        let proxy = Camera::new().await?;
        let present = proxy.is_present().await?;
        debug!("Camera present: {}", present);
        Ok(present)
    }

    /// AccessCamera
    pub async fn access(&self) -> Result<BrokerResponse<()>> {
        info!("Requesting camera access");

        let proxy = Camera::new().await?;
        match proxy.request_access().await {
            Ok(request) => from_ashpd(request.response()),
            Err(e) => from_ashpd(Err(e)),
        }
    }

    /// Open the PipeWire remote exposing the camera nodes
    pub async fn open_remote(&self) -> Result<OwnedFd> {
        let proxy = Camera::new().await?;
        let fd = proxy.open_pipe_wire_remote().await?;

        info!("Camera PipeWire FD obtained: {}", fd.as_raw_fd());
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Wayland session
    async fn test_camera_presence_query() {
        let manager = CameraManager::new();
        assert!(manager.is_present().await.is_ok());
    }
}
