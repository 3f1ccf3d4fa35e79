//! Camera device enumeration
//!
//! A registry listener on the loop thread feeds every `Node` global into a
//! [`DeviceRegistry`]. Cameras are the nodes whose `media.class` is
//! `Video/Source`.

use std::collections::BTreeMap;
use tracing::debug;

/// `media.class` of capture devices
pub const CAMERA_MEDIA_CLASS: &str = "Video/Source";

/// A node announced by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    /// Global id, usable as stream target
    pub id: u32,
    /// `node.name`
    pub name: String,
    /// `node.description`, falls back to the name
    pub description: String,
    /// `media.class`
    pub media_class: Option<String>,
}

impl CameraDevice {
    pub fn is_camera(&self) -> bool {
        self.media_class.as_deref() == Some(CAMERA_MEDIA_CLASS)
    }
}

/// Known nodes, keyed by global id
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    nodes: BTreeMap<u32, CameraDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node global
    ///
    /// Nodes without a `node.name` cannot be selected and are skipped.
    pub fn add(&mut self, id: u32, name: Option<&str>, description: Option<&str>, media_class: Option<&str>) {
        let Some(name) = name else {
            debug!("Skipping unnamed node {}", id);
            return;
        };

        let device = CameraDevice {
            id,
            name: name.to_string(),
            description: description.unwrap_or(name).to_string(),
            media_class: media_class.map(str::to_string),
        };

        debug!("Node {} added: {} ({:?})", id, device.description, device.media_class);
        self.nodes.insert(id, device);
    }

    /// Forget a removed global, returns the node if it was known
    pub fn remove(&mut self, id: u32) -> Option<CameraDevice> {
        let removed = self.nodes.remove(&id);
        if let Some(ref device) = removed {
            debug!("Node {} removed: {}", id, device.name);
        }
        removed
    }

    pub fn get(&self, id: u32) -> Option<&CameraDevice> {
        self.nodes.get(&id)
    }

    /// Look up a node by its `node.name`
    pub fn find_by_name(&self, name: &str) -> Option<&CameraDevice> {
        self.nodes.values().find(|d| d.name == name)
    }

    /// All camera nodes, ordered by id
    pub fn cameras(&self) -> Vec<CameraDevice> {
        self.nodes.values().filter(|d| d.is_camera()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

/// What to do after a device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Already streaming from this node
    Unchanged,
    /// Tear down the current stream and target this node
    Switch(u32),
    /// No node carries that name
    NotFound,
}

/// Resolve a selection string against the registry
pub fn select_device(registry: &DeviceRegistry, name: &str, current: Option<u32>) -> DeviceSelection {
    match registry.find_by_name(name) {
        Some(device) if Some(device.id) == current => DeviceSelection::Unchanged,
        Some(device) => DeviceSelection::Switch(device.id),
        None => DeviceSelection::NotFound,
    }
}
