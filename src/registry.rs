use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::config::{DepthSettings, DetectorSettings};
use crate::depth::{ConstantDepth, DepthBackend, GroundPlaneDepth, LuminanceDepth};
use crate::detect::{ColorDetector, DetectorBackend, StubDetector};

pub type DetectorFactory =
    Box<dyn Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;
pub type DepthFactory = Box<dyn Fn(&DepthSettings) -> Result<Box<dyn DepthBackend>> + Send + Sync>;

/// Named constructors for both backend roles.
///
/// Backends are selected by name at construction time; the pipeline itself only ever sees the
/// trait objects.
pub struct BackendRegistry {
    detectors: BTreeMap<String, DetectorFactory>,
    depth: BTreeMap<String, DepthFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            detectors: BTreeMap::new(),
            depth: BTreeMap::new(),
        }
    }

    /// Registry preloaded with the built-in heuristic backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_detector("stub", |_| Ok(Box::new(StubDetector::new())));
        registry.register_detector("color", |_| Ok(Box::new(ColorDetector::new())));
        registry.register_depth("constant", |s| {
            Ok(Box::new(ConstantDepth::new(s.meters).with_stride(s.stride)))
        });
        registry.register_depth("ground", |s| {
            Ok(Box::new(GroundPlaneDepth::new(s.near_m, s.far_m, s.stride)))
        });
        registry.register_depth("luminance", |s| {
            Ok(Box::new(LuminanceDepth::new(s.near_m, s.far_m, s.stride)))
        });
        registry
    }

    /// Register a detector factory. A later registration under the same name replaces it.
    pub fn register_detector<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.detectors.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_depth<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DepthSettings) -> Result<Box<dyn DepthBackend>> + Send + Sync + 'static,
    {
        self.depth.insert(name.to_string(), Box::new(factory));
    }

    pub fn create_detector(&self, settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.detectors.get(&settings.backend).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not registered (available: {})",
                settings.backend,
                self.detector_names().join(", ")
            )
        })?;
        factory(settings)
    }

    pub fn create_depth(&self, settings: &DepthSettings) -> Result<Box<dyn DepthBackend>> {
        let factory = self.depth.get(&settings.backend).ok_or_else(|| {
            anyhow!(
                "depth backend '{}' not registered (available: {})",
                settings.backend,
                self.depth_names().join(", ")
            )
        })?;
        factory(settings)
    }

    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.keys().map(String::as_str).collect()
    }

    pub fn depth_names(&self) -> Vec<&str> {
        self.depth.keys().map(String::as_str).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
