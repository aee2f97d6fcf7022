//! Driver registry — resolves a handshake to a concrete device kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::kind::{DeviceKind, GenericKind, LightKind, SensorKind, SwitchKind};
use crate::device::Device;
use crate::error::{AlreadyExistsError, NotFoundError, SensesError};
use crate::handshake::Handshake;

/// Builds the kind of a device from its handshake.
pub type KindFactory = Arc<dyn Fn(&Handshake) -> Arc<dyn DeviceKind> + Send + Sync>;

/// Wrap a closure as a [`KindFactory`].
pub fn kind_factory<F>(factory: F) -> KindFactory
where
    F: Fn(&Handshake) -> Arc<dyn DeviceKind> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Maps a device type tag (`light`, `sensor`, …) to a kind factory.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, KindFactory>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("DriverRegistry").field("tags", &tags).finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `generic`, `light`, `sensor` and `switch` kinds.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&str, KindFactory); 4] = [
            ("generic", kind_factory(|_| Arc::new(GenericKind::new("generic")))),
            ("light", kind_factory(|_| Arc::new(LightKind))),
            ("sensor", kind_factory(|shake| Arc::new(SensorKind::from_handshake(shake)))),
            ("switch", kind_factory(|_| Arc::new(SwitchKind))),
        ];
        for (tag, factory) in builtin {
            registry.factories.insert(tag.to_string(), factory);
        }
        registry
    }

    /// Register a factory under a type tag.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::AlreadyExists`] when the tag is taken.
    pub fn register(&mut self, tag: impl Into<String>, factory: KindFactory) -> Result<(), SensesError> {
        let tag = tag.into();
        if self.factories.contains_key(&tag) {
            return Err(AlreadyExistsError {
                entity: "Driver",
                id: tag,
            }
            .into());
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    /// Whether a factory is registered for `tag`.
    #[must_use]
    pub fn supports(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Build the device described by `shake`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed handshake and
    /// [`SensesError::NotFound`] when no factory handles its type.
    pub fn resolve(&self, shake: &Handshake) -> Result<Device, SensesError> {
        shake.validate()?;
        let device_type = shake.device_type()?;
        let factory = self
            .factories
            .get(&device_type.type_name)
            .ok_or_else(|| NotFoundError {
                entity: "Driver",
                id: device_type.type_name.clone(),
            })?;
        Ok(Device::from_handshake(shake, factory(shake))?)
    }
}
