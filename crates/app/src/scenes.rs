//! Scene registry.
//!
//! Activating a scene emits [`EventKind::SceneActivated`] for local scene
//! triggers, then publishes the scene name on its topic for peers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use senses_domain::error::{AlreadyExistsError, NotFoundError, SensesError};
use senses_domain::event::{Event, EventKind};
use senses_domain::scene::{Scene, SceneConfig, SceneSelector};

use crate::ports::{EventPublisher, MessageBus};

pub struct SceneRegistry<B, P> {
    bus: B,
    publisher: P,
    prefix: String,
    scenes: RwLock<BTreeMap<String, Arc<Scene>>>,
}

impl<B, P> SceneRegistry<B, P>
where
    B: MessageBus + Send + Sync,
    P: EventPublisher + Send + Sync,
{
    /// Registry deriving default scene topics under `prefix`.
    pub fn new(bus: B, publisher: P, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            publisher,
            prefix: prefix.into(),
            scenes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a scene.
    ///
    /// # Errors
    ///
    /// Fails on a blank name or when the uid is already taken.
    pub fn add(&self, config: &SceneConfig) -> Result<Arc<Scene>, SensesError> {
        let scene = Arc::new(Scene::from_config(config, &self.prefix)?);
        let mut scenes = self.scenes.write().unwrap_or_else(PoisonError::into_inner);
        if scenes.contains_key(&scene.uid) {
            return Err(AlreadyExistsError {
                entity: "Scene",
                id: scene.uid.clone(),
            }
            .into());
        }
        scenes.insert(scene.uid.clone(), Arc::clone(&scene));
        tracing::info!(uid = %scene.uid, topic = %scene.topic, "scene added");
        Ok(scene)
    }

    #[must_use]
    pub fn get(&self, uid: &str) -> Option<Arc<Scene>> {
        self.scenes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Every scene, ordered by uid.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Scene>> {
        self.scenes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// First scene, by uid order, matched by `selector`.
    #[must_use]
    pub fn find(&self, selector: &SceneSelector) -> Option<Arc<Scene>> {
        self.scenes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|scene| selector.matches(scene))
            .cloned()
    }

    /// Activate the scene registered under `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown uid, or the bus error
    /// if the announcement could not be published.
    pub async fn activate(&self, uid: &str) -> Result<Arc<Scene>, SensesError> {
        let scene = self.get(uid).ok_or_else(|| NotFoundError {
            entity: "Scene",
            id: uid.to_string(),
        })?;
        tracing::info!(uid = %scene.uid, "activating scene");
        self.publisher
            .publish(Event::new(EventKind::SceneActivated {
                scene: Box::new(Scene::clone(&scene)),
            }))
            .await?;
        self.bus
            .publish(scene.topic.clone(), scene.name.clone(), 0)
            .await?;
        Ok(scene)
    }
}
