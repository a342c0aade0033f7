use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

static CONFIG_REPOSITORY: OnceLock<RwLock<ConfigRepository>> = OnceLock::new();

/// Config instances keyed by their type
#[derive(Default)]
pub struct ConfigRepository {
    configs: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ConfigRepository {
    pub fn register<T: Any + Send + Sync + 'static>(&mut self, config: T) {
        self.configs.insert(TypeId::of::<T>(), Box::new(config));
    }

    pub fn get<T: Any + Send + Sync + Clone + 'static>(&self) -> Option<T> {
        self.configs
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    pub fn has<T: Any + 'static>(&self) -> bool {
        self.configs.contains_key(&TypeId::of::<T>())
    }
}

fn repository() -> &'static RwLock<ConfigRepository> {
    CONFIG_REPOSITORY.get_or_init(|| RwLock::new(ConfigRepository::default()))
}

/// Register a config in the global repository
pub fn register<T: Any + Send + Sync + 'static>(config: T) {
    if let Ok(mut repo) = repository().write() {
        repo.register(config);
    }
}

/// Get a config from the global repository
pub fn get<T: Any + Send + Sync + Clone + 'static>() -> Option<T> {
    let repo = CONFIG_REPOSITORY.get()?;
    repo.read().ok()?.get::<T>()
}

/// Check if a config type is registered in the global repository
pub fn has<T: Any + 'static>() -> bool {
    CONFIG_REPOSITORY
        .get()
        .and_then(|repo| repo.read().ok())
        .map(|repo| repo.has::<T>())
        .unwrap_or(false)
}
