//! Pipeline filter that hands a shared [`Ring`] to downstream handlers.
//!
//! The filter resolves its options once, builds the ring, and on every call
//! stores it in the request [`Environ`] under [`CACHE_ENV_KEY`] before
//! passing control to the wrapped application.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RingResult;
use crate::resolver::{ConfigResolver, ConfigSource, Conf, FileConfigSource};
use crate::ring::Ring;

/// Key under which the ring is published in the [`Environ`].
pub const CACHE_ENV_KEY: &str = "memcache.ring";

/// Request-scoped values shared along a pipeline.
#[derive(Clone, Default)]
pub struct Environ {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Environ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl Environ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.values.insert(key.into(), value);
    }

    /// The value at `key`, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)?.clone().downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The ring published by a [`CacheFilter`] upstream.
    pub fn cache(&self) -> Option<Arc<Ring>> {
        self.get(CACHE_ENV_KEY)
    }
}

/// Wraps `app`, publishing the ring into every request's environment.
#[derive(Debug)]
pub struct CacheFilter<A> {
    app: A,
    ring: Arc<Ring>,
}

impl<A> CacheFilter<A> {
    /// Build the filter, reading `memcache.conf` when `conf` is incomplete.
    pub fn new(app: A, conf: &Conf) -> RingResult<Self> {
        Self::with_source(app, conf, FileConfigSource::new())
    }

    pub fn with_source<S: ConfigSource>(app: A, conf: &Conf, source: S) -> RingResult<Self> {
        let options = ConfigResolver::with_source(source).resolve(conf)?;
        Ok(Self {
            app,
            ring: Arc::new(Ring::new(options)?),
        })
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Publish the ring and run the wrapped application.
    pub fn call<R>(&self, env: &mut Environ) -> R
    where
        A: Fn(&mut Environ) -> R,
    {
        env.insert(CACHE_ENV_KEY, Arc::clone(&self.ring));
        (self.app)(env)
    }
}

/// Pipeline entry point: merge `global` and `local` options (local wins)
/// and return a constructor that wraps an application.
pub fn filter_factory<A>(global: &Conf, local: &Conf) -> impl Fn(A) -> RingResult<CacheFilter<A>> {
    let mut conf = global.clone();
    conf.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
    move |app| CacheFilter::new(app, &conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::EmptyConfigSource;

    fn conf(pairs: &[(&str, &str)]) -> Conf {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_call_publishes_ring() {
        let app = |env: &mut Environ| env.cache().map(|ring| ring.servers().count());
        let filter = CacheFilter::with_source(app, &conf(&[]), EmptyConfigSource).unwrap();

        let mut env = Environ::new();
        assert_eq!(filter.call(&mut env), Some(1));
        assert!(env.contains_key(CACHE_ENV_KEY));
        assert!(Arc::ptr_eq(&env.cache().unwrap(), filter.ring()));
    }

    #[test]
    fn test_factory_local_wins() {
        let global = conf(&[
            ("memcache_servers", "10.0.0.1:11211"),
            ("max_connections", "3"),
        ]);
        let local = conf(&[("memcache_servers", "10.0.0.2:11211,10.0.0.3:11211")]);

        let filter = filter_factory(&global, &local)(|_: &mut Environ| ()).unwrap();
        let servers: Vec<String> = filter.ring().servers().map(|s| s.to_string()).collect();
        assert_eq!(servers, vec!["10.0.0.2:11211", "10.0.0.3:11211"]);
        assert_eq!(filter.ring().options().get_max_connections(), 3);
    }

    #[test]
    fn test_factory_propagates_config_errors() {
        let global = conf(&[
            ("memcache_servers", "10.0.0.1:11211"),
            ("max_connections", "3"),
            ("item_size_warning_threshold", "lots"),
        ]);
        assert!(filter_factory(&global, &Conf::new())(|_: &mut Environ| ()).is_err());
    }

    #[test]
    fn test_environ_type_mismatch() {
        let mut env = Environ::new();
        env.insert("answer", Arc::new(42u32));
        assert_eq!(env.get::<u32>("answer").as_deref(), Some(&42));
        assert!(env.get::<String>("answer").is_none());
        assert!(env.cache().is_none());
    }
}
