use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::info;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::SpaceError;
use crate::space::local::LocalSpace;
use crate::space::{Result, Space};

/// Backend selector of a space URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `tspace:` or `transient:`, memory only.
    Transient,
    /// `jdbm:` or `persistent:`, RocksDB backed.
    Persistent,
    /// `spacelet:`, must already be bound.
    Spacelet,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Transient => "transient",
            Scheme::Persistent => "persistent",
            Scheme::Spacelet => "spacelet",
        }
    }
}

impl FromStr for Scheme {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tspace" | "transient" => Ok(Scheme::Transient),
            "jdbm" | "persistent" => Ok(Scheme::Persistent),
            "spacelet" => Ok(Scheme::Spacelet),
            other => Err(SpaceError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// A parsed `scheme:name[:param]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceUri {
    pub scheme: Scheme,
    pub name: String,
    pub param: Option<String>,
}

impl FromStr for SpaceUri {
    type Err = SpaceError;

    fn from_str(uri: &str) -> Result<Self> {
        let mut parts = uri.splitn(3, ':');
        let scheme = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if scheme.is_empty() || name.is_empty() {
            return Err(SpaceError::InvalidUri(uri.to_string()));
        }
        Ok(SpaceUri {
            scheme: scheme.parse()?,
            name: name.to_string(),
            param: parts.next().filter(|p| !p.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for SpaceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.name)?;
        if let Some(param) = &self.param {
            write!(f, ":{}", param)?;
        }
        Ok(())
    }
}

type Instances = HashMap<(Scheme, String), Box<dyn Any + Send + Sync>>;

/// Resolves space URIs to shared instances.
///
/// Looking up the same scheme and name twice yields the same `Arc`. Instances
/// are stored type-erased, so asking for an existing name with other key or
/// value types fails with [`SpaceError::TypeMismatch`].
pub struct SpaceRegistry {
    base_dir: Option<PathBuf>,
    #[cfg(feature = "persistent")]
    persistent_options: crate::space::persistent::PersistentOptions,
    instances: Mutex<Instances>,
}

impl Default for SpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceRegistry {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            #[cfg(feature = "persistent")]
            persistent_options: Default::default(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Persistent spaces without an explicit path are created under `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    #[cfg(feature = "persistent")]
    pub fn with_persistent_options(mut self, options: crate::space::persistent::PersistentOptions) -> Self {
        self.persistent_options = options;
        self
    }

    /// Parses `uri` and resolves it, creating the space when the scheme allows.
    pub fn lookup<K, V>(&self, uri: &str) -> Result<Arc<dyn Space<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        self.resolve(&uri.parse()?)
    }

    pub fn resolve<K, V>(&self, uri: &SpaceUri) -> Result<Arc<dyn Space<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let mut instances = self.instances.lock();
        if uri.scheme == Scheme::Spacelet {
            // A spacelet name may also refer to a space created by another scheme.
            let found = [Scheme::Spacelet, Scheme::Transient, Scheme::Persistent]
                .into_iter()
                .find_map(|scheme| instances.get(&(scheme, uri.name.clone())));
            return match found {
                Some(instance) => downcast(&**instance, uri),
                None => Err(SpaceError::NotFound(uri.to_string())),
            };
        }

        let slot = (uri.scheme, uri.name.clone());
        if let Some(instance) = instances.get(&slot) {
            return downcast(&**instance, uri);
        }
        let space: Arc<dyn Space<K, V>> = match uri.scheme {
            Scheme::Transient => Arc::new(LocalSpace::<K, V>::transient()),
            Scheme::Persistent => self.open_persistent(uri)?,
            Scheme::Spacelet => return Err(SpaceError::NotFound(uri.to_string())),
        };
        info!("Created space {}", uri);
        instances.insert(slot, Box::new(Arc::clone(&space)));
        Ok(space)
    }

    /// Makes `space` resolvable as `spacelet:<name>`, replacing any previous
    /// binding of that name.
    pub fn bind<K, V>(&self, name: impl Into<String>, space: Arc<dyn Space<K, V>>)
    where
        K: 'static,
        V: 'static,
    {
        self.instances
            .lock()
            .insert((Scheme::Spacelet, name.into()), Box::new(space));
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.instances
            .lock()
            .remove(&(Scheme::Spacelet, name.to_string()))
            .is_some()
    }

    #[cfg(feature = "persistent")]
    fn open_persistent<K, V>(&self, uri: &SpaceUri) -> Result<Arc<dyn Space<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let path = match (&uri.param, &self.base_dir) {
            (Some(param), _) => PathBuf::from(param),
            (None, Some(base)) => base.join(&uri.name),
            (None, None) => return Err(SpaceError::InvalidUri(uri.to_string())),
        };
        Ok(Arc::new(LocalSpace::<K, V>::persistent(path, self.persistent_options)?))
    }

    #[cfg(not(feature = "persistent"))]
    fn open_persistent<K, V>(&self, uri: &SpaceUri) -> Result<Arc<dyn Space<K, V>>> {
        Err(SpaceError::UnsupportedScheme(uri.scheme.as_str().to_string()))
    }
}

fn downcast<K: 'static, V: 'static>(instance: &(dyn Any + Send + Sync), uri: &SpaceUri) -> Result<Arc<dyn Space<K, V>>> {
    instance
        .downcast_ref::<Arc<dyn Space<K, V>>>()
        .cloned()
        .ok_or_else(|| SpaceError::TypeMismatch(uri.to_string()))
}
