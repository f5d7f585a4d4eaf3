//! Makes agent-owned classes visible from application class loaders.
//!
//! Generated code casts to interceptor and accessor types by name, so those
//! types must resolve from the loader of the rewritten class. If the loader
//! already sees a type, the injector returns that (delegate-up). Otherwise it
//! reads the class file from the agent's own sources and defines it in the
//! target loader, supertypes first.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::classfile::ClassFile;
use crate::descriptor::java_name_to_internal;
use crate::error::InjectError;
use crate::host::{ClassLoaderRef, ClassRef};

/// Supertype chains deeper than this are treated as malformed.
const MAX_SUPERTYPE_DEPTH: usize = 32;

/// Host operations the injector needs.
pub trait ClassDefiner: Send + Sync {
    /// The class as `loader` resolves it, or `None` if it cannot.
    fn find_visible(&self, loader: &ClassLoaderRef, name: &str) -> Result<Option<ClassRef>, InjectError>;

    fn define(&self, loader: &ClassLoaderRef, name: &str, bytes: &[u8]) -> Result<ClassRef, InjectError>;
}

/// Where agent class files come from.
pub trait ClassSource: Send + Sync {
    fn describe(&self) -> String;

    fn read(&self, internal_name: &str) -> Result<Option<Vec<u8>>, InjectError>;

    fn contains(&self, internal_name: &str) -> bool {
        matches!(self.read(internal_name), Ok(Some(_)))
    }
}

/// Class files held in memory, such as the generated runtime helpers.
#[derive(Debug, Default, Clone)]
pub struct GeneratedClassSource {
    classes: HashMap<String, Vec<u8>>,
}

impl GeneratedClassSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, internal_name: &str, bytes: Vec<u8>) -> Self {
        self.classes.insert(internal_name.to_string(), bytes);
        self
    }

    /// The `InterceptorRegistry` and `InterceptorInvokerHelper` classes.
    pub fn runtime() -> Result<Self, crate::classfile::ClassFileError> {
        let mut source = Self::new();
        for (name, bytes) in crate::runtime::helper_classes()? {
            source = source.with_class(name, bytes);
        }
        Ok(source)
    }
}

impl ClassSource for GeneratedClassSource {
    fn describe(&self) -> String {
        format!("{} generated class(es)", self.classes.len())
    }

    fn read(&self, internal_name: &str) -> Result<Option<Vec<u8>>, InjectError> {
        Ok(self.classes.get(internal_name).cloned())
    }

    fn contains(&self, internal_name: &str) -> bool {
        self.classes.contains_key(internal_name)
    }
}

#[cfg(feature = "plugin-jars")]
pub use jar::JarClassSource;

#[cfg(feature = "plugin-jars")]
mod jar {
    use std::fs::File;
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use zip::result::ZipError;
    use zip::ZipArchive;

    use super::ClassSource;
    use crate::error::InjectError;

    /// Class files inside a plugin jar.
    pub struct JarClassSource {
        path: PathBuf,
        archive: Mutex<ZipArchive<File>>,
    }

    impl JarClassSource {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, InjectError> {
            let path = path.as_ref().to_path_buf();
            let read_error = |reason: String| InjectError::Read { class: path.display().to_string(), reason };
            let file = File::open(&path).map_err(|e| read_error(e.to_string()))?;
            let archive = ZipArchive::new(file).map_err(|e| read_error(e.to_string()))?;
            log::debug!("opened plugin jar {} with {} entries", path.display(), archive.len());
            Ok(Self { path, archive: Mutex::new(archive) })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Internal names of every class in the jar.
        pub fn class_names(&self) -> Vec<String> {
            let archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
            archive
                .file_names()
                .filter_map(|n| n.strip_suffix(".class"))
                .map(str::to_string)
                .collect()
        }
    }

    impl ClassSource for JarClassSource {
        fn describe(&self) -> String {
            self.path.display().to_string()
        }

        fn read(&self, internal_name: &str) -> Result<Option<Vec<u8>>, InjectError> {
            let mut archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
            let mut entry = match archive.by_name(&format!("{internal_name}.class")) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Ok(None),
                Err(e) => {
                    return Err(InjectError::Read { class: internal_name.to_string(), reason: e.to_string() })
                }
            };
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| InjectError::Read { class: internal_name.to_string(), reason: e.to_string() })?;
            Ok(Some(bytes))
        }
    }
}

type InjectKey = (ClassLoaderRef, String);

thread_local! {
    /// Keys whose define lock this thread holds.
    static DEFINING: RefCell<HashSet<InjectKey>> = RefCell::new(HashSet::new());
}

/// Marks a key as being defined on this thread until dropped.
struct DefiningMark(InjectKey);

impl DefiningMark {
    fn enter(key: &InjectKey) -> Option<Self> {
        DEFINING.with(|d| d.borrow_mut().insert(key.clone())).then(|| Self(key.clone()))
    }
}

impl Drop for DefiningMark {
    fn drop(&mut self) {
        DEFINING.with(|d| d.borrow_mut().remove(&self.0));
    }
}

pub struct ClassInjector {
    definer: Arc<dyn ClassDefiner>,
    sources: Vec<Arc<dyn ClassSource>>,
    cache: DashMap<InjectKey, ClassRef>,
    define_locks: DashMap<InjectKey, Arc<Mutex<()>>>,
}

impl ClassInjector {
    pub fn new(definer: Arc<dyn ClassDefiner>) -> Self {
        Self { definer, sources: Vec::new(), cache: DashMap::new(), define_locks: DashMap::new() }
    }

    pub fn with_source(mut self, source: Arc<dyn ClassSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Returns `name` (Java or internal form) as a class visible from
    /// `loader`. Repeated calls for the same loader return the same class.
    ///
    /// Definition of one (loader, class) pair is serialized by a per-key
    /// lock. Supertypes are injected before that lock is taken, so nested
    /// injection never waits on a lock its own thread holds.
    pub fn inject(&self, loader: &ClassLoaderRef, name: &str) -> Result<ClassRef, InjectError> {
        self.inject_with_supertypes(loader, &java_name_to_internal(name), 0)
    }

    fn inject_with_supertypes(&self, loader: &ClassLoaderRef, name: &str, depth: usize) -> Result<ClassRef, InjectError> {
        let key = (loader.clone(), name.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.value().clone());
        }
        if depth > MAX_SUPERTYPE_DEPTH {
            return Err(InjectError::DefineFailed { class: name.to_string(), reason: "supertype chain too deep".into() });
        }
        if let Some(visible) = self.definer.find_visible(loader, name)? {
            log::trace!("{name} already visible from {loader}");
            self.cache.insert(key, visible.clone());
            return Ok(visible);
        }
        let bytes = self.read_class(name)?;
        if let Ok(class) = ClassFile::parse(&bytes) {
            let mut supertypes: Vec<String> = Vec::new();
            if let Ok(Some(super_name)) = class.super_class_name() {
                supertypes.push(super_name.to_string());
            }
            if let Ok(interfaces) = class.interface_names() {
                supertypes.extend(interfaces.into_iter().map(str::to_string));
            }
            for supertype in supertypes {
                if supertype != name && self.sources.iter().any(|s| s.contains(&supertype)) {
                    self.inject_with_supertypes(loader, &supertype, depth + 1)?;
                }
            }
        }
        // Defining fires class-load events on this thread; a nested request
        // for the class being defined cannot wait for its own lock.
        let Some(_mark) = DefiningMark::enter(&key) else {
            let reason = "already being defined on this thread".into();
            return Err(InjectError::DefineFailed { class: name.to_string(), reason });
        };
        let lock = self.define_locks.entry(key.clone()).or_default().value().clone();
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.value().clone());
        }
        let class = match self.definer.define(loader, name, &bytes) {
            Ok(class) => {
                log::debug!("defined {name} in {loader}");
                class
            }
            Err(e) => match self.definer.find_visible(loader, name)? {
                Some(visible) => {
                    log::debug!("{name} was defined elsewhere in {loader}");
                    visible
                }
                None => return Err(e),
            },
        };
        self.cache.insert(key, class.clone());
        Ok(class)
    }

    /// Raw class file from the first source that has it.
    pub fn read_class(&self, name: &str) -> Result<Vec<u8>, InjectError> {
        let name = java_name_to_internal(name);
        for source in &self.sources {
            if let Some(bytes) = source.read(&name)? {
                return Ok(bytes);
            }
        }
        Err(InjectError::NoSource(name))
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forgets every injected class, e.g. between tests.
    pub fn clear(&self) {
        self.cache.clear();
        self.define_locks.clear();
    }
}
