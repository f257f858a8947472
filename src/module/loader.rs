//! Locating, version-checking and instantiating modules.
//!
//! A loadable unit named `Foo` exposes three entry points:
//!
//! - `Foo_create`: builds an instance from an instance id
//! - `Foo_version_major` / `Foo_version_minor`: the protocol version it was built against
//!
//! In-process units are listed in a [`StaticRegistry`]; shared objects are
//! opened with [`DynamicLibrary`], whose symbols use the C signatures in
//! [`export`]. Either way the [`ModuleLoader`] queries the version first and
//! refuses a unit whose major version differs from the host's.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::{info, instrument, warn};

use super::{SharedModule, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use crate::error::{Error, Result};

type CreateFn = dyn Fn(&str) -> Result<SharedModule> + Send + Sync;
type VersionFn = dyn Fn() -> i32 + Send + Sync;

/// The three entry points of one unit
#[derive(Clone)]
pub struct EntryPoints {
    create: Arc<CreateFn>,
    version_major: Arc<VersionFn>,
    version_minor: Arc<VersionFn>,
    artifact: Option<Arc<Library>>,
}

impl EntryPoints {
    /// Entry points of a unit compiled into this binary
    pub fn native(
        create: fn(&str) -> SharedModule,
        version_major: fn() -> i32,
        version_minor: fn() -> i32,
    ) -> Self {
        Self {
            create: Arc::new(move |instance| Ok(create(instance))),
            version_major: Arc::new(version_major),
            version_minor: Arc::new(version_minor),
            artifact: None,
        }
    }
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoints")
            .field("dynamic", &self.artifact.is_some())
            .finish()
    }
}

/// Anything that can resolve a unit's entry points by name
pub trait ModuleSource {
    fn entry_points(&self, name: &str) -> Result<EntryPoints>;
}

/// Units linked into the host binary
#[derive(Debug, Default)]
pub struct StaticRegistry {
    units: HashMap<String, EntryPoints>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the units shipped with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, entry: EntryPoints) {
        self.units.insert(name.to_string(), entry);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.units.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ModuleSource for StaticRegistry {
    fn entry_points(&self, name: &str) -> Result<EntryPoints> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }
}

/// A unit built as a shared object
#[derive(Debug)]
pub struct DynamicLibrary {
    path: PathBuf,
    lib: Arc<Library>,
}

impl DynamicLibrary {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        // SAFETY: opening runs the object's initializers; artifacts come from the operator's config
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Load(format!("{}: {}", path.display(), e)))?;
        info!("Opened module artifact {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            lib: Arc::new(lib),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `name` as a `T`.
    ///
    /// # Safety
    ///
    /// `T` must match the type the artifact exports under `name`.
    unsafe fn symbol<T: Copy>(&self, name: &str) -> Result<T> {
        let sym: Symbol<'_, T> = self.lib.get(name.as_bytes()).map_err(|e| {
            Error::Load(format!(
                "{}: missing symbol {}: {}",
                self.path.display(),
                name,
                e
            ))
        })?;
        Ok(*sym)
    }
}

impl ModuleSource for DynamicLibrary {
    fn entry_points(&self, name: &str) -> Result<EntryPoints> {
        // SAFETY: units export these names with the signatures in `export`
        let (create, major, minor) = unsafe {
            (
                self.symbol::<export::CreateSymbol>(&format!("{name}_create"))?,
                self.symbol::<export::VersionSymbol>(&format!("{name}_version_major"))?,
                self.symbol::<export::VersionSymbol>(&format!("{name}_version_minor"))?,
            )
        };

        let unit = name.to_string();
        Ok(EntryPoints {
            create: Arc::new(move |instance| {
                let c_instance = CString::new(instance)
                    .map_err(|_| Error::Load(format!("instance id contains NUL: {instance}")))?;
                let raw = unsafe { create(c_instance.as_ptr()) };
                if raw.is_null() {
                    return Err(Error::Load(format!("{unit}_create returned null")));
                }
                // SAFETY: `export::create` leaks exactly one Box<SharedModule>
                Ok(*unsafe { Box::from_raw(raw.cast::<SharedModule>()) })
            }),
            version_major: Arc::new(move || unsafe { major() }),
            version_minor: Arc::new(move || unsafe { minor() }),
            artifact: Some(self.lib.clone()),
        })
    }
}

/// C entry-point signatures for units built as shared objects.
///
/// A unit `Foo` exports them by hand:
///
/// ```ignore
/// #[no_mangle]
/// pub unsafe extern "C" fn Foo_create(instance: *const c_char) -> *mut c_void {
///     framelink::module::loader::export::create(instance, Foo::new)
/// }
/// #[no_mangle]
/// pub extern "C" fn Foo_version_major() -> c_int { framelink::module::PROTOCOL_VERSION_MAJOR }
/// #[no_mangle]
/// pub extern "C" fn Foo_version_minor() -> c_int { framelink::module::PROTOCOL_VERSION_MINOR }
/// ```
pub mod export {
    use super::*;
    use crate::module::Module;
    use std::sync::Mutex;

    pub type CreateSymbol = unsafe extern "C" fn(*const c_char) -> *mut c_void;
    pub type VersionSymbol = unsafe extern "C" fn() -> c_int;

    /// Build a module and leak it as an opaque `Box<SharedModule>` for the loader.
    ///
    /// # Safety
    ///
    /// `instance` must be null or point to a NUL-terminated string.
    pub unsafe fn create<M, F>(instance: *const c_char, ctor: F) -> *mut c_void
    where
        M: Module + 'static,
        F: FnOnce(&str) -> M,
    {
        let instance = if instance.is_null() {
            String::new()
        } else {
            CStr::from_ptr(instance).to_string_lossy().into_owned()
        };
        let module: SharedModule = Arc::new(Mutex::new(ctor(&instance)));
        Box::into_raw(Box::new(module)).cast()
    }
}

/// A module instance plus whatever keeps its code mapped
pub struct LoadedModule {
    pub name: String,
    pub module: SharedModule,
    // Dropped after `module`
    _artifact: Option<Arc<Library>>,
}

impl LoadedModule {
    /// Wrap a module built directly by the host
    pub fn from_shared(name: &str, module: SharedModule) -> Self {
        Self {
            name: name.to_string(),
            module,
            _artifact: None,
        }
    }
}

/// Loads units after checking their protocol version against the host's
#[derive(Debug, Clone, Copy)]
pub struct ModuleLoader {
    host_major: i32,
    host_minor: i32,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::with_host_version(PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR)
    }

    pub fn with_host_version(host_major: i32, host_minor: i32) -> Self {
        Self {
            host_major,
            host_minor,
        }
    }

    #[instrument(skip(self, source))]
    pub fn load(&self, source: &dyn ModuleSource, name: &str, instance: &str) -> Result<LoadedModule> {
        let entry = source.entry_points(name)?;
        let major = (entry.version_major)();
        let minor = (entry.version_minor)();

        if major != self.host_major {
            return Err(Error::VersionMismatch {
                name: name.to_string(),
                found_major: major,
                found_minor: minor,
                host_major: self.host_major,
                host_minor: self.host_minor,
            });
        }
        if minor != self.host_minor {
            warn!(
                "Module {} built for protocol {}.{}, host is {}.{}",
                name, major, minor, self.host_major, self.host_minor
            );
        }

        let module = (entry.create)(instance)?;
        info!("Loaded module {} as instance {}", name, instance);
        Ok(LoadedModule {
            name: name.to_string(),
            module,
            _artifact: entry.artifact,
        })
    }
}
