//! # Symbol & Layout Resolver
//!
//! Works out which runtime build is mapped into the target and turns that
//! into concrete memory offsets.
//!
//! ## How the build is detected
//!
//! The backend reports the file-backed images mapped into the target. The
//! first one whose file name carries a runtime version (`python3.10`,
//! `libpython2.7.so.1.0`, ...) decides the [`BuildSignature`]. Only builds
//! in the [known table](known) are accepted. Anything else fails closed with
//! [`UnsupportedBuild`](crate::error::PyriteError::UnsupportedBuild).
//!
//! ## What gets resolved
//!
//! - every built-in type object the classifier dispatches on
//! - the `None` and `True` singletons
//! - the head of the interpreter list
//! - the GIL-holder global, where the build has one (optional)
//!
//! A missing required symbol fails with
//! [`MissingDebugInfo`](crate::error::PyriteError::MissingDebugInfo). Both
//! failures are terminal for the attach attempt.

pub mod descriptor;
pub mod known;
pub mod types;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub use descriptor::LayoutDescriptor;
pub use types::{TypeTable, TypeTag};

use crate::backend::ProcessControl;
use crate::error::{PyriteError, Result};
use crate::types::{Address, ProcessHandle};

/// Major/minor version of the runtime mapped into the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildSignature
{
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl BuildSignature
{
    /// Create a signature
    pub const fn new(major: u32, minor: u32) -> Self
    {
        Self { major, minor }
    }

    /// Parse the version out of a runtime image's file name
    ///
    /// ```rust
    /// use std::path::Path;
    /// use pyrite_core::layout::BuildSignature;
    ///
    /// let build = BuildSignature::from_image_path(Path::new("/usr/lib/libpython3.10.so.1.0"));
    /// assert_eq!(build, Some(BuildSignature::new(3, 10)));
    /// assert_eq!(BuildSignature::from_image_path(Path::new("/usr/bin/python3")), None);
    /// ```
    pub fn from_image_path(path: &Path) -> Option<Self>
    {
        let name = path.file_name()?.to_str()?;
        let start = name.find("python")? + "python".len();
        let rest = &name[start..];

        let (major, rest) = split_number(rest)?;
        let rest = rest.strip_prefix('.')?;
        let (minor, _) = split_number(rest)?;

        matches!(major, 2 | 3).then_some(Self { major, minor })
    }

    /// Whether this is a 2.x build
    pub fn is_python2(self) -> bool
    {
        self.major == 2
    }
}

fn split_number(text: &str) -> Option<(u32, &str)>
{
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let value = text[..digits].parse().ok()?;
    Some((value, &text[digits..]))
}

impl fmt::Display for BuildSignature
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Fully resolved layout for one session
///
/// Built once at attach time and never changed; a new attach resolves a
/// new one.
#[derive(Debug, Clone)]
pub struct RuntimeLayout
{
    /// Detected build
    pub build: BuildSignature,
    /// Field offsets for that build
    pub descriptor: &'static LayoutDescriptor,
    /// Known built-in type addresses
    pub types: TypeTable,
    /// Address of the pointer to the first interpreter state
    pub interpreter_head: Address,
    /// Address of the pointer to the GIL-holding thread state
    pub gil_holder: Address,
    /// Image the build was detected from
    pub image: PathBuf,
}

/// Resolve the layout of the runtime in an attached process
///
/// ## Errors
///
/// - `UnsupportedBuild`: no runtime image is mapped, or its version has no
///   known layout
/// - `MissingDebugInfo`: a required symbol can't be resolved
///
/// ## Example
///
/// ```rust,no_run
/// use pyrite_core::backend::{create_backend, ProcessControl};
/// use pyrite_core::layout;
/// use pyrite_core::types::ProcessId;
///
/// let mut backend = create_backend(None)?;
/// let handle = backend.attach(ProcessId::from(4242))?;
/// let runtime = layout::resolve(&backend, &handle)?;
/// println!("CPython {} from {}", runtime.build, runtime.image.display());
/// # Ok::<(), pyrite_core::error::PyriteError>(())
/// ```
pub fn resolve<B: ProcessControl + ?Sized>(backend: &B, handle: &ProcessHandle) -> Result<RuntimeLayout>
{
    let images = backend.mapped_images(handle)?;
    let (build, image) = images
        .iter()
        .find_map(|path| BuildSignature::from_image_path(path).map(|build| (build, path.clone())))
        .ok_or_else(|| PyriteError::UnsupportedBuild("no CPython runtime image is mapped into the target".to_string()))?;

    let descriptor = known::lookup(build).ok_or_else(|| {
        let supported: Vec<String> = known::supported_builds().map(|b| b.to_string()).collect();
        PyriteError::UnsupportedBuild(format!(
            "CPython {build} from {} (supported: {})",
            image.display(),
            supported.join(", ")
        ))
    })?;
    debug!(%build, image = %image.display(), "runtime build detected");

    let mut types = Vec::with_capacity(descriptor.type_symbols.len());
    for (symbol, tag) in descriptor.type_symbols {
        types.push((required(backend, handle, symbol)?, *tag));
    }
    let none = required(backend, handle, descriptor.none_symbol)?;
    let true_object = required(backend, handle, descriptor.true_symbol)?;

    let interpreter_head = slot_address(backend, handle, descriptor.interpreter_head)?;
    let gil_holder = slot_address(backend, handle, descriptor.gil_holder)?;

    let types = TypeTable::new(types, none, true_object);
    info!(%build, known_types = types.len(), "runtime layout resolved");

    Ok(RuntimeLayout {
        build,
        descriptor,
        types,
        interpreter_head,
        gil_holder,
        image,
    })
}

fn slot_address<B: ProcessControl + ?Sized>(
    backend: &B,
    handle: &ProcessHandle,
    slot: descriptor::GlobalSlot,
) -> Result<Address>
{
    match slot {
        descriptor::GlobalSlot::Field { symbol, offset } => Ok(required(backend, handle, symbol)? + offset),
        descriptor::GlobalSlot::Pointer { symbol } => required(backend, handle, symbol),
    }
}

fn required<B: ProcessControl + ?Sized>(backend: &B, handle: &ProcessHandle, symbol: &str) -> Result<Address>
{
    Ok(backend.resolve_symbol(handle, symbol)?.address)
}
