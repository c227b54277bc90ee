//! Common module for library exports

pub use crate::backend::{ProcessControl, create_backend};
pub use crate::error::{PyriteError, Result};
pub use crate::inject::{InjectionRequest, InjectionResult};
pub use crate::session::{AttachmentState, SessionManager};
pub use crate::types::{Address, ProcessId, SessionId, ThreadId};
pub use crate::value::{EntryKey, MappingEntry, Proxy, RemoteValue, Scalar, Shape};
pub use crate::walker::{CodeLocation, Frame, ThreadHandle};
