//! # Session Manager
//!
//! Owns the one active attachment and serialises every operation on it.
//!
//! ## Lifecycle
//!
//! ```text
//!            attach(pid)                 inject(..)
//! Detached ─────────────► Attached ◄──────────────► Busy
//!    ▲                       │
//!    └───── detach() ────────┘   (also: target exit, detected lazily)
//! ```
//!
//! Attaching while attached detaches first. Every operation holds the
//! manager's lock for its whole duration, so two operations never touch the
//! target at once and `Busy` is exclusive.
//!
//! ## Handles and proxies
//!
//! Thread handles and proxies carry the [`SessionId`] of the session that
//! produced them. Passing one to a later session, or with no session at
//! all, fails with [`StaleHandle`](PyriteError::StaleHandle) before any
//! target access.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pyrite_core::backend::create_backend;
//! use pyrite_core::types::ProcessId;
//! use pyrite_core::SessionManager;
//! use pyrite_utils::InspectorConfig;
//!
//! let config = InspectorConfig::from_env()?;
//! let manager = SessionManager::new(create_backend(config.symbol_file.clone())?, config);
//! manager.attach(ProcessId::from(4242))?;
//!
//! for thread in manager.list_threads()? {
//!     println!("{thread}");
//!     print!("{}", manager.backtrace(&thread)?);
//! }
//!
//! let result = manager.inject("import sys; print(sys.version)", None)?;
//! print!("{}", result.stdout());
//! manager.detach()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pyrite_utils::InspectorConfig;
use tracing::{debug, info, warn};

use crate::backend::ProcessControl;
use crate::error::{PyriteError, Result};
use crate::inject::{InjectionRequest, InjectionResult, Injector};
use crate::layout::{self, BuildSignature, RuntimeLayout};
use crate::memory::RemoteMemory;
use crate::types::{Address, ProcessHandle, ProcessId, SessionId};
use crate::value::{Classifier, Limits, Proxy, RemoteValue};
use crate::walker::{self, Frame, ThreadHandle};

/// Attachment state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState
{
    /// No session
    Detached,
    /// A session is open and idle
    Attached,
    /// An injection is running
    Busy,
}

impl fmt::Display for AttachmentState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            AttachmentState::Detached => write!(f, "detached"),
            AttachmentState::Attached => write!(f, "attached"),
            AttachmentState::Busy => write!(f, "busy"),
        }
    }
}

struct Session
{
    id: SessionId,
    pid: ProcessId,
    handle: ProcessHandle,
    runtime: RuntimeLayout,
    state: AttachmentState,
    /// Runtime id of the selected thread
    selected: Option<u64>,
    /// Selected frame, 0 = innermost
    depth: usize,
    /// An injection timed out and left the target paused
    stalled: bool,
}

struct Inner<B>
{
    backend: B,
    config: InspectorConfig,
    limits: Limits,
    session: Option<Session>,
}

/// Owner of the single attachment
pub struct SessionManager<B: ProcessControl>
{
    inner: Mutex<Inner<B>>,
}

impl<B: ProcessControl> SessionManager<B>
{
    /// Create a detached manager
    pub fn new(backend: B, config: InspectorConfig) -> Self
    {
        let limits = Limits::from(&config);
        Self {
            inner: Mutex::new(Inner {
                backend,
                config,
                limits,
                session: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>>
    {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active configuration
    pub fn config(&self) -> InspectorConfig
    {
        self.lock().config.clone()
    }

    /// Attach to `pid`, detaching from any current target first
    ///
    /// ## Errors
    ///
    /// - `InjectionStalled`: the current session must be force-detached first
    /// - `ProcessNotFound` / `PermissionDenied` / `AttachFailed`
    /// - `UnsupportedBuild` / `MissingDebugInfo`: the target is released
    ///   again and the manager stays detached
    pub fn attach(&self, pid: ProcessId) -> Result<SessionId>
    {
        let mut inner = self.lock();
        if inner.session.as_ref().is_some_and(|session| session.stalled) {
            return Err(PyriteError::InjectionStalled);
        }
        if let Some(previous) = inner.session.take() {
            info!(pid = %previous.pid, "detaching before new attach");
            if let Err(err) = inner.backend.detach(&previous.handle) {
                warn!(pid = %previous.pid, error = %err, "implicit detach failed");
            }
        }

        let handle = inner.backend.attach(pid)?;
        let runtime = match layout::resolve(&inner.backend, &handle) {
            Ok(runtime) => runtime,
            Err(err) => {
                if let Err(detach_err) = inner.backend.detach(&handle) {
                    warn!(%pid, error = %detach_err, "detach after failed layout resolution failed");
                }
                return Err(err);
            }
        };

        let id = SessionId::next();
        info!(%pid, session = %id, build = %runtime.build, "attached");
        inner.session = Some(Session {
            id,
            pid,
            handle,
            runtime,
            state: AttachmentState::Attached,
            selected: None,
            depth: 0,
            stalled: false,
        });
        Ok(id)
    }

    /// Release the target and end the session
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `InjectionStalled`: use [`force_detach`](Self::force_detach)
    /// - `Control`: a thread could not be released
    pub fn detach(&self) -> Result<()>
    {
        let mut inner = self.lock();
        match &inner.session {
            None => return Err(PyriteError::NotAttached),
            Some(session) if session.stalled => return Err(PyriteError::InjectionStalled),
            Some(_) => {}
        }
        let Some(session) = inner.session.take() else {
            return Err(PyriteError::NotAttached);
        };

        if inner.backend.is_alive(&session.handle) {
            inner.backend.detach(&session.handle)?;
        } else {
            debug!(pid = %session.pid, "target already exited");
        }
        info!(pid = %session.pid, session = %session.id, "detached");
        Ok(())
    }

    /// Resume and release the target regardless of its state
    ///
    /// This is the only way out of a stalled injection. A thread left
    /// inside an unfinished call resumes from there, which can leave the
    /// target inconsistent.
    ///
    /// ## Errors
    ///
    /// - `NotAttached`
    /// - `Control`: the target could not be released
    pub fn force_detach(&self) -> Result<()>
    {
        let mut inner = self.lock();
        let Some(session) = inner.session.take() else {
            return Err(PyriteError::NotAttached);
        };
        warn!(pid = %session.pid, stalled = session.stalled, "forcing detach");

        if !inner.backend.is_alive(&session.handle) {
            return Ok(());
        }
        if let Err(err) = inner.backend.resume_all(&session.handle) {
            warn!(pid = %session.pid, error = %err, "resume before forced detach failed");
        }
        inner.backend.detach(&session.handle)?;
        Ok(())
    }

    /// Attachment state
    pub fn state(&self) -> AttachmentState
    {
        self.lock()
            .session
            .as_ref()
            .map_or(AttachmentState::Detached, |session| session.state)
    }

    /// Id of the current session
    pub fn session_id(&self) -> Option<SessionId>
    {
        self.lock().session.as_ref().map(|session| session.id)
    }

    /// PID of the attached target
    pub fn pid(&self) -> Option<ProcessId>
    {
        self.lock().session.as_ref().map(|session| session.pid)
    }

    /// Whether an injection timed out and left the target paused
    pub fn is_stalled(&self) -> bool
    {
        self.lock().session.as_ref().is_some_and(|session| session.stalled)
    }

    /// Runtime build of the attached target
    ///
    /// ## Errors
    ///
    /// `NotAttached`
    pub fn build(&self) -> Result<BuildSignature>
    {
        Ok(self.lock().session()?.runtime.build)
    }

    /// Every runtime thread, in the runtime's chain order
    ///
    /// ## Errors
    ///
    /// `NotAttached`, `TargetExited`, `ThreadChainTooLong`, `RemoteRead`
    pub fn list_threads(&self) -> Result<Vec<ThreadHandle>>
    {
        let mut inner = self.lock();
        inner.live()?;
        inner.threads()
    }

    /// The selected thread, or the first thread if none is selected or the
    /// selected one has gone
    ///
    /// Returns `None` if the target has no runtime threads.
    pub fn current_thread(&self) -> Result<Option<ThreadHandle>>
    {
        let mut inner = self.lock();
        inner.live()?;
        inner.current_thread()
    }

    /// Select `thread` and reset the frame position to the innermost frame
    ///
    /// ## Errors
    ///
    /// - `StaleHandle`: the handle is from another session
    /// - `UnknownThread`: the thread no longer exists
    pub fn select_thread(&self, thread: &ThreadHandle) -> Result<()>
    {
        let mut inner = self.lock();
        inner.check_owner(thread.session())?;
        inner.live()?;
        inner.find_thread(thread.runtime_id())?;
        inner.select(thread.runtime_id())
    }

    /// Select the thread with runtime identity `runtime_id`
    ///
    /// ## Errors
    ///
    /// `UnknownThread` if no such thread exists.
    pub fn select_thread_by_id(&self, runtime_id: u64) -> Result<ThreadHandle>
    {
        let mut inner = self.lock();
        inner.live()?;
        let thread = inner.find_thread(runtime_id)?;
        inner.select(runtime_id)?;
        Ok(thread)
    }

    /// Frames of `thread`, innermost first
    ///
    /// ## Errors
    ///
    /// `StaleHandle`, `UnknownThread`, `FrameChainTooDeep`, `RemoteRead`
    pub fn frames(&self, thread: &ThreadHandle) -> Result<Vec<Frame>>
    {
        let mut inner = self.lock();
        inner.check_owner(thread.session())?;
        inner.live()?;
        inner.find_thread(thread.runtime_id())?;
        let classifier = inner.classifier()?;
        walker::frames(&classifier, thread)
    }

    /// Traceback-style rendering of `thread`'s frames
    ///
    /// ## Errors
    ///
    /// As for [`frames`](Self::frames).
    pub fn backtrace(&self, thread: &ThreadHandle) -> Result<String>
    {
        Ok(walker::format_traceback(&self.frames(thread)?))
    }

    /// The selected frame of the current thread
    ///
    /// ## Errors
    ///
    /// `Position` if the current thread has no frames.
    pub fn current_frame(&self) -> Result<Frame>
    {
        let mut inner = self.lock();
        inner.live()?;
        inner.current_frame()
    }

    /// Move one frame towards the outermost call
    ///
    /// ## Errors
    ///
    /// `Position` at the outermost frame.
    pub fn up(&self) -> Result<Frame>
    {
        let mut inner = self.lock();
        inner.live()?;
        let mut frames = inner.current_frames()?;
        let session = inner.session_mut()?;
        let depth = session.depth.min(frames.len() - 1);
        if depth + 1 >= frames.len() {
            return Err(PyriteError::Position("already at the outermost frame".to_string()));
        }
        session.depth = depth + 1;
        Ok(frames.swap_remove(depth + 1))
    }

    /// Move one frame towards the innermost call
    ///
    /// ## Errors
    ///
    /// `Position` at the innermost frame.
    pub fn down(&self) -> Result<Frame>
    {
        let mut inner = self.lock();
        inner.live()?;
        let mut frames = inner.current_frames()?;
        let session = inner.session_mut()?;
        let depth = session.depth.min(frames.len() - 1);
        if depth == 0 {
            return Err(PyriteError::Position("already at the innermost frame".to_string()));
        }
        session.depth = depth - 1;
        Ok(frames.swap_remove(depth - 1))
    }

    /// Select the frame at `depth` (0 = innermost)
    ///
    /// ## Errors
    ///
    /// `Position` if the current thread has fewer frames.
    pub fn set_frame(&self, depth: usize) -> Result<Frame>
    {
        let mut inner = self.lock();
        inner.live()?;
        let mut frames = inner.current_frames()?;
        if depth >= frames.len() {
            return Err(PyriteError::Position(format!(
                "frame {depth} is out of range; the thread has {} frames",
                frames.len()
            )));
        }
        inner.session_mut()?.depth = depth;
        Ok(frames.swap_remove(depth))
    }

    /// Locals of the selected frame
    pub fn locals(&self) -> Result<RemoteValue>
    {
        Ok(self.current_frame()?.locals)
    }

    /// Globals of the selected frame
    pub fn globals(&self) -> Result<RemoteValue>
    {
        Ok(self.current_frame()?.globals)
    }

    /// Builtins of the selected frame
    pub fn builtins(&self) -> Result<RemoteValue>
    {
        Ok(self.current_frame()?.builtins)
    }

    /// Resolve `name` in the selected frame: locals, then globals, then
    /// builtins
    ///
    /// ## Errors
    ///
    /// `Position` if the current thread has no frames; read errors.
    pub fn lookup(&self, name: &str) -> Result<Option<RemoteValue>>
    {
        let mut inner = self.lock();
        inner.live()?;
        let frame = inner.current_frame()?;
        let classifier = inner.classifier()?;

        for scope in [&frame.locals, &frame.globals, &frame.builtins] {
            if let Some(proxy) = scope.as_proxy() {
                if let Some(value) = classifier.get(proxy, name)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Classify the object at `address`
    ///
    /// ## Errors
    ///
    /// `NotAttached`, `TargetExited`, `RemoteRead`, `Malformed`
    pub fn classify(&self, address: Address) -> Result<RemoteValue>
    {
        let mut inner = self.lock();
        inner.live()?;
        let classifier = inner.classifier()?;
        classifier.classify(address)
    }

    /// Item `index` of a sequence proxy
    pub fn item(&self, proxy: &Proxy, index: usize) -> Result<Option<RemoteValue>>
    {
        self.with_owner(proxy, |classifier| classifier.item(proxy, index))
    }

    /// Entry `index` of a mapping or instance proxy
    pub fn entry(&self, proxy: &Proxy, index: usize) -> Result<Option<(RemoteValue, RemoteValue)>>
    {
        self.with_owner(proxy, |classifier| classifier.entry(proxy, index))
    }

    /// Every entry of a mapping or instance proxy
    pub fn entries(&self, proxy: &Proxy) -> Result<Vec<(RemoteValue, RemoteValue)>>
    {
        self.with_owner(proxy, |classifier| classifier.entries(proxy))
    }

    /// Keys of a mapping proxy or attribute names of an instance proxy
    pub fn keys(&self, proxy: &Proxy) -> Result<Vec<RemoteValue>>
    {
        self.with_owner(proxy, |classifier| classifier.keys(proxy))
    }

    /// Value under a string key or attribute name
    pub fn get(&self, proxy: &Proxy, key: &str) -> Result<Option<RemoteValue>>
    {
        self.with_owner(proxy, |classifier| classifier.get(proxy, key))
    }

    fn with_owner<T>(&self, proxy: &Proxy, read: impl FnOnce(&Classifier<'_, B>) -> Result<T>) -> Result<T>
    {
        let mut inner = self.lock();
        inner.check_owner(proxy.session)?;
        inner.live()?;
        let classifier = inner.classifier()?;
        read(&classifier)
    }

    /// Run `source` on `thread`, or on the current thread
    ///
    /// ## Errors
    ///
    /// See [`Injector::inject`]. Additionally `InjectionStalled` while a
    /// previous injection is unresolved. A timeout marks the session
    /// stalled.
    pub fn inject(&self, source: &str, thread: Option<&ThreadHandle>) -> Result<InjectionResult>
    {
        self.inject_request(&InjectionRequest::new(source), thread)
    }

    /// Run a local file's contents, compiled under its own path
    ///
    /// ## Errors
    ///
    /// `Io` if the file can't be read, then as for [`inject`](Self::inject).
    pub fn inject_file(&self, path: &Path, thread: Option<&ThreadHandle>) -> Result<InjectionResult>
    {
        self.inject_request(&InjectionRequest::from_file(path)?, thread)
    }

    /// Run a prepared request
    pub fn inject_request(&self, request: &InjectionRequest, thread: Option<&ThreadHandle>) -> Result<InjectionResult>
    {
        let mut inner = self.lock();
        if let Some(thread) = thread {
            inner.check_owner(thread.session())?;
        }
        inner.live()?;
        if inner.session()?.stalled {
            return Err(PyriteError::InjectionStalled);
        }

        let thread = match thread {
            Some(thread) => inner.find_thread(thread.runtime_id())?,
            None => inner
                .current_thread()?
                .ok_or_else(|| PyriteError::Position("the target has no runtime threads".to_string()))?,
        };

        let Inner {
            backend,
            config,
            limits,
            session: slot,
        } = &mut *inner;
        let session = slot.as_mut().ok_or(PyriteError::NotAttached)?;

        session.state = AttachmentState::Busy;
        let result = Injector::new(
            backend,
            &session.handle,
            &session.runtime,
            *limits,
            session.id,
            config.inject_timeout,
        )
        .inject(&thread, request);
        session.state = AttachmentState::Attached;

        match &result {
            Err(PyriteError::InjectionTimeout { .. }) => session.stalled = true,
            Err(PyriteError::TargetExited { .. }) => {
                warn!(pid = %session.pid, "target exited during injection");
                *slot = None;
            }
            _ => {}
        }
        result
    }
}

impl<B: ProcessControl> Inner<B>
{
    fn session(&self) -> Result<&Session>
    {
        self.session.as_ref().ok_or(PyriteError::NotAttached)
    }

    fn session_mut(&mut self) -> Result<&mut Session>
    {
        self.session.as_mut().ok_or(PyriteError::NotAttached)
    }

    /// Handles from any other session, or with no session, are stale
    fn check_owner(&self, owner: SessionId) -> Result<()>
    {
        match &self.session {
            Some(session) if session.id == owner => Ok(()),
            _ => Err(PyriteError::StaleHandle),
        }
    }

    /// Fail with `TargetExited`, and drop the session, if the target is gone
    fn live(&mut self) -> Result<()>
    {
        let session = self.session()?;
        if self.backend.is_alive(&session.handle) {
            return Ok(());
        }
        let pid = session.pid;
        warn!(%pid, "target exited; session torn down");
        self.session = None;
        Err(PyriteError::TargetExited { pid: pid.0 })
    }

    fn classifier(&self) -> Result<Classifier<'_, B>>
    {
        let session = self.session()?;
        Ok(Classifier::new(
            RemoteMemory::new(&self.backend, &session.handle),
            &session.runtime,
            self.limits,
            session.id,
        ))
    }

    fn threads(&self) -> Result<Vec<ThreadHandle>>
    {
        let classifier = self.classifier()?;
        walker::list_threads(&classifier)
    }

    fn find_thread(&self, runtime_id: u64) -> Result<ThreadHandle>
    {
        self.threads()?
            .into_iter()
            .find(|thread| thread.runtime_id() == runtime_id)
            .ok_or(PyriteError::UnknownThread(runtime_id))
    }

    fn select(&mut self, runtime_id: u64) -> Result<()>
    {
        let session = self.session_mut()?;
        session.selected = Some(runtime_id);
        session.depth = 0;
        debug!(thread = %format!("{runtime_id:#x}"), "thread selected");
        Ok(())
    }

    fn current_thread(&self) -> Result<Option<ThreadHandle>>
    {
        let selected = self.session()?.selected;
        let threads = self.threads()?;
        let found = selected.and_then(|id| threads.iter().find(|thread| thread.runtime_id() == id).cloned());
        Ok(found.or_else(|| threads.into_iter().next()))
    }

    /// Frames of the current thread; never empty
    fn current_frames(&self) -> Result<Vec<Frame>>
    {
        let thread = self
            .current_thread()?
            .ok_or_else(|| PyriteError::Position("the target has no runtime threads".to_string()))?;
        let classifier = self.classifier()?;
        let frames = walker::frames(&classifier, &thread)?;
        if frames.is_empty() {
            return Err(PyriteError::Position(format!("{thread} has no frames")));
        }
        Ok(frames)
    }

    fn current_frame(&self) -> Result<Frame>
    {
        let mut frames = self.current_frames()?;
        let depth = self.session()?.depth.min(frames.len() - 1);
        Ok(frames.swap_remove(depth))
    }
}
