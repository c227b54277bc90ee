//! # Platform-Specific Implementations
//!
//! Each platform module implements
//! [`ProcessControl`](crate::backend::ProcessControl) with that platform's
//! native tracing APIs:
//!
//! - **Linux x86-64**: `ptrace` and procfs
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! Other platforms get no backend; [`create_backend`](crate::backend::create_backend)
//! reports them as unsupported.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;
