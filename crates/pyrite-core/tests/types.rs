//! Tests for platform-agnostic types

use pyrite_core::types::{Address, ProcessHandle, ProcessId, SessionId, ThreadId};

#[test]
fn test_process_id_from_u32()
{
    let pid = ProcessId::from(12345);
    assert_eq!(pid.0, 12345);
}

#[test]
fn test_process_id_to_u32()
{
    let pid = ProcessId::from(54321);
    let value: u32 = pid.into();
    assert_eq!(value, 54321);
}

#[test]
fn test_process_handle_keeps_pid()
{
    let handle = ProcessHandle::new(ProcessId::from(4242));
    assert_eq!(handle.pid(), ProcessId::from(4242));
    assert_eq!(handle, ProcessHandle::new(ProcessId::from(4242)));
}

#[test]
fn test_thread_id_display()
{
    let tid = ThreadId::from(1001);
    assert_eq!(tid.raw(), 1001);
    assert_eq!(tid.to_string(), "1001");
}

#[test]
fn test_session_ids_are_unique()
{
    let first = SessionId::next();
    let second = SessionId::next();
    assert_ne!(first, second);
    assert!(second.value() > first.value());
    assert_eq!(first.to_string(), format!("session#{}", first.value()));
}

#[test]
fn test_address_display()
{
    assert_eq!(Address::new(0x7f00_0000_1000).to_string(), "0x7f0000001000");
    assert_eq!(format!("{:x}", Address::new(0xbeef)), "beef");
}

#[test]
fn test_address_null()
{
    assert!(Address::NULL.is_null());
    assert!(Address::default().is_null());
    assert!(!Address::new(8).is_null());
}

#[test]
fn test_address_arithmetic()
{
    let base = Address::new(0x1000);
    assert_eq!(base + 0x18, Address::new(0x1018));
    assert_eq!(base.element(3, 24), Address::new(0x1048));
    assert_eq!(u64::from(base), 0x1000);
    assert_eq!(Address::from(0x2000u64), Address::new(0x2000));
    assert!(Address::new(u64::MAX).checked_add(1).is_none());
}
