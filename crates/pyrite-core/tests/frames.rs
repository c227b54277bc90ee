//! Tests for thread enumeration, frame walking and frame navigation

mod common;

use common::{attached, attached_with, test_config};
use pyrite_core::layout::TypeTag;
use pyrite_core::types::Address;
use pyrite_core::value::{EntryKey, Shape};
use pyrite_core::{PyriteError, RemoteValue, Scalar};

#[test]
fn test_three_threads_listed_in_chain_order()
{
    let harness = attached();
    let fixture = harness.fixture();

    let threads = harness.manager.list_threads().unwrap();
    assert_eq!(threads.len(), 3);
    let ids: Vec<u64> = threads.iter().map(|thread| thread.runtime_id()).collect();
    assert_eq!(ids, fixture.runtime_ids);
    let states: Vec<Address> = threads.iter().map(|thread| thread.thread_state()).collect();
    assert_eq!(states, fixture.tstates);
    assert_eq!(threads[0].to_string(), "Thread 0x7f0000001000");
}

#[test]
fn test_current_thread_defaults_to_first()
{
    let harness = attached();
    let current = harness.manager.current_thread().unwrap().unwrap();
    assert_eq!(current.runtime_id(), harness.fixture().runtime_ids[0]);
}

#[test]
fn test_select_thread()
{
    let harness = attached();
    let threads = harness.manager.list_threads().unwrap();

    harness.manager.select_thread(&threads[1]).unwrap();
    assert_eq!(harness.manager.current_thread().unwrap(), Some(threads[1].clone()));

    let by_id = harness.manager.select_thread_by_id(threads[2].runtime_id()).unwrap();
    assert_eq!(by_id, threads[2]);
    assert_eq!(harness.manager.current_thread().unwrap(), Some(threads[2].clone()));

    let err = harness.manager.select_thread_by_id(0x1234).unwrap_err();
    assert!(matches!(err, PyriteError::UnknownThread(0x1234)));
}

#[test]
fn test_frames_innermost_first()
{
    let harness = attached();
    let fixture = harness.fixture();
    let thread = harness.manager.list_threads().unwrap().remove(0);

    let frames = harness.manager.frames(&thread).unwrap();
    assert_eq!(frames.len(), 3);
    let addresses: Vec<Address> = frames.iter().map(|frame| frame.address).collect();
    assert_eq!(addresses, fixture.frames);

    let summary: Vec<(usize, &str, i64)> = frames
        .iter()
        .map(|frame| (frame.index, frame.location.function.as_str(), frame.location.line))
        .collect();
    assert_eq!(summary, [(0, "g", 31), (1, "f", 22), (2, "<module>", 5)]);
    assert!(frames.iter().all(|frame| frame.location.filename == "app.py"));
}

#[test]
fn test_line_falls_back_to_frame_lineno()
{
    let harness = attached();
    let thread = harness.manager.list_threads().unwrap().remove(1);

    let frames = harness.manager.frames(&thread).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].location.function, "worker");
    assert_eq!(frames[0].location.filename, "worker.py");
    assert_eq!(frames[0].location.line, 77);
}

#[test]
fn test_thread_without_frames()
{
    let harness = attached();
    let thread = harness.manager.list_threads().unwrap().remove(2);
    assert!(harness.manager.frames(&thread).unwrap().is_empty());

    harness.manager.select_thread(&thread).unwrap();
    assert!(matches!(harness.manager.current_frame(), Err(PyriteError::Position(_))));
    assert!(matches!(harness.manager.locals(), Err(PyriteError::Position(_))));
}

#[test]
fn test_backtrace()
{
    let harness = attached();
    let thread = harness.manager.list_threads().unwrap().remove(0);
    assert_eq!(
        harness.manager.backtrace(&thread).unwrap(),
        "Traceback (most recent call last):\n  \
         File \"app.py\", line 5, in <module>\n  \
         File \"app.py\", line 22, in f\n  \
         File \"app.py\", line 31, in g\n"
    );
}

#[test]
fn test_fast_locals_skip_unbound_slots()
{
    let harness = attached();
    let locals = harness.manager.locals().unwrap();
    let proxy = locals.as_proxy().unwrap();
    assert_eq!(proxy.tag, TypeTag::FastLocals);

    let Shape::Mapping { entries, truncated } = &proxy.shape else {
        panic!("fast locals should be a mapping, got {proxy:?}");
    };
    assert!(!truncated);
    let names: Vec<&EntryKey> = entries.iter().map(|entry| &entry.key).collect();
    assert_eq!(names, [&EntryKey::Name("x".to_string()), &EntryKey::Name("y".to_string())]);

    assert_eq!(harness.manager.get(proxy, "x").unwrap(), Some(RemoteValue::Scalar(Scalar::Int(7))));
    assert_eq!(harness.manager.get(proxy, "y").unwrap().unwrap().as_str(), Some("hello"));
    assert_eq!(harness.manager.get(proxy, "z").unwrap(), None);
}

#[test]
fn test_frame_scopes_are_mapping_proxies()
{
    let harness = attached();
    let fixture = harness.fixture();
    let frame = harness.manager.current_frame().unwrap();

    let globals = frame.globals.as_proxy().unwrap();
    assert_eq!(globals.tag, TypeTag::Dict);
    assert_eq!(globals.address, fixture.globals);
    let builtins = frame.builtins.as_proxy().unwrap();
    assert_eq!(builtins.address, fixture.builtins);
    assert_eq!(builtins.len(), 1);
}

#[test]
fn test_module_frame_locals_are_its_globals()
{
    let harness = attached();
    let frame = harness.manager.set_frame(2).unwrap();
    assert_eq!(frame.location.function, "<module>");
    assert_eq!(frame.locals, frame.globals);
}

#[test]
fn test_lookup_order()
{
    let harness = attached();

    assert_eq!(harness.manager.lookup("x").unwrap(), Some(RemoteValue::Scalar(Scalar::Int(7))));
    assert_eq!(harness.manager.lookup("counter").unwrap(), Some(RemoteValue::Scalar(Scalar::Int(42))));
    let len = harness.manager.lookup("len").unwrap().unwrap();
    assert!(len.is_opaque());
    assert!(len.to_string().starts_with("<builtin_function_or_method at remote 0x"));
    assert_eq!(harness.manager.lookup("missing").unwrap(), None);
}

#[test]
fn test_lookup_in_worker_locals_dict()
{
    let harness = attached();
    let worker = harness.manager.list_threads().unwrap().remove(1);
    harness.manager.select_thread(&worker).unwrap();

    assert_eq!(harness.manager.lookup("job").unwrap(), Some(RemoteValue::Scalar(Scalar::Int(5))));
    assert!(harness.manager.lookup("x").unwrap().is_none());
}

#[test]
fn test_lookup_is_one_locked_operation()
{
    let harness = attached();
    harness.manager.up().unwrap();

    let before = harness.with(|process| process.liveness_checks);
    assert!(harness.manager.lookup("a").unwrap().is_some());
    assert_eq!(harness.with(|process| process.liveness_checks) - before, 1);

    // The position chosen by `up` is the one searched
    assert!(harness.manager.lookup("x").unwrap().is_none());
}

#[test]
fn test_up_and_down()
{
    let harness = attached();

    assert!(matches!(harness.manager.down(), Err(PyriteError::Position(_))));
    assert_eq!(harness.manager.up().unwrap().location.function, "f");
    assert_eq!(harness.manager.up().unwrap().location.function, "<module>");
    assert!(matches!(harness.manager.up(), Err(PyriteError::Position(_))));
    assert_eq!(harness.manager.current_frame().unwrap().index, 2);

    // `a` is f's only local
    assert_eq!(harness.manager.down().unwrap().location.function, "f");
    let locals = harness.manager.locals().unwrap();
    assert_eq!(locals.as_proxy().unwrap().len(), 1);
    assert!(harness.manager.lookup("a").unwrap().unwrap().as_proxy().is_some());
}

#[test]
fn test_set_frame_out_of_range()
{
    let harness = attached();
    let err = harness.manager.set_frame(3).unwrap_err();
    assert!(matches!(err, PyriteError::Position(ref reason) if reason.contains("3 frames")));
    assert_eq!(harness.manager.current_frame().unwrap().index, 0);
}

#[test]
fn test_selecting_a_thread_resets_frame_position()
{
    let harness = attached();
    let threads = harness.manager.list_threads().unwrap();
    harness.manager.set_frame(2).unwrap();

    harness.manager.select_thread(&threads[0]).unwrap();
    assert_eq!(harness.manager.current_frame().unwrap().index, 0);
}

#[test]
fn test_cyclic_frame_chain_is_capped()
{
    let harness = attached();
    let fixture = harness.fixture();
    // <module>.f_back = g closes a loop
    harness.with(|process| process.write_ptr(fixture.frames[2] + 24, fixture.frames[0]));

    let thread = harness.manager.list_threads().unwrap().remove(0);
    let err = harness.manager.frames(&thread).unwrap_err();
    assert!(matches!(err, PyriteError::FrameChainTooDeep { limit: 64 }));

    // Local to that walk: other threads still work
    let worker = harness.manager.list_threads().unwrap().remove(1);
    assert_eq!(harness.manager.frames(&worker).unwrap().len(), 1);
}

#[test]
fn test_frame_cap_is_exclusive_of_chain_length()
{
    let mut config = test_config();
    config.max_frames = 3;
    let harness = attached_with(config);
    let thread = harness.manager.list_threads().unwrap().remove(0);
    assert_eq!(harness.manager.frames(&thread).unwrap().len(), 3);

    let mut config = test_config();
    config.max_frames = 2;
    let harness = attached_with(config);
    let thread = harness.manager.list_threads().unwrap().remove(0);
    assert!(matches!(
        harness.manager.frames(&thread),
        Err(PyriteError::FrameChainTooDeep { limit: 2 })
    ));
}

#[test]
fn test_cyclic_thread_chain_is_capped()
{
    let harness = attached();
    let fixture = harness.fixture();
    harness.with(|process| process.write_ptr(fixture.tstates[2] + 8, fixture.tstates[0]));

    let err = harness.manager.list_threads().unwrap_err();
    assert!(matches!(err, PyriteError::ThreadChainTooLong { limit: 16 }));
}
