/// Tests for registry error handling across the public surface: handler
/// kinds and combine operators share the collective-registration
/// contract (ordered, unique, frozen at startup).

use std::rc::Rc;

use plenum::{
    combine_of, CombineOps, HandlerError, HandlerId, HandlerKind, HandlerKinds, OpError, OpId,
};

fn noop_kind() -> HandlerKind {
    HandlerKind::Plain(Rc::new(|_, _, _| {}))
}

#[test]
fn handler_ids_follow_registration_order() {
    let mut kinds = HandlerKinds::new();
    let first = kinds.register("alpha", noop_kind());
    let second = kinds.register("beta", noop_kind());
    assert_eq!(first, HandlerId(0));
    assert_eq!(second, HandlerId(1));
    assert_eq!(kinds.name_of(second), Some("beta"));
}

#[test]
fn duplicate_handler_name_is_rejected() {
    let mut kinds = HandlerKinds::new();
    kinds.register("alpha", noop_kind());
    let result = kinds.try_register("alpha", noop_kind());
    match result {
        Err(HandlerError::DuplicateHandler { name }) => assert_eq!(name, "alpha"),
        _ => panic!("expected DuplicateHandler"),
    }
}

#[test]
#[should_panic(expected = "registered twice")]
fn duplicate_handler_registration_panics() {
    let mut kinds = HandlerKinds::new();
    kinds.register("alpha", noop_kind());
    kinds.register("alpha", noop_kind());
}

#[test]
fn frozen_registries_reject_late_registration() {
    let mut kinds = HandlerKinds::new();
    kinds.freeze();
    assert!(matches!(
        kinds.try_register("late", noop_kind()),
        Err(HandlerError::RegistryFrozen { .. })
    ));

    let mut ops = CombineOps::new();
    ops.freeze();
    assert!(matches!(
        ops.try_register("late", combine_of::<u64>(|a, b| a + b)),
        Err(OpError::RegistryFrozen { .. })
    ));
}

#[test]
fn unknown_ids_surface_as_errors() {
    let kinds = HandlerKinds::new();
    assert!(matches!(
        kinds.get(HandlerId(7)),
        Err(HandlerError::UnknownHandler { id: 7 })
    ));

    let ops = CombineOps::new();
    assert!(matches!(ops.get(OpId(7)), Err(OpError::UnknownOp { id: 7 })));
}

#[test]
fn combine_ops_fold_serialized_values() {
    let mut ops = CombineOps::new();
    let plus = ops.register("plus.u64", combine_of::<u64>(|a, b| a + b));
    let combine = ops.get(plus).unwrap();
    let result = combine(
        &plenum_wire::to_bytes(&40u64),
        &plenum_wire::to_bytes(&2u64),
    );
    assert_eq!(plenum_wire::from_bytes::<u64>(&result).unwrap(), 42);
}
