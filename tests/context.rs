use contextual::prelude::*;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::thread;

trait Counter: Send + Sync {
    fn value(&self) -> i64;
    fn bump(&self);
}

#[derive(Default)]
struct Basic(AtomicI64);

impl Counter for Basic {
    fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Extended(AtomicI64);

impl Counter for Extended {
    fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(2, Ordering::Relaxed);
    }
}

#[test]
fn settings_nest_and_unwind() {
    let _scope = isolate();
    let speed = declare_setting("speed", 16i32, |v| *v as f64);

    assert_eq!(speed.get(), 16.0);
    {
        let _frame = enter();
        speed.assign(48).unwrap();
        assert_eq!(speed.get(), 48.0);
    }
    assert_eq!(speed.get(), 16.0);
}

#[test]
fn write_once_per_frame_with_nesting() {
    let _scope = isolate();
    let speed = declare_setting("speed", 16i32, |v| *v as f64);
    let _frame = enter();

    speed.assign(77).unwrap();
    speed.assign(99).unwrap();
    speed.assign(66).unwrap();
    assert_eq!(speed.get(), 66.0);

    let err = speed.assign(8).unwrap_err();
    assert_eq!((err.key.as_str(), err.existing.as_str(), err.attempted.as_str()), ("speed", "66", "8"));

    {
        let _inner = enter();
        speed.assign(99).unwrap();
        speed.assign(54).unwrap();
        assert_eq!(speed.get(), 54.0);
    }
    assert_eq!(speed.get(), 66.0);

    {
        let _sibling = enter();
        // Nothing written here, so the enclosing frame's value shows through.
        assert_eq!(speed.get(), 66.0);
    }
}

#[test]
fn services_are_instantiated_once_per_state() {
    let _scope = isolate();
    let counter: Service<dyn Counter> = declare_service("counter", || Arc::new(Basic::default()) as _);

    counter.current().unwrap().bump();
    assert_eq!(counter.with(|c| c.value()).unwrap(), 1);

    // A new thread starts from its own empty state and gets a fresh
    // instance, shared by its subsequent reads.
    let other = {
        let counter = counter.clone();
        thread::spawn(move || {
            let first = counter.current().unwrap();
            assert_eq!(first.value(), 0);
            first.bump();
            counter.current().unwrap().value()
        })
    };
    assert_eq!(other.join().unwrap(), 1);

    assert_eq!(counter.current().unwrap().value(), 1);
}

#[test]
fn replacements_hold_for_their_frame_only() {
    let _scope = isolate();
    let counter: Service<dyn Counter> = declare_service("counter", || Arc::new(Basic::default()) as _);
    let extended: Service<dyn Counter> =
        declare_service("counter-extended", || Arc::new(Extended::default()) as _);

    counter.current().unwrap().bump();
    assert_eq!(counter.current().unwrap().value(), 1);

    {
        let _frame = enter();
        extended.replaces(&counter).unwrap();

        assert_eq!(counter.current().unwrap().value(), 0);
        counter.current().unwrap().bump();
        assert_eq!(counter.current().unwrap().value(), 2);
    }

    assert_eq!(counter.current().unwrap().value(), 1);
}

#[test]
fn factories_rebind_only_before_the_first_read() {
    let _scope = isolate();
    let counter: Service<dyn Counter> = declare_service("counter", || Arc::new(Basic::default()) as _);

    counter.current().unwrap();
    assert!(counter
        .assign(|| Arc::new(Extended::default()) as _)
        .is_err());

    {
        let _frame = enter();
        counter.assign(|| Arc::new(Extended::default()) as _).unwrap();
        counter.current().unwrap().bump();
        assert_eq!(counter.current().unwrap().value(), 2);
    }
}

#[test]
fn states_are_per_thread() {
    let _scope = isolate();
    let speed = declare_setting("speed", 16i32, |v| *v as f64);
    let _frame = enter();
    speed.assign(48).unwrap();

    let read_elsewhere = {
        let speed = speed.clone();
        thread::spawn(move || speed.get())
    };

    assert_eq!(read_elsewhere.join().unwrap(), 16.0);
    assert_eq!(speed.get(), 48.0);
}

#[test]
fn cooperative_switching_round_trips() {
    let _scope = isolate();
    let speed = declare_setting("speed", 16i32, |v| *v as f64);

    let outer = snapshot();
    let _frame = enter();
    speed.assign(48).unwrap();
    assert_eq!(speed.get(), 48.0);

    // Run a stretch of work as if the frame had never been entered, then
    // switch back.
    let inner = restore(outer).unwrap();
    assert_eq!(speed.get(), 16.0);

    restore(inner).unwrap();
    assert_eq!(speed.get(), 48.0);
}

#[test]
fn restore_from_the_wrong_thread_is_rejected() {
    let _scope = isolate();
    let _frame = enter();

    let snap = snapshot();
    let result = thread::spawn(move || restore(snap)).join().unwrap();
    assert!(matches!(result, Err(DynamicRuleError::ForeignRestore)));
}

#[test]
fn resources_resolve_like_services() {
    let _scope = isolate();
    let journal: Resource<dyn Counter> =
        declare_resource("journal", || Arc::new(Basic::default()) as _);

    journal.current().unwrap().bump();
    assert_eq!(journal.current().unwrap().value(), 1);
}

#[cfg(feature = "tracing")]
#[test]
fn scopes_work_under_a_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .try_init();

    let _scope = isolate();
    let speed = declare_setting("speed", 16i32, |v| *v as f64);
    let _frame = enter();
    speed.assign(48).unwrap();
    assert_eq!(speed.get(), 48.0);
}
