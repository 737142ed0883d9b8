mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{frame, stub_host};
use serde_json::json;

#[test]
fn tick_dispatch_is_lifo_by_registration() {
    let (host, setups) = stub_host();
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let order = Arc::clone(&order);
        setups.on_load(&format!("{name}.stub"), move |ctx| {
            let order = Arc::clone(&order);
            ctx.on_tick(move |_| order.lock().unwrap().push(name));
            Ok(())
        });
    }

    let a = host.create("a.stub", json!({})).expect("create a");
    let b = host.create("b.stub", json!({})).expect("create b");
    let c = host.create("c.stub", json!({})).expect("create c");
    host.load(a).expect("load a");
    host.load(b).expect("load b");
    host.load(c).expect("load c");

    host.tick(frame(16, 0.016));
    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"], "newest registration ticks first");

    host.unload(b);
    host.tick(frame(32, 0.016));
    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a", "c", "a"], "unloaded script left the list");
}

#[test]
fn tick_handler_sees_delta_and_current_script() {
    let (host, setups) = stub_host();
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    setups.on_load("dt.stub", move |ctx| {
        let record = Arc::clone(&record);
        let id = ctx.script();
        ctx.on_tick(move |seconds| {
            *record.lock().unwrap() = Some((seconds, scripthost::current_script() == Some(id)));
        });
        Ok(())
    });

    let id = host.create("dt.stub", json!({})).expect("create");
    host.load(id).expect("load");
    host.tick(frame(250, 0.25));

    let (seconds, current_matches) = seen.lock().unwrap().expect("tick handler ran");
    assert!((seconds - 0.25).abs() < f32::EPSILON);
    assert!(current_matches, "current_script() points at the ticking script");
}

#[test]
fn panicking_tick_handler_does_not_stop_the_sweep() {
    let (host, setups) = stub_host();
    setups.on_load("bad.stub", |ctx| {
        ctx.on_tick(|_| panic!("intentional tick panic"));
        Ok(())
    });
    let survivor_ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&survivor_ticks);
    setups.on_load("good.stub", move |ctx| {
        let counter = Arc::clone(&counter);
        ctx.on_tick(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    });

    let good = host.create("good.stub", json!({})).expect("create good");
    let bad = host.create("bad.stub", json!({})).expect("create bad");
    host.load(good).expect("load good");
    host.load(bad).expect("load bad");

    host.tick(frame(16, 0.016));
    host.tick(frame(32, 0.016));
    assert_eq!(survivor_ticks.load(Ordering::SeqCst), 2, "other scripts keep ticking past a panic");
}

#[test]
fn timer_is_phase_locked_across_a_stall() {
    let (host, setups) = stub_host();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer_cb = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&fires);
    let slot = Arc::clone(&timer_cb);
    setups.on_load("timer.stub", move |ctx| {
        let counter = Arc::clone(&counter);
        let cb = ctx.host().add_callback(ctx.script(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.host().register_timer(cb, Duration::from_millis(1000));
        *slot.lock().unwrap() = Some(cb);
        Ok(())
    });

    let id = host.create("timer.stub", json!({})).expect("create");
    host.load(id).expect("load");
    host.drain_deferred();
    let cb = timer_cb.lock().unwrap().expect("load registered the timer callback");

    // One tick that jumps 3 intervals: the timer fires once and stays on its
    // original schedule instead of resetting to "now".
    host.tick(frame(3000, 3.0));
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert_eq!(
        host.timer_scheduler().last_fired(cb),
        Some(Duration::from_millis(1000)),
        "last_fired advances by exactly one interval"
    );

    // One more interval of wall time: already overdue, fires again immediately.
    host.tick(frame(4000, 1.0));
    assert_eq!(fires.load(Ordering::SeqCst), 2);
    assert_eq!(host.timer_scheduler().last_fired(cb), Some(Duration::from_millis(2000)));
}

#[test]
fn removed_timer_entry_is_unlinked_during_the_sweep() {
    let (host, setups) = stub_host();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer_cb = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&fires);
    let slot = Arc::clone(&timer_cb);
    setups.on_load("timer.stub", move |ctx| {
        let counter = Arc::clone(&counter);
        let cb = ctx.host().add_callback(ctx.script(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.host().register_timer(cb, Duration::from_millis(100));
        *slot.lock().unwrap() = Some(cb);
        Ok(())
    });

    let id = host.create("timer.stub", json!({})).expect("create");
    host.load(id).expect("load");
    host.drain_deferred();
    let cb = timer_cb.lock().unwrap().expect("timer callback recorded");
    assert_eq!(host.timer_scheduler().len(), 1);

    host.remove_callback(cb);
    host.tick(frame(500, 0.5));

    assert_eq!(fires.load(Ordering::SeqCst), 0, "a removed timer never fires");
    assert_eq!(host.timer_scheduler().len(), 0, "sweep unlinks entries whose callback was removed");
    assert_eq!(host.callbacks().detached_len(), 1, "the graveyard move happened at removal time");
}

#[test]
fn end_to_end_tick_and_timer_over_simulated_frames() {
    let (host, setups) = stub_host();
    let ticks = Arc::new(AtomicUsize::new(0));
    let timer_fires = Arc::new(AtomicUsize::new(0));
    let timer_cb = Arc::new(Mutex::new(None));

    let tick_counter = Arc::clone(&ticks);
    let fire_counter = Arc::clone(&timer_fires);
    let slot = Arc::clone(&timer_cb);
    setups.on_load("scene.stub", move |ctx| {
        let tick_counter = Arc::clone(&tick_counter);
        ctx.on_tick(move |_| {
            tick_counter.fetch_add(1, Ordering::SeqCst);
        });
        let fire_counter = Arc::clone(&fire_counter);
        let cb = ctx.host().add_callback(ctx.script(), move || {
            fire_counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.host().register_timer(cb, Duration::from_millis(1000));
        *slot.lock().unwrap() = Some(cb);
        Ok(())
    });

    let id = host.create("scene.stub", json!({})).expect("create");
    host.load(id).expect("load");
    host.drain_deferred();
    let cb = timer_cb.lock().unwrap().expect("timer callback recorded");

    // 10 frames of 150 ms: the 1000 ms threshold is crossed exactly once.
    for i in 1..=10u64 {
        host.tick(frame(150 * i, 0.15));
    }

    assert_eq!(ticks.load(Ordering::SeqCst), 10, "tick handler runs every frame");
    assert_eq!(timer_fires.load(Ordering::SeqCst), 1, "timer fired exactly once in the span");
    assert_eq!(
        host.timer_scheduler().last_fired(cb),
        Some(Duration::from_millis(1000)),
        "last_fired advanced by exactly one interval"
    );
}

#[test]
fn one_shot_timer_removes_itself_from_inside_its_invocation() {
    let (host, setups) = stub_host();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer_cb: Arc<Mutex<Option<scripthost::CallbackId>>> = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&fires);
    let slot = Arc::clone(&timer_cb);
    setups.on_load("oneshot.stub", move |ctx| {
        let counter = Arc::clone(&counter);
        let registry = ctx.host().callbacks_handle();
        let own_id = Arc::clone(&slot);
        let cb = ctx.host().add_callback(ctx.script(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = *own_id.lock().unwrap() {
                registry.remove(own);
            }
        });
        ctx.host().register_timer(cb, Duration::from_millis(100));
        *slot.lock().unwrap() = Some(cb);
        Ok(())
    });

    let id = host.create("oneshot.stub", json!({})).expect("create");
    host.load(id).expect("load");
    host.drain_deferred();

    host.tick(frame(150, 0.15));
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    host.tick(frame(300, 0.15));
    assert_eq!(fires.load(Ordering::SeqCst), 1, "self-removed timer never fires again");
    assert_eq!(host.timer_scheduler().len(), 0, "its entry was unlinked by the next sweep");
    assert_eq!(host.callbacks().detached_len(), 1);
}
