//! End-to-end scheduler scenarios, driven through the host port.
//!
//! The runtime is a process singleton, so every test goes through
//! `with_runtime`, which serializes tests on one gate and gives each a fresh
//! `global_init`/`global_exit` bracket.

use std::pin::pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use eventhub::{
    Affair, Epoll, Error, Event, HostPlatform, Slot, TaskFlags, Timeout, Timer, TimerAttrs,
};

static GATE: StdMutex<()> = StdMutex::new(());

fn with_runtime(f: impl FnOnce()) {
    let _gate = GATE.lock().unwrap_or_else(PoisonError::into_inner);
    eventhub::global_init(HostPlatform::new(), &[]).expect("global_init");
    f();
    eventhub::global_exit();
}

const STACK: usize = 64 * 1024;

#[test]
fn sleep_then_join_from_boot_task() {
    with_runtime(|| {
        let started = Instant::now();
        let sleeper = eventhub::spawn("sleeper", TaskFlags::empty(), STACK, || {
            match eventhub::sleep_ms(1000) {
                Ok(()) => 0,
                Err(_) => -1,
            }
        })
        .unwrap();

        // Joining from the boot task itself: the scheduler drives timers and
        // the idle hook inline while we are parked.
        let code = sleeper.join(Timeout::Forever).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(code, 0);
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1090), "{elapsed:?}");
    });
}

#[test]
fn condition_wait_resumes_once_after_third_notify() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::named("cond")));
        let counter = Arc::new(AtomicU32::new(0));
        let resumes = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let r = resumes.clone();
        let waiter = eventhub::spawn("waiter", TaskFlags::empty(), STACK, move || {
            let got =
                event.wait_condition_timeout(|| c.load(Ordering::SeqCst) >= 3, Timeout::Forever);
            r.fetch_add(1, Ordering::SeqCst);
            if got.is_ok() && c.load(Ordering::SeqCst) == 3 {
                3
            } else {
                -1
            }
        })
        .unwrap();

        let c = counter.clone();
        let poker = eventhub::spawn("poker", TaskFlags::empty(), STACK, move || {
            for _ in 0..3 {
                c.fetch_add(1, Ordering::SeqCst);
                event.notify().unwrap();
                // Let the waiter observe each notify individually.
                eventhub::yield_now();
            }
            0
        })
        .unwrap();

        assert_eq!(waiter.join(Timeout::Forever).unwrap(), 3);
        assert_eq!(poker.join(Timeout::Forever).unwrap(), 0);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn three_auto_timers_fire_fairly_through_epoll() {
    with_runtime(|| {
        let counts = Arc::new(StdMutex::new([0u32; 3]));
        let shared = counts.clone();

        let app = eventhub::spawn("fairness", TaskFlags::empty(), STACK, move || {
            let t1 = pin!(Timer::named("t300"));
            let t2 = pin!(Timer::named("t700"));
            let t3 = pin!(Timer::named("t1100"));
            for (timer, ms) in [(&t1, 300), (&t2, 700), (&t3, 1100)] {
                timer.set_attrs(TimerAttrs::AUTO_CIRCULATION);
                timer.set_interval_ms(ms);
            }
            t1.as_ref().start().unwrap();
            t2.as_ref().start().unwrap();
            t3.as_ref().start().unwrap();

            let epoll = Epoll::new();
            epoll.add(t1.event(), 1).unwrap();
            epoll.add(t2.event(), 2).unwrap();
            epoll.add(t3.event(), 3).unwrap();

            let stop_at = Instant::now() + Duration::from_secs(10);
            while Instant::now() < stop_at {
                let mut slots = [Slot::default(); 4];
                match epoll.wait(&mut slots, Timeout::after_ms(5000)) {
                    Ok(n) => {
                        for slot in &slots[..n] {
                            assert_eq!(slot.affair, Affair::EventTrigger);
                            shared.lock().unwrap()[slot.userdata - 1] += 1;
                        }
                    }
                    Err(err) => assert_eq!(err, Error::Timeout),
                }
            }

            t1.as_ref().stop();
            t2.as_ref().stop();
            t3.as_ref().stop();
            0
        })
        .unwrap();

        assert_eq!(app.join(Timeout::Forever).unwrap(), 0);
        let counts = counts.lock().unwrap();
        assert!((32..=34).contains(&counts[0]), "300 ms: {counts:?}");
        assert!((13..=15).contains(&counts[1]), "700 ms: {counts:?}");
        assert!((8..=10).contains(&counts[2]), "1100 ms: {counts:?}");
    });
}

#[test]
fn join_of_already_finished_task() {
    with_runtime(|| {
        let t = eventhub::spawn("quick", TaskFlags::empty(), STACK, || 42).unwrap();
        // Let it run to completion before anyone joins.
        eventhub::yield_now();
        assert_eq!(t.join(Timeout::after_ms(10)).unwrap(), 42);
    });
}

#[test]
fn destroying_an_event_wakes_every_waiter_with_error() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::named("doomed")));
        let spawn_waiter = |name: &str| {
            eventhub::spawn(name, TaskFlags::empty(), STACK, move || {
                match event.wait_timeout(Timeout::Forever) {
                    Err(Error::EventClosed) => 7,
                    Ok(()) => -1,
                    Err(_) => -2,
                }
            })
            .unwrap()
        };
        let first = spawn_waiter("doomed-1");
        let second = spawn_waiter("doomed-2");

        // Both park on the event...
        eventhub::yield_now();
        // ...then the event is destroyed under them.
        event.clean();

        assert_eq!(first.join(Timeout::Forever).unwrap(), 7);
        assert_eq!(second.join(Timeout::Forever).unwrap(), 7);

        // The receptor list is empty again: a notify on the (still live)
        // instance is a harmless no-op.
        event.notify().unwrap();
    });
}

#[test]
fn epoll_keeps_notifications_that_land_between_waits() {
    with_runtime(|| {
        let a: &'static Event = Box::leak(Box::new(Event::named("a")));
        let b: &'static Event = Box::leak(Box::new(Event::named("b")));
        let epoll = Epoll::new();
        epoll.add(a, 1).unwrap();
        epoll.add(b, 2).unwrap();

        // Nobody is waiting while these fire; notify `a` twice to check
        // coalescing as well.
        a.notify().unwrap();
        a.notify().unwrap();
        b.notify().unwrap();

        let mut slots = [Slot::default(); 10];
        let n = epoll.wait(&mut slots, Timeout::Forever).unwrap();
        assert_eq!(n, 2);

        let mut seen = [false; 3];
        for slot in &slots[..n] {
            assert_eq!(slot.affair, Affair::EventTrigger);
            assert!(!seen[slot.userdata], "event reported twice");
            seen[slot.userdata] = true;
        }
        assert!(seen[1] && seen[2]);

        // The set survives the wait; a second poll is clean.
        assert_eq!(epoll.wait(&mut slots, Timeout::After(eventhub::Ticks(0))).unwrap(), 0);
    });
}

#[test]
fn loop_run_returns_the_exit_code() {
    with_runtime(|| {
        eventhub::spawn("worker", TaskFlags::DETACHED, STACK, || 0).unwrap();
        eventhub::spawn("app", TaskFlags::empty(), STACK, || {
            eventhub::sleep_ms(50).unwrap();
            eventhub::loop_exit(5);
            0
        })
        .unwrap();

        assert_eq!(eventhub::loop_run().unwrap(), 5);
    });
}
