//! Boundary behavior of the individual primitives: timers, events, epoll
//! membership, sync types, the callback dispatcher and task bookkeeping.

use std::pin::{Pin, pin};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use eventhub::sync::{EventFlags, Mutex, MutexKind, Semaphore};
use eventhub::{
    Error, Event, HostPlatform, RawStack, Slot, TaskFlags, TaskState, Ticks, Timeout, Timer,
    callback,
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
fn api_rejects_calls_before_init() {
    let _gate = GATE.lock().unwrap_or_else(PoisonError::into_inner);
    let event = Event::new();
    assert_eq!(event.notify(), Err(Error::InvalidState));
    assert_eq!(
        eventhub::spawn("early", TaskFlags::empty(), STACK, || 0).unwrap_err(),
        Error::InvalidState
    );
    assert!(eventhub::current().is_err());
}

#[test]
fn double_init_is_rejected() {
    let _gate = GATE.lock().unwrap_or_else(PoisonError::into_inner);
    eventhub::global_init(HostPlatform::new(), &[]).unwrap();
    assert_eq!(
        eventhub::global_init(HostPlatform::new(), &[]).unwrap_err(),
        Error::InvalidState
    );
    eventhub::global_exit();
    // And a fresh cycle works after exit.
    eventhub::global_init(HostPlatform::new(), &[]).unwrap();
    eventhub::global_exit();
}

#[test]
fn zero_timeout_event_wait_is_invalid() {
    with_runtime(|| {
        let event = Event::new();
        assert_eq!(
            event.wait_timeout(Timeout::After(Ticks(0))),
            Err(Error::InvalidParam)
        );
    });
}

#[test]
fn event_wait_times_out_and_detaches() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let waiter = eventhub::spawn("timed", TaskFlags::empty(), STACK, || {
            match event.wait_timeout(Timeout::after_ms(30)) {
                Err(Error::Timeout) => 1,
                _ => -1,
            }
        })
        .unwrap();
        assert_eq!(waiter.join(Timeout::Forever).unwrap(), 1);
        // Receptors are gone: notify finds nobody, then a fresh wait works.
        event.notify().unwrap();
    });
}

#[test]
fn timer_start_stop_restart_contract() {
    with_runtime(|| {
        let timer = pin!(Timer::new());
        assert_eq!(timer.as_ref().start(), Err(Error::InvalidParam));

        timer.set_interval_ms(100);
        timer.as_ref().start().unwrap();
        assert!(timer.is_running());
        assert_eq!(timer.as_ref().start(), Err(Error::Busy));

        // Restart is defined on a running timer.
        timer.as_ref().restart().unwrap();
        assert!(timer.is_running());

        // Stop restores the pre-start state and is idempotent.
        timer.as_ref().stop();
        assert!(!timer.is_running());
        timer.as_ref().stop();
        timer.as_ref().start().unwrap();
        timer.as_ref().stop();
    });
}

#[test]
fn notify_wakes_waiters_in_attach_order() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let order: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

        for i in 1..=3u8 {
            let order = order.clone();
            eventhub::spawn("ordered", TaskFlags::empty(), STACK, move || {
                event.wait_timeout(Timeout::Forever).unwrap();
                order.lock().unwrap().push(i);
                0
            })
            .unwrap();
        }

        // All three park, in spawn order.
        eventhub::yield_now();
        event.notify().unwrap();
        // Let them all run.
        eventhub::yield_now();
        eventhub::yield_now();

        assert_eq!(*order.lock().unwrap(), [1, 2, 3]);
    });
}

#[test]
fn epoll_membership_round_trip() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let epoll = eventhub::Epoll::new();

        epoll.add(event, 1).unwrap();
        assert_eq!(epoll.add(event, 2), Err(Error::Exists));

        // A notification held by the receptor disappears with the membership.
        event.notify().unwrap();
        epoll.del(event).unwrap();
        assert_eq!(epoll.del(event), Err(Error::NotExists));

        let mut slots = [Slot::default(); 4];
        assert_eq!(epoll.wait(&mut slots, Timeout::After(Ticks(0))).unwrap(), 0);
    });
}

#[test]
fn semaphore_post_from_producer_thread() {
    with_runtime(|| {
        let sem: &'static Semaphore = Box::leak(Box::new(Semaphore::new(0)));
        let waiter = eventhub::spawn("sem-wait", TaskFlags::empty(), STACK, || {
            match sem.wait(Timeout::after_ms(2000)) {
                Ok(()) => 1,
                Err(_) => -1,
            }
        })
        .unwrap();

        // Park the waiter, then post from a real OS thread.
        eventhub::yield_now();
        let producer = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(30));
            sem.post().unwrap();
        });

        assert_eq!(waiter.join(Timeout::Forever).unwrap(), 1);
        producer.join().unwrap();
    });
}

#[test]
fn mutex_is_recursive_and_owner_checked() {
    with_runtime(|| {
        let mutex: &'static Mutex = Box::leak(Box::new(Mutex::new(MutexKind::Recursive)));

        mutex.lock(Timeout::Forever).unwrap();
        mutex.lock(Timeout::Forever).unwrap();

        let thief = eventhub::spawn("thief", TaskFlags::empty(), STACK, || {
            match mutex.unlock() {
                Err(Error::InvalidState) => 1,
                _ => -1,
            }
        })
        .unwrap();
        assert_eq!(thief.join(Timeout::Forever).unwrap(), 1);

        let contender = eventhub::spawn("contender", TaskFlags::empty(), STACK, || {
            if mutex.lock(Timeout::after_ms(20)) != Err(Error::Timeout) {
                return -1;
            }
            mutex.lock(Timeout::Forever).unwrap();
            mutex.unlock().unwrap();
            5
        })
        .unwrap();

        // The contender times out against our nested hold...
        eventhub::sleep_ms(50).unwrap();
        // ...and wins once both depths are released.
        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
        assert_eq!(contender.join(Timeout::Forever).unwrap(), 5);
    });
}

#[test]
fn event_flags_match_and_clear() {
    with_runtime(|| {
        let flags: &'static EventFlags = Box::leak(Box::new(EventFlags::new()));
        let waiter = eventhub::spawn("flags", TaskFlags::empty(), STACK, || {
            match flags.wait(0b1100, 0b0100, Timeout::Forever) {
                Ok(0b0100) => 4,
                Ok(_) => -2,
                Err(_) => -1,
            }
        })
        .unwrap();

        eventhub::yield_now();
        flags.set_bits(0b0100).unwrap();

        assert_eq!(waiter.join(Timeout::Forever).unwrap(), 4);
        // The clear mask removed the bit.
        assert_eq!(flags.peek() & 0b0100, 0);
    });
}

static TRIGGER: callback::Trigger = callback::Trigger::new();
static HITS: AtomicUsize = AtomicUsize::new(0);

fn count_hit(_event: *const Event, param: usize) {
    HITS.fetch_add(param, Ordering::SeqCst);
}

static SLOT: callback::CbSlot = callback::CbSlot::new(count_hit, 5);

#[test]
fn callback_dispatcher_runs_connected_slots() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::named("cb")));
        let before = HITS.load(Ordering::SeqCst);

        // Safety: trigger, slot and event are 'static (and statics never move).
        let slot = unsafe { Pin::new_unchecked(&SLOT) };
        // Safety: as above.
        unsafe {
            callback::connect(&TRIGGER, slot).unwrap();
            callback::register(event, &TRIGGER).unwrap();
        }

        event.notify().unwrap();
        // The dispatcher is the system task: one yield and it has run.
        eventhub::yield_now();

        assert_eq!(HITS.load(Ordering::SeqCst), before + 5);

        callback::unregister(event).unwrap();
        callback::disconnect(slot);
    });
}

#[test]
fn task_stat_reports_stack_watermark() {
    with_runtime(|| {
        let busy = eventhub::spawn("stacky", TaskFlags::empty(), STACK, || {
            // Touch a chunk of stack before parking.
            let mut scratch = [0u8; 4096];
            scratch[0] = 1;
            scratch[4095] = scratch[0];
            let touched = usize::from(scratch[4095]);
            eventhub::sleep_ms(30).unwrap();
            if touched == 1 { 0 } else { -1 }
        })
        .unwrap();

        // Let it park inside the sleep.
        eventhub::yield_now();
        let stat = busy.stat().unwrap();
        assert_eq!(stat.name, "stacky");
        assert_eq!(stat.state, TaskState::Waiting);
        assert!(stat.stack_size >= STACK);
        assert!(stat.stack_free_min > 0);
        assert!(stat.stack_free_min < stat.stack_size);

        let boot = eventhub::current().unwrap().stat().unwrap();
        assert_eq!(boot.stack_size, 0);

        assert_eq!(busy.join(Timeout::Forever).unwrap(), 0);
    });
}

#[test]
fn spawn_on_a_caller_managed_stack() {
    with_runtime(|| {
        let buf: &'static mut [u8] = Box::leak(vec![0u8; 32 * 1024].into_boxed_slice());
        let len = buf.len();
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        // Safety: the region is leaked, so it outlives the task.
        let stack = unsafe { RawStack::new(base, len) };

        let t = eventhub::spawn_static("static-stack", TaskFlags::empty(), stack, || 9).unwrap();
        eventhub::yield_now();
        assert_eq!(t.join(Timeout::after_ms(10)).unwrap(), 9);
    });
}

#[test]
fn destroy_detaches_a_parked_waiters_receptor() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let victim = eventhub::spawn("victim", TaskFlags::empty(), STACK, || {
            let _ = event.wait_timeout(Timeout::Forever);
            0
        })
        .unwrap();

        eventhub::yield_now();
        // Parked on the event; reap it unconditionally.
        victim.destroy().unwrap();

        // The receptor that lived on the victim's stack is gone from the
        // event's list: walking it again must find nothing of the victim.
        event.notify().unwrap();
        event.clean();
        event.notify().unwrap();

        // Destroying the current task is refused.
        let me = eventhub::current().unwrap();
        assert_eq!(me.destroy(), Err(Error::InvalidState));
    });
}

#[test]
fn destroy_of_a_woken_but_unscheduled_waiter() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let victim = eventhub::spawn("woken-victim", TaskFlags::empty(), STACK, || {
            let _ = event.wait_timeout(Timeout::Forever);
            0
        })
        .unwrap();

        // Park it, then wake it without ever letting it run again: the
        // receptor is still attached while the task sits on the ready list.
        eventhub::yield_now();
        event.notify().unwrap();
        victim.destroy().unwrap();

        // The event's receptor list must not reference the freed stack.
        event.notify().unwrap();
        event.clean();
    });
}

#[test]
fn destroy_stops_a_sleepers_timer() {
    with_runtime(|| {
        let victim = eventhub::spawn("sleepy-victim", TaskFlags::empty(), STACK, || {
            let _ = eventhub::sleep_ms(40);
            0
        })
        .unwrap();

        // Parked in the sleep, with the sleep timer armed on its stack.
        eventhub::yield_now();
        victim.destroy().unwrap();

        // Drive the clock past the victim's deadline: the timer check walks
        // the tree, which must no longer contain the freed node.
        eventhub::sleep_ms(60).unwrap();
    });
}

#[test]
fn destroy_clears_an_epoll_waiter() {
    with_runtime(|| {
        let event: &'static Event = Box::leak(Box::new(Event::new()));
        let epoll: &'static eventhub::Epoll = Box::leak(Box::new(eventhub::Epoll::new()));
        epoll.add(event, 1).unwrap();

        let victim = eventhub::spawn("epoll-victim", TaskFlags::empty(), STACK, || {
            let mut slots = [Slot::default(); 2];
            let _ = epoll.wait(&mut slots, Timeout::after_ms(5000));
            0
        })
        .unwrap();

        // Parked in the epoll wait (waiter registered, timeout timer armed).
        eventhub::yield_now();
        victim.destroy().unwrap();

        // A notification must not try to wake the freed task, and the
        // victim's timeout timer must be gone from the tree.
        event.notify().unwrap();
        eventhub::sleep_ms(10).unwrap();
        epoll.del(event).unwrap();
    });
}
