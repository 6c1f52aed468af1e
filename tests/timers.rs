use cyclos::Reactor;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn timers_fire_in_deadline_order() {
    let mut reactor = Reactor::new();
    let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));

    // Registered out of deadline order on purpose.
    {
        let log = log.clone();
        reactor.call_later(Duration::from_millis(30), move |_| {
            log.borrow_mut().push("slow");
            Ok(())
        });
    }
    {
        let log = log.clone();
        reactor.call_later(Duration::from_millis(10), move |_| {
            log.borrow_mut().push("fast");
            Ok(())
        });
    }
    reactor.call_later(Duration::from_millis(60), |reactor| {
        reactor.stop();
        Ok(())
    });

    reactor.run_forever().unwrap();

    assert_eq!(*log.borrow(), vec!["fast", "slow"]);
}

#[test]
fn equal_deadlines_fire_in_registration_order() {
    let mut reactor = Reactor::new();
    let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_millis(20);

    for name in ["a", "b", "c"] {
        let log = log.clone();
        reactor.call_at(deadline, move |_| {
            log.borrow_mut().push(name);
            Ok(())
        });
    }
    reactor.call_later(Duration::from_millis(50), |reactor| {
        reactor.stop();
        Ok(())
    });

    reactor.run_forever().unwrap();

    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn zero_delay_runs_in_the_next_iteration() {
    let mut reactor = Reactor::new();
    let ran = Rc::new(RefCell::new(false));

    {
        let ran = ran.clone();
        reactor.call_later(Duration::ZERO, move |_| {
            *ran.borrow_mut() = true;
            Ok(())
        });
    }

    // One iteration, no poller wait involved.
    reactor.run_once().unwrap();

    assert!(*ran.borrow());
}

#[test]
fn past_deadlines_are_treated_as_immediate() {
    let mut reactor = Reactor::new();
    let ran = Rc::new(RefCell::new(false));

    let deadline = Instant::now() - Duration::from_secs(1);
    {
        let ran = ran.clone();
        reactor.call_at(deadline, move |_| {
            *ran.borrow_mut() = true;
            Ok(())
        });
    }

    reactor.run_once().unwrap();

    assert!(*ran.borrow());
}

#[test]
fn cancelled_timers_never_fire() {
    let mut reactor = Reactor::new();
    let ran = Rc::new(RefCell::new(false));

    let timer = {
        let ran = ran.clone();
        reactor.call_later(Duration::from_millis(10), move |_| {
            *ran.borrow_mut() = true;
            Ok(())
        })
    };
    timer.cancel();
    assert!(timer.is_cancelled());

    reactor.call_later(Duration::from_millis(40), |reactor| {
        reactor.stop();
        Ok(())
    });

    reactor.run_forever().unwrap();

    assert!(!*ran.borrow());
}

#[test]
fn cancelled_timer_does_not_shorten_the_wait() {
    let mut reactor = Reactor::new();

    // A near timer that is cancelled must not cause an early wake-up
    // relative to the far one.
    let near = reactor.call_later(Duration::from_millis(5), |_| Ok(()));
    near.cancel();

    reactor.call_later(Duration::from_millis(60), |reactor| {
        reactor.stop();
        Ok(())
    });

    let started = Instant::now();
    reactor.run_forever().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(55));
}

#[test]
fn timer_handle_reports_its_deadline() {
    let mut reactor = Reactor::new();
    let deadline = Instant::now() + Duration::from_secs(10);

    let timer = reactor.call_at(deadline, |_| Ok(()));

    assert_eq!(timer.when(), deadline);
    timer.cancel();
    reactor.close();
}
