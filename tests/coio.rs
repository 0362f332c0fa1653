use std::cell::{Cell, RefCell};
use std::io::{IoSlice, Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use strand::coio::{IoFlags, Stream};
use strand::fiber::{self, YieldResult};
use strand::Runtime;

/// Scenario: the reader's first read hits EAGAIN and suspends it; the
/// writer then writes 4 bytes and the reader wakes up with the payload.
#[test]
fn suspend_on_eagain_resume_on_readiness() {
    let rt = Runtime::new();
    let delivered: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = delivered.clone();
    rt.work(move |h| {
        let (mut rx, mut tx) = Stream::pipe(h).unwrap();
        h.spawn(move |_| {
            tx.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        })
        .unwrap();
        // The writer has not run yet: this read parks the fiber in the
        // reactor until the pipe becomes readable.
        let mut buf = [0u8; 8];
        let read = fiber::check_yield(h, || rx.read(&mut buf).unwrap());
        match read {
            YieldResult::Yielded(n) => observed.borrow_mut().extend(&buf[..n]),
            YieldResult::DidntYield(_) => panic!("the first read was supposed to block"),
        }
    })
    .unwrap();
    assert_eq!(*delivered.borrow(), vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn read_of_available_data_does_not_yield() {
    let rt = Runtime::new();
    rt.work(|h| {
        let (mut rx, mut tx) = Stream::pipe(h).unwrap();
        tx.write_all(b"ready").unwrap();
        let mut buf = [0u8; 5];
        let read = fiber::check_yield(h, || rx.read(&mut buf).unwrap());
        assert_eq!(read, YieldResult::DidntYield(5));
        assert_eq!(&buf, b"ready");
    })
    .unwrap();
}

#[test]
fn reader_sees_eof_when_writer_drops() {
    let rt = Runtime::new();
    let eof = Rc::new(Cell::new(false));
    let observed = eof.clone();
    rt.work(move |h| {
        let (mut rx, tx) = Stream::pipe(h).unwrap();
        h.spawn(move |_| {
            drop(tx); // close the write end without writing
        })
        .unwrap();
        let mut buf = [0u8; 4];
        let n = rx.read(&mut buf).unwrap();
        observed.set(n == 0);
    })
    .unwrap();
    assert!(eof.get());
}

/// Round-trip over a loopback socket pair: bytes arrive in order with the
/// total preserved, across many suspensions in both directions.
#[test]
fn socketpair_round_trip_preserves_order_and_total() {
    const TOTAL: usize = 1 << 20; // far beyond the socket buffers

    let rt = Runtime::new();
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::with_capacity(TOTAL)));
    let sink = received.clone();
    rt.work(move |h| {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Stream::new(h, a).unwrap();
        let mut rx = Stream::new(h, b).unwrap();

        h.spawn(move |_| {
            let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
            tx.write_all(&payload).unwrap();
        })
        .unwrap();

        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = rx.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            sink.borrow_mut().extend(&buf[..n]);
        }
    })
    .unwrap();

    let received = received.borrow();
    assert_eq!(received.len(), TOTAL);
    assert!(received
        .iter()
        .enumerate()
        .all(|(i, &b)| b == (i % 251) as u8));
}

#[test]
fn vectored_write_and_read() {
    let rt = Runtime::new();
    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = collected.clone();
    rt.work(move |h| {
        let (mut rx, mut tx) = Stream::pipe(h).unwrap();
        h.spawn(move |_| {
            let parts = [IoSlice::new(b"head:"), IoSlice::new(b"tail")];
            let written = tx.write_vectored(&parts).unwrap();
            assert_eq!(written, 9);
        })
        .unwrap();
        let mut buf = [0u8; 9];
        rx.read_exact(&mut buf).unwrap();
        sink.borrow_mut().extend(&buf);
    })
    .unwrap();
    assert_eq!(&*collected.borrow(), b"head:tail");
}

#[test]
fn wait_reports_the_observed_events() {
    let rt = Runtime::new();
    rt.work(|h| {
        let (rx, mut tx) = Stream::pipe(h).unwrap();
        h.spawn(move |_| {
            tx.write_all(b"x").unwrap();
        })
        .unwrap();
        let events = rx.wait(IoFlags::READ).unwrap();
        assert!(events.contains(IoFlags::READ));
        assert!(!events.contains(IoFlags::ERROR));
    })
    .unwrap();
}

#[test]
fn wait_with_empty_interest_is_rejected() {
    let rt = Runtime::new();
    rt.work(|h| {
        let (rx, _tx) = Stream::pipe(h).unwrap();
        assert!(rx.wait(IoFlags::ERROR).is_err());
    })
    .unwrap();
}

/// Two independent fiber pairs, four live registrations interleaving in one
/// reactor.
#[test]
fn multiple_fibers_multiplex_one_reactor() {
    let rt = Runtime::new();
    let totals = Rc::new(RefCell::new(Vec::new()));
    let observed = totals.clone();
    rt.work(move |h| {
        for lane in 0..2u8 {
            let totals = observed.clone();
            let (mut rx, mut tx) = Stream::pipe(h).unwrap();
            h.spawn(move |_| {
                tx.write_all(&[lane; 3]).unwrap();
            })
            .unwrap();
            h.spawn(move |_| {
                let mut buf = [0u8; 3];
                rx.read_exact(&mut buf).unwrap();
                totals.borrow_mut().push((lane, buf.to_vec()));
            })
            .unwrap();
        }
    })
    .unwrap();
    let mut totals = totals.borrow_mut();
    totals.sort();
    assert_eq!(
        *totals,
        vec![(0, vec![0, 0, 0]), (1, vec![1, 1, 1])]
    );
}
